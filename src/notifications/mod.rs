pub mod models;
pub mod senders;
pub mod service;

pub use models::{Channel, Notification};
pub use service::Notifier;
