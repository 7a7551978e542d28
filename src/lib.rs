pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod notifications;
pub mod poller;
pub mod queue;
pub mod shutdown;
pub mod version;
pub mod web;
