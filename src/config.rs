use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration value: {0}")]
    Missing(&'static str),
    #[error("Failed to load config file: {0}")]
    File(String),
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub queue: String,
    pub publish_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reinit_delay: Duration,
    pub publish_retry_delay: Duration,
}

impl RabbitMqConfig {
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f",
            self.user, self.password, self.host, self.port
        )
    }
}

#[derive(Debug, Clone)]
pub struct MailjetConfig {
    pub api_key: String,
    pub secret_key: String,
    pub sender_name: String,
    pub sender_email: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub concurrency: usize,
    pub http_timeout: Duration,
    pub webhook_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub listen_address: String,
    pub max_body_bytes: usize,
}

/// Fully merged configuration.
///
/// Sections that carry credentials are only validated when a binary asks for
/// them, so the notifier can start without database settings and the poller
/// without Mailjet settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    database: Result<DatabaseConfig, &'static str>,
    rabbitmq: Result<RabbitMqConfig, &'static str>,
    mailjet: Result<MailjetConfig, &'static str>,
    pub poller: PollerConfig,
    pub notifier: NotifierConfig,
    pub ingest: IngestConfig,
    pub log_dir: String,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug, Clone)]
pub struct PartialDatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct PartialRabbitMqConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub queue: Option<String>,
    pub publish_timeout_ms: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    pub reinit_delay_ms: Option<u64>,
    pub publish_retry_delay_ms: Option<u64>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct PartialMailjetConfig {
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct PartialPollerConfig {
    pub interval_ms: Option<u64>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct PartialNotifierConfig {
    pub concurrency: Option<usize>,
    pub http_timeout_ms: Option<u64>,
    pub webhook_attempts: Option<u32>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct PartialIngestConfig {
    pub listen_address: Option<String>,
    pub max_body_bytes: Option<usize>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct PartialAppConfig {
    #[serde(default)]
    pub database: PartialDatabaseConfig,
    #[serde(default)]
    pub rabbitmq: PartialRabbitMqConfig,
    #[serde(default)]
    pub mailjet: PartialMailjetConfig,
    #[serde(default)]
    pub poller: PartialPollerConfig,
    #[serde(default)]
    pub notifier: PartialNotifierConfig,
    #[serde(default)]
    pub ingest: PartialIngestConfig,
    pub log_dir: Option<String>,
}

#[derive(Deserialize, Default, Debug)]
struct EnvLogDir {
    log_dir: Option<String>,
}

fn default_mailjet_base_url() -> String {
    "https://api.mailjet.com".to_string()
}

fn default_queue_name() -> String {
    "notifications".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn millis(env: Option<u64>, file: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(env.or(file).unwrap_or(default))
}

impl PartialAppConfig {
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::File(format!("Failed to read {path:?}: {e}")))?;
        toml::from_str(&contents)
            .map_err(|e| ConfigError::File(format!("Failed to parse TOML from {path:?}: {e}")))
    }

    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database: envy::prefixed("DB_").from_env()?,
            rabbitmq: envy::prefixed("RABBITMQ_").from_env()?,
            mailjet: envy::prefixed("MAILJET_").from_env()?,
            poller: envy::prefixed("POLLER_").from_env()?,
            notifier: envy::prefixed("NOTIFIER_").from_env()?,
            ingest: envy::prefixed("INGEST_").from_env()?,
            log_dir: envy::from_env::<EnvLogDir>()?.log_dir,
        })
    }
}

impl AppConfig {
    /// Loads `.env`, the optional TOML file and the process environment.
    /// Environment values override file values.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let file_config = match config_path {
            Some(path) => PartialAppConfig::from_file(Path::new(path))?,
            None => PartialAppConfig::default(),
        };
        let env_config = PartialAppConfig::from_env()?;

        Ok(Self::merge(env_config, file_config))
    }

    pub fn merge(env: PartialAppConfig, file: PartialAppConfig) -> Self {
        let (db_env, db_file) = (env.database, file.database);
        let database = (|| -> Result<DatabaseConfig, &'static str> {
            Ok(DatabaseConfig {
                host: db_env.host.or(db_file.host).ok_or("DB_HOST")?,
                port: db_env.port.or(db_file.port).unwrap_or(5432),
                user: db_env.user.or(db_file.user).ok_or("DB_USER")?,
                password: db_env.password.or(db_file.password).ok_or("DB_PASSWORD")?,
                name: db_env.name.or(db_file.name).ok_or("DB_NAME")?,
                max_connections: db_env
                    .max_connections
                    .or(db_file.max_connections)
                    .unwrap_or(10),
            })
        })();

        let (mq_env, mq_file) = (env.rabbitmq, file.rabbitmq);
        let rabbitmq = (|| -> Result<RabbitMqConfig, &'static str> {
            Ok(RabbitMqConfig {
                host: mq_env.host.or(mq_file.host).ok_or("RABBITMQ_HOST")?,
                port: mq_env.port.or(mq_file.port).unwrap_or(5672),
                user: mq_env.user.or(mq_file.user).ok_or("RABBITMQ_USER")?,
                password: mq_env
                    .password
                    .or(mq_file.password)
                    .ok_or("RABBITMQ_PASSWORD")?,
                queue: mq_env
                    .queue
                    .or(mq_file.queue)
                    .unwrap_or_else(default_queue_name),
                publish_timeout: millis(mq_env.publish_timeout_ms, mq_file.publish_timeout_ms, 5000),
                reconnect_delay: millis(mq_env.reconnect_delay_ms, mq_file.reconnect_delay_ms, 1000),
                reinit_delay: millis(mq_env.reinit_delay_ms, mq_file.reinit_delay_ms, 1000),
                publish_retry_delay: millis(
                    mq_env.publish_retry_delay_ms,
                    mq_file.publish_retry_delay_ms,
                    1000,
                ),
            })
        })();

        let (mj_env, mj_file) = (env.mailjet, file.mailjet);
        let mailjet = (|| -> Result<MailjetConfig, &'static str> {
            Ok(MailjetConfig {
                api_key: mj_env.api_key.or(mj_file.api_key).ok_or("MAILJET_API_KEY")?,
                secret_key: mj_env
                    .secret_key
                    .or(mj_file.secret_key)
                    .ok_or("MAILJET_SECRET_KEY")?,
                sender_name: mj_env
                    .sender_name
                    .or(mj_file.sender_name)
                    .ok_or("MAILJET_SENDER_NAME")?,
                sender_email: mj_env
                    .sender_email
                    .or(mj_file.sender_email)
                    .ok_or("MAILJET_SENDER_EMAIL")?,
                base_url: mj_env
                    .base_url
                    .or(mj_file.base_url)
                    .unwrap_or_else(default_mailjet_base_url),
            })
        })();

        let poller = PollerConfig {
            interval: millis(env.poller.interval_ms, file.poller.interval_ms, 100),
        };

        let notifier = NotifierConfig {
            concurrency: env
                .notifier
                .concurrency
                .or(file.notifier.concurrency)
                .unwrap_or(100)
                .max(1),
            http_timeout: millis(
                env.notifier.http_timeout_ms,
                file.notifier.http_timeout_ms,
                5000,
            ),
            webhook_attempts: env
                .notifier
                .webhook_attempts
                .or(file.notifier.webhook_attempts)
                .unwrap_or(3)
                .max(1),
        };

        let ingest = IngestConfig {
            listen_address: env
                .ingest
                .listen_address
                .or(file.ingest.listen_address)
                .unwrap_or_else(default_listen_address),
            max_body_bytes: env
                .ingest
                .max_body_bytes
                .or(file.ingest.max_body_bytes)
                .unwrap_or(300_000),
        };

        Self {
            database,
            rabbitmq,
            mailjet,
            poller,
            notifier,
            ingest,
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
        }
    }

    pub fn database(&self) -> Result<&DatabaseConfig, ConfigError> {
        self.database.as_ref().map_err(|key| ConfigError::Missing(*key))
    }

    pub fn rabbitmq(&self) -> Result<&RabbitMqConfig, ConfigError> {
        self.rabbitmq.as_ref().map_err(|key| ConfigError::Missing(*key))
    }

    pub fn mailjet(&self) -> Result<&MailjetConfig, ConfigError> {
        self.mailjet.as_ref().map_err(|key| ConfigError::Missing(*key))
    }
}
