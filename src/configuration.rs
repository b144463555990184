use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::transport::HttpMailClient;

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub mail_client: MailClientSettings,
    pub engine: EngineSettings,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct MailClientSettings {
    pub base_url: String,
    pub auth_token: SecretString,
    pub timeout_ms: u64,
}

impl MailClientSettings {
    pub fn client(self) -> HttpMailClient {
        let timeout = self.timeout();
        HttpMailClient::new(self.base_url, self.auth_token, timeout)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Knobs of the quota & rotation engine itself.
#[derive(serde::Deserialize, Debug, Clone)]
pub struct EngineSettings {
    /// Daily send cap shared by every sender account.
    #[serde(
        default = "default_daily_send_limit",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub daily_send_limit: u32,
    /// What auto-rotation does once every account is at the cap.
    #[serde(default)]
    pub quota_overflow: QuotaOverflow,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            daily_send_limit: default_daily_send_limit(),
            quota_overflow: QuotaOverflow::default(),
        }
    }
}

fn default_daily_send_limit() -> u32 {
    15
}

/// The original system kept sending with the oldest account when every
/// account had hit its cap ("never stall"). Whether the cap is soft or hard
/// is a policy question, so it is configurable rather than hard-coded.
#[derive(serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuotaOverflow {
    #[default]
    Soft,
    Hard,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: SecretString,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    pub require_ssl: bool,
}

impl DatabaseSettings {
    pub fn with_db(&self) -> PgConnectOptions {
        self.without_db()
            .database(&self.database_name)
            .log_statements(tracing::log::LevelFilter::Trace)
    }

    pub fn without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };

        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
    }
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "local" => Ok(Environment::Local),
            "production" => Ok(Environment::Production),
            other => Err(format!(
                "{other} is not supported environment. Try to use `local` or `production`",
            )),
        }
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir().expect("Failed to determine current directory");
    let conf_dir = base_path.join("configuration");
    let env: Environment = std::env::var("APP_ENV")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENV");

    let settings = config::Config::builder()
        .add_source(
            config::File::with_name(
                conf_dir
                    .join("base")
                    .to_str()
                    .expect("Failed to read base configuration"),
            )
            .required(true),
        )
        .add_source(
            config::File::with_name(
                conf_dir
                    .join(env.as_str())
                    .to_str()
                    .expect("Failed to read environment configuration"),
            )
            .required(true),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .separator("__")
                .prefix_separator("_"),
        )
        .build()?;

    settings.try_deserialize::<Settings>()
}
