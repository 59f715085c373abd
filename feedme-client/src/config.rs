//! Client configuration (§6). Constructed programmatically rather than
//! loaded from a file, but validated eagerly the way the teacher's
//! `ForwarderConfig` validates a deserialized `RawConfig`: every option
//! defaults, and incompatible combinations are rejected at construction
//! rather than discovered mid-session.

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub connect_retry_ms: i64,
    pub connect_retry_backoff_ms: u64,
    /// Caps the per-attempt backoff delay. `0` means uncapped.
    pub connect_retry_max_ms: u64,
    pub connect_retry_max_attempts: u32,
    pub action_timeout_ms: u64,
    pub feed_timeout_ms: u64,
    pub reconnect: bool,
    pub reopen_max_attempts: i32,
    pub reopen_trailing_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            connect_retry_ms: 1_000,
            connect_retry_backoff_ms: 1_000,
            connect_retry_max_ms: 30_000,
            connect_retry_max_attempts: 0,
            action_timeout_ms: 10_000,
            feed_timeout_ms: 10_000,
            reconnect: true,
            reopen_max_attempts: 3,
            reopen_trailing_ms: 60_000,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    cfg: PartialConfig,
}

#[derive(Debug, Clone, Default)]
struct PartialConfig {
    connect_timeout_ms: Option<u64>,
    connect_retry_ms: Option<i64>,
    connect_retry_backoff_ms: Option<u64>,
    connect_retry_max_ms: Option<u64>,
    connect_retry_max_attempts: Option<u32>,
    action_timeout_ms: Option<u64>,
    feed_timeout_ms: Option<u64>,
    reconnect: Option<bool>,
    reopen_max_attempts: Option<i32>,
    reopen_trailing_ms: Option<u64>,
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.cfg.$name = Some(value);
            self
        }
    };
}

impl ClientConfigBuilder {
    setter!(connect_timeout_ms, u64);
    setter!(connect_retry_ms, i64);
    setter!(connect_retry_backoff_ms, u64);
    setter!(connect_retry_max_ms, u64);
    setter!(connect_retry_max_attempts, u32);
    setter!(action_timeout_ms, u64);
    setter!(feed_timeout_ms, u64);
    setter!(reconnect, bool);
    setter!(reopen_max_attempts, i32);
    setter!(reopen_trailing_ms, u64);

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let defaults = ClientConfig::default();
        let config = ClientConfig {
            connect_timeout_ms: self.cfg.connect_timeout_ms.unwrap_or(defaults.connect_timeout_ms),
            connect_retry_ms: self.cfg.connect_retry_ms.unwrap_or(defaults.connect_retry_ms),
            connect_retry_backoff_ms: self
                .cfg
                .connect_retry_backoff_ms
                .unwrap_or(defaults.connect_retry_backoff_ms),
            connect_retry_max_ms: self
                .cfg
                .connect_retry_max_ms
                .unwrap_or(defaults.connect_retry_max_ms),
            connect_retry_max_attempts: self
                .cfg
                .connect_retry_max_attempts
                .unwrap_or(defaults.connect_retry_max_attempts),
            action_timeout_ms: self.cfg.action_timeout_ms.unwrap_or(defaults.action_timeout_ms),
            feed_timeout_ms: self.cfg.feed_timeout_ms.unwrap_or(defaults.feed_timeout_ms),
            reconnect: self.cfg.reconnect.unwrap_or(defaults.reconnect),
            reopen_max_attempts: self
                .cfg
                .reopen_max_attempts
                .unwrap_or(defaults.reopen_max_attempts),
            reopen_trailing_ms: self
                .cfg
                .reopen_trailing_ms
                .unwrap_or(defaults.reopen_trailing_ms),
        };
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &ClientConfig) -> Result<(), ConfigError> {
    if config.connect_retry_ms >= 0
        && config.connect_retry_max_ms > 0
        && (config.connect_retry_max_ms as i64) < config.connect_retry_ms
    {
        return Err(ConfigError::InvalidValue {
            field: "connect_retry_max_ms",
            reason: "must not be smaller than connect_retry_ms".into(),
        });
    }
    Ok(())
}
