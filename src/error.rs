use thiserror::Error;

/// Error taxonomy for the relay.
///
/// Only the startup variants are fatal to the process; everything else is
/// scoped to one connection, one publish, or one cache write.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("broker unavailable after {0} connection attempts")]
    BrokerUnavailable(u32),

    #[error("broker channel not open")]
    BrokerChannelClosed,

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("cache disabled")]
    CacheDisabled,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] figment::Error),

    #[error("authorization service unavailable: {0}")]
    AuthUnavailable(#[from] reqwest::Error),
}
