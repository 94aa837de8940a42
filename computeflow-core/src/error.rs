use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Topology Error - {0}")]
    Topology(String),

    #[error("Log Error - {0}")]
    Log(String),

    #[error("Append Error - {0}")]
    Append(String),

    #[error("Commit Error - {0}")]
    Commit(String),

    /// The partition assignment of the tailer changed while reading.
    #[error("Rebalance Error - read interrupted by a partition rebalance")]
    Rebalance,

    /// The runner was interrupted by a pool shutdown.
    #[error("Interrupted")]
    Interrupted,

    #[error("Computation Error - {0}")]
    Computation(String),

    #[error("Pool Error - {0}")]
    Pool(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Config(err.to_string())
    }
}
