use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Discovery Error - {message}")]
    Discovery {
        message: String,
        /// HTTP status reported by the broker, when one was available.
        status: Option<u16>,
    },

    #[error("Subscribe Error - {0}")]
    Subscribe(String),

    #[error("Receive Transport Error - {0}")]
    ReceiveTransport(String),

    #[error("Send Unsupported - {0}")]
    SendUnsupported(String),

    #[error("Send Error - {0}")]
    Send(String),

    #[error("Persist Error - {0}")]
    Persist(String),

    #[error("Retrieve Error - {0}")]
    Retrieve(String),

    #[error("event processor not initialized")]
    NotInitialized,

    #[error("Config Error - {0}")]
    Config(String),
}

impl Error {
    /// Discovery failure, carrying the broker's status code when the
    /// transport saw one.
    pub fn discovery(message: impl Into<String>, status: Option<u16>) -> Self {
        Error::Discovery {
            message: message.into(),
            status,
        }
    }
}
