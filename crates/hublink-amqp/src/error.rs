use thiserror::Error;

pub type Result<T> = std::result::Result<T, AmqpError>;

#[derive(Debug, Clone, Error)]
pub enum AmqpError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Link error: {0}")]
    LinkError(String),

    #[error("Sasl negotiation failed: {0}")]
    Sasl(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl From<std::io::Error> for AmqpError {
    fn from(err: std::io::Error) -> Self {
        AmqpError::Io(err.to_string())
    }
}
