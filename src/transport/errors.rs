// src/transport/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport configuration error: {0}")]
    Config(String),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("unknown transport error: {0}")]
    Unknown(String),
}

// Custom Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

// Converting from lapin errors
impl From<LapinError> for TransportError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();

        if error_text.contains("connection") {
            TransportError::Connection(error_text)
        } else if error_text.contains("channel") {
            TransportError::Channel(error_text)
        } else if error_text.contains("publish") {
            TransportError::Publish(error_text)
        } else if error_text.contains("consume") {
            TransportError::Consume(error_text)
        } else if error_text.contains("ack") || error_text.contains("nack") {
            TransportError::Ack(error_text)
        } else {
            TransportError::Unknown(error_text)
        }
    }
}

impl From<String> for TransportError {
    fn from(message: String) -> Self {
        TransportError::Unknown(message)
    }
}

impl From<&str> for TransportError {
    fn from(message: &str) -> Self {
        TransportError::Unknown(message.to_string())
    }
}
