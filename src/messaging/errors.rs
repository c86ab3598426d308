use thiserror::Error;

use super::message::Lane;

/// Errors raised by queue implementations
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue operation failed: {0}")]
    Queue(#[from] pgmq::errors::PgmqError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message {message_id} not found on lane {lane}")]
    MessageNotFound { lane: Lane, message_id: i64 },

    #[error("Invalid message payload: {0}")]
    InvalidPayload(String),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MessagingError::MessageNotFound {
            lane: Lane::Image,
            message_id: 42,
        };
        assert_eq!(err.to_string(), "Message 42 not found on lane image");
    }
}
