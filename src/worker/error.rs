use thiserror::Error;

/// Failures talking to the transcription worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker answered with a non-success status.
    #[error("worker error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Connection, DNS or body decoding failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The worker accepted the request but answered with something unusable.
    #[error("invalid worker response: {0}")]
    InvalidResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display() {
        let err = WorkerError::Api {
            status: 503,
            message: "model loading".into(),
        };
        assert_eq!(err.to_string(), "worker error (status 503): model loading");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WorkerError>();
    }
}
