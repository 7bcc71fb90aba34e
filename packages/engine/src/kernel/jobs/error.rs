//! Job failure taxonomy.

use super::job::ErrorKind;

/// Errors raised while enqueueing or executing jobs.
///
/// Handlers return `anyhow::Error`; the dispatcher downcasts to this type to
/// decide whether a failure may be retried. Anything else is transient.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// No handler is registered for the job's type.
    #[error("no handler registered for job type: {0}")]
    NoHandler(String),

    /// A strict queue refused a type no handler in this process can run.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// The payload does not satisfy the handler's schema.
    #[error("invalid payload for {job_type}: {message}")]
    InvalidPayload { job_type: String, message: String },

    /// The handler did not return within the configured timeout.
    #[error("job timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// A batch must contain at least one operation.
    #[error("batch has no operations")]
    EmptyBatch,
}

impl JobError {
    pub fn invalid_payload(job_type: impl Into<String>, message: impl ToString) -> Self {
        JobError::InvalidPayload {
            job_type: job_type.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::NoHandler(_)
            | JobError::UnknownJobType(_)
            | JobError::InvalidPayload { .. }
            | JobError::EmptyBatch => ErrorKind::NonRetryable,
            JobError::Timeout { .. } => ErrorKind::Retryable,
        }
    }
}

/// Classify a handler error to determine retry behavior.
///
/// Only payload validation failures (and the other permanent `JobError`
/// variants) are terminal; every other error is treated as transient.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    match error.downcast_ref::<JobError>() {
        Some(job_error) => job_error.kind(),
        None => ErrorKind::Retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error_retryable() {
        let error = anyhow::anyhow!("connection timeout");
        assert_eq!(classify_error(&error), ErrorKind::Retryable);
    }

    #[test]
    fn test_classify_error_invalid_payload() {
        let error: anyhow::Error = JobError::invalid_payload("embedding", "missing entity_id").into();
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }

    #[test]
    fn test_classify_error_keeps_kind_through_context() {
        let error = anyhow::Error::from(JobError::invalid_payload("embedding", "bad"))
            .context("while running handler");
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert_eq!(JobError::Timeout { after_ms: 10 }.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn test_missing_handler_message() {
        let error = JobError::NoHandler("embedding".into());
        assert_eq!(error.to_string(), "no handler registered for job type: embedding");
        assert_eq!(error.kind(), ErrorKind::NonRetryable);
    }
}
