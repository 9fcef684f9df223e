use sasjs_tables::EncodeError;
use thiserror::Error;

use crate::models::Job;

/// Everything a call into the server can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// 401, `invalid_grant`, or a login page. Recovered by re-authenticating
    /// and replaying the queued call.
    #[error("login required")]
    LoginRequired,

    /// An authorization form could not be submitted.
    #[error("authorization required: {0}")]
    Authorize(String),

    /// The server rejected the CSRF token even after a cookie refresh.
    #[error("invalid CSRF token")]
    InvalidCsrf,

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("internal server error (HTTP {status}) at {url}")]
    InternalServer { url: String, status: u16, body: String },

    /// TLS trust failure. Never retried.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The server-side program failed and said so in its response.
    #[error("job execution failed ({code}): {message}")]
    JobExecution {
        code: String,
        message: String,
        log: Option<String>,
    },

    #[error("compute job '{}' failed with state '{}'", .job.name, .job.state)]
    ComputeJobExecution { job: Box<Job>, log: String },

    /// A value is wider than SAS can store. Raised before anything is sent.
    #[error(transparent)]
    LengthExceeded(EncodeError),

    #[error(transparent)]
    Encode(EncodeError),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{rel}' link not found on {resource}")]
    MissingLink { rel: String, resource: String },

    #[error("compute context '{0}' not found")]
    ContextNotFound(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("polling job {job_id} failed: {source}")]
    PollFailed {
        job_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to create a session: {}", join_errors(.errors))]
    SessionCreation { errors: Vec<Error> },

    #[error("session {id} entered state '{state}'")]
    SessionFailed { id: String, state: String },

    #[error("could not read job output: {0}")]
    Webout(String),
}

impl Error {
    /// True when the failure, or anything it wraps, needs a fresh login.
    pub fn is_login_required(&self) -> bool {
        match self {
            Error::LoginRequired => true,
            Error::PollFailed { source, .. } => source.is_login_required(),
            Error::SessionCreation { errors } => errors.iter().any(Error::is_login_required),
            _ => false,
        }
    }

    pub(crate) fn missing_link(rel: &str, resource: impl Into<String>) -> Self {
        Error::MissingLink {
            rel: rel.to_string(),
            resource: resource.into(),
        }
    }
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::LengthExceeded { .. } => Error::LengthExceeded(err),
            other => Error::Encode(other),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_required_through_wrappers() {
        let polled = Error::PollFailed {
            job_id: "j1".into(),
            source: Box::new(Error::LoginRequired),
        };
        assert!(polled.is_login_required());

        let creation = Error::SessionCreation {
            errors: vec![Error::Transport("reset".into()), Error::LoginRequired],
        };
        assert!(creation.is_login_required());
        assert!(!Error::NotFound { url: "/x".into() }.is_login_required());
    }

    #[test]
    fn test_length_exceeded_conversion() {
        let err: Error = EncodeError::LengthExceeded {
            table: "t".into(),
            column: "c".into(),
            width: 40000,
        }
        .into();
        assert!(matches!(err, Error::LengthExceeded(_)));

        let err: Error = EncodeError::NotATable {
            name: "t".into(),
            reason: "not an array".into(),
        }
        .into();
        assert!(matches!(err, Error::Encode(_)));
    }

    #[test]
    fn test_session_creation_message_lists_all() {
        let err = Error::SessionCreation {
            errors: vec![
                Error::ContextNotFound("ctx".into()),
                Error::Transport("timeout".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("compute context 'ctx' not found"));
        assert!(msg.contains("network error: timeout"));
    }
}
