//! Pod operation errors.

use edge_podspec::SpecError;
use thiserror::Error;

use crate::backend::BackendError;

/// Errors returned by pod operations.
#[derive(Debug, Error)]
pub enum PodError {
    /// The pod was rejected before any backend call.
    #[error("invalid pod: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("pod {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// Delete was asked for a pod without namespace or name.
    #[error("pod is missing its namespace or name")]
    MissingIdentity,

    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    /// The embedded pod label was missing or unparseable.
    #[error("cannot decode pod {pod} from container labels: {reason}")]
    Decode { pod: String, reason: String },

    #[error("cannot encode pod {pod}: {source}")]
    Encode {
        pod: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl PodError {
    pub(crate) fn not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Whether the error means "no such pod" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Backend(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Stable machine-readable code for transport layers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidSpec(_) => "invalid_spec",
            Self::NotFound { .. } => "not_found",
            Self::MissingIdentity => "missing_identity",
            Self::Backend(e) if e.is_not_found() => "not_found",
            Self::Backend(_) => "backend_failure",
            Self::Decode { .. } => "decode_failure",
            Self::Encode { .. } => "encode_failure",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(PodError::not_found("default", "web").reason_code(), "not_found");
        assert!(PodError::not_found("default", "web").is_not_found());
        assert_eq!(PodError::MissingIdentity.reason_code(), "missing_identity");
        assert!(!PodError::MissingIdentity.is_not_found());

        let spec = PodError::from(SpecError::MissingName);
        assert_eq!(spec.reason_code(), "invalid_spec");

        let gone = PodError::from(BackendError::NotFound("abc".to_string()));
        assert!(gone.is_not_found());
        assert_eq!(gone.reason_code(), "not_found");

        let api = PodError::from(BackendError::Api {
            status: 500,
            message: "boom".to_string(),
        });
        assert_eq!(api.reason_code(), "backend_failure");
    }

    #[test]
    fn test_display() {
        let err = PodError::not_found("default", "web");
        assert_eq!(err.to_string(), "pod default/web not found");
    }
}
