//! Error kinds shared across the workspace.

use thiserror::Error;

/// Failures while turning a manifest package into concrete objects.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("manifest package not found: {0}")]
    MissingPackage(String),
    #[error("manifest package {0} is empty")]
    EmptyPackage(String),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: String, message: String },
    #[error("transform registered for unknown path: {0}")]
    UnknownPath(String),
    #[error("transform on {path} failed: {message}")]
    Transform { path: String, message: String },
}

/// Failures reported by the platform client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("api: {0}")]
    Api(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// How an operand failure should be presented to whoever watches the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; the next reconcile cycle retries.
    Retryable,
    /// Will not resolve on its own; needs operator intervention.
    Configuration,
}

/// Operand-local failure. Converted into the operand's outcome by the executor.
#[derive(Debug, Error)]
pub enum OperandError {
    #[error("render: {0}")]
    Render(#[from] RenderError),
    #[error("apply: {0}")]
    Apply(#[from] ClientError),
    #[error("readiness probe: {0}")]
    Readiness(String),
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("cancelled")]
    Cancelled,
}

impl OperandError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OperandError::Render(_) | OperandError::InvalidResource(_) => ErrorClass::Configuration,
            OperandError::Apply(ClientError::Invalid(_)) => ErrorClass::Configuration,
            OperandError::Apply(_) | OperandError::Readiness(_) | OperandError::Cancelled => {
                ErrorClass::Retryable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        let e = OperandError::from(ClientError::Conflict("x".into()));
        assert_eq!(e.class(), ErrorClass::Retryable);
        let e = OperandError::from(RenderError::MissingPackage("csi".into()));
        assert_eq!(e.class(), ErrorClass::Configuration);
        assert_eq!(e.to_string(), "render: manifest package not found: csi");
        assert!(ClientError::NotFound("a".into()).is_not_found());
    }
}
