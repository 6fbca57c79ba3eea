//! Driver error types.
//!
//! Every failure the orchestrator sees is one of these variants. The RPC
//! transport converts them into a `tonic::Status`; the code is part of the
//! contract, because the orchestrator decides whether to retry from it.

use std::time::Duration;

use metal_reconcile::ReconcileError;
use thiserror::Error;
use tonic::{Code, Status};

use crate::infra::ApiError;

/// Driver operation errors.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The provider spec blob is not structurally valid.
    #[error("failed to decode provider spec: {0}")]
    Decode(String),

    /// Required spec or secret fields are missing. Lists every violation.
    #[error("error while validating provider spec: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The provider spec carries no cluster ownership tag.
    #[error("{operation} request failed because provider spec did not contain metal-stack cluster tag")]
    MissingClusterTag { operation: &'static str },

    /// The machine was never created, was released, or is no longer owned.
    #[error("{0}")]
    NotFound(String),

    /// More than one machine matched a lookup that must be unique.
    #[error("found {count} machines for id {instance_id}, refusing to act on an ambiguous result")]
    Ambiguous { instance_id: String, count: usize },

    /// A creation for the same machine was accepted within the backoff window.
    #[error("backing off from creation of machine {machine}, retry in {}ms", .retry_after.as_millis())]
    Throttled {
        machine: String,
        retry_after: Duration,
    },

    /// The infrastructure API call failed.
    #[error(transparent)]
    Infrastructure(#[from] ApiError),

    /// The infrastructure API returned a record the driver cannot use.
    #[error("machine response contains invalid fields: {0}")]
    InvalidResponse(String),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The request deadline passed before the API answered.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The operation is not supported by this driver.
    #[error("{0}")]
    Unimplemented(&'static str),

    /// A driver invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// The transport status code for this error.
    pub fn code(&self) -> Code {
        match self {
            DriverError::Decode(_) | DriverError::Validation(_) => Code::InvalidArgument,
            DriverError::MissingClusterTag { .. } => Code::FailedPrecondition,
            DriverError::NotFound(_) => Code::NotFound,
            DriverError::Throttled { .. } => Code::Unavailable,
            DriverError::Cancelled => Code::Cancelled,
            DriverError::DeadlineExceeded => Code::DeadlineExceeded,
            DriverError::Unimplemented(_) => Code::Unimplemented,
            DriverError::Ambiguous { .. }
            | DriverError::Infrastructure(_)
            | DriverError::InvalidResponse(_)
            | DriverError::Internal(_) => Code::Internal,
        }
    }

    /// Returns true if retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Throttled { .. }
                | DriverError::Infrastructure(_)
                | DriverError::Cancelled
                | DriverError::DeadlineExceeded
        )
    }

    /// Returns true if this error reports a missing machine.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }
}

impl From<ReconcileError> for DriverError {
    fn from(err: ReconcileError) -> Self {
        DriverError::Internal(err.to_string())
    }
}

impl From<DriverError> for Status {
    fn from(err: DriverError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_lists_all_violations() {
        let err = DriverError::Validation(vec![
            "image is required field".to_string(),
            "size is required field".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "error while validating provider spec: image is required field; size is required field"
        );
    }

    #[test]
    fn test_status_codes() {
        let status: Status = DriverError::NotFound("machine already released".to_string()).into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "machine already released");

        let status: Status = DriverError::Unimplemented("nope").into();
        assert_eq!(status.code(), Code::Unimplemented);

        let status: Status = DriverError::Ambiguous {
            instance_id: "m1".to_string(),
            count: 2,
        }
        .into();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn test_infrastructure_message_preserved() {
        let err = DriverError::from(ApiError::Status {
            status: 503,
            message: "partition fra-equ01 has no free machines".to_string(),
        });
        assert!(err.to_string().contains("partition fra-equ01 has no free machines"));
        assert_eq!(err.code(), Code::Internal);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_throttled_is_retryable_and_unavailable() {
        let err = DriverError::Throttled {
            machine: "worker-a".to_string(),
            retry_after: Duration::from_millis(1500),
        };
        assert!(err.is_retryable());
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn test_permanent_errors_not_retryable() {
        assert!(!DriverError::Validation(vec![]).is_retryable());
        assert!(!DriverError::MissingClusterTag { operation: "create" }.is_retryable());
        assert!(!DriverError::Ambiguous {
            instance_id: "m1".to_string(),
            count: 3
        }
        .is_retryable());
    }
}
