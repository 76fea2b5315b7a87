use thiserror::Error;

use crate::instance::InstanceId;

pub type Result<T> = std::result::Result<T, Error>;

/// One reason a manifest failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractViolationKind {
    EmitUndeclaredOutput,
    SubscribeUndeclaredInput,
    ReservedEventNamespace,
}

impl ContractViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractViolationKind::EmitUndeclaredOutput => "emit on undeclared output",
            ContractViolationKind::SubscribeUndeclaredInput => "subscribe on undeclared input",
            ContractViolationKind::ReservedEventNamespace => "emit into reserved event namespace",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest `{id}` failed validation: {}", format_issues(issues))]
    Validation {
        id: String,
        issues: Vec<ValidationIssue>,
    },
    #[error("contract violation by widget `{widget_id}` port `{port}`: {}", kind.as_str())]
    ContractViolation {
        widget_id: String,
        port: String,
        kind: ContractViolationKind,
    },
    #[error("sandbox fault in instance {instance_id:?} during {context}")]
    SandboxFault {
        instance_id: InstanceId,
        context: &'static str,
    },
    #[error("request `{operation}` timed out")]
    RequestTimeout { operation: String },
    #[error("request `{operation}` failed: {details}")]
    RequestFailure { operation: String, details: String },
    #[error("{operation} persistence failed: {details}")]
    Persistence {
        operation: &'static str,
        details: String,
    },
    #[error("not found: {resource} `{id}`")]
    NotFound { resource: &'static str, id: String },
    #[error("conflict: {resource} `{id}`")]
    Conflict { resource: &'static str, id: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("close request denied for instance {instance_id:?}")]
    CloseDenied { instance_id: InstanceId },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn validation(id: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        Self::Validation {
            id: id.into(),
            issues,
        }
    }

    pub fn contract_violation(
        widget_id: impl Into<String>,
        port: impl Into<String>,
        kind: ContractViolationKind,
    ) -> Self {
        Self::ContractViolation {
            widget_id: widget_id.into(),
            port: port.into(),
            kind,
        }
    }

    pub fn sandbox_fault(instance_id: InstanceId, context: &'static str) -> Self {
        Self::SandboxFault {
            instance_id,
            context,
        }
    }

    pub fn request_timeout(operation: impl Into<String>) -> Self {
        Self::RequestTimeout {
            operation: operation.into(),
        }
    }

    pub fn request_failure(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::RequestFailure {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn persistence(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Persistence {
            operation,
            details: details.into(),
        }
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn conflict(resource: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            resource,
            id: id.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}
