//! Error types and diagnostics for code generation.
//!
//! Every failure the caller can observe maps to a small negative integer via
//! `code()`, so embedders that speak in status codes can forward them unchanged.
//! Diagnostics are collected as [`Message`]s and travel with the failure (or with
//! the produced [`TargetCode`](super::TargetCode) on success).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodegenError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid expression path '{0}'")]
    InvalidPath(String),

    #[error("environment function '{function}' must return color or texture_return, got {found}")]
    InvalidEnvironmentType { function: String, found: String },

    #[error("link unit cannot be finalized: {0}")]
    LinkFailed(String),

    #[error("backend failed while compiling '{0}'")]
    BackendFailure(String),

    #[error("field '{0}' is constant and compile_constants is off")]
    ConstantRejected(String),

    #[error("field '{path}' has type {ty}, which is a distribution or resource type")]
    UnsupportedFieldType { path: String, ty: String },

    #[error("'{0}' captures parameters, which environment and uniform-state functions cannot")]
    CapturedParameters(String),

    #[error("path '{path}' needs the {found:?} context, fragment uses {expected:?}")]
    MixedExecutionContext {
        path: String,
        expected: super::ExecutionContext,
        found: super::ExecutionContext,
    },

    #[error("'{0}' is an EDF; only BSDFs can be compiled as distribution functions")]
    EdfNotSupported(String),

    #[error("'{0}' is a VDF; only BSDFs can be compiled as distribution functions")]
    VdfNotSupported(String),

    #[error("unsupported BSDF '{0}'")]
    UnsupportedBsdf(String),

    #[error("fragment '{0}' has neither a body nor root expressions")]
    EmptyFragment(String),

    #[error("fragment '{0}' has a single body; convert it to the switch form before adding roots")]
    SwitchFormViolation(String),
}

impl CodegenError {
    pub fn code(&self) -> i32 {
        match self {
            CodegenError::InvalidParameters(_) => -1,
            CodegenError::InvalidPath(_)
            | CodegenError::InvalidEnvironmentType { .. }
            | CodegenError::LinkFailed(_) => -2,
            CodegenError::BackendFailure(_) => -3,
            CodegenError::ConstantRejected(_) => -4,
            CodegenError::UnsupportedFieldType { .. } => -5,
            CodegenError::CapturedParameters(_) => -6,
            CodegenError::MixedExecutionContext { .. } => -7,
            CodegenError::EdfNotSupported(_) => -8,
            CodegenError::VdfNotSupported(_) => -9,
            CodegenError::UnsupportedBsdf(_) => -10,
            CodegenError::EmptyFragment(_) | CodegenError::SwitchFormViolation(_) => -11,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Problem in the input (paths, types, unresolved calls).
    Compiler,
    /// The backend failed without telling us why.
    InternalBackend,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub severity: Severity,
    pub kind: MessageKind,
    pub text: String,
}

impl Message {
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind: MessageKind::Compiler,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind: MessageKind::Compiler,
            text: text.into(),
        }
    }

    pub fn internal(text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind: MessageKind::InternalBackend,
            text: text.into(),
        }
    }
}

/// A failed compile: the error plus every diagnostic collected on the way.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error}")]
pub struct CompileFailure {
    pub error: CodegenError,
    pub messages: Vec<Message>,
}

impl CompileFailure {
    pub fn code(&self) -> i32 {
        self.error.code()
    }
}

impl From<CodegenError> for CompileFailure {
    fn from(error: CodegenError) -> Self {
        let messages = vec![Message::error(error.to_string())];
        Self { error, messages }
    }
}

/// Errors from packing values into an argument block.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayoutError {
    #[error("layout address is invalid or the block is too small")]
    InvalidAddress,

    #[error("value kind {found:?} does not match layout kind {expected:?}")]
    KindMismatch {
        expected: crate::dsl::ValueKind,
        found: crate::dsl::ValueKind,
    },

    #[error("value has {found} children, layout expects {expected}")]
    ChildCountMismatch { expected: usize, found: usize },

    #[error("{0} values cannot be stored in this argument block")]
    Unsupported(String),
}

impl LayoutError {
    pub fn code(&self) -> i32 {
        match self {
            LayoutError::InvalidAddress => -1,
            LayoutError::KindMismatch { .. } => -3,
            LayoutError::ChildCountMismatch { .. } => -4,
            LayoutError::Unsupported(_) => -5,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptionError {
    #[error("unknown option '{0}'")]
    Unknown(String),

    #[error("invalid value '{value}' for option '{name}'")]
    InvalidValue { name: String, value: String },
}

impl OptionError {
    pub fn code(&self) -> i32 {
        match self {
            OptionError::Unknown(_) => -1,
            OptionError::InvalidValue { .. } => -2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_rejections_have_distinct_codes() {
        let codes = [
            CodegenError::EdfNotSupported("e".into()).code(),
            CodegenError::VdfNotSupported("v".into()).code(),
            CodegenError::UnsupportedBsdf("b".into()).code(),
        ];
        assert_eq!(codes, [-8, -9, -10]);
    }

    #[test]
    fn failure_from_error_carries_a_message() {
        let f: CompileFailure = CodegenError::InvalidPath("surface.nope".into()).into();
        assert_eq!(f.code(), -2);
        assert_eq!(f.messages.len(), 1);
        assert!(f.messages[0].text.contains("surface.nope"));
    }
}
