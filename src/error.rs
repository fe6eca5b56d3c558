//! Error types for the SAML2 service provider engine.
//!
//! Structural and validation failures accumulate and are reported together;
//! binding and signature failures are fail-fast since they mean the message
//! cannot be trusted at all.

use std::fmt;

use thiserror::Error;

/// Result type for SAML operations.
pub type SamlResult<T> = Result<T, SamlError>;

/// How serious a recorded XML problem is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Something was skipped but the document can still be used.
    Warning,
    /// The document does not follow the schema.
    Error,
}

/// A problem found while walking an XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError {
    pub severity: Severity,
    /// Slash separated element path, e.g. `/Response/Assertion[1]/Subject`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A single failed check of a response against the validation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Response issuer {actual} does not match expected {expected}")]
    Issuer { expected: String, actual: String },

    #[error("trust error: {0}")]
    Trust(String),

    #[error("conditions not met: {0}")]
    Conditions(String),

    #[error("correlation failed: {0}")]
    Correlation(String),

    #[error("unsuccessful status: {0}")]
    Status(String),
}

/// Crate-wide error.
#[derive(Debug, Error)]
pub enum SamlError {
    /// The input is not well-formed XML.
    #[error("XML parsing error: {0}")]
    Xml(String),

    /// The XML is well-formed but does not match the expected structure.
    #[error("structural error: {}", join(.0))]
    Structural(Vec<XmlError>),

    /// Transport decoding of untrusted input failed.
    #[error("binding error: {0}")]
    Binding(String),

    /// A signature could not be verified.
    #[error("signature validation failed: {0}")]
    Signature(String),

    /// One or more response validation checks failed.
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SamlError {
    /// Validation failures carried by this error, if any.
    #[must_use]
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Self::Validation(errors) => errors,
            _ => &[],
        }
    }

    /// HTTP status an adapter should answer with when this error ends a request.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Xml(_) | Self::Structural(_) | Self::Binding(_) => 400,
            Self::Signature(_) | Self::Validation(_) => 401,
            Self::Configuration(_) | Self::Serialization(_) | Self::Crypto(_) => 500,
        }
    }
}

impl From<quick_xml::Error> for SamlError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Xml(err.to_string())
    }
}
