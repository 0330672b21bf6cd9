//! Error taxonomy for harvesting.
//!
//! Session-level failures (configuration, protocol, transport, database)
//! are returned as [`HarvestError`] and end the run. Record-level failures
//! ([`HarvestError::Parse`]) are logged by the caller and the record is
//! skipped.

use std::fmt;

use thiserror::Error;

/// Result alias used across the harvesting core.
pub type Result<T> = std::result::Result<T, HarvestError>;

#[derive(Error, Debug)]
pub enum HarvestError {
    /// Invalid or missing configuration. Raised before any request is sent.
    #[error("configuration error: {0}")]
    Config(String),

    /// An `<error>` element returned by the repository.
    #[error("OAI-PMH error {0}")]
    Protocol(ProtocolError),

    /// The repository could not be reached or answered with a failure status.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body is not an OAI-PMH document.
    #[error("malformed response: {0}")]
    Xml(String),

    /// A single record could not be decoded.
    #[error("cannot parse record {identifier}: {message}")]
    Parse { identifier: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A concurrent session task ended without reporting.
    #[error("task failed: {0}")]
    Task(String),
}

impl HarvestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transport(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn parse(identifier: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Parse {
            identifier: identifier.into(),
            message: message.to_string(),
        }
    }

    /// The protocol error carried by this failure, if any.
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProtocolError> for HarvestError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

/// Machine-readable OAI-PMH error codes.
///
/// Codes the protocol defines get their own variant; anything else is kept
/// verbatim in [`OaiErrorCode::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OaiErrorCode {
    BadArgument,
    BadResumptionToken,
    BadVerb,
    CannotDisseminateFormat,
    IdDoesNotExist,
    NoRecordsMatch,
    NoMetadataFormats,
    NoSetHierarchy,
    Other(String),
}

impl OaiErrorCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "badArgument" => Self::BadArgument,
            "badResumptionToken" => Self::BadResumptionToken,
            "badVerb" => Self::BadVerb,
            "cannotDisseminateFormat" => Self::CannotDisseminateFormat,
            "idDoesNotExist" => Self::IdDoesNotExist,
            "noRecordsMatch" => Self::NoRecordsMatch,
            "noMetadataFormats" => Self::NoMetadataFormats,
            "noSetHierarchy" => Self::NoSetHierarchy,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::BadArgument => "badArgument",
            Self::BadResumptionToken => "badResumptionToken",
            Self::BadVerb => "badVerb",
            Self::CannotDisseminateFormat => "cannotDisseminateFormat",
            Self::IdDoesNotExist => "idDoesNotExist",
            Self::NoRecordsMatch => "noRecordsMatch",
            Self::NoMetadataFormats => "noMetadataFormats",
            Self::NoSetHierarchy => "noSetHierarchy",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for OaiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error element found in a repository response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: OaiErrorCode,
    pub description: String,
}

impl ProtocolError {
    pub fn new(code: &str, description: impl Into<String>) -> Self {
        Self {
            code: OaiErrorCode::from_code(code),
            description: description.into(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.description)
        }
    }
}
