//! Domain error types for the gateway.
//!
//! Errors are designed for layered context using rootcause:
//! - `PipelineError`: Failures that stop the authentication pipeline
//! - `StartupError`: Problems assembling the gateway from its configuration

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;

/// Errors that end a request with a server error instead of a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A stage ran before the request scope was attached.
    MissingScope { stage: &'static str },
    /// The session store could not be read and no other session was found.
    StoreUnavailable { details: String },
    /// The pipeline finished without a session or a response.
    NoDecision,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScope { stage } => {
                write!(f, "stage '{stage}' ran without a request scope")
            }
            Self::StoreUnavailable { details } => {
                write!(f, "session store unavailable: {details}")
            }
            Self::NoDecision => write!(f, "pipeline finished without a decision"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "authentication pipeline failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
    }
}

/// Errors from building the gateway at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    /// A configured value is unusable.
    Configuration { details: String },
    /// The session store could not be created or reached.
    Store,
    /// The identity provider could not be set up.
    Provider,
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { details } => write!(f, "invalid configuration: {details}"),
            Self::Store => write!(f, "failed to set up session store"),
            Self::Provider => write!(f, "failed to set up identity provider"),
        }
    }
}

impl std::error::Error for StartupError {}
