//! Coordination Wire Protocol
//!
//! Requests and responses exchanged between `RemoteBackend` and
//! `CoordinationServer`, carried in length-prefixed checksummed frames.

use serde::{Deserialize, Serialize};

use super::{CreateMode, SessionId};
use crate::error::Error;

/// Request sent to the coordination server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    OpenSession { timeout_ms: u64 },
    KeepAlive { session: SessionId },
    CloseSession { session: SessionId },
    Create { session: SessionId, path: String, data: Vec<u8>, mode: CreateMode },
    Delete { session: SessionId, path: String },
    Get { path: String },
    Set { session: SessionId, path: String, data: Vec<u8> },
    Children { path: String },
}

impl Request {
    /// Get the request type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::OpenSession { .. } => "OpenSession",
            Request::KeepAlive { .. } => "KeepAlive",
            Request::CloseSession { .. } => "CloseSession",
            Request::Create { .. } => "Create",
            Request::Delete { .. } => "Delete",
            Request::Get { .. } => "Get",
            Request::Set { .. } => "Set",
            Request::Children { .. } => "Children",
        }
    }
}

/// Failure category carried back to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    SessionExpired,
    NodeExists,
    NoNode,
    Other,
}

/// Response from the coordination server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Session { session: SessionId },
    Ok,
    Data { data: Option<Vec<u8>> },
    Children { names: Vec<String> },
    Error { code: ErrorCode, message: String },
}

impl Response {
    /// Encode a backend failure
    pub fn from_error(error: &Error) -> Self {
        let (code, message) = match error {
            Error::SessionExpired => (ErrorCode::SessionExpired, String::new()),
            Error::NodeExists(path) => (ErrorCode::NodeExists, path.clone()),
            Error::NoNode(path) => (ErrorCode::NoNode, path.clone()),
            other => (ErrorCode::Other, other.to_string()),
        };
        Response::Error { code, message }
    }

    /// Decode a failure back into the crate error
    pub fn into_error(code: ErrorCode, message: String) -> Error {
        match code {
            ErrorCode::SessionExpired => Error::SessionExpired,
            ErrorCode::NodeExists => Error::NodeExists(message),
            ErrorCode::NoNode => Error::NoNode(message),
            ErrorCode::Other => Error::Coordination(message),
        }
    }

    /// Error for a response that does not answer the request
    pub fn unexpected(self, request: &str) -> Error {
        match self {
            Response::Error { code, message } => Self::into_error(code, message),
            other => Error::Coordination(format!("unexpected response to {}: {:?}", request, other)),
        }
    }
}
