//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use axum::response::Response;
use http::StatusCode;
use serde_json::json;
use yang3::data::DataFormat;

use crate::dataformat;
use vireo_datastore::Error as DatastoreError;

/// RESTCONF-level protocol error, rendered as an RFC 8040 errors document
/// in the negotiated response encoding.
#[derive(Clone, Debug)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub error_type: ErrorType,
    pub error_tag: ErrorTag,
    pub message: String,
    pub path: Option<String>,
    /// Methods to advertise in an `Allow` header (405 responses).
    pub allow: Option<&'static str>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

/// The subset of the RFC 8040 error-tag registry this server emits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorTag {
    InvalidValue,
    InvalidAttribute,
    MalformedMessage,
    AccessDenied,
    ResourceDenied,
    DataMissing,
    OperationNotSupported,
    OperationFailed,
}

// ===== impl ErrorType =====

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Transport => "transport",
            ErrorType::Rpc => "rpc",
            ErrorType::Protocol => "protocol",
            ErrorType::Application => "application",
        }
    }
}

// ===== impl ErrorTag =====

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::InvalidValue => "invalid-value",
            ErrorTag::InvalidAttribute => "invalid-attribute",
            ErrorTag::MalformedMessage => "malformed-message",
            ErrorTag::AccessDenied => "access-denied",
            ErrorTag::ResourceDenied => "resource-denied",
            ErrorTag::DataMissing => "data-missing",
            ErrorTag::OperationNotSupported => "operation-not-supported",
            ErrorTag::OperationFailed => "operation-failed",
        }
    }
}

// ===== impl ErrorResponse =====

impl ErrorResponse {
    pub fn new(
        status: StatusCode,
        error_type: ErrorType,
        error_tag: ErrorTag,
        message: impl Into<String>,
    ) -> ErrorResponse {
        ErrorResponse {
            status,
            error_type,
            error_tag,
            message: message.into(),
            path: None,
            allow: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> ErrorResponse {
        self.path = Some(path.into());
        self
    }

    pub fn with_allow(mut self, allow: &'static str) -> ErrorResponse {
        self.allow = Some(allow);
        self
    }

    /// Renders the RFC 8040, section 7 errors document.
    pub fn into_response(self, format: DataFormat) -> Response {
        let body = match format {
            DataFormat::JSON => {
                let mut error = json!({
                    "error-type": self.error_type.as_str(),
                    "error-tag": self.error_tag.as_str(),
                    "error-message": self.message,
                });
                if let Some(path) = &self.path {
                    error["error-path"] = json!(path);
                }
                json!({
                    "ietf-restconf:errors": {
                        "error": [error],
                    }
                })
                .to_string()
            }
            _ => {
                let mut body = String::new();
                body.push_str(
                    "<errors xmlns=\"urn:ietf:params:xml:ns:yang:ietf-restconf\"><error>",
                );
                body.push_str(&format!(
                    "<error-type>{}</error-type>",
                    self.error_type.as_str()
                ));
                body.push_str(&format!(
                    "<error-tag>{}</error-tag>",
                    self.error_tag.as_str()
                ));
                if let Some(path) = &self.path {
                    body.push_str(&format!(
                        "<error-path>{}</error-path>",
                        escape_xml(path)
                    ));
                }
                body.push_str(&format!(
                    "<error-message>{}</error-message>",
                    escape_xml(&self.message)
                ));
                body.push_str("</error></errors>");
                body
            }
        };

        let mut response = Response::builder()
            .status(self.status)
            .header(
                http::header::CONTENT_TYPE,
                dataformat::as_mime_type(format),
            );
        if let Some(allow) = self.allow {
            response = response.header(http::header::ALLOW, allow);
        }
        response.body(axum::body::Body::from(body)).unwrap()
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.message,
            self.error_type.as_str(),
            self.error_tag.as_str()
        )
    }
}

impl std::error::Error for ErrorResponse {}

impl From<DatastoreError> for ErrorResponse {
    fn from(error: DatastoreError) -> ErrorResponse {
        match error {
            DatastoreError::ItemExists(path) => ErrorResponse::new(
                StatusCode::CONFLICT,
                ErrorType::Application,
                ErrorTag::ResourceDenied,
                "Resource already exists.",
            )
            .with_path(path),
            DatastoreError::ItemNotFound(path) => ErrorResponse::new(
                StatusCode::NOT_FOUND,
                ErrorType::Application,
                ErrorTag::InvalidValue,
                "Request could not be completed because the relevant data model content does not exist.",
            )
            .with_path(path),
            DatastoreError::DefaultValue(path) => ErrorResponse::new(
                StatusCode::NOT_FOUND,
                ErrorType::Application,
                ErrorTag::DataMissing,
                "Data missing.",
            )
            .with_path(path),
            DatastoreError::AccessDenied(path) => ErrorResponse::new(
                StatusCode::FORBIDDEN,
                ErrorType::Application,
                ErrorTag::AccessDenied,
                "Access denied.",
            )
            .with_path(path),
            DatastoreError::Validation(message)
            | DatastoreError::BadInput(message) => ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                ErrorType::Application,
                ErrorTag::InvalidValue,
                message,
            ),
            error => ErrorResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorType::Application,
                ErrorTag::OperationFailed,
                format!("Internal server error: {error}"),
            ),
        }
    }
}

// ===== global functions =====

/// Minimal escaping for XML text content.
pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
