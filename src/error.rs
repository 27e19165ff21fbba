//! Protocol error model.
//!
//! Every failure on the request path is expressed as an [`ErrorObject`]
//! carrying a code from the closed [`ErrorCode`] set (or a caller-defined
//! SCREAMING_SNAKE_CASE custom code), a human-readable message, an optional
//! [`ErrorSource`] locating the problem, and optional structured `details`.
//!
//! Each closed code carries a fixed HTTP status and a fixed client/server
//! classification. The transport derives the HTTP response line from the
//! first error's code; the server never invents ad-hoc codes outside this
//! catalog.
//!
//! | Code | HTTP | Class |
//! |------|------|-------|
//! | `PARSE_ERROR` | 400 | client |
//! | `INVALID_REQUEST` | 400 | client |
//! | `INVALID_PROTOCOL_VERSION` | 400 | client |
//! | `FUNCTION_NOT_FOUND` | 404 | client |
//! | `VERSION_NOT_FOUND` | 404 | client |
//! | `INVALID_ARGUMENTS` | 400 | client |
//! | `SCHEMA_VALIDATION_FAILED` | 422 | client |
//! | `EXTENSION_NOT_SUPPORTED` | 400 | client |
//! | `EXTENSION_NOT_APPLICABLE` | 400 | client |
//! | `DEADLINE_EXCEEDED` | 504 | server |
//! | `RATE_LIMITED` | 429 | client |
//! | `CANCELLED` | 499 | client |
//! | `INTERNAL_ERROR` | 500 | server |
//! | ... | | |
//!
//! Custom codes map to HTTP 400: they are business errors raised by user
//! functions, and the server cannot assign them server-fault semantics.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Whether an error is the caller's fault or the server's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Client,
    Server,
}

/// The closed error-code set, plus caller-defined custom codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    InvalidProtocolVersion,
    FunctionNotFound,
    VersionNotFound,
    InvalidArguments,
    SchemaValidationFailed,
    ExtensionNotSupported,
    ExtensionNotApplicable,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Gone,
    DeadlineExceeded,
    RateLimited,
    Cancelled,
    InternalError,
    Unavailable,
    DependencyError,
    IdempotencyConflict,
    IdempotencyProcessing,
    AsyncOperationNotFound,
    AsyncOperationFailed,
    AsyncCannotCancel,
    /// Any SCREAMING_SNAKE_CASE code defined by a caller or a function body.
    Custom(String),
}

impl ErrorCode {
    /// The wire form of the code.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidProtocolVersion => "INVALID_PROTOCOL_VERSION",
            ErrorCode::FunctionNotFound => "FUNCTION_NOT_FOUND",
            ErrorCode::VersionNotFound => "VERSION_NOT_FOUND",
            ErrorCode::InvalidArguments => "INVALID_ARGUMENTS",
            ErrorCode::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            ErrorCode::ExtensionNotSupported => "EXTENSION_NOT_SUPPORTED",
            ErrorCode::ExtensionNotApplicable => "EXTENSION_NOT_APPLICABLE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Gone => "GONE",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::DependencyError => "DEPENDENCY_ERROR",
            ErrorCode::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            ErrorCode::IdempotencyProcessing => "IDEMPOTENCY_PROCESSING",
            ErrorCode::AsyncOperationNotFound => "ASYNC_OPERATION_NOT_FOUND",
            ErrorCode::AsyncOperationFailed => "ASYNC_OPERATION_FAILED",
            ErrorCode::AsyncCannotCancel => "ASYNC_CANNOT_CANCEL",
            ErrorCode::Custom(code) => code,
        }
    }

    /// Parse a wire code back into the closed set; anything else becomes
    /// [`ErrorCode::Custom`].
    pub fn parse(code: &str) -> Self {
        match code {
            "PARSE_ERROR" => ErrorCode::ParseError,
            "INVALID_REQUEST" => ErrorCode::InvalidRequest,
            "INVALID_PROTOCOL_VERSION" => ErrorCode::InvalidProtocolVersion,
            "FUNCTION_NOT_FOUND" => ErrorCode::FunctionNotFound,
            "VERSION_NOT_FOUND" => ErrorCode::VersionNotFound,
            "INVALID_ARGUMENTS" => ErrorCode::InvalidArguments,
            "SCHEMA_VALIDATION_FAILED" => ErrorCode::SchemaValidationFailed,
            "EXTENSION_NOT_SUPPORTED" => ErrorCode::ExtensionNotSupported,
            "EXTENSION_NOT_APPLICABLE" => ErrorCode::ExtensionNotApplicable,
            "UNAUTHORIZED" => ErrorCode::Unauthorized,
            "FORBIDDEN" => ErrorCode::Forbidden,
            "NOT_FOUND" => ErrorCode::NotFound,
            "CONFLICT" => ErrorCode::Conflict,
            "GONE" => ErrorCode::Gone,
            "DEADLINE_EXCEEDED" => ErrorCode::DeadlineExceeded,
            "RATE_LIMITED" => ErrorCode::RateLimited,
            "CANCELLED" => ErrorCode::Cancelled,
            "INTERNAL_ERROR" => ErrorCode::InternalError,
            "UNAVAILABLE" => ErrorCode::Unavailable,
            "DEPENDENCY_ERROR" => ErrorCode::DependencyError,
            "IDEMPOTENCY_CONFLICT" => ErrorCode::IdempotencyConflict,
            "IDEMPOTENCY_PROCESSING" => ErrorCode::IdempotencyProcessing,
            "ASYNC_OPERATION_NOT_FOUND" => ErrorCode::AsyncOperationNotFound,
            "ASYNC_OPERATION_FAILED" => ErrorCode::AsyncOperationFailed,
            "ASYNC_CANNOT_CANCEL" => ErrorCode::AsyncCannotCancel,
            other => ErrorCode::Custom(other.to_string()),
        }
    }

    /// HTTP status the transport maps this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ParseError
            | ErrorCode::InvalidRequest
            | ErrorCode::InvalidProtocolVersion
            | ErrorCode::InvalidArguments
            | ErrorCode::ExtensionNotSupported
            | ErrorCode::ExtensionNotApplicable
            | ErrorCode::AsyncCannotCancel => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::FunctionNotFound
            | ErrorCode::VersionNotFound
            | ErrorCode::NotFound
            | ErrorCode::AsyncOperationNotFound => 404,
            ErrorCode::Conflict
            | ErrorCode::IdempotencyConflict
            | ErrorCode::IdempotencyProcessing => 409,
            ErrorCode::Gone => 410,
            ErrorCode::SchemaValidationFailed => 422,
            ErrorCode::RateLimited => 429,
            // nginx-native; see DESIGN.md for the 499-vs-408 decision.
            ErrorCode::Cancelled => 499,
            ErrorCode::InternalError | ErrorCode::AsyncOperationFailed => 500,
            ErrorCode::DependencyError => 502,
            ErrorCode::Unavailable => 503,
            ErrorCode::DeadlineExceeded => 504,
            ErrorCode::Custom(_) => 400,
        }
    }

    /// Fixed client/server classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCode::DeadlineExceeded
            | ErrorCode::InternalError
            | ErrorCode::Unavailable
            | ErrorCode::DependencyError
            | ErrorCode::AsyncOperationFailed => ErrorClass::Server,
            _ => ErrorClass::Client,
        }
    }

    /// Whether the retry extension should attach a strategy for this code.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::DependencyError
                | ErrorCode::RateLimited
                | ErrorCode::DeadlineExceeded
        )
    }

    /// Validates a custom code shape: SCREAMING_SNAKE_CASE, non-empty.
    pub fn is_valid_custom(code: &str) -> bool {
        !code.is_empty()
            && code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
            && code.chars().next().is_some_and(|c| c.is_ascii_uppercase())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let code = ErrorCode::parse(&s);
        if let ErrorCode::Custom(custom) = &code {
            if !ErrorCode::is_valid_custom(custom) {
                return Err(de::Error::custom(format!(
                    "error code must be SCREAMING_SNAKE_CASE, got '{s}'"
                )));
            }
        }
        Ok(code)
    }
}

/// Locates the origin of an error within the request or raw payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorSource {
    /// RFC 6901 JSON pointer into the request document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    /// Byte offset into the raw payload (parse failures).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Named field, for errors not tied to a document location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// The error object carried in a response's `errors` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            details: None,
        }
    }

    pub fn with_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.source = Some(ErrorSource {
            pointer: Some(pointer.into()),
            ..Default::default()
        });
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.source = Some(ErrorSource {
            position: Some(position),
            ..Default::default()
        });
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// HTTP status of this error's code.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

/// Maps an unexpected runtime failure to a protocol error object.
///
/// This is the single choke point for unknown failures: anything that is
/// not already an [`ErrorObject`], such as a panic caught at the
/// invocation boundary or an internal `anyhow` failure, becomes
/// `INTERNAL_ERROR` here. The underlying cause lands in `details`; the
/// handler strips it before assembly unless the server is configured to
/// expose internals.
pub fn map_internal(err: &anyhow::Error) -> ErrorObject {
    ErrorObject::new(ErrorCode::InternalError, "internal server error")
        .with_details(serde_json::json!({ "cause": format!("{err:#}") }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_set_http_mapping() {
        assert_eq!(ErrorCode::ParseError.http_status(), 400);
        assert_eq!(ErrorCode::FunctionNotFound.http_status(), 404);
        assert_eq!(ErrorCode::SchemaValidationFailed.http_status(), 422);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::Cancelled.http_status(), 499);
        assert_eq!(ErrorCode::DeadlineExceeded.http_status(), 504);
        assert_eq!(ErrorCode::DependencyError.http_status(), 502);
        assert_eq!(ErrorCode::IdempotencyConflict.http_status(), 409);
    }

    #[test]
    fn test_classification() {
        assert_eq!(ErrorCode::DeadlineExceeded.class(), ErrorClass::Server);
        assert_eq!(ErrorCode::InternalError.class(), ErrorClass::Server);
        assert_eq!(ErrorCode::RateLimited.class(), ErrorClass::Client);
        assert_eq!(ErrorCode::Cancelled.class(), ErrorClass::Client);
    }

    #[test]
    fn test_wire_round_trip() {
        for code in [
            ErrorCode::ParseError,
            ErrorCode::VersionNotFound,
            ErrorCode::AsyncCannotCancel,
            ErrorCode::Custom("OUT_OF_STOCK".to_string()),
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
    }

    #[test]
    fn test_custom_code_validation() {
        assert!(ErrorCode::is_valid_custom("OUT_OF_STOCK"));
        assert!(ErrorCode::is_valid_custom("E42"));
        assert!(!ErrorCode::is_valid_custom(""));
        assert!(!ErrorCode::is_valid_custom("lowercase"));
        assert!(!ErrorCode::is_valid_custom("HAS SPACE"));
        assert!(!ErrorCode::is_valid_custom("9LEADING"));
    }

    #[test]
    fn test_custom_codes_map_to_400() {
        assert_eq!(ErrorCode::Custom("OUT_OF_STOCK".into()).http_status(), 400);
    }

    #[test]
    fn test_retryable_set() {
        assert!(ErrorCode::Unavailable.is_retryable());
        assert!(ErrorCode::RateLimited.is_retryable());
        assert!(!ErrorCode::InvalidRequest.is_retryable());
        assert!(!ErrorCode::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_object_serialization() {
        let err = ErrorObject::new(ErrorCode::InvalidArguments, "bad field")
            .with_pointer("/call/arguments/count");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "INVALID_ARGUMENTS");
        assert_eq!(json["source"]["pointer"], "/call/arguments/count");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_map_internal_confines_cause_to_details() {
        let cause = anyhow::anyhow!("db timeout behind pool 'accounts'");
        let mapped = map_internal(&cause);
        assert_eq!(mapped.code, ErrorCode::InternalError);
        // the message stays generic; the cause is in details only
        assert_eq!(mapped.message, "internal server error");
        assert!(mapped.details.unwrap()["cause"]
            .as_str()
            .unwrap()
            .contains("db timeout"));
    }
}
