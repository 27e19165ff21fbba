//! Wire envelope types: request, call, response, meta.
//!
//! A request carries a protocol envelope, a correlation id, the call
//! object, an optional context map, and an ordered list of extension
//! declarations. The response echoes the protocol and id and carries
//! exactly one of `result` or a non-empty `errors` array, plus any
//! extension outputs and server metadata.
//!
//! Requests are validated field by field from a parsed [`serde_json::Value`]
//! rather than through a blanket serde derive, so that every missing or
//! mistyped field produces an `INVALID_REQUEST` error with an RFC 6901
//! pointer to the offending location.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, ErrorObject};

/// Protocol name expected in every envelope.
pub const PROTOCOL_NAME: &str = "forrst";
/// Protocol version this server speaks.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Upper bound on `errors` entries in one response.
pub const MAX_ERRORS: usize = 100;
/// Upper bound on `extensions` entries in one response.
pub const MAX_EXTENSIONS: usize = 50;

pub type JsonMap = Map<String, Value>;

/// `{name, version}` envelope present on requests and responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolEnvelope {
    pub name: String,
    pub version: String,
}

impl ProtocolEnvelope {
    pub fn current() -> Self {
        Self {
            name: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// The call object: which function, which version, with what arguments.
#[derive(Debug, Clone, Serialize)]
pub struct Call {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// One extension declaration on a request.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionDecl {
    pub urn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// A fully validated request.
#[derive(Debug, Clone)]
pub struct Request {
    pub protocol: ProtocolEnvelope,
    pub id: String,
    pub call: Call,
    pub context: Option<JsonMap>,
    pub extensions: Vec<ExtensionDecl>,
}

impl Request {
    /// Validate a parsed JSON document into a request.
    ///
    /// Top-level arrays are rejected before this point (batch requests are
    /// not supported); this function assumes an object or scalar.
    pub fn from_value(value: &Value) -> Result<Request, ErrorObject> {
        let obj = value.as_object().ok_or_else(|| {
            ErrorObject::new(ErrorCode::InvalidRequest, "request must be a JSON object")
        })?;

        let protocol = parse_protocol(obj)?;
        let id = parse_id(obj)?;
        let call = parse_call(obj)?;
        let context = parse_context(obj)?;
        let extensions = parse_extensions(obj)?;

        Ok(Request {
            protocol,
            id,
            call,
            context,
            extensions,
        })
    }

    /// Read one context value (e.g. `caller`, `tenant_id`).
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.as_ref()?.get(key)?.as_str()
    }

    /// The extension declaration for a URN, if present.
    pub fn extension(&self, urn: &str) -> Option<&ExtensionDecl> {
        self.extensions.iter().find(|e| e.urn == urn)
    }
}

fn invalid(message: impl Into<String>, pointer: &str) -> ErrorObject {
    ErrorObject::new(ErrorCode::InvalidRequest, message).with_pointer(pointer)
}

fn parse_protocol(obj: &JsonMap) -> Result<ProtocolEnvelope, ErrorObject> {
    let value = obj
        .get("protocol")
        .ok_or_else(|| invalid("missing required field 'protocol'", "/protocol"))?;
    let proto = value
        .as_object()
        .ok_or_else(|| invalid("'protocol' must be an object", "/protocol"))?;
    let name = proto
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("'protocol.name' must be a string", "/protocol/name"))?;
    let version = proto
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("'protocol.version' must be a string", "/protocol/version"))?;
    Ok(ProtocolEnvelope {
        name: name.to_string(),
        version: version.to_string(),
    })
}

fn parse_id(obj: &JsonMap) -> Result<String, ErrorObject> {
    let id = obj
        .get("id")
        .ok_or_else(|| invalid("missing required field 'id'", "/id"))?
        .as_str()
        .ok_or_else(|| invalid("'id' must be a string", "/id"))?;
    if id.is_empty() {
        return Err(invalid("'id' must not be empty", "/id"));
    }
    Ok(id.to_string())
}

fn parse_call(obj: &JsonMap) -> Result<Call, ErrorObject> {
    let value = obj
        .get("call")
        .ok_or_else(|| invalid("missing required field 'call'", "/call"))?;
    let call = value
        .as_object()
        .ok_or_else(|| invalid("'call' must be an object", "/call"))?;

    let function = call
        .get("function")
        .ok_or_else(|| invalid("missing required field 'call.function'", "/call/function"))?
        .as_str()
        .ok_or_else(|| invalid("'call.function' must be a string", "/call/function"))?;

    let version = match call.get("version") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(invalid("'call.version' must be a string", "/call/version")),
    };

    let arguments = match call.get("arguments") {
        None | Some(Value::Null) => None,
        Some(args @ Value::Object(_)) => Some(args.clone()),
        Some(_) => {
            return Err(invalid(
                "'call.arguments' must be an object",
                "/call/arguments",
            ))
        }
    };

    Ok(Call {
        function: function.to_string(),
        version,
        arguments,
    })
}

fn parse_context(obj: &JsonMap) -> Result<Option<JsonMap>, ErrorObject> {
    match obj.get("context") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(invalid("'context' must be an object", "/context")),
    }
}

fn parse_extensions(obj: &JsonMap) -> Result<Vec<ExtensionDecl>, ErrorObject> {
    let value = match obj.get("extensions") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(v) => v,
    };
    let items = value
        .as_array()
        .ok_or_else(|| invalid("'extensions' must be an array", "/extensions"))?;

    let mut decls = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let pointer = format!("/extensions/{i}");
        let entry = item
            .as_object()
            .ok_or_else(|| invalid("extension declaration must be an object", &pointer))?;
        let urn = entry
            .get("urn")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("extension 'urn' must be a string", &pointer))?;
        let options = match entry.get("options") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        };
        decls.push(ExtensionDecl {
            urn: urn.to_string(),
            options,
        });
    }
    Ok(decls)
}

/// Check the envelope: exact protocol name, compatible version.
///
/// While the protocol major is 0, compatibility means equal major and
/// minor, per semver-0 convention.
pub fn check_envelope(envelope: &ProtocolEnvelope) -> Result<(), ErrorObject> {
    if envelope.name != PROTOCOL_NAME {
        return Err(ErrorObject::new(
            ErrorCode::InvalidProtocolVersion,
            format!("unknown protocol '{}'", envelope.name),
        )
        .with_pointer("/protocol/name"));
    }

    let theirs = semver::Version::parse(&envelope.version).map_err(|_| {
        ErrorObject::new(
            ErrorCode::InvalidProtocolVersion,
            format!("'{}' is not a semantic version", envelope.version),
        )
        .with_pointer("/protocol/version")
    })?;
    let ours = semver::Version::parse(PROTOCOL_VERSION).expect("const protocol version parses");

    let compatible = if ours.major == 0 {
        theirs.major == 0 && theirs.minor == ours.minor
    } else {
        theirs.major == ours.major
    };
    if !compatible {
        return Err(ErrorObject::new(
            ErrorCode::InvalidProtocolVersion,
            format!(
                "protocol version {} is not compatible with server version {}",
                envelope.version, PROTOCOL_VERSION
            ),
        )
        .with_details(serde_json::json!({
            "requested": envelope.version,
            "supported": [PROTOCOL_VERSION],
        })));
    }
    Ok(())
}

/// Output of one extension, echoed in the response's `extensions` array.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseExtension {
    pub urn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The response envelope.
///
/// Exactly one of `result` / `errors` is populated; [`Response::success`]
/// and [`Response::failure`] are the only constructors, so the exclusivity
/// invariant holds by construction. `result: Some(Value::Null)` is a
/// legitimate null result and serializes as `"result": null`; an error
/// response omits the key entirely.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub protocol: ProtocolEnvelope,
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorObject>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ResponseExtension>,
    pub meta: JsonMap,
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            protocol: ProtocolEnvelope::current(),
            id: Some(id.into()),
            result: Some(result),
            errors: Vec::new(),
            extensions: Vec::new(),
            meta: JsonMap::new(),
        }
    }

    /// Build a failure response. `id` is `None` only for parse failures,
    /// where no id could be recovered from the payload.
    pub fn failure(id: Option<String>, errors: Vec<ErrorObject>) -> Self {
        let mut errors = errors;
        if errors.is_empty() {
            errors.push(ErrorObject::new(
                ErrorCode::InternalError,
                "error response with no error objects",
            ));
        }
        errors.truncate(MAX_ERRORS);
        Self {
            protocol: ProtocolEnvelope::current(),
            id,
            result: None,
            errors,
            extensions: Vec::new(),
            meta: JsonMap::new(),
        }
    }

    /// Attach extension outputs, deduplicating by URN (first wins) and
    /// capping the array length.
    pub fn with_extensions(mut self, outputs: Vec<ResponseExtension>) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.extensions = outputs
            .into_iter()
            .filter(|ext| seen.insert(ext.urn.clone()))
            .take(MAX_EXTENSIONS)
            .collect();
        self
    }

    /// HTTP status for this response: the first error's mapping, or 200.
    pub fn http_status(&self) -> u16 {
        self.errors.first().map(|e| e.http_status()).unwrap_or(200)
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}
