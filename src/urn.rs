//! URN parsing and validation.
//!
//! Functions and extensions are identified by URNs in one of four shapes:
//!
//! ```text
//! urn:<vendor>:forrst:fn:<path>        user function (vendor namespace)
//! urn:forrst:system:fn:<path>          system function (reserved)
//! urn:forrst:ext:<name>:fn:<path>      extension-owned function (reserved)
//! urn:forrst:ext:<name>                extension identity
//! ```
//!
//! `<path>` is one or more dot-separated lowercase segments
//! (`math.calculator`, `operation.status`). Vendor, extension name, and path
//! segments accept `a-z`, `0-9`, `-` and `_`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum UrnError {
    #[error("urn must start with 'urn:'")]
    MissingScheme,
    #[error("urn has unrecognized shape: '{0}'")]
    BadShape(String),
    #[error("urn segment '{0}' contains invalid characters")]
    BadSegment(String),
    #[error("urn path '{0}' is empty or malformed")]
    BadPath(String),
}

/// A validated function or extension URN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn(String);

impl Urn {
    /// Parse and validate a URN string.
    pub fn parse(raw: &str) -> Result<Self, UrnError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.first() != Some(&"urn") {
            return Err(UrnError::MissingScheme);
        }

        match parts.as_slice() {
            // urn:forrst:ext:<name>
            ["urn", "forrst", "ext", name] => {
                check_segment(name)?;
            }
            // urn:forrst:system:fn:<path> | urn:forrst:ext:<name>:fn:<path>
            ["urn", "forrst", "system", "fn", path] => {
                check_path(path)?;
            }
            ["urn", "forrst", "ext", name, "fn", path] => {
                check_segment(name)?;
                check_path(path)?;
            }
            // urn:<vendor>:forrst:fn:<path>
            ["urn", vendor, "forrst", "fn", path] if *vendor != "forrst" => {
                check_segment(vendor)?;
                check_path(path)?;
            }
            _ => return Err(UrnError::BadShape(raw.to_string())),
        }

        Ok(Urn(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this URN names a callable function (has an `:fn:` part).
    pub fn is_function(&self) -> bool {
        self.0.contains(":fn:")
    }

    /// Whether this URN falls under any of the given reserved prefixes.
    ///
    /// Only system and extension functions may register under a reserved
    /// prefix; user registrations there fail at startup.
    pub fn is_reserved(&self, reserved_prefixes: &[String]) -> bool {
        reserved_prefixes.iter().any(|p| self.0.starts_with(p.as_str()))
    }

    /// The dot-separated path portion, if this is a function URN.
    pub fn path(&self) -> Option<&str> {
        self.0.split(":fn:").nth(1)
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Urn {
    type Error = UrnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Urn::parse(&value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> String {
        urn.0
    }
}

fn check_segment(segment: &str) -> Result<(), UrnError> {
    if segment.is_empty()
        || !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(UrnError::BadSegment(segment.to_string()));
    }
    Ok(())
}

fn check_path(path: &str) -> Result<(), UrnError> {
    if path.is_empty() {
        return Err(UrnError::BadPath(path.to_string()));
    }
    for segment in path.split('.') {
        check_segment(segment).map_err(|_| UrnError::BadPath(path.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_function_urn() {
        let urn = Urn::parse("urn:acme:forrst:fn:math.calculator").unwrap();
        assert!(urn.is_function());
        assert_eq!(urn.path(), Some("math.calculator"));
    }

    #[test]
    fn test_system_and_extension_urns() {
        assert!(Urn::parse("urn:forrst:system:fn:ping").is_ok());
        assert!(Urn::parse("urn:forrst:system:fn:operation.status").is_ok());
        assert!(Urn::parse("urn:forrst:ext:deadline").is_ok());
        assert!(Urn::parse("urn:forrst:ext:cancellation:fn:cancel").is_ok());
        assert!(!Urn::parse("urn:forrst:ext:deadline").unwrap().is_function());
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(Urn::parse("not-a-urn"), Err(UrnError::MissingScheme));
        assert!(Urn::parse("urn:forrst:fn:ping").is_err());
        assert!(Urn::parse("urn:forrst:forrst:fn:ping").is_err());
        assert!(Urn::parse("urn:acme:forrst:fn:").is_err());
        assert!(Urn::parse("urn:acme:forrst:fn:Has.Caps").is_err());
        assert!(Urn::parse("urn:acme:forrst:fn:a..b").is_err());
        assert!(Urn::parse("urn:ac me:forrst:fn:x").is_err());
    }

    #[test]
    fn test_reserved_prefixes() {
        let reserved = vec!["urn:forrst:".to_string(), "urn:cline:".to_string()];
        assert!(Urn::parse("urn:forrst:system:fn:ping")
            .unwrap()
            .is_reserved(&reserved));
        assert!(!Urn::parse("urn:acme:forrst:fn:echo")
            .unwrap()
            .is_reserved(&reserved));
    }
}
