//! Semantic version parsing, stability classification, and resolution.
//!
//! A request names a version as an exact semver string, a stability alias
//! (`stable`, `beta`, `alpha`, `rc`), or not at all. Resolution against the
//! registry's version set for a URN follows fixed rules:
//!
//! 1. Exact semver → exact match by normalized form.
//! 2. Stability alias → filter by prerelease class, pick the highest.
//! 3. Absent → rule 2 with `stable`; no silent fallback to prereleases.
//!
//! Precedence is SemVer 2.0; build metadata is ignored. On top of the
//! `semver` crate this module rejects a `v` prefix and bare integers
//! (`"2"`) so that wire versions are always fully spelled out.

use semver::Version;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum VersionSpecError {
    #[error("version '{0}' must not carry a 'v' prefix")]
    VPrefix(String),
    #[error("'{0}' is not a full semantic version or stability alias")]
    Invalid(String),
}

/// Prerelease stability class of a concrete version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stability {
    Stable,
    Rc,
    Beta,
    Alpha,
}

impl Stability {
    /// Classify a version by the first identifier of its prerelease tag.
    ///
    /// Stable means no prerelease. Unrecognized tags (e.g. `-pre.1`)
    /// classify as `None` and are reachable only by exact version.
    pub fn of(version: &Version) -> Option<Stability> {
        if version.pre.is_empty() {
            return Some(Stability::Stable);
        }
        match version.pre.split('.').next() {
            Some("rc") => Some(Stability::Rc),
            Some("beta") => Some(Stability::Beta),
            Some("alpha") => Some(Stability::Alpha),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stability::Stable => "stable",
            Stability::Rc => "rc",
            Stability::Beta => "beta",
            Stability::Alpha => "alpha",
        }
    }
}

/// A requested version: exact, by stability alias, or absent (= stable).
#[derive(Debug, Clone, PartialEq)]
pub enum VersionSpec {
    Exact(Version),
    Alias(Stability),
}

impl VersionSpec {
    /// Parse the optional `call.version` field of a request.
    pub fn parse(spec: Option<&str>) -> Result<Self, VersionSpecError> {
        let Some(raw) = spec else {
            return Ok(VersionSpec::Alias(Stability::Stable));
        };
        match raw {
            "stable" => return Ok(VersionSpec::Alias(Stability::Stable)),
            "beta" => return Ok(VersionSpec::Alias(Stability::Beta)),
            "alpha" => return Ok(VersionSpec::Alias(Stability::Alpha)),
            "rc" => return Ok(VersionSpec::Alias(Stability::Rc)),
            _ => {}
        }
        Ok(VersionSpec::Exact(parse_version(raw)?))
    }

    /// Wire form of the request, for error details.
    pub fn describe(&self) -> String {
        match self {
            VersionSpec::Exact(v) => v.to_string(),
            VersionSpec::Alias(s) => s.as_str().to_string(),
        }
    }
}

/// Strict version parse: full `major.minor.patch`, no `v` prefix.
///
/// Leading zeros and incomplete versions are already rejected by the
/// `semver` crate.
pub fn parse_version(raw: &str) -> Result<Version, VersionSpecError> {
    if raw.starts_with('v') || raw.starts_with('V') {
        return Err(VersionSpecError::VPrefix(raw.to_string()));
    }
    Version::parse(raw).map_err(|_| VersionSpecError::Invalid(raw.to_string()))
}

/// Resolve a spec against a version set. `None` means no version matched;
/// the caller builds the `VERSION_NOT_FOUND` error with the available set.
///
/// The set is assumed duplicate-free (registrations are unique), so ties
/// cannot occur.
pub fn resolve(spec: &VersionSpec, available: &[Version]) -> Option<Version> {
    match spec {
        VersionSpec::Exact(wanted) => available
            .iter()
            .find(|v| v.cmp_precedence(wanted) == std::cmp::Ordering::Equal)
            .cloned(),
        VersionSpec::Alias(stability) => available
            .iter()
            .filter(|v| Stability::of(v) == Some(*stability))
            .max()
            .cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn set() -> Vec<Version> {
        vec![v("1.0.0"), v("2.0.0"), v("3.0.0-beta.2")]
    }

    #[test]
    fn test_absent_resolves_latest_stable() {
        let spec = VersionSpec::parse(None).unwrap();
        assert_eq!(resolve(&spec, &set()), Some(v("2.0.0")));
    }

    #[test]
    fn test_beta_alias_resolves_prerelease() {
        let spec = VersionSpec::parse(Some("beta")).unwrap();
        assert_eq!(resolve(&spec, &set()), Some(v("3.0.0-beta.2")));
    }

    #[test]
    fn test_exact_match() {
        let spec = VersionSpec::parse(Some("1.0.0")).unwrap();
        assert_eq!(resolve(&spec, &set()), Some(v("1.0.0")));
    }

    #[test]
    fn test_missing_exact_version() {
        let spec = VersionSpec::parse(Some("99.0.0")).unwrap();
        assert_eq!(resolve(&spec, &set()), None);
    }

    #[test]
    fn test_no_stable_does_not_fall_back() {
        let only_pre = vec![v("1.0.0-alpha.1"), v("1.0.0-beta.1")];
        let spec = VersionSpec::parse(None).unwrap();
        assert_eq!(resolve(&spec, &only_pre), None);
    }

    #[test]
    fn test_strictness() {
        assert!(matches!(
            VersionSpec::parse(Some("v1.0.0")),
            Err(VersionSpecError::VPrefix(_))
        ));
        assert!(VersionSpec::parse(Some("2")).is_err());
        assert!(VersionSpec::parse(Some("01.0.0")).is_err());
        assert!(VersionSpec::parse(Some("1.0")).is_err());
    }

    #[test]
    fn test_stability_classification() {
        assert_eq!(Stability::of(&v("1.0.0")), Some(Stability::Stable));
        assert_eq!(Stability::of(&v("1.0.0-rc.1")), Some(Stability::Rc));
        assert_eq!(Stability::of(&v("1.0.0-alpha")), Some(Stability::Alpha));
        assert_eq!(Stability::of(&v("1.0.0-pre.1")), None);
    }

    #[test]
    fn test_build_metadata_ignored_for_precedence() {
        let set = vec![v("1.0.0+build.5")];
        let spec = VersionSpec::parse(Some("1.0.0")).unwrap();
        assert_eq!(resolve(&spec, &set), Some(v("1.0.0+build.5")));
    }

    #[test]
    fn test_parse_normalize_round_trip() {
        for raw in ["1.2.3", "3.0.0-beta.2", "10.20.30-rc.1+build.7"] {
            let first = parse_version(raw).unwrap();
            let second = parse_version(&first.to_string()).unwrap();
            assert_eq!(first, second);
        }
    }
}
