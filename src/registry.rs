//! Function registry: URN + version indexing and resolution.
//!
//! The registry is built once at startup through [`RegistryBuilder`] and
//! frozen. Request-time reads go through plain `HashMap` lookups behind an
//! `Arc` with no synchronization.
//!
//! Registration enforces, as fatal startup errors:
//! - URN shape and version strictness (via the descriptor),
//! - `(urn, version)` uniqueness,
//! - the reserved-namespace policy: only system/extension functions may
//!   register under a reserved prefix (`urn:forrst:*` by default).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use semver::Version;

use crate::error::{ErrorCode, ErrorObject};
use crate::function::{Function, FunctionDescriptor};
use crate::urn::Urn;
use crate::version::{resolve, Stability, VersionSpec};

pub struct RegistryBuilder {
    by_key: HashMap<(Urn, Version), Arc<dyn Function>>,
    reserved_prefixes: Vec<String>,
}

impl RegistryBuilder {
    pub fn new(reserved_prefixes: Vec<String>) -> Self {
        Self {
            by_key: HashMap::new(),
            reserved_prefixes,
        }
    }

    /// Register a user function. Reserved namespaces are rejected.
    pub fn register(&mut self, function: Arc<dyn Function>) -> Result<&mut Self> {
        let urn = function.descriptor().urn.clone();
        if urn.is_reserved(&self.reserved_prefixes) {
            bail!("'{urn}' is in a reserved namespace; user functions cannot register there");
        }
        self.insert(function)
    }

    /// Register a system or extension function (reserved namespaces allowed).
    pub fn register_system(&mut self, function: Arc<dyn Function>) -> Result<&mut Self> {
        self.insert(function)
    }

    fn insert(&mut self, function: Arc<dyn Function>) -> Result<&mut Self> {
        let descriptor = function.descriptor();
        if !descriptor.urn.is_function() {
            bail!("'{}' is not a function urn", descriptor.urn);
        }
        let key = (descriptor.urn.clone(), descriptor.version.clone());
        if self.by_key.contains_key(&key) {
            bail!("duplicate registration for {} version {}", key.0, key.1);
        }
        self.by_key.insert(key, function);
        Ok(self)
    }

    /// Freeze the registry. Version lists are sorted ascending once, here.
    pub fn build(self) -> FunctionRegistry {
        let mut by_urn: HashMap<Urn, Vec<Version>> = HashMap::new();
        for (urn, version) in self.by_key.keys() {
            by_urn.entry(urn.clone()).or_default().push(version.clone());
        }
        for versions in by_urn.values_mut() {
            versions.sort();
        }
        FunctionRegistry {
            by_key: self.by_key,
            by_urn,
        }
    }
}

/// Read-only function index. See module docs for construction.
pub struct FunctionRegistry {
    by_key: HashMap<(Urn, Version), Arc<dyn Function>>,
    by_urn: HashMap<Urn, Vec<Version>>,
}

impl FunctionRegistry {
    /// Resolve a call target to a concrete registered function.
    pub fn resolve(
        &self,
        function: &str,
        version: Option<&str>,
    ) -> Result<Arc<dyn Function>, ErrorObject> {
        let urn = Urn::parse(function).map_err(|e| {
            ErrorObject::new(
                ErrorCode::InvalidRequest,
                format!("invalid function urn: {e}"),
            )
            .with_pointer("/call/function")
        })?;

        let Some(available) = self.by_urn.get(&urn) else {
            return Err(ErrorObject::new(
                ErrorCode::FunctionNotFound,
                format!("no function registered for '{urn}'"),
            )
            .with_details(serde_json::json!({ "function": urn.as_str() })));
        };

        let spec = VersionSpec::parse(version).map_err(|e| {
            ErrorObject::new(ErrorCode::InvalidRequest, e.to_string())
                .with_pointer("/call/version")
        })?;

        let Some(resolved) = resolve(&spec, available) else {
            return Err(ErrorObject::new(
                ErrorCode::VersionNotFound,
                format!("no version of '{urn}' matches '{}'", spec.describe()),
            )
            .with_details(serde_json::json!({
                "function": urn.as_str(),
                "requested_version": version,
                "available_versions": available.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
            })));
        };

        Ok(self.by_key[&(urn, resolved)].clone())
    }

    /// `{urn → [versions]}` for the capabilities document.
    pub fn list(&self) -> BTreeMap<String, Vec<String>> {
        self.by_urn
            .iter()
            .map(|(urn, versions)| {
                (
                    urn.as_str().to_string(),
                    versions.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect()
    }

    /// Descriptors for the discovery document, skipping hidden functions.
    ///
    /// Results are ordered by URN then ascending version so the document
    /// is stable across calls.
    pub fn for_describe(
        &self,
        function: Option<&str>,
        version: Option<&str>,
    ) -> Vec<&FunctionDescriptor> {
        let mut keys: Vec<&(Urn, Version)> = self.by_key.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| {
                let descriptor = self.by_key[key].descriptor();
                if !descriptor.discoverable {
                    return None;
                }
                if let Some(wanted) = function {
                    if descriptor.urn.as_str() != wanted {
                        return None;
                    }
                }
                if let Some(wanted) = version {
                    if descriptor.version.to_string() != wanted {
                        return None;
                    }
                }
                Some(descriptor)
            })
            .collect()
    }

    /// Versions with their stability tags for one URN.
    pub fn stability_tags(&self, urn: &Urn) -> Vec<(String, Option<Stability>)> {
        self.by_urn
            .get(urn)
            .map(|versions| {
                versions
                    .iter()
                    .map(|v| (v.to_string(), Stability::of(v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationContext;
    use crate::function::FunctionResult;
    use crate::protocol::JsonMap;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed(FunctionDescriptor);

    #[async_trait]
    impl Function for Fixed {
        fn descriptor(&self) -> &FunctionDescriptor {
            &self.0
        }

        async fn invoke(&self, _ctx: &InvocationContext, _args: JsonMap) -> FunctionResult {
            Ok(json!(null))
        }
    }

    fn fixed(urn: &str, version: &str) -> Arc<dyn Function> {
        Arc::new(Fixed(FunctionDescriptor::new(urn, version).unwrap()))
    }

    fn reserved() -> Vec<String> {
        vec!["urn:forrst:".to_string(), "urn:cline:".to_string()]
    }

    fn calculator_registry() -> FunctionRegistry {
        let mut builder = RegistryBuilder::new(reserved());
        builder
            .register(fixed("urn:acme:forrst:fn:math.calculator", "1.0.0"))
            .unwrap();
        builder
            .register(fixed("urn:acme:forrst:fn:math.calculator", "2.0.0"))
            .unwrap();
        builder
            .register(fixed("urn:acme:forrst:fn:math.calculator", "3.0.0-beta.2"))
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_resolution_rules() {
        let registry = calculator_registry();
        let urn = "urn:acme:forrst:fn:math.calculator";

        let latest = registry.resolve(urn, None).unwrap();
        assert_eq!(latest.descriptor().version.to_string(), "2.0.0");

        let beta = registry.resolve(urn, Some("beta")).unwrap();
        assert_eq!(beta.descriptor().version.to_string(), "3.0.0-beta.2");

        let exact = registry.resolve(urn, Some("1.0.0")).unwrap();
        assert_eq!(exact.descriptor().version.to_string(), "1.0.0");
    }

    #[test]
    fn test_version_not_found_details() {
        let registry = calculator_registry();
        let err = registry
            .resolve("urn:acme:forrst:fn:math.calculator", Some("99.0.0"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::VersionNotFound);
        let details = err.details.unwrap();
        assert_eq!(
            details["available_versions"],
            json!(["1.0.0", "2.0.0", "3.0.0-beta.2"])
        );
        assert_eq!(details["requested_version"], "99.0.0");
    }

    #[test]
    fn test_function_not_found() {
        let err = calculator_registry()
            .resolve("urn:acme:forrst:fn:nope", None)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FunctionNotFound);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut builder = RegistryBuilder::new(reserved());
        builder
            .register(fixed("urn:acme:forrst:fn:echo", "1.0.0"))
            .unwrap();
        assert!(builder
            .register(fixed("urn:acme:forrst:fn:echo", "1.0.0"))
            .is_err());
    }

    #[test]
    fn test_reserved_namespace_policy() {
        let mut builder = RegistryBuilder::new(reserved());
        assert!(builder
            .register(fixed("urn:cline:forrst:fn:rogue", "1.0.0"))
            .is_err());
        assert!(builder
            .register_system(fixed("urn:forrst:system:fn:ping", "1.0.0"))
            .is_ok());
    }

    #[test]
    fn test_describe_skips_hidden() {
        let mut builder = RegistryBuilder::new(reserved());
        builder
            .register(Arc::new(Fixed(
                FunctionDescriptor::new("urn:acme:forrst:fn:visible", "1.0.0").unwrap(),
            )))
            .unwrap();
        builder
            .register(Arc::new(Fixed(
                FunctionDescriptor::new("urn:acme:forrst:fn:secret", "1.0.0")
                    .unwrap()
                    .hidden(),
            )))
            .unwrap();
        let registry = builder.build();
        let described = registry.for_describe(None, None);
        assert_eq!(described.len(), 1);
        assert_eq!(described[0].urn.as_str(), "urn:acme:forrst:fn:visible");
    }

    #[test]
    fn test_resolved_version_in_registry_set() {
        let registry = calculator_registry();
        let urn = Urn::parse("urn:acme:forrst:fn:math.calculator").unwrap();
        for spec in [None, Some("beta"), Some("2.0.0")] {
            let resolved = registry
                .resolve("urn:acme:forrst:fn:math.calculator", spec)
                .unwrap();
            let version = resolved.descriptor().version.to_string();
            assert!(registry
                .stability_tags(&urn)
                .iter()
                .any(|(v, _)| *v == version));
        }
    }
}
