//! Name-based lookup of policy types for configuration and loading.

use std::fmt;
use std::path::Path;

use crate::config::PolicySpec;
use crate::error::ConfigError;
use crate::policy::{
    AugmentedMemoizationPolicy, FallbackPolicy, MemoizationPolicy, Policy, PolicyLoadResult,
    RegistrablePolicy, RulePolicy, UnexpectedIntentPolicy,
};

/// Builds a policy from its configuration.
pub type PolicyFactory = fn(&PolicySpec) -> Result<Box<dyn Policy>, ConfigError>;

/// Restores a persisted policy from its directory.
pub type PolicyLoader = fn(&Path) -> PolicyLoadResult;

/// Registry entry for one policy type.
#[derive(Clone)]
pub struct RegisteredPolicy {
    /// Short type name.
    pub type_name: &'static str,
    /// Module path forming the qualified name.
    pub module_path: &'static str,
    /// Builds an untrained instance.
    pub create: PolicyFactory,
    /// Restores a persisted instance.
    pub load: PolicyLoader,
}

impl fmt::Debug for RegisteredPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredPolicy")
            .field("type_name", &self.type_name)
            .field("module_path", &self.module_path)
            .finish_non_exhaustive()
    }
}

fn create_boxed<P: RegistrablePolicy>(spec: &PolicySpec) -> Result<Box<dyn Policy>, ConfigError> {
    Ok(Box::new(P::from_spec(spec)?))
}

fn load_boxed<P: RegistrablePolicy>(dir: &Path) -> PolicyLoadResult {
    Ok(P::load(dir)?.map(|p| Box::new(p) as Box<dyn Policy>))
}

impl RegisteredPolicy {
    /// Entry for a [`RegistrablePolicy`] type.
    #[must_use]
    pub fn of<P: RegistrablePolicy>() -> Self {
        Self {
            type_name: P::TYPE_NAME,
            module_path: P::MODULE_PATH,
            create: create_boxed::<P>,
            load: load_boxed::<P>,
        }
    }

    /// `module::path::TypeName`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.module_path, self.type_name)
    }
}

/// Explicit table of known policy types.
///
/// Names resolve either by exact qualified name or, for unqualified names,
/// by short type name.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    entries: Vec<RegisteredPolicy>,
}

impl PolicyRegistry {
    /// A registry without entries.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding every built-in policy.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry
            .register(RegisteredPolicy::of::<MemoizationPolicy>())
            .register(RegisteredPolicy::of::<AugmentedMemoizationPolicy>())
            .register(RegisteredPolicy::of::<RulePolicy>())
            .register(RegisteredPolicy::of::<UnexpectedIntentPolicy>())
            .register(RegisteredPolicy::of::<FallbackPolicy>());
        registry
    }

    /// Adds an entry, replacing any entry with the same qualified name.
    pub fn register(&mut self, entry: RegisteredPolicy) -> &mut Self {
        let qualified = entry.qualified_name();
        self.entries.retain(|e| e.qualified_name() != qualified);
        self.entries.push(entry);
        self
    }

    /// Convenience for `register(RegisteredPolicy::of::<P>())`.
    pub fn register_type<P: RegistrablePolicy>(&mut self) -> &mut Self {
        self.register(RegisteredPolicy::of::<P>())
    }

    /// Looks up a policy type.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&RegisteredPolicy> {
        if let Some(entry) = self.entries.iter().find(|e| e.qualified_name() == name) {
            return Some(entry);
        }
        if name.contains("::") || name.contains('.') {
            return None;
        }
        // Later registrations shadow earlier ones with the same short name.
        self.entries.iter().rev().find(|e| e.type_name == name)
    }

    /// Builds a policy from its spec.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownPolicy` if the name does not resolve, or
    /// the factory's error for invalid options.
    pub fn create(&self, spec: &PolicySpec) -> Result<Box<dyn Policy>, ConfigError> {
        let entry = self.resolve(&spec.name).ok_or_else(|| ConfigError::UnknownPolicy {
            name: spec.name.clone(),
        })?;
        (entry.create)(spec)
    }

    /// Short names of all registered types, in registration order.
    #[must_use]
    pub fn type_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.type_name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_resolves_short_and_qualified_names() {
        let registry = PolicyRegistry::builtin();
        let entry = registry.resolve("MemoizationPolicy").unwrap();
        assert_eq!(entry.type_name, "MemoizationPolicy");

        let qualified = entry.qualified_name();
        assert!(qualified.ends_with("::MemoizationPolicy"));
        assert_eq!(registry.resolve(&qualified).unwrap().type_name, "MemoizationPolicy");
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let registry = PolicyRegistry::builtin();
        assert!(registry.resolve("ykaüoppodas").is_none());
        assert!(registry.resolve("ykaüoppodas.bladibla").is_none());
        assert!(registry.resolve("colloquy::policy::Nope").is_none());
    }

    #[test]
    fn create_reports_unknown_policy() {
        let err = PolicyRegistry::builtin()
            .create(&PolicySpec::new("ykaüoppodas"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPolicy { .. }));
    }

    #[test]
    fn register_replaces_same_qualified_name() {
        let mut registry = PolicyRegistry::builtin();
        let before = registry.type_names().len();
        registry.register_type::<RulePolicy>();
        assert_eq!(registry.type_names().len(), before);
        assert_eq!(registry.type_names().last(), Some(&"RulePolicy"));
    }
}
