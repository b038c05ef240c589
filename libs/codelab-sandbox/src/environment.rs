/// Sandbox Environment Builder
///
/// Produces the immutable name -> binding set a snippet is evaluated against.
/// Only safe primitives are listed; host facilities appear only when a
/// capability flag adds exactly one scoped binding for them.

use codelab_common::config::SandboxConfig;
use codelab_common::types::{Capabilities, SandboxFixtures};
use std::collections::BTreeMap;

/// Globals every snippet may see
const INTRINSICS: &[&str] = &[
    // values
    "globalThis",
    "undefined",
    "NaN",
    "Infinity",
    // functions
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "encodeURI",
    "encodeURIComponent",
    "decodeURI",
    "decodeURIComponent",
    // fundamental objects
    "Object",
    "Boolean",
    "Symbol",
    // numbers and text
    "Number",
    "BigInt",
    "Math",
    "String",
    "RegExp",
    // collections
    "Array",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "ArrayBuffer",
    "DataView",
    "Int8Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "Int16Array",
    "Uint16Array",
    "Int32Array",
    "Uint32Array",
    "Float32Array",
    "Float64Array",
    "BigInt64Array",
    "BigUint64Array",
    // structured data and reflection
    "JSON",
    "Reflect",
    // errors
    "Error",
    "TypeError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "URIError",
    "EvalError",
    "AggregateError",
];

/// Namespace objects frozen along with the constructors
const NAMESPACES: &[&str] = &["Math", "JSON", "Reflect"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Fixture-backed `fetch`
    Network,
    /// In-memory `fs`
    FileSystem,
    /// `eval` and the `Function` constructor
    Eval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Intrinsic,
    Console,
    Capability(Capability),
}

/// Interpreter limits applied to the realm
#[derive(Debug, Clone)]
pub struct RealmLimits {
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    pub stack_size_limit: usize,
    pub max_console_entries: usize,
    pub max_value_depth: usize,
    pub max_nesting_depth: usize,
    pub random_seed: u32,
    pub freeze_intrinsics: bool,
}

impl From<&SandboxConfig> for RealmLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            loop_iteration_limit: config.loop_iteration_limit,
            recursion_limit: config.recursion_limit,
            stack_size_limit: config.stack_size_limit,
            max_console_entries: config.max_console_entries,
            max_value_depth: config.max_value_depth,
            max_nesting_depth: config.max_nesting_depth,
            random_seed: config.random_seed,
            freeze_intrinsics: config.freeze_intrinsics,
        }
    }
}

/// Frozen binding set for one execution.
///
/// No mutators and no `Clone`: an Environment is built per request and moved
/// into exactly one engine call.
#[derive(Debug)]
pub struct Environment {
    bindings: BTreeMap<String, Binding>,
    capabilities: Capabilities,
    fixtures: SandboxFixtures,
    limits: RealmLimits,
}

impl Environment {
    pub fn bindings(&self) -> &BTreeMap<String, Binding> {
        &self.bindings
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn fixtures(&self) -> &SandboxFixtures {
        &self.fixtures
    }

    pub fn limits(&self) -> &RealmLimits {
        &self.limits
    }

    pub fn namespaces() -> &'static [&'static str] {
        NAMESPACES
    }
}

/// Builds Environments from configuration plus request-scoped fixtures
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    limits: RealmLimits,
    fixtures: SandboxFixtures,
}

impl EnvironmentBuilder {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            limits: RealmLimits::from(config),
            fixtures: SandboxFixtures::default(),
        }
    }

    pub fn with_fixtures(mut self, fixtures: SandboxFixtures) -> Self {
        self.fixtures = fixtures;
        self
    }

    pub fn build(&self, capabilities: Capabilities) -> Environment {
        let mut bindings: BTreeMap<String, Binding> = INTRINSICS
            .iter()
            .map(|name| (name.to_string(), Binding::Intrinsic))
            .collect();
        bindings.insert("console".to_string(), Binding::Console);

        if capabilities.allow_network {
            bindings.insert("fetch".to_string(), Binding::Capability(Capability::Network));
        }
        if capabilities.allow_file_system {
            bindings.insert("fs".to_string(), Binding::Capability(Capability::FileSystem));
        }
        if capabilities.allow_eval {
            bindings.insert("eval".to_string(), Binding::Capability(Capability::Eval));
            bindings.insert("Function".to_string(), Binding::Capability(Capability::Eval));
        }

        // Fixtures for a capability that was not granted never reach the realm
        let fixtures = SandboxFixtures {
            network: if capabilities.allow_network {
                self.fixtures.network.clone()
            } else {
                BTreeMap::new()
            },
            files: if capabilities.allow_file_system {
                self.fixtures.files.clone()
            } else {
                BTreeMap::new()
            },
        };

        Environment {
            bindings,
            capabilities,
            fixtures,
            limits: self.limits.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_environment_omits_host_facilities() {
        let env = EnvironmentBuilder::new(&SandboxConfig::default()).build(Capabilities::none());
        for name in ["fetch", "fs", "eval", "Function", "Date", "Promise", "setTimeout", "process"] {
            assert!(!env.contains(name), "{} should not be bound", name);
        }
        for name in ["Math", "JSON", "Array", "Map", "TypeError", "console"] {
            assert!(env.contains(name), "{} should be bound", name);
        }
    }

    #[test]
    fn test_capabilities_add_scoped_bindings() {
        let caps = Capabilities {
            allow_network: true,
            allow_file_system: true,
            allow_eval: true,
        };
        let env = EnvironmentBuilder::new(&SandboxConfig::default()).build(caps);
        assert_eq!(env.bindings().get("fetch"), Some(&Binding::Capability(Capability::Network)));
        assert_eq!(env.bindings().get("fs"), Some(&Binding::Capability(Capability::FileSystem)));
        assert!(env.contains("eval"));
        assert!(env.contains("Function"));
    }

    #[test]
    fn test_fixtures_follow_capabilities() {
        let mut fixtures = SandboxFixtures::default();
        fixtures.network.insert("https://api.test/a".into(), "{}".into());
        fixtures.files.insert("/data.txt".into(), "hello".into());

        let builder = EnvironmentBuilder::new(&SandboxConfig::default()).with_fixtures(fixtures);
        let env = builder.build(Capabilities {
            allow_file_system: true,
            ..Capabilities::none()
        });
        assert!(env.fixtures().network.is_empty());
        assert_eq!(env.fixtures().files.get("/data.txt").map(String::as_str), Some("hello"));
    }
}
