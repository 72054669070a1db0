//! Command-module strategy interface and the per-toolkit registry.
//!
//! A command module is a passive helper describing one named remote command:
//! its default command line, flags and result key. Modules are resolved by
//! name through a [`ModuleRegistry`] of constructor functions (registration,
//! not reflection) and cached as singletons on the owning toolkit, so
//! concurrent toolkits never share module state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::CommandRequest;

/// Static description of what a module runs by default.
#[derive(Debug, Clone)]
pub struct ModuleDefaults {
    /// The base command, e.g. `df`.
    pub command: String,
    /// Default flags appended when the caller supplies none.
    pub flags: String,
    /// Explicit result key; derived from the command text when absent.
    pub key: Option<String>,
}

impl ModuleDefaults {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            flags: String::new(),
            key: None,
        }
    }

    pub fn flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = flags.into();
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// The strategy interface every command module implements.
pub trait CommandModule: Send + Sync {
    /// Registry name of this module.
    fn name(&self) -> &str;

    /// The module's default command line.
    fn defaults(&self) -> ModuleDefaults;

    /// Builds the request this module runs, with `flags` overriding the
    /// defaults.
    fn build_request(&self, flags: Option<&str>) -> CommandRequest {
        let defaults = self.defaults();
        let flags = flags.unwrap_or(&defaults.flags);
        let command = if flags.is_empty() {
            defaults.command.clone()
        } else {
            format!("{} {}", defaults.command, flags)
        };
        match defaults.key {
            Some(key) => CommandRequest::keyed(key, command),
            None => CommandRequest::from(command),
        }
    }
}

/// Constructor producing one module instance.
pub type ModuleConstructor = Box<dyn Fn() -> Arc<dyn CommandModule> + Send + Sync>;

/// Name-to-constructor mapping. Adding a module is a registration call.
#[derive(Default)]
pub struct ModuleRegistry {
    constructors: HashMap<String, ModuleConstructor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `name`, replacing any previous one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn() -> Arc<dyn CommandModule> + Send + Sync + 'static,
    ) {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    /// Instantiates the module registered under `name`.
    pub fn construct(&self, name: &str) -> Option<Arc<dyn CommandModule>> {
        self.constructors.get(name).map(|constructor| constructor())
    }

    /// All registered module names.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

/// A module defined entirely by its defaults. Covers the common case of
/// wrapping one Linux command without custom behavior.
pub struct GenericModule {
    name: String,
    defaults: ModuleDefaults,
}

impl GenericModule {
    pub fn new(name: impl Into<String>, defaults: ModuleDefaults) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            defaults,
        })
    }
}

impl CommandModule for GenericModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn defaults(&self) -> ModuleDefaults {
        self.defaults.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRequest;

    #[test]
    fn registry_constructs_registered_modules() {
        let mut registry = ModuleRegistry::new();
        registry.register("df", || {
            GenericModule::new("df", ModuleDefaults::new("df").flags("-h").key("df"))
        });

        let module = registry.construct("df").expect("df module");
        assert_eq!(module.name(), "df");
        assert!(registry.construct("missing").is_none());
    }

    #[test]
    fn build_request_uses_default_flags_and_key() {
        let module = GenericModule::new("df", ModuleDefaults::new("df").flags("-h").key("df"));
        match module.build_request(None) {
            CommandRequest::Single { key, command } => {
                assert_eq!(key.as_deref(), Some("df"));
                assert_eq!(command, "df -h");
            }
            _ => panic!("expected a single command"),
        }
    }

    #[test]
    fn caller_flags_override_defaults() {
        let module = GenericModule::new("df", ModuleDefaults::new("df").flags("-h"));
        match module.build_request(Some("-i /var")) {
            CommandRequest::Single { command, .. } => assert_eq!(command, "df -i /var"),
            _ => panic!("expected a single command"),
        }
    }
}
