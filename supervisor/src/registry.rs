//! Declarative catalog of known agents.
//!
//! The registry is rebuilt on every supervisor start: seeded from the
//! embedded catalog plus the configuration file, then extended by
//! `register_agent` traffic. Definitions are copy-on-read and never deleted.

pub mod builtin;
pub mod definition;

use definition::AgentDefinition;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("malformed agent catalog: {0}")]
    Catalog(#[from] serde_yaml::Error),
}

pub struct AgentRegistry {
    definitions: RwLock<HashMap<String, AgentDefinition>>,
}

impl AgentRegistry {
    /// Builds a registry holding the embedded catalog plus any extra
    /// definitions (typically from the configuration file). Later
    /// definitions override earlier ones by name.
    pub fn with_builtin(extra: Vec<AgentDefinition>) -> Result<Self, RegistryError> {
        let mut definitions: HashMap<String, AgentDefinition> = builtin::catalog()?
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        for def in extra {
            definitions.insert(def.name.clone(), def);
        }
        info!(count = definitions.len(), "agent registry seeded");
        Ok(Self {
            definitions: RwLock::new(definitions),
        })
    }

    /// Empty registry, used by tests and by callers providing the full set
    /// of definitions themselves.
    pub fn from_definitions(definitions: impl IntoIterator<Item = AgentDefinition>) -> Self {
        Self {
            definitions: RwLock::new(
                definitions
                    .into_iter()
                    .map(|def| (def.name.clone(), def))
                    .collect(),
            ),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<AgentDefinition> {
        self.definitions
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All known definitions, ordered by name for stable output.
    pub fn list(&self) -> Vec<AgentDefinition> {
        let mut definitions: Vec<AgentDefinition> = self
            .definitions
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Names of persistent definitions marked as singletons.
    pub fn singleton_set(&self) -> BTreeSet<String> {
        self.definitions
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|def| def.is_singleton())
            .map(|def| def.name.clone())
            .collect()
    }

    /// Inserts or overrides a definition. Definitions are append/override
    /// only, there is no removal path.
    pub fn register(&self, definition: AgentDefinition) {
        debug!(agent = %definition.name, "registering agent definition");
        self.definitions
            .write()
            .expect("registry lock poisoned")
            .insert(definition.name.clone(), definition);
    }
}
