//! Embedded catalog of built-in agent definitions.
//!
//! These mirror the agents shipped with the platform. Deployments override
//! or extend them through the `agents` section of the supervisor
//! configuration or at runtime via `register_agent`.

use super::RegistryError;
use super::definition::AgentDefinition;

const BUILTIN_CATALOG: &str = r#"
- name: AGT-NAMING-1
  description: Capability and module name allocator
  kind: persistent
  capabilities: [naming, allocation]
  exec:
    bin: agt-naming
  dependencies:
    - service: bus
      kind: infrastructure
      endpoint: bus
      critical: true
      retry_count: 3
      retry_delay_seconds: 5

- name: AGT-SEMANTIC-1
  description: Semantic vector store client
  kind: persistent
  capabilities: [semantic-search, embeddings]
  exec:
    bin: agt-semantic
  dependencies:
    - service: bus
      kind: infrastructure
      endpoint: bus
      critical: true
      retry_count: 3
      retry_delay_seconds: 5
    - service: vector-db
      kind: infrastructure
      endpoint: http://127.0.0.1:6333/healthz
      critical: true
      retry_count: 3
      retry_delay_seconds: 10

- name: AGT-STRUCT-1
  description: Structure creator
  kind: persistent
  capabilities: [structure]
  exec:
    bin: agt-struct
  dependencies:
    - service: bus
      kind: infrastructure
      endpoint: bus
      critical: true
    - service: AGT-NAMING-1
      kind: agent
      endpoint: AGT-NAMING-1
      critical: true

- name: AGT-SESSION-1
  description: Session capture
  kind: persistent
  singleton: false
  capabilities: [session-capture]
  exec:
    bin: agt-session

- name: AGT-CLEANUP-1
  description: Workspace cleanup task runner
  kind: ephemeral
  auto_shutdown: true
  max_runtime_seconds: 300
  capabilities: [cleanup]
  exec:
    bin: agt-cleanup
"#;

pub fn catalog() -> Result<Vec<AgentDefinition>, RegistryError> {
    Ok(serde_yaml::from_str(BUILTIN_CATALOG)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::definition::AgentKind;

    #[test]
    fn catalog_contains_expected_agents() {
        let defs = catalog().unwrap();
        let names: Vec<&str> = defs.iter().map(|def| def.name.as_str()).collect();
        assert!(names.contains(&"AGT-NAMING-1"));
        assert!(names.contains(&"AGT-CLEANUP-1"));
    }

    #[test]
    fn cleanup_is_ephemeral_and_bounded() {
        let defs = catalog().unwrap();
        let cleanup = defs.iter().find(|def| def.name == "AGT-CLEANUP-1").unwrap();
        assert_eq!(cleanup.kind, AgentKind::Ephemeral);
        assert!(cleanup.max_runtime_seconds > 0);
    }
}
