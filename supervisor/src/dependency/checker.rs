use super::probe::{
    ContainerProbe, DependencyProbe, InfrastructureProbe, ProbeError, RunningAgentsView,
};
use crate::bus::BusAdapter;
use crate::heartbeat::pid::pid_alive;
use crate::registry::definition::{AgentDefinition, DependencyKind, ServiceDependency};
use crate::utils::retry::retry_with_attempts;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Outcome of probing one declared dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyReport {
    pub service: String,
    pub healthy: bool,
    pub attempts: usize,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated outcome for an agent's full dependency list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyCheckResult {
    pub reports: Vec<DependencyReport>,
}

impl DependencyCheckResult {
    pub fn all_critical_healthy(&self) -> bool {
        self.reports
            .iter()
            .all(|report| report.healthy || !report.critical)
    }

    pub fn critical_failures(&self) -> Vec<&DependencyReport> {
        self.reports
            .iter()
            .filter(|report| report.critical && !report.healthy)
            .collect()
    }

    /// Short summary of failed critical services for error records.
    pub fn failure_summary(&self) -> String {
        self.critical_failures()
            .iter()
            .map(|report| {
                format!(
                    "{}: {}",
                    report.service,
                    report.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Probes an agent's dependencies in declaration order with bounded retry.
///
/// A critical failure short-circuits only when `fail_fast` is set; the
/// default is to finish the sweep so the report is complete, then let the
/// caller fail the start.
pub struct DependencyChecker {
    infrastructure: Box<dyn DependencyProbe>,
    container: Box<dyn DependencyProbe>,
    heartbeat_timeout: Duration,
    fail_fast: bool,
}

impl DependencyChecker {
    pub fn new(bus: Arc<dyn BusAdapter>, heartbeat_timeout: Duration, fail_fast: bool) -> Self {
        Self {
            infrastructure: Box::new(InfrastructureProbe::new(bus)),
            container: Box::new(ContainerProbe::new()),
            heartbeat_timeout,
            fail_fast,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_probes(
        infrastructure: Box<dyn DependencyProbe>,
        container: Box<dyn DependencyProbe>,
        heartbeat_timeout: Duration,
        fail_fast: bool,
    ) -> Self {
        Self {
            infrastructure,
            container,
            heartbeat_timeout,
            fail_fast,
        }
    }

    pub fn check(
        &self,
        definition: &AgentDefinition,
        agents: &dyn RunningAgentsView,
    ) -> DependencyCheckResult {
        let mut result = DependencyCheckResult::default();
        for dependency in &definition.dependencies {
            let report = self.check_one(dependency, agents);
            if !report.healthy {
                warn!(
                    agent = %definition.name,
                    service = %report.service,
                    critical = report.critical,
                    error = report.error.as_deref().unwrap_or_default(),
                    "dependency probe failed"
                );
            }
            let failed_critical = report.critical && !report.healthy;
            result.reports.push(report);
            if failed_critical && self.fail_fast {
                debug!(agent = %definition.name, "fail-fast on critical dependency failure");
                break;
            }
        }
        result
    }

    fn check_one(
        &self,
        dependency: &ServiceDependency,
        agents: &dyn RunningAgentsView,
    ) -> DependencyReport {
        let delay = Duration::from_secs(dependency.retry_delay_seconds);
        let (outcome, attempts) = retry_with_attempts(dependency.retry_count, delay, || {
            self.probe_once(dependency, agents)
        });

        match outcome {
            Ok(detail) => DependencyReport {
                service: dependency.service.clone(),
                healthy: true,
                attempts,
                critical: dependency.critical,
                detail: Some(detail),
                error: None,
            },
            Err(err) => DependencyReport {
                service: dependency.service.clone(),
                healthy: false,
                attempts,
                critical: dependency.critical,
                detail: None,
                error: Some(err.to_string()),
            },
        }
    }

    fn probe_once(
        &self,
        dependency: &ServiceDependency,
        agents: &dyn RunningAgentsView,
    ) -> Result<String, ProbeError> {
        match dependency.kind {
            DependencyKind::Infrastructure => self.infrastructure.probe(dependency),
            DependencyKind::Container => self.container.probe(dependency),
            DependencyKind::Agent => self.probe_agent(dependency, agents),
        }
    }

    /// Agent dependencies pass when the target is in the running map, its
    /// PID is alive and its heartbeat is fresh.
    fn probe_agent(
        &self,
        dependency: &ServiceDependency,
        agents: &dyn RunningAgentsView,
    ) -> Result<String, ProbeError> {
        let target = dependency.endpoint.as_str();
        let instance = agents.running_instance(target).ok_or_else(|| {
            ProbeError::Unreachable(dependency.service.clone(), "agent is not running".into())
        })?;

        if !pid_alive(instance.pid) {
            return Err(ProbeError::Unreachable(
                dependency.service.clone(),
                format!("pid {} is dead", instance.pid),
            ));
        }

        let heartbeat_age = SystemTime::now()
            .duration_since(instance.last_heartbeat)
            .unwrap_or_default();
        if heartbeat_age >= self.heartbeat_timeout {
            return Err(ProbeError::Unhealthy(
                dependency.service.clone(),
                format!("heartbeat is {}s old", heartbeat_age.as_secs()),
            ));
        }

        Ok(format!("pid {} alive, heartbeat fresh", instance.pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::probe::{MockDependencyProbe, RunningInstanceProbe};
    use std::collections::HashMap;
    use std::time::Instant;

    const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

    struct FakeAgents(HashMap<String, RunningInstanceProbe>);

    impl RunningAgentsView for FakeAgents {
        fn running_instance(&self, agent: &str) -> Option<RunningInstanceProbe> {
            self.0.get(agent).cloned()
        }
    }

    fn no_agents() -> FakeAgents {
        FakeAgents(HashMap::new())
    }

    fn dependency(
        service: &str,
        kind: DependencyKind,
        critical: bool,
        retry_count: usize,
    ) -> ServiceDependency {
        ServiceDependency {
            service: service.to_string(),
            kind,
            endpoint: service.to_string(),
            critical,
            retry_count,
            retry_delay_seconds: 0,
        }
    }

    fn definition_with(dependencies: Vec<ServiceDependency>) -> AgentDefinition {
        AgentDefinition {
            name: "AGT-TEST-1".to_string(),
            dependencies,
            ..Default::default()
        }
    }

    fn checker_with_infra(
        infrastructure: MockDependencyProbe,
        fail_fast: bool,
    ) -> DependencyChecker {
        DependencyChecker::with_probes(
            Box::new(infrastructure),
            Box::new(MockDependencyProbe::new()),
            HEARTBEAT_TIMEOUT,
            fail_fast,
        )
    }

    #[test]
    fn healthy_on_first_attempt() {
        let mut infra = MockDependencyProbe::new();
        infra
            .expect_probe()
            .once()
            .returning(|_| Ok("HTTP 200".to_string()));

        let checker = checker_with_infra(infra, false);
        let result = checker.check(
            &definition_with(vec![dependency(
                "vector-db",
                DependencyKind::Infrastructure,
                true,
                3,
            )]),
            &no_agents(),
        );

        assert!(result.all_critical_healthy());
        assert_eq!(result.reports[0].attempts, 1);
        assert_eq!(result.reports[0].detail.as_deref(), Some("HTTP 200"));
    }

    #[test]
    fn retries_until_success() {
        let mut infra = MockDependencyProbe::new();
        let mut calls = 0;
        infra.expect_probe().times(3).returning(move |dep| {
            calls += 1;
            if calls < 3 {
                Err(ProbeError::Unreachable(dep.service.clone(), "down".into()))
            } else {
                Ok("recovered".to_string())
            }
        });

        let checker = checker_with_infra(infra, false);
        let result = checker.check(
            &definition_with(vec![dependency(
                "vector-db",
                DependencyKind::Infrastructure,
                true,
                5,
            )]),
            &no_agents(),
        );

        assert!(result.all_critical_healthy());
        assert_eq!(result.reports[0].attempts, 3);
    }

    #[test]
    fn critical_failure_after_all_retries() {
        let mut infra = MockDependencyProbe::new();
        infra.expect_probe().times(3).returning(|dep| {
            Err(ProbeError::Unreachable(
                dep.service.clone(),
                "connection refused".into(),
            ))
        });

        let checker = checker_with_infra(infra, false);
        let result = checker.check(
            &definition_with(vec![dependency(
                "vector-db",
                DependencyKind::Infrastructure,
                true,
                3,
            )]),
            &no_agents(),
        );

        assert!(!result.all_critical_healthy());
        let failures = result.critical_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);
        assert!(result.failure_summary().contains("vector-db"));
        assert!(result.failure_summary().contains("connection refused"));
    }

    #[test]
    fn non_critical_failures_do_not_block() {
        let mut infra = MockDependencyProbe::new();
        infra
            .expect_probe()
            .returning(|dep| Err(ProbeError::Unreachable(dep.service.clone(), "down".into())));

        let checker = checker_with_infra(infra, false);
        let result = checker.check(
            &definition_with(vec![dependency(
                "metrics-db",
                DependencyKind::Infrastructure,
                false,
                1,
            )]),
            &no_agents(),
        );

        assert!(result.all_critical_healthy());
        assert!(result.critical_failures().is_empty());
        assert!(!result.reports[0].healthy);
    }

    #[test]
    fn default_mode_produces_a_complete_report() {
        let mut infra = MockDependencyProbe::new();
        infra
            .expect_probe()
            .times(2)
            .returning(|dep| Err(ProbeError::Unreachable(dep.service.clone(), "down".into())));

        let checker = checker_with_infra(infra, false);
        let result = checker.check(
            &definition_with(vec![
                dependency("first", DependencyKind::Infrastructure, true, 1),
                dependency("second", DependencyKind::Infrastructure, true, 1),
            ]),
            &no_agents(),
        );

        assert_eq!(result.reports.len(), 2);
    }

    #[test]
    fn fail_fast_short_circuits() {
        let mut infra = MockDependencyProbe::new();
        infra
            .expect_probe()
            .once()
            .returning(|dep| Err(ProbeError::Unreachable(dep.service.clone(), "down".into())));

        let checker = checker_with_infra(infra, true);
        let result = checker.check(
            &definition_with(vec![
                dependency("first", DependencyKind::Infrastructure, true, 1),
                dependency("second", DependencyKind::Infrastructure, true, 1),
            ]),
            &no_agents(),
        );

        assert_eq!(result.reports.len(), 1);
    }

    #[test]
    fn agent_dependency_requires_presence() {
        let checker = DependencyChecker::with_probes(
            Box::new(MockDependencyProbe::new()),
            Box::new(MockDependencyProbe::new()),
            HEARTBEAT_TIMEOUT,
            false,
        );
        let result = checker.check(
            &definition_with(vec![dependency("AGT-NAMING-1", DependencyKind::Agent, true, 1)]),
            &no_agents(),
        );

        assert!(!result.all_critical_healthy());
        assert!(result.reports[0]
            .error
            .as_deref()
            .unwrap()
            .contains("not running"));
    }

    #[test]
    fn agent_dependency_checks_pid_and_heartbeat() {
        let checker = DependencyChecker::with_probes(
            Box::new(MockDependencyProbe::new()),
            Box::new(MockDependencyProbe::new()),
            HEARTBEAT_TIMEOUT,
            false,
        );

        // Our own PID is alive and the heartbeat is fresh.
        let agents = FakeAgents(HashMap::from([(
            "AGT-NAMING-1".to_string(),
            RunningInstanceProbe {
                pid: std::process::id(),
                last_heartbeat: SystemTime::now(),
            },
        )]));
        let result = checker.check(
            &definition_with(vec![dependency("AGT-NAMING-1", DependencyKind::Agent, true, 1)]),
            &agents,
        );
        assert!(result.all_critical_healthy());

        // Stale heartbeat fails even though the PID is alive.
        let agents = FakeAgents(HashMap::from([(
            "AGT-NAMING-1".to_string(),
            RunningInstanceProbe {
                pid: std::process::id(),
                last_heartbeat: SystemTime::now() - Duration::from_secs(600),
            },
        )]));
        let result = checker.check(
            &definition_with(vec![dependency("AGT-NAMING-1", DependencyKind::Agent, true, 1)]),
            &agents,
        );
        assert!(!result.all_critical_healthy());
    }

    #[test]
    fn retry_timing_is_bounded() {
        let mut infra = MockDependencyProbe::new();
        infra
            .expect_probe()
            .times(2)
            .returning(|dep| Err(ProbeError::Unreachable(dep.service.clone(), "down".into())));

        let checker = checker_with_infra(infra, false);
        let mut dep = dependency("slow", DependencyKind::Infrastructure, true, 2);
        dep.retry_delay_seconds = 1;

        let started = Instant::now();
        let result = checker.check(&definition_with(vec![dep]), &no_agents());
        let elapsed = started.elapsed();

        // One sleep between two attempts: at least 1s, well under 2 sleeps.
        assert!(!result.all_critical_healthy());
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
    }
}
