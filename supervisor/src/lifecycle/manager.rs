//! The lifecycle manager: owns the arena of running instances, drives
//! start/stop/restart transitions, enforces singleton invariants against the
//! shared store and arms the per-instance reaper and timer threads.

use super::command::NotStartedCommand;
use super::error::LifecycleError;
use super::process::{ActiveInstanceRecord, AgentProcess, AgentStatusView, RunningAgentRecord};
use super::terminator::ProcessTerminator;
use crate::bus::BusAdapter;
use crate::dependency::checker::{DependencyChecker, DependencyReport};
use crate::dependency::probe::{RunningAgentsView, RunningInstanceProbe};
use crate::event::LifecycleEvent;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{EventPublisher, pub_sub};
use crate::heartbeat::pid::pid_alive;
use crate::registry::AgentRegistry;
use crate::registry::definition::{AgentDefinition, AgentKind};
use crate::supervisor::defaults::{
    ENV_AGENT_TYPE, ENV_RESTORE_CONTEXT, ENV_SESSION_ID, ENV_TASK_DATA, ENV_TASK_ID,
    EVENTS_STREAM, MANAGER_RESPONSE_CHANNEL, RUNNING_RECORD_TTL, active_instance_field,
    active_instances_key, running_agent_key,
};
use crate::utils::threads::spawn_named_thread;
use crate::utils::time::{now_unix_timestamp, system_time_from_unix, unix_timestamp};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Tunables handed down from the supervisor configuration.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub shutdown_grace: Duration,
    pub heartbeat_timeout: Duration,
    pub staleness_threshold: Duration,
    pub agent_log_dir: Option<PathBuf>,
}

/// Options for `start` and `restart`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub session_id: Option<String>,
    pub session_data: Option<Value>,
    pub restore: bool,
    pub dependency_check: bool,
    pub force: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            session_data: None,
            restore: false,
            dependency_check: true,
            force: false,
        }
    }
}

/// Outcome of `restart_with_dependencies`.
#[derive(Debug)]
pub enum RestartOutcome {
    Restarted(AgentStatusView),
    DependenciesFailed(Vec<DependencyReport>),
}

pub struct LifecycleManager {
    registry: Arc<AgentRegistry>,
    bus: Arc<dyn BusAdapter>,
    checker: DependencyChecker,
    manager_id: String,
    settings: LifecycleSettings,
    /// Arena of running instances keyed by instance name. Reapers and
    /// timers hold the key, never a reference into the map.
    agents: RwLock<HashMap<String, AgentProcess>>,
    /// Cancellation handles for armed ephemeral timers, keyed by instance.
    timers: Mutex<HashMap<String, EventPublisher<CancellationMessage>>>,
    lifecycle_publisher: EventPublisher<LifecycleEvent>,
    /// Lifecycle transitions are serialized through a single writer.
    transition_lock: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<dyn BusAdapter>,
        checker: DependencyChecker,
        manager_id: String,
        settings: LifecycleSettings,
        lifecycle_publisher: EventPublisher<LifecycleEvent>,
    ) -> Self {
        Self {
            registry,
            bus,
            checker,
            manager_id,
            settings,
            agents: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            lifecycle_publisher,
            transition_lock: Mutex::new(()),
        }
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    // ---- lifecycle operations -------------------------------------------

    pub fn start(&self, name: &str, opts: StartOptions) -> Result<AgentStatusView, LifecycleError> {
        let _transition = self.transition_lock.lock().expect("transition lock poisoned");
        self.start_unlocked(name, opts)
    }

    pub fn stop(&self, instance: &str) -> Result<(), LifecycleError> {
        let _transition = self.transition_lock.lock().expect("transition lock poisoned");
        self.stop_unlocked(instance)
    }

    pub fn restart(
        &self,
        name: &str,
        mut opts: StartOptions,
    ) -> Result<AgentStatusView, LifecycleError> {
        let _transition = self.transition_lock.lock().expect("transition lock poisoned");
        // Preserve the session unless the caller supplied one.
        if opts.session_id.is_none() {
            opts.session_id = self
                .agents
                .read()
                .expect("agents lock poisoned")
                .get(name)
                .and_then(|process| process.session_id.clone());
        }
        match self.stop_unlocked(name) {
            Ok(()) | Err(LifecycleError::NotRunning(_)) => {}
            Err(err) => return Err(err),
        }
        self.start_unlocked(name, opts)
    }

    /// Restart variant used by the automatic-restart path and the
    /// `restart_with_dependencies` request: reports critical dependency
    /// failures instead of spawning, unless `force` is set.
    pub fn restart_with_dependencies(
        &self,
        name: &str,
        force: bool,
    ) -> Result<RestartOutcome, LifecycleError> {
        let definition = self
            .registry
            .lookup(name)
            .ok_or_else(|| LifecycleError::UnknownAgent(name.to_string()))?;

        if !force {
            let result = self.checker.check(&definition, self);
            if !result.all_critical_healthy() {
                return Ok(RestartOutcome::DependenciesFailed(
                    result.critical_failures().into_iter().cloned().collect(),
                ));
            }
        }

        let opts = StartOptions {
            // The checker already ran (or was forced off).
            dependency_check: false,
            force,
            ..Default::default()
        };
        self.restart(name, opts).map(RestartOutcome::Restarted)
    }

    pub fn spawn_ephemeral(
        &self,
        name: &str,
        task_id: Option<String>,
        task_data: Option<Value>,
    ) -> Result<AgentStatusView, LifecycleError> {
        let definition = self
            .registry
            .lookup(name)
            .ok_or_else(|| LifecycleError::UnknownAgent(name.to_string()))?;
        if !definition.is_ephemeral() {
            return Err(LifecycleError::NotEphemeral(name.to_string()));
        }

        let task_id = task_id.unwrap_or_else(|| Ulid::new().to_string());
        let instance = format!("{name}_{task_id}");

        let _transition = self.transition_lock.lock().expect("transition lock poisoned");
        let view = self.launch(
            &definition,
            &instance,
            StartOptions::default(),
            Some((task_id.clone(), task_data)),
        )?;

        if definition.max_runtime_seconds > 0 {
            self.arm_ephemeral_timer(
                &instance,
                name,
                &task_id,
                view.pid,
                Duration::from_secs(definition.max_runtime_seconds),
            );
        }
        Ok(view)
    }

    fn start_unlocked(
        &self,
        name: &str,
        opts: StartOptions,
    ) -> Result<AgentStatusView, LifecycleError> {
        let definition = self
            .registry
            .lookup(name)
            .ok_or_else(|| LifecycleError::UnknownAgent(name.to_string()))?;
        if definition.is_ephemeral() {
            return Err(LifecycleError::NotEphemeral(format!(
                "{name} must be started through spawn_ephemeral"
            )));
        }
        self.launch(&definition, name, opts, None)
    }

    /// Shared start path: collision gate, dependency gate, spawn, record.
    fn launch(
        &self,
        definition: &AgentDefinition,
        instance: &str,
        opts: StartOptions,
        task: Option<(String, Option<Value>)>,
    ) -> Result<AgentStatusView, LifecycleError> {
        let name = definition.name.as_str();

        if self
            .agents
            .read()
            .expect("agents lock poisoned")
            .contains_key(instance)
        {
            return Err(LifecycleError::SingletonCollision(instance.to_string()));
        }
        if definition.is_singleton() && !opts.force && self.is_agent_running(name)? {
            return Err(LifecycleError::SingletonCollision(name.to_string()));
        }

        if opts.dependency_check && !opts.force {
            let result = self.checker.check(definition, self);
            if !result.all_critical_healthy() {
                return Err(LifecycleError::DependencyUnavailable {
                    agent: name.to_string(),
                    detail: result.failure_summary(),
                });
            }
        }

        let exec = definition
            .exec
            .clone()
            .ok_or_else(|| LifecycleError::NoExecutable(name.to_string()))?;

        let session_id = match (&opts.session_id, definition.kind) {
            (Some(session_id), _) => Some(session_id.clone()),
            (None, AgentKind::Persistent) => Some(Ulid::new().to_string()),
            (None, AgentKind::Ephemeral) => None,
        };
        let env = self.spawn_env(&session_id, opts.restore, &task, &opts.session_data);

        let command = NotStartedCommand::new(
            definition,
            &exec,
            instance,
            &env,
            self.settings.agent_log_dir.as_deref(),
        )
        .and_then(NotStartedCommand::start)
        .map_err(|source| LifecycleError::Spawn {
            agent: name.to_string(),
            source,
        })?;

        let now = SystemTime::now();
        let process = AgentProcess {
            instance: instance.to_string(),
            agent: name.to_string(),
            kind: definition.kind,
            definition: definition.clone(),
            pid: command.pid(),
            running: true,
            started_at: now,
            last_heartbeat: now,
            session_id,
            task_id: task.as_ref().map(|(task_id, _)| task_id.clone()),
            supervised: true,
        };
        let view = process.status_view();

        info!(agent = %name, %instance, pid = view.pid, "agent started");
        self.record_active_instance(&process);
        self.write_running_record(&process, None);
        self.agents
            .write()
            .expect("agents lock poisoned")
            .insert(instance.to_string(), process);

        self.spawn_reaper(
            instance.to_string(),
            name.to_string(),
            definition.kind,
            view.session_id.clone(),
            view.task_id.clone(),
            command,
        );

        self.emit_event(
            "agent_started",
            json!({
                "agent": name,
                "instance": instance,
                "pid": view.pid,
                "kind": definition.kind.to_string(),
            }),
        );
        Ok(view)
    }

    fn stop_unlocked(&self, instance: &str) -> Result<(), LifecycleError> {
        let process = self
            .agents
            .write()
            .expect("agents lock poisoned")
            .remove(instance)
            .ok_or_else(|| LifecycleError::NotRunning(instance.to_string()))?;

        self.cancel_timer(instance);
        self.clear_active_instance(&process.agent);
        let _ = self.bus.delete(&running_agent_key(&process.agent));

        if process.supervised {
            info!(agent = %process.agent, %instance, pid = process.pid, "stopping agent");
            let _ = ProcessTerminator::new(process.pid)
                .shutdown(self.settings.shutdown_grace)
                .inspect_err(|err| debug!("terminating {instance}: {err}"));
        }

        self.emit_event(
            "agent_stopped",
            json!({
                "agent": process.agent,
                "instance": instance,
                "pid": process.pid,
            }),
        );
        Ok(())
    }

    /// Stops every supervised instance. Used on supervisor shutdown.
    pub fn stop_all(&self) {
        let _transition = self.transition_lock.lock().expect("transition lock poisoned");
        let instances: Vec<String> = self
            .agents
            .read()
            .expect("agents lock poisoned")
            .keys()
            .cloned()
            .collect();
        for instance in instances {
            let _ = self
                .stop_unlocked(&instance)
                .inspect_err(|err| warn!("stopping {instance} on shutdown: {err}"));
        }
    }

    // ---- agent-initiated signalling -------------------------------------

    /// Updates `last_heartbeat` for the named agent (or instance) and
    /// refreshes the shared records. Heartbeats only ever move forward.
    pub fn heartbeat(&self, name: &str) -> Result<(), LifecycleError> {
        let mut agents = self.agents.write().expect("agents lock poisoned");
        let process = Self::find_mut(&mut agents, name)
            .ok_or_else(|| LifecycleError::NotRunning(name.to_string()))?;

        let now = SystemTime::now();
        if now > process.last_heartbeat {
            process.last_heartbeat = now;
        }
        let process = process.clone();
        drop(agents);

        self.record_active_instance(&process);
        self.refresh_running_heartbeat(&process);
        Ok(())
    }

    /// Registers an agent whose process was started elsewhere, merging the
    /// submitted metadata into the shared running record.
    pub fn register_running(
        &self,
        name: &str,
        pid: Option<u32>,
        port: Option<u16>,
        service_type: Option<String>,
        endpoints: HashMap<String, String>,
        session_id: Option<String>,
    ) -> Result<AgentStatusView, LifecycleError> {
        // First writer wins: a live record is never displaced by a later
        // registration, the collision handshake tells the newcomer to exit.
        if let Some(existing) = self.agents.read().expect("agents lock poisoned").get(name) {
            if existing.pid != 0
                && Some(existing.pid) != pid
                && pid_alive(existing.pid)
            {
                warn!(
                    agent = %name,
                    held_by = existing.pid,
                    requested_by = pid.unwrap_or_default(),
                    "ignoring registration for an agent with a live instance"
                );
                return Ok(existing.status_view());
            }
        }

        let kind = self
            .registry
            .lookup(name)
            .map(|definition| definition.kind)
            .unwrap_or_default();

        let now = SystemTime::now();
        let process = AgentProcess {
            instance: name.to_string(),
            agent: name.to_string(),
            kind,
            definition: self.registry.lookup(name).unwrap_or_default(),
            pid: pid.unwrap_or_default(),
            running: true,
            started_at: now,
            last_heartbeat: now,
            session_id,
            task_id: None,
            supervised: false,
        };
        let view = process.status_view();

        self.record_active_instance(&process);
        self.write_running_record(
            &process,
            Some(RegistrationMeta {
                port,
                service_type,
                endpoints,
            }),
        );
        self.agents
            .write()
            .expect("agents lock poisoned")
            .insert(name.to_string(), process);

        debug!(agent = %name, "registered externally started agent");
        Ok(view)
    }

    pub fn unregister_running(&self, name: &str) -> Result<(), LifecycleError> {
        let process = self
            .agents
            .write()
            .expect("agents lock poisoned")
            .remove(name)
            .ok_or_else(|| LifecycleError::NotRunning(name.to_string()))?;

        self.clear_active_instance(&process.agent);
        let _ = self.bus.delete(&running_agent_key(&process.agent));
        Ok(())
    }

    // ---- singleton enforcement ------------------------------------------

    /// Cross-supervisor liveness: reads the shared active-instances hash,
    /// purging every entry whose heartbeat crossed the staleness threshold.
    pub fn is_agent_running(&self, name: &str) -> Result<bool, LifecycleError> {
        let key = active_instances_key(name);
        let entries = self.bus.hash_get_all(&key)?;
        let now = SystemTime::now();

        let mut alive = false;
        for (field, raw) in entries {
            let record: ActiveInstanceRecord = match serde_json::from_slice(&raw) {
                Ok(record) => record,
                Err(err) => {
                    warn!(agent = %name, %field, "dropping unreadable active record: {err}");
                    self.bus.hash_delete(&key, &field)?;
                    continue;
                }
            };
            let age = now
                .duration_since(system_time_from_unix(record.last_heartbeat))
                .unwrap_or_default();
            if age > self.settings.staleness_threshold {
                debug!(agent = %name, %field, age_secs = age.as_secs(), "purging stale active record");
                self.bus.hash_delete(&key, &field)?;
            } else {
                alive = true;
            }
        }
        Ok(alive)
    }

    /// Boot-time collision handshake: a booting agent asks whether another
    /// instance of itself is live, passing its own PID. The recorded holder
    /// answers `false` to itself and `true` to everyone else; a record with
    /// a dead PID is cleared before answering, so crashed agents never
    /// block their successors.
    pub fn collision_check(&self, name: &str, requester_pid: Option<u32>) -> bool {
        let existing = self
            .agents
            .read()
            .expect("agents lock poisoned")
            .get(name)
            .map(|process| (process.pid, process.agent.clone()));

        match existing {
            Some((pid, _)) if requester_pid == Some(pid) => false,
            Some((pid, _)) if pid != 0 && pid_alive(pid) => true,
            // PID zero marks an external registration that never reported
            // its process id; it cannot be probed and never blocks.
            Some((pid, agent)) => {
                info!(%agent, pid, "clearing stale record during collision check");
                self.agents
                    .write()
                    .expect("agents lock poisoned")
                    .remove(name);
                self.clear_active_instance(&agent);
                false
            }
            None => false,
        }
    }

    // ---- terminal exits and the heartbeat sweep -------------------------

    /// Called by the supervisor loop when a reaper observes an exit.
    /// Returns true when the instance was still tracked, i.e. the exit was
    /// not caused by an explicit stop.
    pub fn handle_exit(
        &self,
        instance: &str,
        agent: &str,
        kind: AgentKind,
        session_id: Option<String>,
        task_id: Option<String>,
        exit_code: Option<i32>,
    ) -> bool {
        self.cancel_timer(instance);

        let tracked = self
            .agents
            .write()
            .expect("agents lock poisoned")
            .remove(instance)
            .is_some();
        if !tracked {
            debug!(%instance, "exit for untracked instance (explicit stop)");
            return false;
        }

        self.clear_active_instance(agent);
        let _ = self.bus.delete(&running_agent_key(agent));

        info!(%agent, %instance, ?exit_code, "agent exited");
        let event = match kind {
            AgentKind::Ephemeral => "ephemeral_completed",
            AgentKind::Persistent => "agent_exited",
        };
        self.emit_event(
            event,
            json!({
                "agent": agent,
                "instance": instance,
                "kind": kind.to_string(),
                "session_id": session_id,
                "task_id": task_id,
                "exit_code": exit_code,
            }),
        );
        true
    }

    /// Instances whose heartbeat is older than `timeout`, for the monitor.
    pub(crate) fn collect_stale(&self, timeout: Duration) -> Vec<(String, u32)> {
        let now = SystemTime::now();
        self.agents
            .read()
            .expect("agents lock poisoned")
            .values()
            .filter(|process| {
                now.duration_since(process.last_heartbeat)
                    .unwrap_or_default()
                    > timeout
            })
            .map(|process| (process.instance.clone(), process.pid))
            .collect()
    }

    /// Removes a dead instance and its shared records, emitting an alert.
    /// Returns the removed process so the caller can decide on a restart.
    pub(crate) fn purge_dead(&self, instance: &str) -> Option<AgentProcess> {
        let process = self
            .agents
            .write()
            .expect("agents lock poisoned")
            .remove(instance)?;

        self.cancel_timer(instance);
        self.clear_active_instance(&process.agent);
        let _ = self.bus.delete(&running_agent_key(&process.agent));

        warn!(
            agent = %process.agent,
            %instance,
            pid = process.pid,
            "agent presumed dead: heartbeat stale and pid gone"
        );
        self.emit_event(
            "agent_dead",
            json!({
                "agent": process.agent,
                "instance": instance,
                "pid": process.pid,
                "last_heartbeat": unix_timestamp(process.last_heartbeat),
            }),
        );
        Some(process)
    }

    // ---- snapshots -------------------------------------------------------

    pub fn snapshot(&self) -> Vec<AgentStatusView> {
        let mut views: Vec<AgentStatusView> = self
            .agents
            .read()
            .expect("agents lock poisoned")
            .values()
            .map(AgentProcess::status_view)
            .collect();
        views.sort_by(|a, b| a.instance.cmp(&b.instance));
        views
    }

    /// Status by instance name, falling back to the first instance of the
    /// named agent.
    pub fn status(&self, name: &str) -> Option<AgentStatusView> {
        let agents = self.agents.read().expect("agents lock poisoned");
        agents
            .get(name)
            .or_else(|| agents.values().find(|process| process.agent == name))
            .map(AgentProcess::status_view)
    }

    pub fn agents_count(&self) -> usize {
        self.agents.read().expect("agents lock poisoned").len()
    }

    /// The shared running record contributed by agent registration, used by
    /// discovery for ports and endpoint URLs.
    pub fn running_record(&self, name: &str) -> Option<RunningAgentRecord> {
        let raw = self.bus.get(&running_agent_key(name)).ok()??;
        serde_json::from_slice(&raw).ok()
    }

    /// Runs the dependency checker for the named agent without touching its
    /// lifecycle. Backs `check_dependencies` and `validate_service_health`.
    pub fn check_dependencies(
        &self,
        name: &str,
    ) -> Result<crate::dependency::checker::DependencyCheckResult, LifecycleError> {
        let definition = self
            .registry
            .lookup(name)
            .ok_or_else(|| LifecycleError::UnknownAgent(name.to_string()))?;
        Ok(self.checker.check(&definition, self))
    }

    // ---- events ----------------------------------------------------------

    /// Publishes a lifecycle event on the broadcast response channel and
    /// appends it to the observability stream.
    pub(crate) fn emit_event(&self, event: &str, fields: Value) {
        let mut payload = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("detail".to_string(), other);
                map
            }
        };
        payload.insert("event".to_string(), json!(event));
        payload.insert("manager_id".to_string(), json!(self.manager_id));
        payload.insert("timestamp".to_string(), json!(now_unix_timestamp()));
        let payload = Value::Object(payload);

        let _ = self
            .bus
            .publish(MANAGER_RESPONSE_CHANNEL, payload.to_string().as_bytes())
            .inspect_err(|err| error!("cannot publish `{event}` event: {err}"));

        let mut entry: HashMap<String, String> = payload
            .as_object()
            .expect("payload is an object")
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => (key.clone(), s.clone()),
                other => (key.clone(), other.to_string()),
            })
            .collect();
        entry.insert("time".to_string(), crate::utils::time::now_rfc3339());
        let _ = self
            .bus
            .stream_append(EVENTS_STREAM, &entry)
            .inspect_err(|err| debug!("cannot append `{event}` to events stream: {err}"));
    }

    pub(crate) fn emit_ephemeral_timeout(
        &self,
        instance: &str,
        agent: &str,
        task_id: &str,
        max_runtime_seconds: u64,
    ) {
        self.emit_event(
            "ephemeral_timeout",
            json!({
                "agent": agent,
                "instance": instance,
                "task_id": task_id,
                "max_runtime": max_runtime_seconds,
            }),
        );
    }

    pub(crate) fn emit_restart_outcome(
        &self,
        agent: &str,
        attempt: usize,
        success: bool,
        detail: Option<String>,
    ) {
        let event = if success { "agent_restarted" } else { "restart_failed" };
        self.emit_event(
            event,
            json!({ "agent": agent, "attempt": attempt, "detail": detail }),
        );
    }

    pub(crate) fn emit_restart_abandoned(&self, agent: &str, attempts: usize) {
        self.emit_event(
            "restart_abandoned",
            json!({ "agent": agent, "attempts": attempts }),
        );
    }

    // ---- internals -------------------------------------------------------

    fn find_mut<'a>(
        agents: &'a mut HashMap<String, AgentProcess>,
        name: &str,
    ) -> Option<&'a mut AgentProcess> {
        if agents.contains_key(name) {
            return agents.get_mut(name);
        }
        agents.values_mut().find(|process| process.agent == name)
    }

    fn spawn_env(
        &self,
        session_id: &Option<String>,
        restore: bool,
        task: &Option<(String, Option<Value>)>,
        session_data: &Option<Value>,
    ) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(session_id) = session_id {
            env.insert(ENV_SESSION_ID.to_string(), session_id.clone());
        }
        env.insert(ENV_RESTORE_CONTEXT.to_string(), restore.to_string());
        if let Some((task_id, task_data)) = task {
            env.insert(ENV_AGENT_TYPE.to_string(), "ephemeral".to_string());
            env.insert(ENV_TASK_ID.to_string(), task_id.clone());
            env.insert(
                ENV_TASK_DATA.to_string(),
                task_data.clone().unwrap_or(Value::Null).to_string(),
            );
        } else if let Some(session_data) = session_data {
            env.insert(ENV_TASK_DATA.to_string(), session_data.to_string());
        }
        env
    }

    fn spawn_reaper(
        &self,
        instance: String,
        agent: String,
        kind: AgentKind,
        session_id: Option<String>,
        task_id: Option<String>,
        command: super::command::StartedCommand,
    ) {
        let publisher = self.lifecycle_publisher.clone();
        spawn_named_thread(format!("reaper {instance}"), move || {
            let exit_code = match command.wait() {
                Ok(status) => exit_code_of(status),
                Err(err) => {
                    error!(%instance, "reaping failed: {err}");
                    None
                }
            };
            let _ = publisher
                .publish(LifecycleEvent::AgentExited {
                    instance,
                    agent,
                    kind,
                    session_id,
                    task_id,
                    exit_code,
                })
                .inspect_err(|err| error!("cannot publish exit event: {err}"));
        });
    }

    /// Arms the wall-clock bound on an ephemeral instance. The timer and
    /// the reaper race; whichever fires first wins, the timer's kill is a
    /// no-op when the process already exited.
    fn arm_ephemeral_timer(
        &self,
        instance: &str,
        agent: &str,
        task_id: &str,
        pid: u32,
        max_runtime: Duration,
    ) {
        let (cancel_publisher, cancel_consumer) = pub_sub();
        self.timers
            .lock()
            .expect("timers lock poisoned")
            .insert(instance.to_string(), cancel_publisher);

        let publisher = self.lifecycle_publisher.clone();
        let instance = instance.to_string();
        let agent = agent.to_string();
        let task_id = task_id.to_string();
        spawn_named_thread(format!("ephemeral timer {instance}"), move || {
            if cancel_consumer.is_cancelled(max_runtime) {
                return;
            }
            warn!(%agent, %instance, max_runtime_secs = max_runtime.as_secs(), "ephemeral runtime exceeded, killing");
            let _ = publisher
                .publish(LifecycleEvent::EphemeralTimedOut {
                    instance: instance.clone(),
                    agent,
                    task_id,
                    max_runtime_seconds: max_runtime.as_secs(),
                })
                .inspect_err(|err| error!("cannot publish timeout event: {err}"));
            let _ = ProcessTerminator::new(pid)
                .kill()
                .inspect_err(|err| debug!("killing {instance}: {err}"));
        });
    }

    fn cancel_timer(&self, instance: &str) {
        if let Some(cancel) = self
            .timers
            .lock()
            .expect("timers lock poisoned")
            .remove(instance)
        {
            let _ = cancel.publish(());
        }
    }

    fn record_active_instance(&self, process: &AgentProcess) {
        let record = ActiveInstanceRecord {
            instance_id: process.instance.clone(),
            agent: process.agent.clone(),
            manager_id: self.manager_id.clone(),
            session_id: process.session_id.clone(),
            started_at: unix_timestamp(process.started_at),
            last_heartbeat: unix_timestamp(process.last_heartbeat),
        };
        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(err) => {
                error!("cannot serialize active record: {err}");
                return;
            }
        };
        let _ = self
            .bus
            .hash_set(
                &active_instances_key(&process.agent),
                &active_instance_field(&self.manager_id, &process.agent),
                &payload,
            )
            .inspect_err(|err| error!("cannot record active instance: {err}"));
    }

    fn clear_active_instance(&self, agent: &str) {
        let _ = self
            .bus
            .hash_delete(
                &active_instances_key(agent),
                &active_instance_field(&self.manager_id, agent),
            )
            .inspect_err(|err| error!("cannot clear active instance: {err}"));
    }

    fn write_running_record(&self, process: &AgentProcess, meta: Option<RegistrationMeta>) {
        let mut record = self.running_record(&process.agent).unwrap_or_default();
        record.agent = process.agent.clone();
        record.pid = Some(process.pid);
        record.manager_id = self.manager_id.clone();
        if record.registered_at == 0 {
            record.registered_at = unix_timestamp(process.started_at);
        }
        record.last_heartbeat = unix_timestamp(process.last_heartbeat);
        if let Some(meta) = meta {
            record.port = meta.port.or(record.port);
            record.service_type = meta.service_type.or(record.service_type);
            if !meta.endpoints.is_empty() {
                record.endpoints = meta.endpoints;
            }
        }
        self.store_running_record(&record);
    }

    fn refresh_running_heartbeat(&self, process: &AgentProcess) {
        let mut record = self.running_record(&process.agent).unwrap_or_default();
        record.agent = process.agent.clone();
        record.last_heartbeat = unix_timestamp(process.last_heartbeat);
        self.store_running_record(&record);
    }

    fn store_running_record(&self, record: &RunningAgentRecord) {
        let payload = match serde_json::to_vec(record) {
            Ok(payload) => payload,
            Err(err) => {
                error!("cannot serialize running record: {err}");
                return;
            }
        };
        let _ = self
            .bus
            .set(
                &running_agent_key(&record.agent),
                &payload,
                Some(RUNNING_RECORD_TTL),
            )
            .inspect_err(|err| error!("cannot store running record: {err}"));
    }
}

impl RunningAgentsView for LifecycleManager {
    fn running_instance(&self, agent: &str) -> Option<RunningInstanceProbe> {
        let agents = self.agents.read().expect("agents lock poisoned");
        agents
            .get(agent)
            .or_else(|| agents.values().find(|process| process.agent == agent))
            .map(|process| RunningInstanceProbe {
                pid: process.pid,
                last_heartbeat: process.last_heartbeat,
            })
    }
}

#[cfg(target_family = "unix")]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal())
}

#[cfg(not(target_family = "unix"))]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

struct RegistrationMeta {
    port: Option<u16>,
    service_type: Option<String>,
    endpoints: HashMap<String, String>,
}
