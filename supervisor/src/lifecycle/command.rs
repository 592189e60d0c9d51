//! Typestate wrapper around the OS process used to run an agent.

use crate::registry::definition::{AgentDefinition, ExecSpec};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch `{bin}`: {source}")]
    Launch {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open agent log file: {0}")]
    LogFile(std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct NotStartedCommand {
    cmd: Command,
    bin: String,
}

#[derive(Debug)]
pub struct StartedCommand {
    process: Child,
}

impl NotStartedCommand {
    /// Builds the launch command from a definition's executable spec, the
    /// environment injected by the lifecycle manager and the optional agent
    /// log directory. Child output goes to per-instance log files when a log
    /// directory is configured, otherwise it is discarded.
    pub fn new(
        definition: &AgentDefinition,
        exec: &ExecSpec,
        instance: &str,
        extra_env: &HashMap<String, String>,
        log_dir: Option<&Path>,
    ) -> Result<Self, CommandError> {
        let mut cmd = Command::new(&exec.bin);
        cmd.args(&exec.args).envs(&exec.env).envs(extra_env);
        if let Some(dir) = &definition.working_dir {
            cmd.current_dir(dir);
        }

        match log_dir {
            Some(dir) => {
                let open = |suffix: &str| {
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(dir.join(format!("{instance}.{suffix}.log")))
                        .map_err(CommandError::LogFile)
                };
                cmd.stdout(Stdio::from(open("stdout")?));
                cmd.stderr(Stdio::from(open("stderr")?));
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        Ok(Self {
            cmd,
            bin: exec.bin.clone(),
        })
    }

    pub fn start(mut self) -> Result<StartedCommand, CommandError> {
        let process = self.cmd.spawn().map_err(|source| CommandError::Launch {
            bin: self.bin,
            source,
        })?;
        Ok(StartedCommand { process })
    }
}

impl StartedCommand {
    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.try_wait().is_ok_and(|status| status.is_none())
    }

    /// Blocks until the process exits. Consumed by the reaper thread.
    pub fn wait(mut self) -> Result<ExitStatus, CommandError> {
        self.process.wait().map_err(CommandError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::definition::AgentDefinition;

    fn definition() -> AgentDefinition {
        AgentDefinition {
            name: "AGT-TEST-1".to_string(),
            ..Default::default()
        }
    }

    fn exec(bin: &str, args: &[&str]) -> ExecSpec {
        ExecSpec {
            bin: bin.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn spawn_wait_exit_status() {
        let command = NotStartedCommand::new(
            &definition(),
            &exec("true", &[]),
            "AGT-TEST-1",
            &HashMap::new(),
            None,
        )
        .unwrap();

        let started = command.start().unwrap();
        assert!(started.pid() > 0);
        assert!(started.wait().unwrap().success());
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let command = NotStartedCommand::new(
            &definition(),
            &exec("definitely-not-a-real-binary", &[]),
            "AGT-TEST-1",
            &HashMap::new(),
            None,
        )
        .unwrap();

        assert_matches::assert_matches!(command.start(), Err(CommandError::Launch { .. }));
    }

    #[test]
    fn injected_env_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("TASK_ID".to_string(), "t-42".to_string())]);

        let command = NotStartedCommand::new(
            &definition(),
            &exec("sh", &["-c", "printf '%s' \"$TASK_ID\""]),
            "env-test",
            &env,
            Some(dir.path()),
        )
        .unwrap();
        command.start().unwrap().wait().unwrap();

        let logged = std::fs::read_to_string(dir.path().join("env-test.stdout.log")).unwrap();
        assert_eq!(logged, "t-42");
    }

    #[test]
    fn is_running_tracks_process_state() {
        let command = NotStartedCommand::new(
            &definition(),
            &exec("sleep", &["5"]),
            "AGT-TEST-1",
            &HashMap::new(),
            None,
        )
        .unwrap();

        let mut started = command.start().unwrap();
        assert!(started.is_running());

        crate::lifecycle::terminator::ProcessTerminator::new(started.pid())
            .kill()
            .unwrap();
        // Reap the child so the state flips.
        assert!(!started.wait().unwrap().success());
    }
}
