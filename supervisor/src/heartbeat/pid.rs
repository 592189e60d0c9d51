//! Signal-0 PID probing.

/// Returns true while a process with the given PID exists. Uses the null
/// signal, so no signal is actually delivered.
#[cfg(target_family = "unix")]
pub fn pid_alive(pid: u32) -> bool {
    use nix::unistd::Pid;
    nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(target_family = "windows")]
pub fn pid_alive(_pid: u32) -> bool {
    unimplemented!("PID probing is not supported on windows")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn reaped_child_is_dead() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
    }
}
