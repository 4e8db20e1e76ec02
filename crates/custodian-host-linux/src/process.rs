//! Process enumeration and control
//!
//! Enumeration goes through `sysinfo`; signals through `nix`. Launched
//! targets get their own session and null stdio so they outlive the daemon
//! and never hold its terminal.

use custodian_api::TargetIdentity;
use custodian_host_api::{HostError, HostResult, ProcessHandle, ProcessIdentity};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::desktop::{application_dirs, resolve_program};

/// `comm` as reported by the kernel is cut to this many bytes
const COMM_LEN: usize = 15;

/// How long `gtk-launch` may take to hand the target off
const LAUNCHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Process table access shared by the host adapter and the process watcher
#[derive(Debug, Clone)]
pub struct ProcessControl {
    system: Arc<Mutex<System>>,
    search_dirs: Vec<PathBuf>,
}

impl Default for ProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::with_search_dirs(application_dirs())
    }

    pub fn with_search_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            search_dirs,
        }
    }

    /// Program name a running instance of the target shows up as
    pub fn program_for(&self, target: &TargetIdentity) -> String {
        match target {
            TargetIdentity::Identifier(id) => resolve_program(id, &self.search_dirs),
            TargetIdentity::Name(name) => Path::new(name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone()),
        }
    }

    /// Oldest live process matching the target
    pub async fn find_running(&self, target: &TargetIdentity) -> HostResult<Option<ProcessHandle>> {
        let program = self.program_for(target);
        let system = self.system.clone();

        tokio::task::spawn_blocking(move || {
            let mut sys = system
                .lock()
                .map_err(|_| HostError::Internal("process table lock poisoned".into()))?;
            sys.refresh_processes();
            Ok(oldest_match(&sys, &program))
        })
        .await
        .map_err(|e| HostError::Internal(format!("process scan task failed: {}", e)))?
    }

    /// Current identity of a PID, if it is alive
    pub async fn identity_of(&self, pid: u32) -> HostResult<Option<ProcessIdentity>> {
        let system = self.system.clone();

        tokio::task::spawn_blocking(move || {
            let mut sys = system
                .lock()
                .map_err(|_| HostError::Internal("process table lock poisoned".into()))?;
            let sys_pid = Pid::from_u32(pid);
            if !sys.refresh_process(sys_pid) {
                return Ok(None);
            }
            Ok(sys
                .process(sys_pid)
                .filter(|p| p.status() != ProcessStatus::Zombie)
                .map(|p| ProcessIdentity::new(pid, p.start_time())))
        })
        .await
        .map_err(|e| HostError::Internal(format!("process lookup task failed: {}", e)))?
    }

    /// Start the target without bringing it to the foreground.
    ///
    /// Identifier targets go through `gtk-launch` first and fall back to the
    /// resolved program if the launcher is missing or fails.
    pub async fn launch(&self, target: &TargetIdentity) -> HostResult<()> {
        let program = self.program_for(target);

        if let TargetIdentity::Identifier(id) = target {
            match run_launcher(id).await {
                Ok(()) => {
                    info!(identifier = %id, "Launched via gtk-launch");
                    return Ok(());
                }
                Err(e) => {
                    debug!(identifier = %id, error = %e, program = %program, "gtk-launch unavailable; starting program directly");
                }
            }
        }

        let mut child = spawn_detached(&program, &[]).map_err(|e| {
            HostError::LaunchFailed(format!("failed to spawn {}: {}", program, e))
        })?;
        let pid = child.id();
        info!(program = %program, pid = ?pid, "Target spawned");

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid = ?pid, status = ?status, signal = ?status.signal(), "Launched target exited"),
                Err(e) => warn!(pid = ?pid, error = %e, "Failed to reap launched target"),
            }
        });
        Ok(())
    }

    /// Send `signal` to the process, provided it is still the same instance
    pub async fn signal(&self, handle: &ProcessHandle, signal: Signal) -> HostResult<()> {
        let expected = handle.identity();
        match self.identity_of(expected.pid).await? {
            Some(current) if current == expected => {}
            Some(current) => {
                debug!(expected = %expected, found = %current, "PID now belongs to another process");
                return Err(HostError::ProcessNotFound);
            }
            None => return Err(HostError::ProcessNotFound),
        }

        match signal::kill(NixPid::from_raw(expected.pid as i32), signal) {
            Ok(()) => {
                debug!(pid = expected.pid, signal = %signal, "Signal sent");
                Ok(())
            }
            Err(Errno::ESRCH) => Err(HostError::ProcessNotFound),
            Err(Errno::EPERM) => Err(HostError::PermissionDenied(format!(
                "not allowed to signal pid {}",
                expected.pid
            ))),
            Err(e) => Err(HostError::SignalFailed(format!(
                "failed to send {} to pid {}: {}",
                signal, expected.pid, e
            ))),
        }
    }
}

fn oldest_match(sys: &System, program: &str) -> Option<ProcessHandle> {
    sys.processes()
        .values()
        .filter(|p| p.status() != ProcessStatus::Zombie)
        .filter(|p| {
            let argv0 = p.cmd().first().map(String::as_str);
            matches_program(p.name(), p.exe(), argv0, program)
        })
        .min_by_key(|p| (p.start_time(), p.pid().as_u32()))
        .map(|p| {
            ProcessHandle::new(
                ProcessIdentity::new(p.pid().as_u32(), p.start_time()),
                p.name(),
            )
        })
}

/// Whether a process (by comm name, executable, or argv[0]) runs `program`
pub fn matches_program(name: &str, exe: Option<&Path>, argv0: Option<&str>, program: &str) -> bool {
    if program.is_empty() {
        return false;
    }

    let comm_match = name == program
        || (program.len() > COMM_LEN && program.is_char_boundary(COMM_LEN) && name == &program[..COMM_LEN]);
    let exe_match = exe
        .and_then(Path::file_name)
        .is_some_and(|n| n.to_string_lossy() == program);
    let argv_match = argv0
        .map(Path::new)
        .and_then(Path::file_name)
        .is_some_and(|n| n.to_string_lossy() == program);

    comm_match || exe_match || argv_match
}

/// Spawn in a new session with null stdio
fn spawn_detached(program: &str, args: &[&str]) -> std::io::Result<tokio::process::Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: setsid is async-signal-safe and touches no shared state
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    cmd.spawn()
}

async fn run_launcher(identifier: &str) -> HostResult<()> {
    let mut child = spawn_detached("gtk-launch", &[identifier])?;

    match tokio::time::timeout(LAUNCHER_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(HostError::LaunchFailed(format!(
            "gtk-launch exited with {}",
            status
        ))),
        Ok(Err(e)) => Err(HostError::Io(e)),
        Err(_) => Err(HostError::LaunchFailed("gtk-launch timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_on_comm_exe_or_argv() {
        let exe = Path::new("/opt/sync/bin/sync-agent");
        assert!(matches_program("sync-agent", None, None, "sync-agent"));
        assert!(matches_program("python3", Some(exe), None, "sync-agent"));
        assert!(matches_program("python3", None, Some("/usr/bin/sync-agent"), "sync-agent"));
        assert!(!matches_program("sync-agentd", None, None, "sync-agent"));
        assert!(!matches_program("anything", None, None, ""));
    }

    #[test]
    fn matches_truncated_comm() {
        assert!(matches_program(
            "very-long-progr",
            None,
            None,
            "very-long-program-name"
        ));
    }

    #[test]
    fn name_targets_use_file_name() {
        let control = ProcessControl::with_search_dirs(Vec::new());
        assert_eq!(
            control.program_for(&TargetIdentity::Name("/usr/bin/sync-agent".into())),
            "sync-agent"
        );
        assert_eq!(
            control.program_for(&TargetIdentity::Identifier("org.example.Agent".into())),
            "Agent"
        );
    }

    #[tokio::test]
    async fn own_process_has_stable_identity() {
        let control = ProcessControl::with_search_dirs(Vec::new());
        let pid = std::process::id();

        let first = control.identity_of(pid).await.unwrap().unwrap();
        let second = control.identity_of(pid).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.pid, pid);
    }

    #[tokio::test]
    async fn terminates_spawned_process() {
        let control = ProcessControl::with_search_dirs(Vec::new());
        let mut child = spawn_detached("sleep", &["30"]).unwrap();
        let pid = child.id().unwrap();

        let identity = control.identity_of(pid).await.unwrap().unwrap();
        let handle = ProcessHandle::new(identity, "sleep");
        control.signal(&handle, Signal::SIGTERM).await.unwrap();

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn stale_identity_is_not_signalled() {
        let control = ProcessControl::with_search_dirs(Vec::new());
        let pid = std::process::id();
        let identity = control.identity_of(pid).await.unwrap().unwrap();

        let stale = ProcessHandle::new(ProcessIdentity::new(pid, identity.start_time + 1), "test");
        let result = control.signal(&stale, Signal::SIGCONT).await;
        assert!(matches!(result, Err(HostError::ProcessNotFound)));
    }
}
