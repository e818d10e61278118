use std::collections::HashMap;
use std::io;

#[cfg(target_os = "linux")]
use log::warn;

pub type ProcessEnvironment = HashMap<String, String>;

/// A handle to an OS process that is never waited on from this process.
/// Reaping exited children is the responsibility of the subreaper configured
/// by the daemon.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;
    fn is_alive(&self) -> bool;
    fn kill(&self);
}

pub trait ProcessSpawner: Send + Sync + 'static {
    /// Spawn a worker process with the given command line and environment
    /// additions.
    fn spawn(
        &self,
        argv: &[String],
        env: &ProcessEnvironment,
    ) -> io::Result<Box<dyn ProcessHandle>>;

    /// Reconstitute a handle for a process known only by its pid, e.g. when
    /// a worker identifies itself at registration.
    fn attach(&self, pid: u32) -> Box<dyn ProcessHandle>;
}

pub struct OsProcessSpawner;

struct OsProcessHandle {
    pid: u32,
}

impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        unsafe { libc::kill(self.pid as libc::pid_t, 0) == 0 }
    }

    fn kill(&self) {
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

impl ProcessSpawner for OsProcessSpawner {
    fn spawn(
        &self,
        argv: &[String],
        env: &ProcessEnvironment,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty worker command")
        })?;
        let child = std::process::Command::new(program)
            .args(args)
            .envs(env)
            .spawn()?;
        // The child is dropped without waiting; the subreaper reaps it.
        Ok(Box::new(OsProcessHandle { pid: child.id() }))
    }

    fn attach(&self, pid: u32) -> Box<dyn ProcessHandle> {
        Box::new(OsProcessHandle { pid })
    }
}

/// Raise the OOM score of a worker so the OS prefers killing workers over
/// the node agent under memory pressure.
#[cfg(target_os = "linux")]
pub fn adjust_worker_oom_score(pid: u32, adjustment: i32) {
    let adjustment = adjustment.clamp(0, 1000);
    let path = format!("/proc/{pid}/oom_score_adj");
    if let Err(e) = std::fs::write(&path, adjustment.to_string()) {
        warn!("failed to set OOM score adjustment for worker with pid {pid}: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn adjust_worker_oom_score(_pid: u32, _adjustment: i32) {}
