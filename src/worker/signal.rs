//! Signal delivery to job processes.
//!
//! Jobs are spawned as process group leaders, so on POSIX the whole group is
//! signalled and the interpreter started by the shell wrapper receives the
//! signal as well. A pid that no longer exists is routine here (the job
//! exited on its own, or the pid is left over from a previous supervisor),
//! so failures are logged and reported as `false`, never raised.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful, SIGINT
    Interrupt,
    /// Forceful, SIGKILL
    Kill,
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopSignal::Interrupt => write!(f, "SIGINT"),
            StopSignal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Send `signal` to the process group led by `pid`, falling back to the
/// single process. Returns whether the signal was delivered.
#[cfg(unix)]
pub fn send(pid: u32, signal: StopSignal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        StopSignal::Interrupt => Signal::SIGINT,
        StopSignal::Kill => Signal::SIGKILL,
    };

    // 0 and 1 would address our own group or init.
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 1 => raw,
        _ => {
            tracing::warn!(pid, signal = %signal, "Refusing to signal invalid pid");
            return false;
        }
    };
    let target = Pid::from_raw(raw);

    match killpg(target, sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => match kill(target, sig) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pid, signal = %signal, error = %e, "Process not running");
                false
            }
        },
        Err(e) => {
            tracing::warn!(pid, signal = %signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

/// Windows has no signals for console processes; both variants terminate
/// the process tree.
#[cfg(not(unix))]
pub fn send(pid: u32, signal: StopSignal) -> bool {
    let result = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status();

    match result {
        Ok(status) if status.success() => true,
        Ok(status) => {
            tracing::warn!(pid, signal = %signal, status = %status, "Process not running");
            false
        }
        Err(e) => {
            tracing::warn!(pid, signal = %signal, error = %e, "Failed to run taskkill");
            false
        }
    }
}

/// Human readable name of a terminating signal number.
#[cfg(unix)]
pub fn signal_name(raw: i32) -> String {
    nix::sys::signal::Signal::try_from(raw)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", raw))
}

#[cfg(not(unix))]
pub fn signal_name(raw: i32) -> String {
    format!("signal {}", raw)
}
