//! Stale-PID detection and the supervisor's own PID file (`gateway.pid`).
//! Liveness/signal delivery is POSIX `kill(2)` with a zero signal for a
//! liveness probe and `SIGTERM` for the takeover of an orphaned prior
//! supervisor instance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

/// If a PID file exists and names a live process, ask it to terminate and
/// wait briefly for it to exit before this process takes over the file.
pub async fn evict_stale_instance(pid_path: &Path) {
    let Ok(raw) = std::fs::read_to_string(pid_path) else {
        return;
    };
    let Ok(pid) = raw.trim().parse::<i32>() else {
        warn!(path = %pid_path.display(), "pid file unreadable, removing");
        let _ = std::fs::remove_file(pid_path);
        return;
    };

    if !process_alive(pid) {
        info!(pid, "stale pid file from a dead process, removing");
        let _ = std::fs::remove_file(pid_path);
        return;
    }

    warn!(pid, "prior gateway instance still running, sending SIGTERM");
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if !process_alive(pid) {
            info!(pid, "prior instance exited");
            break;
        }
    }
    let _ = std::fs::remove_file(pid_path);
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 performs no delivery, only existence/permission checks.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

pub fn write_pid_file(pid_path: &Path) -> std::io::Result<()> {
    std::fs::write(pid_path, std::process::id().to_string())
}

pub fn remove_pid_file(pid_path: &Path) {
    let _ = std::fs::remove_file(pid_path);
}

pub fn default_pid_path(data_dir: &Path) -> PathBuf {
    data_dir.join("gateway.pid")
}
