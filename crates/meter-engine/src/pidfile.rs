//! Single-instance pid lock file.
//!
//! One meter instance per host: the pid file in the state directory holds
//! the running daemon's pid. A leftover file whose pid is no longer alive
//! is treated as stale and removed.

use std::fs;
use std::path::{Path, PathBuf};

use meter_common::{MeterError, MeterResult};
use tracing::warn;

/// Name of the lock file inside the state directory.
pub const PID_FILE_NAME: &str = "meterd.pid";

/// Held pid lock; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

impl PidFile {
    /// Acquire the lock in `state_dir`, failing when another live
    /// instance holds it.
    pub fn acquire(state_dir: &Path) -> MeterResult<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(PID_FILE_NAME);

        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(pid) = content.trim().parse::<u32>() {
                if pid != std::process::id() && pid_alive(pid) {
                    return Err(MeterError::AlreadyRunning(pid));
                }
                warn!(pid, "removing stale pid file");
            }
            fs::remove_file(&path)?;
        }

        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }

    /// Path of the held lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
