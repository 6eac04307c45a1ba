//! Start and stop worker processes from the CLI.
//!
//! Workers are independent OS processes running `queuectl worker run`. The
//! supervisor holds no handles to them after spawning; stopping goes through
//! the worker registry and POSIX signals.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{Error, Result};

/// Result of a stop request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Workers sent SIGTERM. Each finishes its current job before exiting.
    pub signalled: Vec<u32>,
    /// Registered pids with no live process behind them.
    pub already_gone: Vec<u32>,
    /// Pids that could not be signalled, with the reason.
    pub failed: Vec<(u32, String)>,
}

impl StopReport {
    pub fn total(&self) -> usize {
        self.signalled.len() + self.already_gone.len() + self.failed.len()
    }
}

/// Spawn `count` detached worker processes against `db_path`.
///
/// Each child's log output is appended to `log_file`. Returns the child
/// pids. Each child registers itself once it starts, so `worker list` may
/// lag briefly behind this call.
pub fn start_workers(count: u32, db_path: &Path, log_file: &Path) -> Result<Vec<u32>> {
    if count == 0 {
        return Err(Error::Validation(
            "worker count must be at least 1".to_string(),
        ));
    }

    if let Some(dir) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(log_file)?;

    let exe = std::env::current_exe()?;
    let mut pids = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let child = Command::new(&exe)
            .args(["worker", "run"])
            .env("QUEUECTL_DB_PATH", db_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log.try_clone()?))
            .spawn()?;

        info!(pid = child.id(), db = %db_path.display(), "worker process spawned");
        pids.push(child.id());
    }

    Ok(pids)
}

/// Ask every registered worker to stop and remove its registration.
///
/// Workers exit after their current job. A pid whose process is already
/// gone is deregistered without a signal.
pub async fn stop_workers(db: &Db) -> Result<StopReport> {
    let workers = db.list_active_workers().await?;
    let mut report = StopReport::default();

    for worker in workers {
        match terminate(worker.pid) {
            Ok(true) => report.signalled.push(worker.pid),
            Ok(false) => report.already_gone.push(worker.pid),
            Err(e) => {
                warn!(pid = worker.pid, error = %e, "could not signal worker");
                report.failed.push((worker.pid, e.to_string()));
                continue;
            }
        }
        db.unregister_worker(worker.pid).await?;
    }

    info!(
        signalled = report.signalled.len(),
        already_gone = report.already_gone.len(),
        failed = report.failed.len(),
        "stop requested"
    );
    Ok(report)
}

/// Send SIGTERM. `Ok(false)` when no such process exists.
#[cfg(unix)]
fn terminate(pid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| Error::Validation(format!("invalid pid {pid}")))?;
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(Error::Other(format!("kill({pid}, SIGTERM): {e}"))),
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<bool> {
    Err(Error::Other(format!(
        "stopping worker {pid} requires POSIX signals"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_is_rejected() {
        let err = start_workers(0, Path::new("unused.db"), Path::new("unused.log")).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn report_total_counts_every_bucket() {
        let report = StopReport {
            signalled: vec![1, 2],
            already_gone: vec![3],
            failed: vec![(4, "denied".to_string())],
        };
        assert_eq!(report.total(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn terminating_a_missing_process_reports_gone() {
        // Pid far above any default pid_max.
        assert!(!terminate(i32::MAX as u32).unwrap());
    }
}
