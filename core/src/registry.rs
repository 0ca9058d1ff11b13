use std::collections::HashMap;
#[cfg(unix)]
use std::io;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use procmux_protocol::RunStatus;
use procmux_protocol::RunSummary;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::error::SupervisorError;
use crate::log_channel::LogChannel;

/// In-memory state for one supervised run: the process identity, its log
/// channel, and the background tasks that service it.
///
/// The registry is the record's single owner. Only the launcher creates
/// records, and only the terminator's escalation path and the post-exit
/// eviction timer remove them.
#[derive(Debug)]
pub(crate) struct RunRecord {
    pub(crate) id: String,
    pub(crate) channel: Arc<LogChannel>,
    pid: StdMutex<Option<u32>>,
    has_exited: AtomicBool,
    /// Signals the exit watcher, which exclusively owns the `Child`, to
    /// deliver a forced kill.
    force_kill: Notify,
    /// Handles for this run's reader, pump, keepalive, and watcher tasks;
    /// aborted when the record is dropped so no timer outlives its run.
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl RunRecord {
    pub(crate) fn new(id: String, channel: Arc<LogChannel>) -> Self {
        Self {
            id,
            channel,
            pid: StdMutex::new(None),
            has_exited: AtomicBool::new(false),
            force_kill: Notify::new(),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        if let Ok(mut guard) = self.pid.lock() {
            *guard = pid;
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid.lock().ok().and_then(|guard| *guard)
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.has_exited.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_exited(&self) {
        self.has_exited.store(true, Ordering::SeqCst);
    }

    pub(crate) fn status(&self) -> RunStatus {
        if self.has_exited() {
            RunStatus::Exited
        } else {
            RunStatus::Running
        }
    }

    /// Asks the exit watcher to kill the process unconditionally. A permit
    /// is stored if the watcher is mid-wait, so the request is never lost.
    pub(crate) fn request_force_kill(&self) {
        self.force_kill.notify_one();
    }

    pub(crate) async fn force_kill_requested(&self) {
        self.force_kill.notified().await;
    }

    /// Sends the platform's graceful termination request to the process.
    ///
    /// Returns `Ok(false)` when the process is already gone, which callers
    /// treat as the benign not-running outcome.
    pub(crate) fn request_graceful_kill(&self) -> Result<bool> {
        let Some(pid) = self.pid() else {
            return Ok(false);
        };
        if self.has_exited() {
            return Ok(false);
        }
        self.send_graceful(pid)
    }

    #[cfg(unix)]
    fn send_graceful(&self, pid: u32) -> Result<bool> {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(false)
        } else {
            Err(SupervisorError::signal(pid, err))
        }
    }

    /// Windows has no SIGTERM equivalent for arbitrary processes, so the
    /// graceful request degrades to the watcher's kill handle.
    #[cfg(not(unix))]
    fn send_graceful(&self, _pid: u32) -> Result<bool> {
        self.request_force_kill();
        Ok(true)
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            pid: self.pid(),
            status: self.status(),
            log_lines: self.channel.line_count(),
            subscribers: self.channel.subscriber_count(),
        }
    }
}

impl Drop for RunRecord {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Single source of truth mapping run id to [`RunRecord`].
#[derive(Debug, Default)]
pub(crate) struct RunRegistry {
    runs: Mutex<HashMap<String, Arc<RunRecord>>>,
}

impl RunRegistry {
    /// Reserves the record's id. Fails while any record with the same id is
    /// still tracked, including one lingering after exit.
    pub(crate) async fn register(&self, record: Arc<RunRecord>) -> Result<()> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&record.id) {
            return Err(SupervisorError::duplicate_run(&record.id));
        }
        runs.insert(record.id.clone(), record);
        Ok(())
    }

    pub(crate) async fn get(&self, id: &str) -> Option<Arc<RunRecord>> {
        self.runs.lock().await.get(id).cloned()
    }

    pub(crate) async fn lookup(&self, id: &str) -> Result<Arc<RunRecord>> {
        self.get(id)
            .await
            .ok_or_else(|| SupervisorError::not_found(id))
    }

    /// Idempotent removal; evicting an unknown id is a no-op.
    pub(crate) async fn remove(&self, id: &str) {
        let removed = self.runs.lock().await.remove(id);
        if let Some(record) = removed {
            record.channel.close();
            debug!(run_id = id, "evicted run record");
        }
    }

    /// Snapshot of every tracked run. Arcs are cloned out of the lock first
    /// so summary building never holds up registration or eviction.
    pub(crate) async fn list(&self) -> Vec<RunSummary> {
        let records: Vec<Arc<RunRecord>> = {
            let runs = self.runs.lock().await;
            runs.values().cloned().collect()
        };

        let mut summaries: Vec<RunSummary> =
            records.iter().map(|record| record.summary()).collect();
        summaries.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        summaries
    }

    pub(crate) async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }
}
