use std::io::ErrorKind;
use std::process::ExitStatus;
use std::sync::Arc;

use procmux_protocol::HealthStatus;
use procmux_protocol::LaunchParams;
use procmux_protocol::LaunchScriptParams;
use procmux_protocol::RunSummary;
use procmux_protocol::StopOutcome;
use procmux_protocol::StreamEvent;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::log_channel::LogChannel;
use crate::log_channel::SubscriberId;
use crate::log_channel::capture_line;
use crate::registry::RunRecord;
use crate::registry::RunRegistry;
use crate::spawn;
use crate::spawn::PreparedCommand;

/// Depth of the channel between the pipe readers and the pump. Filling it
/// backpressures the child's pipes, never a subscriber.
const READER_CHANNEL_CAPACITY: usize = 256;

/// The process supervisor: launches child processes keyed by caller-chosen
/// run ids, captures their merged output, broadcasts it live to any number
/// of subscribers, and answers stop/list/health requests.
///
/// Cheap to clone; all clones share one registry.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

#[derive(Debug)]
struct SupervisorInner {
    config: SupervisorConfig,
    registry: RunRegistry,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config: config.normalized(),
                registry: RunRegistry::default(),
            }),
        }
    }

    /// Launches a run and returns the child's OS pid without waiting for it
    /// to finish.
    ///
    /// Returns `Ok(None)` only when the executable does not exist: that
    /// failure is reported through the run's log stream (so observers see
    /// it) and the record lingers until eviction like any finished run.
    pub async fn launch(&self, params: LaunchParams) -> Result<Option<u32>> {
        let prepared = spawn::prepare(&params)?;
        self.start_run(params.run_id, prepared).await
    }

    /// Launches a platform script file; always shell-interpreted.
    pub async fn launch_script(&self, params: LaunchScriptParams) -> Result<Option<u32>> {
        let prepared = spawn::prepare_script(&params)?;
        self.start_run(params.run_id, prepared).await
    }

    async fn start_run(&self, run_id: String, prepared: PreparedCommand) -> Result<Option<u32>> {
        let channel = Arc::new(LogChannel::new(&self.inner.config));
        let record = Arc::new(RunRecord::new(run_id, channel));
        // Register before spawning so no output, and no subscriber, can ever
        // observe a half-created run.
        self.inner.registry.register(Arc::clone(&record)).await?;

        let PreparedCommand {
            display: command_display,
            mut command,
        } = prepared;

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(run_id = record.id.as_str(), "command not found: {command_display}");
                record
                    .channel
                    .append(capture_line(format!(
                        "failed to start {command_display}: {err}"
                    )));
                record.mark_exited();
                self.schedule_eviction(&record);
                return Ok(None);
            }
            Err(err) => {
                self.inner.registry.remove(&record.id).await;
                return Err(SupervisorError::spawn_failure(command_display, err));
            }
        };

        let pid = child.id();
        record.set_pid(pid);
        info!(run_id = record.id.as_str(), pid, "launched {command_display}");

        // Two reader tasks forward raw lines into one channel; the pump is
        // the sole writer to the run's log channel, which makes the merged
        // stream arrival-ordered by construction.
        let (lines_tx, lines_rx) = mpsc::channel::<String>(READER_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            record.track_task(tokio::spawn(forward_lines(stdout, lines_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            record.track_task(tokio::spawn(forward_lines(stderr, lines_tx.clone())));
        }
        drop(lines_tx);
        let pump = tokio::spawn(pump_lines(lines_rx, Arc::clone(&record.channel)));

        self.spawn_keepalive(&record);

        let watcher_record = Arc::clone(&record);
        let supervisor = self.clone();
        record.track_task(tokio::spawn(async move {
            supervisor.watch_exit(watcher_record, child, pump).await;
        }));

        Ok(pid)
    }

    /// Requests termination of a run: graceful first, forced after the grace
    /// period unless the process exits sooner. Stopping an unknown or
    /// already-finished run is a benign [`StopOutcome::NotRunning`].
    pub async fn stop(&self, run_id: &str) -> Result<StopOutcome> {
        let Some(record) = self.inner.registry.get(run_id).await else {
            return Ok(StopOutcome::NotRunning);
        };
        if record.has_exited() {
            return Ok(StopOutcome::NotRunning);
        }
        if !record.request_graceful_kill()? {
            return Ok(StopOutcome::NotRunning);
        }
        info!(run_id, "termination requested");

        let grace = self.inner.config.kill_grace;
        let timer_record = Arc::clone(&record);
        tokio::spawn(async move {
            sleep(grace).await;
            if !timer_record.has_exited() {
                info!(
                    run_id = timer_record.id.as_str(),
                    "grace period elapsed; escalating to forced kill"
                );
                timer_record.request_force_kill();
            }
        });

        Ok(StopOutcome::TerminationRequested)
    }

    /// Attaches a subscriber to a run's log stream. The stream starts with a
    /// replay of the most recent buffered lines, then carries live lines and
    /// periodic keepalives until the run is evicted.
    pub async fn subscribe(&self, run_id: &str) -> Result<RunStream> {
        let record = self.inner.registry.lookup(run_id).await?;
        let (subscriber_id, events) = record.channel.attach();
        debug!(run_id, subscriber = ?subscriber_id, "subscriber attached");
        Ok(RunStream {
            subscriber_id,
            channel: Arc::clone(&record.channel),
            events,
        })
    }

    /// Snapshot of every tracked run, running or lingering after exit.
    pub async fn list(&self) -> Vec<RunSummary> {
        self.inner.registry.list().await
    }

    pub async fn health(&self) -> HealthStatus {
        HealthStatus::operational(self.inner.registry.len().await)
    }

    fn spawn_keepalive(&self, record: &Arc<RunRecord>) {
        let channel = Arc::clone(&record.channel);
        let period = self.inner.config.keepalive_interval;
        record.track_task(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                channel.broadcast(StreamEvent::KeepAlive);
            }
        }));
    }

    fn schedule_eviction(&self, record: &Arc<RunRecord>) {
        let supervisor = self.clone();
        let linger = self.inner.config.eviction_linger;
        let evicted = Arc::clone(record);
        record.track_task(tokio::spawn(async move {
            sleep(linger).await;
            supervisor.inner.registry.remove(&evicted.id).await;
        }));
    }

    /// Owns the child for the rest of its life: answers forced-kill
    /// requests, then writes the exit marker once the output pump has
    /// drained, and finally evicts the record after the linger delay.
    async fn watch_exit(&self, record: Arc<RunRecord>, mut child: Child, pump: JoinHandle<()>) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = record.force_kill_requested() => {
                    if let Err(err) = child.start_kill() {
                        debug!(
                            run_id = record.id.as_str(),
                            error = %err,
                            "forced kill failed; process has likely already exited"
                        );
                    }
                }
            }
        };
        record.mark_exited();

        // The pipes can still hold output after wait() returns; the marker
        // must be the final line, so drain the pump first.
        if let Err(err) = pump.await {
            if !err.is_cancelled() {
                warn!(run_id = record.id.as_str(), error = %err, "output pump failed");
            }
        }

        let marker = match &status {
            Ok(status) => {
                info!(
                    run_id = record.id.as_str(),
                    code = status.code(),
                    "process exited"
                );
                exit_marker(&record.id, *status)
            }
            Err(err) => {
                warn!(run_id = record.id.as_str(), error = %err, "waiting on process failed");
                format!("process {} could not be awaited: {err}", record.id)
            }
        };
        record.channel.append(capture_line(marker));

        sleep(self.inner.config.eviction_linger).await;
        self.inner.registry.remove(&record.id).await;
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

/// A live view of one run's output stream.
///
/// Dropping the stream detaches the subscriber; a subscriber that stops
/// draining is detached by the supervisor instead, so either way the run is
/// never held up by its observers.
#[derive(Debug)]
pub struct RunStream {
    subscriber_id: SubscriberId,
    channel: Arc<LogChannel>,
    events: mpsc::Receiver<StreamEvent>,
}

impl RunStream {
    /// Next event in delivery order: replayed lines, then live lines and
    /// keepalives. `None` once the run has been evicted or this subscriber
    /// has been detached.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        self.channel.detach(self.subscriber_id);
    }
}

async fn forward_lines<R>(reader: R, lines_tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if lines_tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "child output stream ended with error");
                break;
            }
        }
    }
}

/// Sole writer to a run's log channel: trims each arriving chunk, drops
/// whitespace-only lines, stamps and appends the rest.
async fn pump_lines(mut lines_rx: mpsc::Receiver<String>, channel: Arc<LogChannel>) {
    while let Some(raw) = lines_rx.recv().await {
        let text = raw.trim();
        if text.is_empty() {
            continue;
        }
        channel.append(capture_line(text));
    }
}

fn exit_marker(run_id: &str, status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("process {run_id} exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("process {run_id} terminated by signal {signal}");
        }
    }
    format!("process {run_id} exited")
}
