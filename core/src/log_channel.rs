use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use procmux_protocol::LogLine;
use procmux_protocol::StreamEvent;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::SupervisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriberId(u64);

#[derive(Debug, Default)]
struct ChannelState {
    lines: VecDeque<LogLine>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<StreamEvent>>,
    closed: bool,
}

/// Bounded log history plus the live subscriber set for one run.
///
/// Everything lives behind one lock so that an attach observes a consistent
/// cut of the stream: the replay it is handed and the first live line it
/// receives are guaranteed to be adjacent, with no gap and no duplication.
/// All operations are short and never block on a subscriber; a subscriber
/// that cannot accept a delivery is dropped, not waited on.
#[derive(Debug)]
pub(crate) struct LogChannel {
    max_lines: usize,
    trim_block: usize,
    replay_lines: usize,
    subscriber_capacity: usize,
    next_subscriber_id: AtomicU64,
    state: Mutex<ChannelState>,
}

impl LogChannel {
    pub(crate) fn new(config: &SupervisorConfig) -> Self {
        Self {
            max_lines: config.max_buffer_lines,
            trim_block: config.trim_block_lines,
            replay_lines: config.replay_lines,
            subscriber_capacity: config.subscriber_capacity,
            next_subscriber_id: AtomicU64::new(0),
            state: Mutex::new(ChannelState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends one line to the buffer and delivers it to every subscriber.
    ///
    /// Once the buffer exceeds its cap the oldest block is dropped in a
    /// single step, so the length oscillates between cap and cap minus the
    /// block size instead of being trimmed on every insert.
    pub(crate) fn append(&self, line: LogLine) {
        let mut state = self.state();
        state.lines.push_back(line.clone());
        if state.lines.len() > self.max_lines {
            state.lines.drain(..self.trim_block);
        }
        Self::deliver(&mut state, StreamEvent::Line(line));
    }

    /// Delivers an event to every subscriber without touching the buffer.
    /// Used for liveness markers, which are not log content.
    pub(crate) fn broadcast(&self, event: StreamEvent) {
        let mut state = self.state();
        Self::deliver(&mut state, event);
    }

    fn deliver(state: &mut ChannelState, event: StreamEvent) {
        if state.subscribers.is_empty() {
            return;
        }
        let mut dead: Vec<SubscriberId> = Vec::new();
        for (id, sender) in &state.subscribers {
            if sender.try_send(event.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            state.subscribers.remove(&id);
            debug!(subscriber = id.0, "detached subscriber after failed delivery");
        }
    }

    /// Adds a subscriber, handing it a replay of up to the most recent
    /// `replay_lines` buffered lines before any live line can reach it.
    pub(crate) fn attach(&self) -> (SubscriberId, mpsc::Receiver<StreamEvent>) {
        let id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);

        let mut state = self.state();
        let start = state.lines.len().saturating_sub(self.replay_lines);
        for line in state.lines.iter().skip(start) {
            // The channel is fresh and sized past replay_lines, so this
            // cannot fail.
            let _ = tx.try_send(StreamEvent::Line(line.clone()));
        }
        if !state.closed {
            state.subscribers.insert(id, tx);
        }
        (id, rx)
    }

    /// Removes a subscriber. Safe for unknown ids and repeated calls.
    pub(crate) fn detach(&self, id: SubscriberId) {
        self.state().subscribers.remove(&id);
    }

    /// Drops every subscriber so their streams terminate. Called when the
    /// owning run record is evicted.
    pub(crate) fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.subscribers.clear();
    }

    pub(crate) fn line_count(&self) -> usize {
        self.state().lines.len()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }
}

/// Stamps a chunk of output text with its capture time.
pub(crate) fn capture_line(text: impl Into<String>) -> LogLine {
    LogLine {
        timestamp: chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
        text: text.into(),
    }
}
