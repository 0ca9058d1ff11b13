use std::time::Duration;

const DEFAULT_MAX_BUFFER_LINES: usize = 5_000;
const DEFAULT_TRIM_BLOCK_LINES: usize = 1_000;
const DEFAULT_REPLAY_LINES: usize = 200;
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_EVICTION_LINGER: Duration = Duration::from_secs(60);
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1_024;

/// Sizing and timing knobs for a [`crate::Supervisor`] instance.
///
/// The defaults are the reference sizing; tests shrink the delays to keep
/// wall-clock time down.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Log buffer cap per run; exceeding it drops the oldest block.
    pub max_buffer_lines: usize,
    /// How many of the oldest lines one trimming step removes.
    pub trim_block_lines: usize,
    /// Upper bound on the replay delivered to a freshly attached subscriber.
    pub replay_lines: usize,
    /// How long a graceful termination request may go unanswered before the
    /// forced kill fires.
    pub kill_grace: Duration,
    /// Cadence of the liveness marker broadcast to subscribers.
    pub keepalive_interval: Duration,
    /// How long a finished run's record stays visible before eviction.
    pub eviction_linger: Duration,
    /// Per-subscriber delivery channel depth. A subscriber that falls this
    /// far behind is treated as dead and detached.
    pub subscriber_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
            trim_block_lines: DEFAULT_TRIM_BLOCK_LINES,
            replay_lines: DEFAULT_REPLAY_LINES,
            kill_grace: DEFAULT_KILL_GRACE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            eviction_linger: DEFAULT_EVICTION_LINGER,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    /// Clamps degenerate values so the buffer invariants hold: a trimming
    /// step removes at least one line and never more than the cap, and a
    /// subscriber channel always has room for a full replay.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_buffer_lines = self.max_buffer_lines.max(1);
        self.trim_block_lines = self.trim_block_lines.clamp(1, self.max_buffer_lines);
        self.replay_lines = self.replay_lines.min(self.max_buffer_lines);
        self.subscriber_capacity = self.subscriber_capacity.max(self.replay_lines + 1);
        self
    }
}
