use std::time::Duration;

/// How a channel send behaves when the retransmission buffer is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressureMode {
    /// The sender suspends until acknowledgements free buffer space.
    Block,
    /// The send fails immediately with a state conflict.
    Fail,
}

/// Tunable knobs for the orchestration core. Each timeout is enforced by
/// exactly one owning component and is never extended by unrelated activity.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Warm instances the pool controller tries to keep ready.
    pub target_warm_count: usize,
    /// Cap on concurrent provisioning requests to the collaborator.
    pub max_in_flight_provisions: usize,
    /// Pool controller loop interval.
    pub pool_tick: Duration,
    /// How long an instance may sit in provisioning/warming before it is
    /// swept to failed.
    pub provision_timeout: Duration,
    /// Attempts per provision before giving up until the next tick.
    pub provision_max_attempts: u32,
    /// Base delay for provisioning retry backoff (jittered, exponential).
    pub provision_backoff_base: Duration,
    pub provision_backoff_cap: Duration,

    /// How long a session creation waits for a ready instance.
    pub claim_timeout: Duration,
    /// Inactivity before an active session is marked idle.
    pub idle_after: Duration,
    /// Inactivity before a session is terminated outright.
    pub idle_timeout: Duration,
    /// Idle sweeper interval.
    pub idle_sweep_interval: Duration,

    /// Heartbeat send interval, both directions.
    pub heartbeat_interval: Duration,
    /// Consecutive silent intervals before a channel is suspect. One more
    /// silent interval confirms the failure.
    pub heartbeat_miss_threshold: u32,

    /// Grace given to a draining instance before reset is attempted.
    pub drain_grace: Duration,
    /// Reconnect window after an orchestrator restart before unreachable
    /// instances are marked failed.
    pub reconnect_grace: Duration,

    /// Unacknowledged reliable messages retained per channel. A reconnect
    /// presenting a sequence older than this window loses the channel.
    pub retransmit_buffer: usize,
    pub backpressure: BackpressureMode,

    /// How long a finished task's update history stays replayable.
    pub task_history_retention: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            target_warm_count: 5,
            max_in_flight_provisions: 3,
            pool_tick: Duration::from_secs(3),
            provision_timeout: Duration::from_secs(120),
            provision_max_attempts: 3,
            provision_backoff_base: Duration::from_millis(500),
            provision_backoff_cap: Duration::from_secs(10),

            claim_timeout: Duration::from_secs(30),
            idle_after: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            idle_sweep_interval: Duration::from_secs(1),

            heartbeat_interval: Duration::from_secs(5),
            heartbeat_miss_threshold: 3,

            drain_grace: Duration::from_secs(10),
            reconnect_grace: Duration::from_secs(30),

            retransmit_buffer: 256,
            backpressure: BackpressureMode::Block,

            task_history_retention: Duration::from_secs(5 * 60),
        }
    }
}

impl CoreConfig {
    /// Silence on a channel longer than this marks it suspect.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_miss_threshold
    }
}
