//! Command channel — the persistent, ordered, reconnectable logical link
//! between the orchestrator and one worker instance.
//!
//! A logical channel outlives any physical transport. Reliable messages are
//! buffered until the instance acknowledges them, so a reconnect can resume
//! from the last acknowledged sequence without loss, up to the buffer's
//! retention window. Control frames (hello, heartbeat, ack) are unsequenced
//! and never replayed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

use convoy_core::config::{BackpressureMode, CoreConfig};
use convoy_core::errors::OrchestratorError;
use convoy_core::ids::{ChannelId, InstanceId};
use convoy_core::protocol::{CommandMessage, CommandPayload};

struct Outbound {
    /// Next reliable sequence to assign. Starts at 1; control frames use 0.
    next_seq: u64,
    /// Highest cumulative acknowledgement seen. Never regresses.
    last_ack: u64,
    /// Reliable messages sent but not yet acknowledged.
    buffer: VecDeque<CommandMessage>,
    /// Current physical transport, if one is attached.
    transport: Option<mpsc::Sender<CommandMessage>>,
}

/// Where an inbound reliable message landed relative to the expected
/// sequence.
#[derive(Debug)]
pub enum InboundDisposition {
    /// In order; deliver to the router and acknowledge.
    Deliver(CommandMessage),
    /// At or below the last delivered sequence; re-acknowledge only.
    Duplicate { last: u64 },
    /// Ahead of the expected sequence; re-acknowledge so the sender replays.
    Gap { expected: u64, last: u64 },
}

pub struct CommandChannel {
    id: ChannelId,
    instance_id: InstanceId,
    outbound: Mutex<Outbound>,
    space: Notify,
    /// Last delivered inbound reliable sequence.
    inbound_seq: Mutex<u64>,
    /// Epoch millis of the most recent inbound frame of any kind.
    last_traffic_ms: AtomicU64,
    suspect: AtomicBool,
    capacity: usize,
    mode: BackpressureMode,
}

impl CommandChannel {
    fn new(instance_id: InstanceId, capacity: usize, mode: BackpressureMode) -> Self {
        Self {
            id: ChannelId::new(),
            instance_id,
            outbound: Mutex::new(Outbound {
                next_seq: 1,
                last_ack: 0,
                buffer: VecDeque::new(),
                transport: None,
            }),
            space: Notify::new(),
            inbound_seq: Mutex::new(0),
            last_traffic_ms: AtomicU64::new(now_ms()),
            suspect: AtomicBool::new(false),
            capacity,
            mode,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Send a reliable payload. The message is buffered until acknowledged;
    /// when the buffer is full the call blocks or fails per the configured
    /// backpressure mode.
    pub async fn send(&self, payload: CommandPayload) -> Result<u64, OrchestratorError> {
        debug_assert!(!payload.is_control(), "control frames go through send_control");

        loop {
            // Register for ack notifications before checking the buffer so a
            // wakeup between the check and the await is not lost.
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut out = self.outbound.lock();
                if out.buffer.len() < self.capacity {
                    let seq = out.next_seq;
                    out.next_seq += 1;
                    let msg = CommandMessage {
                        channel_id: self.id.clone(),
                        seq,
                        payload,
                    };
                    out.buffer.push_back(msg.clone());
                    self.forward(&mut out, msg);
                    return Ok(seq);
                }
                if self.mode == BackpressureMode::Fail {
                    return Err(OrchestratorError::StateConflict(format!(
                        "channel {} outbound buffer full",
                        self.id
                    )));
                }
            }
            notified.await;
        }
    }

    /// Send an unsequenced control frame on the current transport, if any.
    pub fn send_control(&self, payload: CommandPayload) {
        let mut out = self.outbound.lock();
        let msg = CommandMessage::control(self.id.clone(), payload);
        self.forward(&mut out, msg);
    }

    /// Push a message onto the attached transport. A saturated or closed
    /// transport is detached; reliable traffic stays buffered for replay.
    fn forward(&self, out: &mut Outbound, msg: CommandMessage) {
        if let Some(tx) = &out.transport {
            match tx.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel_id = %self.id, "transport saturated, detaching");
                    out.transport = None;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    out.transport = None;
                }
            }
        }
    }

    /// Apply a cumulative acknowledgement. Stale acks are ignored so the
    /// acknowledged horizon never regresses.
    pub fn on_ack(&self, seq: u64) {
        {
            let mut out = self.outbound.lock();
            if seq <= out.last_ack {
                return;
            }
            out.last_ack = seq;
            while out.buffer.front().is_some_and(|m| m.seq <= seq) {
                out.buffer.pop_front();
            }
        }
        self.space.notify_waiters();
    }

    /// Attach a new physical transport and resume the logical channel.
    /// `resume_from` is the last sequence the instance durably processed;
    /// buffered messages after it are replayed in order. A resume point
    /// outside the retention window loses the channel.
    pub fn attach(
        &self,
        tx: mpsc::Sender<CommandMessage>,
        resume_from: u64,
    ) -> Result<usize, OrchestratorError> {
        let replayed = {
            let mut out = self.outbound.lock();

            if resume_from >= out.next_seq {
                return Err(OrchestratorError::Validation(format!(
                    "resume point {resume_from} is ahead of anything sent on {}",
                    self.id
                )));
            }
            if let Some(front) = out.buffer.front() {
                if resume_from + 1 < front.seq {
                    return Err(OrchestratorError::ChannelLost(format!(
                        "resume point {resume_from} is outside the retention window \
                         (oldest buffered {})",
                        front.seq
                    )));
                }
            } else if resume_from < out.last_ack {
                return Err(OrchestratorError::ChannelLost(format!(
                    "resume point {resume_from} predates acknowledged {}",
                    out.last_ack
                )));
            }

            // A presented resume point counts as an acknowledgement.
            if resume_from > out.last_ack {
                out.last_ack = resume_from;
            }
            while out.buffer.front().is_some_and(|m| m.seq <= resume_from) {
                out.buffer.pop_front();
            }

            let mut replayed = 0;
            for msg in out.buffer.iter() {
                if tx.try_send(msg.clone()).is_err() {
                    break;
                }
                replayed += 1;
            }
            out.transport = Some(tx);
            replayed
        };

        self.mark_traffic();
        self.space.notify_waiters();
        info!(channel_id = %self.id, resume_from, replayed, "transport attached");
        Ok(replayed)
    }

    /// Drop the physical transport; the logical channel stays resumable.
    pub fn detach(&self) {
        self.outbound.lock().transport = None;
        debug!(channel_id = %self.id, "transport detached");
    }

    pub fn is_attached(&self) -> bool {
        self.outbound.lock().transport.is_some()
    }

    pub fn last_ack(&self) -> u64 {
        self.outbound.lock().last_ack
    }

    pub fn buffered(&self) -> usize {
        self.outbound.lock().buffer.len()
    }

    /// Sequence-check an inbound reliable message.
    pub fn on_reliable(&self, msg: CommandMessage) -> InboundDisposition {
        self.mark_traffic();
        let mut last = self.inbound_seq.lock();
        if msg.seq == *last + 1 {
            *last = msg.seq;
            InboundDisposition::Deliver(msg)
        } else if msg.seq <= *last {
            InboundDisposition::Duplicate { last: *last }
        } else {
            InboundDisposition::Gap { expected: *last + 1, last: *last }
        }
    }

    pub fn last_inbound(&self) -> u64 {
        *self.inbound_seq.lock()
    }

    pub fn mark_traffic(&self) {
        self.last_traffic_ms.store(now_ms(), Ordering::Relaxed);
        self.suspect.store(false, Ordering::Relaxed);
    }

    pub fn silent_for(&self) -> Duration {
        let last = self.last_traffic_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms().saturating_sub(last))
    }

    /// Mark the channel suspect; returns true if it was already suspect
    /// (the confirmation re-check failed).
    fn mark_suspect(&self) -> bool {
        self.suspect.swap(true, Ordering::Relaxed)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Health transitions observed by the channel monitor.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    /// No traffic past the heartbeat deadline; confirmation pending.
    Unhealthy {
        channel_id: ChannelId,
        instance_id: InstanceId,
    },
    /// Still silent after the confirmation re-check, or the reconnect
    /// window was exceeded.
    Lost {
        channel_id: ChannelId,
        instance_id: InstanceId,
        reason: String,
    },
}

/// Registry of logical channels, one per connected worker instance.
pub struct ChannelManager {
    channels: DashMap<ChannelId, Arc<CommandChannel>>,
    by_instance: DashMap<InstanceId, ChannelId>,
    events: broadcast::Sender<ChannelEvent>,
    config: CoreConfig,
}

impl ChannelManager {
    pub fn new(config: CoreConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            channels: DashMap::new(),
            by_instance: DashMap::new(),
            events,
            config,
        }
    }

    /// Open a fresh logical channel for an instance.
    pub fn open(&self, instance_id: &InstanceId) -> Arc<CommandChannel> {
        let channel = Arc::new(CommandChannel::new(
            instance_id.clone(),
            self.config.retransmit_buffer,
            self.config.backpressure,
        ));
        self.channels.insert(channel.id().clone(), Arc::clone(&channel));
        self.by_instance.insert(instance_id.clone(), channel.id().clone());
        info!(channel_id = %channel.id(), instance_id = %instance_id, "channel opened");
        channel
    }

    pub fn get(&self, id: &ChannelId) -> Option<Arc<CommandChannel>> {
        self.channels.get(id).map(|e| Arc::clone(&e))
    }

    pub fn for_instance(&self, instance_id: &InstanceId) -> Option<Arc<CommandChannel>> {
        let channel_id = self.by_instance.get(instance_id)?.clone();
        self.get(&channel_id)
    }

    pub fn remove(&self, id: &ChannelId) {
        if let Some((_, channel)) = self.channels.remove(id) {
            self.by_instance.remove(channel.instance_id());
        }
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Report a channel as lost outside the monitor loop (e.g. a reconnect
    /// presented a resume point past the retention window).
    pub fn report_lost(&self, channel: &CommandChannel, reason: &str) {
        let _ = self.events.send(ChannelEvent::Lost {
            channel_id: channel.id().clone(),
            instance_id: channel.instance_id().clone(),
            reason: reason.to_string(),
        });
    }

    /// Process one inbound frame. Control frames are consumed here;
    /// in-order reliable frames are acknowledged and returned for routing.
    pub fn handle_frame(
        &self,
        channel: &Arc<CommandChannel>,
        msg: CommandMessage,
    ) -> Option<CommandMessage> {
        if msg.is_control() {
            channel.mark_traffic();
            if let CommandPayload::Ack { seq } = msg.payload {
                channel.on_ack(seq);
            }
            return None;
        }

        match channel.on_reliable(msg) {
            InboundDisposition::Deliver(delivered) => {
                channel.send_control(CommandPayload::Ack { seq: delivered.seq });
                Some(delivered)
            }
            InboundDisposition::Duplicate { last } => {
                channel.send_control(CommandPayload::Ack { seq: last });
                None
            }
            InboundDisposition::Gap { expected, last } => {
                debug!(
                    channel_id = %channel.id(),
                    expected, last, "inbound gap, requesting replay"
                );
                channel.send_control(CommandPayload::Ack { seq: last });
                None
            }
        }
    }

    /// One monitor pass: heartbeat every attached channel, escalate silent
    /// ones. First detection marks the channel suspect; a second consecutive
    /// silent pass confirms the loss.
    pub fn monitor_pass(&self) {
        let deadline = self.config.heartbeat_deadline();
        for entry in self.channels.iter() {
            let channel = entry.value();
            if channel.is_attached() {
                channel.send_control(CommandPayload::Heartbeat);
            }

            if channel.silent_for() <= deadline {
                continue;
            }
            if channel.mark_suspect() {
                warn!(channel_id = %channel.id(), "channel silent past confirmation re-check");
                let _ = self.events.send(ChannelEvent::Lost {
                    channel_id: channel.id().clone(),
                    instance_id: channel.instance_id().clone(),
                    reason: "missed heartbeats".to_string(),
                });
            } else {
                debug!(channel_id = %channel.id(), "channel suspect, awaiting re-check");
                let _ = self.events.send(ChannelEvent::Unhealthy {
                    channel_id: channel.id().clone(),
                    instance_id: channel.instance_id().clone(),
                });
            }
        }
    }

    /// Start the heartbeat/health loop.
    pub fn spawn_health_monitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                self.monitor_pass();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ids::{SessionId, TaskId};

    fn test_config() -> CoreConfig {
        CoreConfig {
            retransmit_buffer: 4,
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_miss_threshold: 2,
            ..Default::default()
        }
    }

    fn open_attached(
        manager: &ChannelManager,
    ) -> (Arc<CommandChannel>, mpsc::Receiver<CommandMessage>) {
        let channel = manager.open(&InstanceId::new());
        let (tx, rx) = mpsc::channel(64);
        channel.attach(tx, 0).unwrap();
        (channel, rx)
    }

    fn dispatch_payload() -> CommandPayload {
        CommandPayload::Dispatch {
            task_id: TaskId::new(),
            session_id: SessionId::new(),
            steps: vec![serde_json::json!({"action": "noop"})],
        }
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_increase() {
        let manager = ChannelManager::new(test_config());
        let (channel, mut rx) = open_attached(&manager);

        for expected in 1..=3u64 {
            let seq = channel.send(dispatch_payload()).await.unwrap();
            assert_eq!(seq, expected);
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.seq, expected);
        }
    }

    #[tokio::test]
    async fn ack_frees_buffer_and_stale_ack_ignored() {
        let manager = ChannelManager::new(test_config());
        let (channel, _rx) = open_attached(&manager);

        channel.send(dispatch_payload()).await.unwrap();
        channel.send(dispatch_payload()).await.unwrap();
        channel.send(dispatch_payload()).await.unwrap();
        assert_eq!(channel.buffered(), 3);

        channel.on_ack(2);
        assert_eq!(channel.buffered(), 1);
        assert_eq!(channel.last_ack(), 2);

        // Acks never regress.
        channel.on_ack(1);
        assert_eq!(channel.last_ack(), 2);
        assert_eq!(channel.buffered(), 1);
    }

    #[tokio::test]
    async fn full_buffer_fails_fast_in_fail_mode() {
        let config = CoreConfig {
            backpressure: BackpressureMode::Fail,
            ..test_config()
        };
        let manager = ChannelManager::new(config);
        let (channel, _rx) = open_attached(&manager);

        for _ in 0..4 {
            channel.send(dispatch_payload()).await.unwrap();
        }
        let result = channel.send(dispatch_payload()).await;
        assert!(matches!(result, Err(OrchestratorError::StateConflict(_))));
    }

    #[tokio::test]
    async fn full_buffer_blocks_until_ack_in_block_mode() {
        let manager = ChannelManager::new(test_config());
        let (channel, _rx) = open_attached(&manager);

        for _ in 0..4 {
            channel.send(dispatch_payload()).await.unwrap();
        }

        let blocked = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send(dispatch_payload()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished(), "send should suspend while full");

        channel.on_ack(1);
        let seq = blocked.await.unwrap().unwrap();
        assert_eq!(seq, 5);
    }

    #[tokio::test]
    async fn reconnect_replays_unacknowledged_messages() {
        let manager = ChannelManager::new(test_config());
        let (channel, rx) = open_attached(&manager);

        channel.send(dispatch_payload()).await.unwrap();
        channel.send(dispatch_payload()).await.unwrap();
        channel.send(dispatch_payload()).await.unwrap();
        channel.on_ack(1);

        // Transport dies mid-task.
        channel.detach();
        drop(rx);

        // Instance reconnects having durably processed seq 1.
        let (tx, mut rx2) = mpsc::channel(64);
        let replayed = channel.attach(tx, 1).unwrap();
        assert_eq!(replayed, 2);

        let a = rx2.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a.seq, 2);
        assert_eq!(b.seq, 3);

        // New sends continue the same sequence.
        let seq = channel.send(dispatch_payload()).await.unwrap();
        assert_eq!(seq, 4);
        assert_eq!(rx2.recv().await.unwrap().seq, 4);
    }

    #[tokio::test]
    async fn resume_inside_retention_never_duplicates_acknowledged() {
        let manager = ChannelManager::new(test_config());
        let (channel, rx) = open_attached(&manager);

        channel.send(dispatch_payload()).await.unwrap();
        channel.send(dispatch_payload()).await.unwrap();
        channel.detach();
        drop(rx);

        // The instance processed both but the ack for 2 was lost in flight:
        // resuming from 2 must not replay either message.
        let (tx, mut rx2) = mpsc::channel(64);
        let replayed = channel.attach(tx, 2).unwrap();
        assert_eq!(replayed, 0);
        assert_eq!(channel.last_ack(), 2);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn resume_outside_retention_window_loses_channel() {
        let manager = ChannelManager::new(test_config());
        let (channel, _rx) = open_attached(&manager);

        channel.send(dispatch_payload()).await.unwrap();
        channel.send(dispatch_payload()).await.unwrap();
        channel.send(dispatch_payload()).await.unwrap();
        // Messages 1 and 2 acknowledged and dropped from the buffer.
        channel.on_ack(2);
        channel.detach();

        // An instance that lost its durable state presents 0; messages 1-2
        // are gone from the retention window.
        let (tx, _rx2) = mpsc::channel(64);
        let result = channel.attach(tx, 0);
        assert!(matches!(result, Err(OrchestratorError::ChannelLost(_))));
    }

    #[tokio::test]
    async fn resume_ahead_of_sent_is_rejected() {
        let manager = ChannelManager::new(test_config());
        let (channel, _rx) = open_attached(&manager);
        channel.detach();

        let (tx, _rx2) = mpsc::channel(64);
        let result = channel.attach(tx, 9);
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn inbound_ordering_and_gap_detection() {
        let manager = ChannelManager::new(test_config());
        let (channel, _rx) = open_attached(&manager);

        let mk = |seq| CommandMessage {
            channel_id: channel.id().clone(),
            seq,
            payload: CommandPayload::Status {
                task_id: TaskId::new(),
                phase: convoy_core::protocol::StatusPhase::Progress,
                detail: None,
            },
        };

        assert!(matches!(channel.on_reliable(mk(1)), InboundDisposition::Deliver(_)));
        assert!(matches!(channel.on_reliable(mk(2)), InboundDisposition::Deliver(_)));
        assert!(matches!(
            channel.on_reliable(mk(2)),
            InboundDisposition::Duplicate { last: 2 }
        ));
        assert!(matches!(
            channel.on_reliable(mk(4)),
            InboundDisposition::Gap { expected: 3, last: 2 }
        ));
        assert_eq!(channel.last_inbound(), 2);
    }

    #[tokio::test]
    async fn handle_frame_acks_delivered_and_reacks_gaps() {
        let manager = Arc::new(ChannelManager::new(test_config()));
        let (channel, mut rx) = open_attached(&manager);

        let mk = |seq| CommandMessage {
            channel_id: channel.id().clone(),
            seq,
            payload: CommandPayload::Status {
                task_id: TaskId::new(),
                phase: convoy_core::protocol::StatusPhase::Progress,
                detail: None,
            },
        };

        let delivered = manager.handle_frame(&channel, mk(1));
        assert!(delivered.is_some());
        let ack = rx.recv().await.unwrap();
        assert!(matches!(ack.payload, CommandPayload::Ack { seq: 1 }));

        // Gap: nothing delivered, last good sequence re-acked.
        let delivered = manager.handle_frame(&channel, mk(3));
        assert!(delivered.is_none());
        let ack = rx.recv().await.unwrap();
        assert!(matches!(ack.payload, CommandPayload::Ack { seq: 1 }));
    }

    #[tokio::test]
    async fn handle_frame_consumes_acks() {
        let manager = Arc::new(ChannelManager::new(test_config()));
        let (channel, _rx) = open_attached(&manager);

        channel.send(dispatch_payload()).await.unwrap();
        assert_eq!(channel.buffered(), 1);

        let ack = CommandMessage::control(channel.id().clone(), CommandPayload::Ack { seq: 1 });
        let delivered = manager.handle_frame(&channel, ack);
        assert!(delivered.is_none());
        assert_eq!(channel.buffered(), 0);
    }

    #[tokio::test]
    async fn monitor_confirms_before_reporting_lost() {
        let manager = Arc::new(ChannelManager::new(test_config()));
        let mut events = manager.subscribe();
        let (channel, _rx) = open_attached(&manager);

        // Past the deadline (2 * 20ms) with no traffic.
        tokio::time::sleep(Duration::from_millis(60)).await;

        manager.monitor_pass();
        match events.try_recv().unwrap() {
            ChannelEvent::Unhealthy { channel_id, .. } => assert_eq!(&channel_id, channel.id()),
            other => panic!("expected Unhealthy, got {other:?}"),
        }

        manager.monitor_pass();
        match events.try_recv().unwrap() {
            ChannelEvent::Lost { channel_id, reason, .. } => {
                assert_eq!(&channel_id, channel.id());
                assert_eq!(reason, "missed heartbeats");
            }
            other => panic!("expected Lost, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn traffic_clears_suspect_state() {
        let manager = Arc::new(ChannelManager::new(test_config()));
        let mut events = manager.subscribe();
        let (channel, _rx) = open_attached(&manager);

        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.monitor_pass();
        assert!(matches!(events.try_recv().unwrap(), ChannelEvent::Unhealthy { .. }));

        // A heartbeat arrives before the re-check: back to healthy.
        let hb = CommandMessage::control(channel.id().clone(), CommandPayload::Heartbeat);
        manager.handle_frame(&channel, hb);

        manager.monitor_pass();
        assert!(events.try_recv().is_err(), "healthy channel reported");
    }

    #[tokio::test]
    async fn manager_instance_lookup() {
        let manager = ChannelManager::new(test_config());
        let instance_id = InstanceId::new();
        let channel = manager.open(&instance_id);

        assert_eq!(manager.count(), 1);
        assert_eq!(
            manager.for_instance(&instance_id).unwrap().id(),
            channel.id()
        );

        manager.remove(channel.id());
        assert_eq!(manager.count(), 0);
        assert!(manager.for_instance(&instance_id).is_none());
    }
}
