use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, InstanceId, SessionId, TaskId};

/// Sequence number carried by control frames. Control frames are never
/// buffered for retransmission and never advance either side's counter.
pub const CONTROL_SEQ: u64 = 0;

/// A framed, typed message exchanged over a Command Channel.
///
/// Reliable payloads carry a per-channel, per-direction sequence number
/// starting at 1; either side detects gaps or reordering after a reconnect
/// by comparing against the last sequence it delivered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandMessage {
    pub channel_id: ChannelId,
    pub seq: u64,
    pub payload: CommandPayload,
}

impl CommandMessage {
    /// An unsequenced control frame (hello, heartbeat, ack).
    pub fn control(channel_id: ChannelId, payload: CommandPayload) -> Self {
        Self { channel_id, seq: CONTROL_SEQ, payload }
    }

    pub fn is_control(&self) -> bool {
        self.seq == CONTROL_SEQ
    }
}

/// Reported progress phase for an in-flight task. `Completed` and
/// `Cancelled` are authoritative terminal reports from the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Started,
    Progress,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Readiness handshake and reconnect resume. `last_seq` is the highest
    /// orchestrator sequence the instance has durably processed.
    Hello { instance_id: InstanceId, last_seq: u64 },

    Heartbeat,

    /// Cumulative acknowledgement of reliable messages up to `seq`.
    Ack { seq: u64 },

    Dispatch {
        task_id: TaskId,
        session_id: SessionId,
        steps: Vec<serde_json::Value>,
    },

    Cancel { task_id: TaskId },

    StepResult {
        task_id: TaskId,
        step_index: u32,
        output: serde_json::Value,
    },

    Status {
        task_id: TaskId,
        phase: StatusPhase,
        detail: Option<String>,
    },

    Error { task_id: TaskId, message: String },

    Close { reason: String },
}

impl CommandPayload {
    /// Control payloads are liveness/bookkeeping traffic: unsequenced and
    /// never retransmitted.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Hello { .. } | Self::Heartbeat | Self::Ack { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Heartbeat => "heartbeat",
            Self::Ack { .. } => "ack",
            Self::Dispatch { .. } => "dispatch",
            Self::Cancel { .. } => "cancel",
            Self::StepResult { .. } => "step_result",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Close { .. } => "close",
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Dispatch { task_id, .. }
            | Self::Cancel { task_id }
            | Self::StepResult { task_id, .. }
            | Self::Status { task_id, .. }
            | Self::Error { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_payload_classification() {
        assert!(CommandPayload::Heartbeat.is_control());
        assert!(CommandPayload::Ack { seq: 7 }.is_control());
        assert!(CommandPayload::Hello { instance_id: InstanceId::new(), last_seq: 0 }.is_control());
        assert!(!CommandPayload::Cancel { task_id: TaskId::new() }.is_control());
        assert!(!CommandPayload::Close { reason: "drain".into() }.is_control());
    }

    #[test]
    fn control_frame_has_zero_seq() {
        let msg = CommandMessage::control(ChannelId::new(), CommandPayload::Heartbeat);
        assert_eq!(msg.seq, CONTROL_SEQ);
        assert!(msg.is_control());
    }

    #[test]
    fn payload_task_id_accessor() {
        let task_id = TaskId::new();
        let payload = CommandPayload::Status {
            task_id: task_id.clone(),
            phase: StatusPhase::Progress,
            detail: Some("step 2 of 4".into()),
        };
        assert_eq!(payload.task_id(), Some(&task_id));
        assert_eq!(CommandPayload::Heartbeat.task_id(), None);
    }

    #[test]
    fn serde_roundtrip() {
        let messages = vec![
            CommandMessage::control(
                ChannelId::new(),
                CommandPayload::Hello { instance_id: InstanceId::new(), last_seq: 12 },
            ),
            CommandMessage {
                channel_id: ChannelId::new(),
                seq: 3,
                payload: CommandPayload::Dispatch {
                    task_id: TaskId::new(),
                    session_id: SessionId::new(),
                    steps: vec![serde_json::json!({"action": "search", "query": "rust"})],
                },
            },
            CommandMessage {
                channel_id: ChannelId::new(),
                seq: 4,
                payload: CommandPayload::Status {
                    task_id: TaskId::new(),
                    phase: StatusPhase::Completed,
                    detail: None,
                },
            },
        ];

        for msg in &messages {
            let json = serde_json::to_string(msg).unwrap();
            let parsed: CommandMessage = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }

    #[test]
    fn wire_format_tags_kind() {
        let msg = CommandMessage {
            channel_id: ChannelId::new(),
            seq: 1,
            payload: CommandPayload::StepResult {
                task_id: TaskId::new(),
                step_index: 0,
                output: serde_json::json!({"stdout": "ok"}),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"step_result\""));
        assert!(json.contains("\"seq\":1"));
    }
}
