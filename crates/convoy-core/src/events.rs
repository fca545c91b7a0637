use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, SessionId, TaskId};

/// Update-stream events for a task, in delivery order. A subscriber sees a
/// finite sequence ending at exactly one terminal event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Dispatched {
        session_id: SessionId,
        task_id: TaskId,
        task_seq: u64,
    },

    Started {
        session_id: SessionId,
        task_id: TaskId,
    },

    StepResult {
        session_id: SessionId,
        task_id: TaskId,
        step_index: u32,
        output: serde_json::Value,
    },

    Progress {
        session_id: SessionId,
        task_id: TaskId,
        detail: String,
    },

    Completed {
        session_id: SessionId,
        task_id: TaskId,
    },

    Failed {
        session_id: SessionId,
        task_id: TaskId,
        reason: String,
    },

    Cancelled {
        session_id: SessionId,
        task_id: TaskId,
    },
}

impl TaskEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Dispatched { session_id, .. }
            | Self::Started { session_id, .. }
            | Self::StepResult { session_id, .. }
            | Self::Progress { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Failed { session_id, .. }
            | Self::Cancelled { session_id, .. } => session_id,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Dispatched { task_id, .. }
            | Self::Started { task_id, .. }
            | Self::StepResult { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Cancelled { task_id, .. } => task_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Dispatched { .. } => "dispatched",
            Self::Started { .. } => "started",
            Self::StepResult { .. } => "step_result",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. })
    }
}

/// Instance lifecycle events broadcast by the registry. The session manager
/// listens for `InstanceFailed` to force-unbind the held session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    InstanceReady {
        instance_id: InstanceId,
    },

    InstanceDraining {
        instance_id: InstanceId,
    },

    InstanceFailed {
        instance_id: InstanceId,
        session_id: Option<SessionId>,
        reason: String,
    },

    InstanceTerminated {
        instance_id: InstanceId,
    },
}

impl FleetEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::InstanceReady { instance_id }
            | Self::InstanceDraining { instance_id }
            | Self::InstanceFailed { instance_id, .. }
            | Self::InstanceTerminated { instance_id } => instance_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InstanceReady { .. } => "instance_ready",
            Self::InstanceDraining { .. } => "instance_draining",
            Self::InstanceFailed { .. } => "instance_failed",
            Self::InstanceTerminated { .. } => "instance_terminated",
        }
    }
}

/// Session lifecycle events. The task router listens for `Terminated` to
/// fail the session's in-progress task so subscriber streams never hang.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Activated {
        session_id: SessionId,
        instance_id: InstanceId,
    },

    Idled {
        session_id: SessionId,
    },

    Terminated {
        session_id: SessionId,
        reason: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Activated { session_id, .. }
            | Self::Idled { session_id }
            | Self::Terminated { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Activated { .. } => "activated",
            Self::Idled { .. } => "idled",
            Self::Terminated { .. } => "terminated",
        }
    }
}
