use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use convoy_core::ids::{InstanceId, SessionId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Idle,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub user_id: UserId,
    pub instance_id: Option<InstanceId>,
    pub state: SessionState,
    pub ended_reason: Option<String>,
    pub created_at: String,
    pub last_activity_at: String,
    pub updated_at: String,
}

const SELECT_COLUMNS: &str =
    "id, user_id, instance_id, state, ended_reason, created_at, last_activity_at, updated_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new pending session.
    #[instrument(skip(self), fields(session_id = %id, user_id = %user_id))]
    pub fn create(&self, id: &SessionId, user_id: &UserId) -> Result<SessionRow, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, state, created_at, last_activity_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?3, ?3)",
                rusqlite::params![id.as_str(), user_id.as_str(), now],
            )?;

            Ok(SessionRow {
                id: id.clone(),
                user_id: user_id.clone(),
                instance_id: None,
                state: SessionState::Pending,
                ended_reason: None,
                created_at: now.clone(),
                last_activity_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Write state, binding, and end reason in one statement.
    #[instrument(skip(self), fields(session_id = %id, state = %state))]
    pub fn update_binding(
        &self,
        id: &SessionId,
        state: SessionState,
        instance_id: Option<&InstanceId>,
        ended_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET state = ?1, instance_id = ?2, ended_reason = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    state.to_string(),
                    instance_id.map(|i| i.as_str()),
                    ended_reason,
                    now,
                    id.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Reset the activity clock (task submission or explicit touch).
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET last_activity_at = ?1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Sessions worth reconciling on restart (not terminated).
    #[instrument(skip(self))]
    pub fn live(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM sessions
                 WHERE state != 'terminated'
                 ORDER BY created_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// List sessions for one user, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM sessions
                 WHERE user_id = ?1 ORDER BY created_at DESC"
            ))?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let state_str: String = row_helpers::get(row, 3, "sessions", "state")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "user_id")?),
        instance_id: row_helpers::get_opt::<String>(row, 2, "sessions", "instance_id")?
            .map(InstanceId::from_raw),
        state: row_helpers::parse_enum(&state_str, "sessions", "state")?,
        ended_reason: row_helpers::get_opt(row, 4, "sessions", "ended_reason")?,
        created_at: row_helpers::get(row, 5, "sessions", "created_at")?,
        last_activity_at: row_helpers::get(row, 6, "sessions", "last_activity_at")?,
        updated_at: row_helpers::get(row, 7, "sessions", "updated_at")?,
    })
}
