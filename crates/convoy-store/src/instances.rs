use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use convoy_core::ids::{InstanceId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Lifecycle state of a worker instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Warming,
    Ready,
    Leased,
    Draining,
    Failed,
    Terminated,
}

impl InstanceState {
    /// Whether the lifecycle permits moving to `next`. `Failed` is reachable
    /// from any non-terminal state; `Terminated` only via `Draining` or
    /// `Failed`.
    pub fn can_transition(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Provisioning, Warming) => true,
            (Warming, Ready) => true,
            (Ready, Leased) => true,
            (Leased, Draining) => true,
            (Draining, Ready) => true,
            (Draining, Terminated) => true,
            (Failed, Terminated) => true,
            (from, Failed) => from != Failed && from != Terminated,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == InstanceState::Terminated
    }

    /// States worth reconciling after an orchestrator restart.
    pub fn is_live(self) -> bool {
        !matches!(self, InstanceState::Failed | InstanceState::Terminated)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Warming => "warming",
            Self::Ready => "ready",
            Self::Leased => "leased",
            Self::Draining => "draining",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "warming" => Ok(Self::Warming),
            "ready" => Ok(Self::Ready),
            "leased" => Ok(Self::Leased),
            "draining" => Ok(Self::Draining),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown instance state: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceRow {
    pub id: InstanceId,
    pub state: InstanceState,
    pub provider_handle: String,
    pub leased_session_id: Option<SessionId>,
    pub warm_pool: bool,
    pub cpu_count: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub created_at: String,
    pub last_health_check_at: Option<String>,
    pub updated_at: String,
}

const SELECT_COLUMNS: &str =
    "id, state, provider_handle, leased_session_id, warm_pool, cpu_count, memory_mb, disk_gb,
     created_at, last_health_check_at, updated_at";

pub struct InstanceRepo {
    db: Database,
}

impl InstanceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a freshly admitted instance in `provisioning` state.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn create(
        &self,
        id: &InstanceId,
        cpu_count: u32,
        memory_mb: u32,
        disk_gb: u32,
    ) -> Result<InstanceRow, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instances (id, state, cpu_count, memory_mb, disk_gb, created_at, updated_at)
                 VALUES (?1, 'provisioning', ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id.as_str(), cpu_count, memory_mb, disk_gb, now, now],
            )?;

            Ok(InstanceRow {
                id: id.clone(),
                state: InstanceState::Provisioning,
                provider_handle: String::new(),
                leased_session_id: None,
                warm_pool: false,
                cpu_count,
                memory_mb,
                disk_gb,
                created_at: now.clone(),
                last_health_check_at: None,
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn get(&self, id: &InstanceId) -> Result<InstanceRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM instances WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_instance(row),
                None => Err(StoreError::NotFound(format!("instance {id}"))),
            }
        })
    }

    /// Record the provider-side handle once provisioning reports it.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn set_handle(&self, id: &InstanceId, handle: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE instances SET provider_handle = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![handle, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Write state, lease, and pool membership in one statement so a
    /// persisted row never shows a half-applied transition.
    #[instrument(skip(self), fields(instance_id = %id, state = %state))]
    pub fn update_placement(
        &self,
        id: &InstanceId,
        state: InstanceState,
        lease: Option<&SessionId>,
        warm_pool: bool,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE instances SET state = ?1, leased_session_id = ?2, warm_pool = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    state.to_string(),
                    lease.map(|s| s.as_str()),
                    warm_pool as i64,
                    now,
                    id.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn touch_health_check(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE instances SET last_health_check_at = ?1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Instances worth reconciling on restart (not failed, not terminated).
    #[instrument(skip(self))]
    pub fn live(&self) -> Result<Vec<InstanceRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM instances
                 WHERE state NOT IN ('failed', 'terminated')
                 ORDER BY created_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_instance(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> Result<InstanceRow, StoreError> {
    let state_str: String = row_helpers::get(row, 1, "instances", "state")?;

    Ok(InstanceRow {
        id: InstanceId::from_raw(row_helpers::get::<String>(row, 0, "instances", "id")?),
        state: row_helpers::parse_enum(&state_str, "instances", "state")?,
        provider_handle: row_helpers::get(row, 2, "instances", "provider_handle")?,
        leased_session_id: row_helpers::get_opt::<String>(row, 3, "instances", "leased_session_id")?
            .map(SessionId::from_raw),
        warm_pool: row_helpers::get::<i64>(row, 4, "instances", "warm_pool")? != 0,
        cpu_count: row_helpers::get::<u32>(row, 5, "instances", "cpu_count")?,
        memory_mb: row_helpers::get::<u32>(row, 6, "instances", "memory_mb")?,
        disk_gb: row_helpers::get::<u32>(row, 7, "instances", "disk_gb")?,
        created_at: row_helpers::get(row, 8, "instances", "created_at")?,
        last_health_check_at: row_helpers::get_opt(row, 9, "instances", "last_health_check_at")?,
        updated_at: row_helpers::get(row, 10, "instances", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> InstanceRepo {
        InstanceRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_instance_row() {
        let repo = setup();
        let id = InstanceId::new();
        let row = repo.create(&id, 2, 4096, 20).unwrap();
        assert_eq!(row.state, InstanceState::Provisioning);
        assert_eq!(row.cpu_count, 2);
        assert!(row.leased_session_id.is_none());
        assert!(!row.warm_pool);
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = setup();
        let result = repo.get(&InstanceId::from_raw("vm_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn placement_roundtrip() {
        let repo = setup();
        let id = InstanceId::new();
        repo.create(&id, 2, 4096, 20).unwrap();

        let session = SessionId::new();
        repo.update_placement(&id, InstanceState::Leased, Some(&session), false).unwrap();

        let row = repo.get(&id).unwrap();
        assert_eq!(row.state, InstanceState::Leased);
        assert_eq!(row.leased_session_id.as_ref(), Some(&session));
        assert!(!row.warm_pool);

        repo.update_placement(&id, InstanceState::Ready, None, true).unwrap();
        let row = repo.get(&id).unwrap();
        assert_eq!(row.state, InstanceState::Ready);
        assert!(row.leased_session_id.is_none());
        assert!(row.warm_pool);
    }

    #[test]
    fn set_handle_persists() {
        let repo = setup();
        let id = InstanceId::new();
        repo.create(&id, 2, 4096, 20).unwrap();
        repo.set_handle(&id, "prov-abc123").unwrap();
        assert_eq!(repo.get(&id).unwrap().provider_handle, "prov-abc123");
    }

    #[test]
    fn touch_health_check_sets_timestamp() {
        let repo = setup();
        let id = InstanceId::new();
        repo.create(&id, 2, 4096, 20).unwrap();
        assert!(repo.get(&id).unwrap().last_health_check_at.is_none());
        repo.touch_health_check(&id).unwrap();
        assert!(repo.get(&id).unwrap().last_health_check_at.is_some());
    }

    #[test]
    fn live_excludes_terminal_rows() {
        let repo = setup();
        let a = InstanceId::new();
        let b = InstanceId::new();
        let c = InstanceId::new();
        repo.create(&a, 2, 4096, 20).unwrap();
        repo.create(&b, 2, 4096, 20).unwrap();
        repo.create(&c, 2, 4096, 20).unwrap();

        repo.update_placement(&b, InstanceState::Failed, None, false).unwrap();
        repo.update_placement(&c, InstanceState::Terminated, None, false).unwrap();

        let live = repo.live().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, a);
    }

    #[test]
    fn transition_rules() {
        use InstanceState::*;
        assert!(Provisioning.can_transition(Warming));
        assert!(Warming.can_transition(Ready));
        assert!(Ready.can_transition(Leased));
        assert!(Leased.can_transition(Draining));
        assert!(Draining.can_transition(Ready));
        assert!(Draining.can_transition(Terminated));
        assert!(Failed.can_transition(Terminated));

        // Failed is reachable from any non-terminal state
        assert!(Provisioning.can_transition(Failed));
        assert!(Leased.can_transition(Failed));
        assert!(Draining.can_transition(Failed));
        assert!(!Failed.can_transition(Failed));
        assert!(!Terminated.can_transition(Failed));

        // No shortcuts
        assert!(!Ready.can_transition(Draining));
        assert!(!Provisioning.can_transition(Ready));
        assert!(!Leased.can_transition(Ready));
        assert!(!Terminated.can_transition(Provisioning));
    }

    #[test]
    fn invalid_state_string_returns_corrupt_row() {
        let db = Database::in_memory().unwrap();
        let id = InstanceId::new();
        let now = chrono::Utc::now().to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instances (id, state, cpu_count, memory_mb, disk_gb, created_at, updated_at)
                 VALUES (?1, 'NOT_A_STATE', 2, 4096, 20, ?2, ?2)",
                rusqlite::params![id.as_str(), now],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = InstanceRepo::new(db);
        assert!(matches!(repo.get(&id), Err(StoreError::CorruptRow { .. })));
    }
}
