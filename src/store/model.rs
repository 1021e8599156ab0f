//! Store row types — the bit-stable schema described in spec §6.

use serde::{Deserialize, Serialize};

/// Generate a new ULID string, used for every primary key minted by the
/// store (events, dependency edges, file reservations).
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub policy_label: String,
    pub priority: i64,
    pub state: String,
    pub attempts: i64,
    pub files: String,   // JSON array of path strings
    pub payload: String, // opaque JSON blob
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRow {
    pub fn files_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.files).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    Hard,
    Soft,
}

impl DependencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyKind::Hard => "hard",
            DependencyKind::Soft => "soft",
        }
    }
}

impl std::str::FromStr for DependencyKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard" => Ok(DependencyKind::Hard),
            "soft" => Ok(DependencyKind::Soft),
            other => Err(anyhow::anyhow!("unknown dependency_type {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DependencyRow {
    pub id: String,
    pub task_id: String,
    pub depends_on_task_id: String,
    pub dependency_type: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaseRow {
    pub task_id: String,
    pub agent_id: String,
    pub lease_expires_at: i64,
    pub attempt: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileReservationRow {
    pub id: String,
    pub file_path: String,
    pub agent_id: String,
    pub lease_expires_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: String,
    pub lease_reason: Option<String>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HeartbeatRow {
    pub agent_id: String,
    pub last_seen: i64,
    pub status: String,
    pub context_usage_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub task_id: String,
    pub ts: i64,
    pub kind: String,
    pub data_json: String,
}
