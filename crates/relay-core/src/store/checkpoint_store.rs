use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{Checkpoint, CheckpointReason, ExecutionInstance};

/// Read side of the checkpoint table. Checkpoints are written by
/// [`InstanceStore`](super::InstanceStore) in the same transaction as the
/// instance they snapshot, and are never mutated afterwards.
#[derive(Clone)]
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The most recent checkpoint of an instance.
    pub async fn latest(&self, instance_id: &str) -> Result<Option<Checkpoint>, EngineError> {
        let id = instance_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT checkpoint_id, instance_id, step_id, reason, snapshot, created_at \
                         FROM checkpoints WHERE instance_id = ?1 ORDER BY seq DESC LIMIT 1",
                        rusqlite::params![id],
                        read_row,
                    )
                    .optional()?;
                row.map(into_checkpoint).transpose()
            })
            .await
    }

    pub async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, EngineError> {
        let id = checkpoint_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT checkpoint_id, instance_id, step_id, reason, snapshot, created_at \
                         FROM checkpoints WHERE checkpoint_id = ?1",
                        rusqlite::params![id],
                        read_row,
                    )
                    .optional()?;
                row.map(into_checkpoint).transpose()
            })
            .await
    }

    /// All checkpoints of an instance, oldest first.
    pub async fn list(&self, instance_id: &str) -> Result<Vec<Checkpoint>, EngineError> {
        let id = instance_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT checkpoint_id, instance_id, step_id, reason, snapshot, created_at \
                     FROM checkpoints WHERE instance_id = ?1 ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(into_checkpoint).collect()
            })
            .await
    }
}

type CheckpointRow = (String, String, Option<String>, String, String, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_checkpoint(row: CheckpointRow) -> Result<Checkpoint, EngineError> {
    let (checkpoint_id, instance_id, step_id, reason, snapshot, created_ms) = row;
    let snapshot: ExecutionInstance = serde_json::from_str(&snapshot)
        .map_err(|e| EngineError::Persistence(format!("Corrupt checkpoint: {}", e)))?;
    Ok(Checkpoint {
        checkpoint_id,
        instance_id,
        step_id,
        reason: CheckpointReason::from_str(&reason),
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        snapshot,
    })
}
