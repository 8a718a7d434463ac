use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{Checkpoint, CheckpointReason, ExecutionInstance, InstanceStatus};
use crate::workflow::catalog::ResolutionContext;
use crate::workflow::schema::WorkflowDefinition;

/// Durable, keyed record of execution instances.
///
/// Every write runs in a single SQLite transaction, so a save either lands
/// completely (instance row plus optional checkpoint) or leaves the prior
/// durable state untouched. Writers racing on the same instance are
/// serialized by an optimistic `version` check.
#[derive(Clone)]
pub struct InstanceStore {
    db: Database,
}

impl InstanceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new active instance positioned at the workflow's entry step,
    /// together with its initial `start` checkpoint.
    pub async fn create(
        &self,
        workflow: &WorkflowDefinition,
        source: Option<&str>,
        instance_id: Option<String>,
        context: &ResolutionContext,
    ) -> Result<ExecutionInstance, EngineError> {
        let entry = workflow.entry_step_id().ok_or_else(|| {
            EngineError::Definition(vec![format!("workflow '{}' has no entry step", workflow.id)])
        })?;
        let instance_id = instance_id.unwrap_or_else(|| generate_instance_id(&workflow.id));
        let mut instance = ExecutionInstance::new(
            instance_id,
            workflow.id.clone(),
            source.map(str::to_string),
            entry.to_string(),
        );
        instance.context = context.clone();
        instance.version = 1;

        let mut checkpoint = Checkpoint::capture(&instance, None, CheckpointReason::Start);
        instance.last_checkpoint_id = Some(checkpoint.checkpoint_id.clone());
        instance.last_checkpoint_at = Some(checkpoint.created_at);
        checkpoint.snapshot = instance.clone();

        let inst = instance.clone();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT status FROM instances WHERE instance_id = ?1",
                        rusqlite::params![inst.instance_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(status) = existing {
                    let status = InstanceStatus::from_str(&status);
                    return Err(EngineError::Conflict(if status.is_terminal() {
                        format!(
                            "instance '{}' already exists (archived as {})",
                            inst.instance_id,
                            status.as_str()
                        )
                    } else {
                        format!(
                            "an instance with id '{}' is already {}",
                            inst.instance_id,
                            status.as_str()
                        )
                    }));
                }

                tx.execute(
                    "INSERT INTO instances (instance_id, workflow_id, status, current_step_id, \
                     state, version, started_at, updated_at, archived_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                    rusqlite::params![
                        inst.instance_id,
                        inst.workflow_id,
                        inst.status.as_str(),
                        inst.current_step_id,
                        encode(&inst)?,
                        inst.version,
                        inst.started_at.timestamp_millis(),
                        inst.started_at.timestamp_millis(),
                    ],
                )?;
                insert_checkpoint(&tx, &checkpoint)?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        tracing::info!(
            instance_id = %instance.instance_id,
            workflow_id = %instance.workflow_id,
            "[InstanceStore] Created instance"
        );
        Ok(instance)
    }

    pub async fn load(&self, instance_id: &str) -> Result<ExecutionInstance, EngineError> {
        self.get(instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("instance '{}'", instance_id)))
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<ExecutionInstance>, EngineError> {
        let id = instance_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT state, version FROM instances WHERE instance_id = ?1",
                        rusqlite::params![id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                row.map(|(state, version)| decode(&state, version)).transpose()
            })
            .await
    }

    /// Persist the working copy. Bumps `instance.version` on success.
    pub async fn save(&self, instance: &mut ExecutionInstance) -> Result<(), EngineError> {
        self.write(instance, None).await
    }

    /// Persist the working copy and record a checkpoint of it in the same
    /// transaction.
    pub async fn save_with_checkpoint(
        &self,
        instance: &mut ExecutionInstance,
        step_id: Option<&str>,
        reason: CheckpointReason,
    ) -> Result<Checkpoint, EngineError> {
        let mut next = instance.clone();
        let checkpoint_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        next.last_checkpoint_id = Some(checkpoint_id.clone());
        next.last_checkpoint_at = Some(now);
        next.version = instance.version + 1;

        let checkpoint = Checkpoint {
            checkpoint_id,
            instance_id: next.instance_id.clone(),
            step_id: step_id.map(str::to_string),
            reason,
            created_at: now,
            snapshot: next.clone(),
        };

        let mut working = next;
        working.version = instance.version;
        self.write(&mut working, Some(checkpoint.clone())).await?;
        *instance = working;

        tracing::debug!(
            instance_id = %instance.instance_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            reason = checkpoint.reason.as_str(),
            "[InstanceStore] Checkpointed instance"
        );
        Ok(checkpoint)
    }

    pub async fn list(
        &self,
        workflow_id: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<ExecutionInstance>, EngineError> {
        let workflow_id = workflow_id.map(str::to_string);
        let status = status.map(|s| s.as_str().to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT state, version FROM instances \
                     WHERE (?1 IS NULL OR workflow_id = ?1) AND (?2 IS NULL OR status = ?2) \
                     ORDER BY started_at DESC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![workflow_id, status], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.iter()
                    .map(|(state, version)| decode(state, *version))
                    .collect()
            })
            .await
    }

    async fn write(
        &self,
        instance: &mut ExecutionInstance,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(), EngineError> {
        let expected = instance.version;
        let mut next = instance.clone();
        next.version = expected + 1;

        let inst = next.clone();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let updated = tx.execute(
                    "UPDATE instances SET status = ?2, current_step_id = ?3, state = ?4, \
                     version = ?5, updated_at = ?6, archived_at = ?7 \
                     WHERE instance_id = ?1 AND version = ?8",
                    rusqlite::params![
                        inst.instance_id,
                        inst.status.as_str(),
                        inst.current_step_id,
                        encode(&inst)?,
                        inst.version,
                        Utc::now().timestamp_millis(),
                        inst.archived_at.map(|t| t.timestamp_millis()),
                        expected,
                    ],
                )?;
                if updated == 0 {
                    let stored: Option<i64> = tx
                        .query_row(
                            "SELECT version FROM instances WHERE instance_id = ?1",
                            rusqlite::params![inst.instance_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    return Err(match stored {
                        None => EngineError::NotFound(format!("instance '{}'", inst.instance_id)),
                        Some(v) => EngineError::Conflict(format!(
                            "instance '{}' was modified concurrently (expected version {}, found {})",
                            inst.instance_id, expected, v
                        )),
                    });
                }
                if let Some(ref cp) = checkpoint {
                    insert_checkpoint(&tx, cp)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        *instance = next;
        Ok(())
    }
}

fn insert_checkpoint(conn: &Connection, cp: &Checkpoint) -> Result<(), EngineError> {
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE instance_id = ?1",
        rusqlite::params![cp.instance_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO checkpoints (checkpoint_id, instance_id, step_id, reason, snapshot, seq, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            cp.checkpoint_id,
            cp.instance_id,
            cp.step_id,
            cp.reason.as_str(),
            encode(&cp.snapshot)?,
            seq,
            cp.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn encode(instance: &ExecutionInstance) -> Result<String, EngineError> {
    serde_json::to_string(instance)
        .map_err(|e| EngineError::Persistence(format!("Failed to encode instance: {}", e)))
}

fn decode(state: &str, version: i64) -> Result<ExecutionInstance, EngineError> {
    let mut instance: ExecutionInstance = serde_json::from_str(state)
        .map_err(|e| EngineError::Persistence(format!("Corrupt instance record: {}", e)))?;
    instance.version = version;
    Ok(instance)
}

/// `<workflowId>-<UTC timestamp with millis>`.
pub fn generate_instance_id(workflow_id: &str) -> String {
    format!("{}-{}", workflow_id, Utc::now().format("%Y%m%dT%H%M%S%3fZ"))
}
