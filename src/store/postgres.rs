use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    AgentId, Mission, MissionStatus, MissionStep, MissionType, Proposal, ProposalMetadata,
    ProposalStatus, StepKind, StepPayload, StepStatus,
};
use crate::error::{OpsError, Result};

use super::{JobStore, QuotaClaim, SystemStats};

/// PostgreSQL-backed job store
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool (zero-cost reuse)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_proposal(row: &sqlx::postgres::PgRow) -> Result<Proposal> {
        let agent: String = row.get("agent_id");
        let status: String = row.get("status");
        let steps_json: serde_json::Value = row.get("proposed_steps");
        let metadata_json: serde_json::Value = row.get("metadata");

        let proposed_steps: Vec<StepKind> = serde_json::from_value(steps_json)?;
        let metadata: ProposalMetadata = serde_json::from_value(metadata_json)?;

        Ok(Proposal {
            id: row.get("id"),
            agent_id: AgentId::try_from(agent.as_str()).map_err(OpsError::Internal)?,
            title: row.get("title"),
            proposed_steps,
            metadata,
            status: ProposalStatus::try_from(status.as_str()).map_err(OpsError::Internal)?,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_mission(row: &sqlx::postgres::PgRow) -> Result<Mission> {
        let status: String = row.get("status");
        let created_by: String = row.get("created_by");
        let mission_type: String = row.get("mission_type");

        Ok(Mission {
            id: row.get("id"),
            title: row.get("title"),
            status: MissionStatus::try_from(status.as_str()).map_err(OpsError::Internal)?,
            created_by: AgentId::try_from(created_by.as_str()).map_err(OpsError::Internal)?,
            mission_type: MissionType::try_from(mission_type.as_str())
                .map_err(OpsError::Internal)?,
            proposal_id: row.get("proposal_id"),
            priority: row.get("priority"),
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
        })
    }

    fn row_to_step(row: &sqlx::postgres::PgRow) -> Result<MissionStep> {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        let payload_json: serde_json::Value = row.get("payload");

        Ok(MissionStep {
            id: row.get("id"),
            mission_id: row.get("mission_id"),
            kind: StepKind::try_from(kind.as_str()).map_err(OpsError::Internal)?,
            status: StepStatus::try_from(status.as_str()).map_err(OpsError::Internal)?,
            payload: serde_json::from_value(payload_json)?,
            assigned_to: row.get("assigned_to"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            result: row.get("result"),
            error: row.get("error"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    /// Conditional increment in one statement. The `ON CONFLICT ... DO UPDATE
    /// ... WHERE` guard makes losing racers leave the counter untouched, so
    /// two concurrent claimers can never both push it past the limit.
    #[instrument(skip(self))]
    async fn try_claim_quota(
        &self,
        key: &str,
        period: NaiveDate,
        limit: i64,
    ) -> Result<QuotaClaim> {
        if limit <= 0 {
            let current = self.quota_count(key, period).await?;
            return Ok(QuotaClaim {
                admitted: false,
                current,
            });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO ops_quota_counters (key, period, claimed)
            VALUES ($1, $2, 1)
            ON CONFLICT (key, period) DO UPDATE
                SET claimed = ops_quota_counters.claimed + 1,
                    updated_at = NOW()
                WHERE ops_quota_counters.claimed < $3
            RETURNING claimed
            "#,
        )
        .bind(key)
        .bind(period)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(QuotaClaim {
                admitted: true,
                current: row.get("claimed"),
            }),
            None => {
                let current = self.quota_count(key, period).await?;
                debug!(key, %period, current, limit, "quota claim refused");
                Ok(QuotaClaim {
                    admitted: false,
                    current,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn release_quota(&self, key: &str, period: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ops_quota_counters
            SET claimed = GREATEST(claimed - 1, 0), updated_at = NOW()
            WHERE key = $1 AND period = $2
            "#,
        )
        .bind(key)
        .bind(period)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn quota_count(&self, key: &str, period: NaiveDate) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT claimed FROM ops_quota_counters
            WHERE key = $1 AND period = $2
            "#,
        )
        .bind(key)
        .bind(period)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("claimed")).unwrap_or(0))
    }

    #[instrument(skip(self, proposal), fields(proposal_id = %proposal.id))]
    async fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ops_proposals
            (id, agent_id, title, proposed_steps, metadata, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(proposal.id)
        .bind(proposal.agent_id.as_str())
        .bind(&proposal.title)
        .bind(serde_json::to_value(&proposal.proposed_steps)?)
        .bind(serde_json::to_value(&proposal.metadata)?)
        .bind(proposal.status.as_str())
        .bind(proposal.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>> {
        let row = sqlx::query(
            r#"
            SELECT id, agent_id, title, proposed_steps, metadata, status, created_at
            FROM ops_proposals WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_proposal(&r)).transpose()
    }

    async fn update_proposal_status(
        &self,
        id: Uuid,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ops_proposals SET status = $3
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_proposals(&self, limit: i64) -> Result<Vec<Proposal>> {
        let rows = sqlx::query(
            r#"
            SELECT id, agent_id, title, proposed_steps, metadata, status, created_at
            FROM ops_proposals
            WHERE status = 'pending'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_proposal).collect()
    }

    #[instrument(skip(self, mission, steps), fields(mission_id = %mission.id, steps = steps.len()))]
    async fn insert_mission_with_steps(
        &self,
        mission: &Mission,
        steps: &[MissionStep],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ops_missions
            (id, title, status, created_by, mission_type, proposal_id, priority, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(mission.id)
        .bind(&mission.title)
        .bind(mission.status.as_str())
        .bind(mission.created_by.as_str())
        .bind(mission.mission_type.as_str())
        .bind(mission.proposal_id)
        .bind(mission.priority)
        .bind(mission.created_at)
        .execute(&mut *tx)
        .await?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO ops_mission_steps
                (id, mission_id, kind, status, payload, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(step.id)
            .bind(step.mission_id)
            .bind(step.kind.as_str())
            .bind(step.status.as_str())
            .bind(serde_json::to_value(&step.payload)?)
            .bind(step.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Inserted mission with {} steps", steps.len());
        Ok(())
    }

    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, status, created_by, mission_type, proposal_id,
                   priority, created_at, completed_at
            FROM ops_missions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_mission(&r)).transpose()
    }

    async fn update_mission_status(
        &self,
        id: Uuid,
        from: MissionStatus,
        to: MissionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ops_missions
            SET status = $3,
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mission_steps(&self, mission_id: Uuid) -> Result<Vec<MissionStep>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mission_id, kind, status, payload, assigned_to,
                   started_at, completed_at, result, error, created_at
            FROM ops_mission_steps
            WHERE mission_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(mission_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_step).collect()
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<MissionStep>> {
        let row = sqlx::query(
            r#"
            SELECT id, mission_id, kind, status, payload, assigned_to,
                   started_at, completed_at, result, error, created_at
            FROM ops_mission_steps WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_step(&r)).transpose()
    }

    async fn fetch_queued_steps(&self, kind: StepKind, limit: i64) -> Result<Vec<MissionStep>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mission_id, kind, status, payload, assigned_to,
                   started_at, completed_at, result, error, created_at
            FROM ops_mission_steps
            WHERE status = 'queued' AND kind = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_step).collect()
    }

    /// Compare-and-swap claim: success is decided by the affected row count,
    /// never by a preceding read.
    #[instrument(skip(self))]
    async fn claim_step(&self, step_id: Uuid, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ops_mission_steps
            SET status = 'running', assigned_to = $2, started_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(step_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_step(&self, step_id: Uuid, result: serde_json::Value) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE ops_mission_steps
            SET status = 'succeeded', result = $2, completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(step_id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn fail_step(&self, step_id: Uuid, error: &str) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE ops_mission_steps
            SET status = 'failed', error = $2, completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(step_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn pending_step_count(&self, mission_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS pending FROM ops_mission_steps
            WHERE mission_id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(mission_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("pending"))
    }

    async fn failed_step_count(&self, mission_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS failed FROM ops_mission_steps
            WHERE mission_id = $1 AND status = 'failed'
            "#,
        )
        .bind(mission_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("failed"))
    }

    async fn find_stale_steps(
        &self,
        older_than: DateTime<Utc>,
        kind: Option<StepKind>,
    ) -> Result<Vec<MissionStep>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mission_id, kind, status, payload, assigned_to,
                   started_at, completed_at, result, error, created_at
            FROM ops_mission_steps
            WHERE status = 'running'
              AND started_at < $1
              AND ($2::text IS NULL OR kind = $2)
            ORDER BY started_at ASC
            "#,
        )
        .bind(older_than)
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_step).collect()
    }

    async fn open_position_count(&self) -> Result<i64> {
        let row = sqlx::query(
            r#"SELECT COUNT(*) AS open FROM ops_positions WHERE status = 'open'"#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("open"))
    }

    async fn open_notional_exposure(&self) -> Result<Decimal> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(notional_usd), 0) AS exposure
            FROM ops_positions WHERE status = 'open'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("exposure"))
    }

    async fn has_open_position(&self, symbol: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM ops_positions
            WHERE symbol = $1 AND status = 'open'
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn upsert_open_position(&self, symbol: &str, notional_usd: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ops_positions (symbol, notional_usd, status, opened_at)
            VALUES ($1, $2, 'open', NOW())
            ON CONFLICT (symbol) DO UPDATE SET
                notional_usd = EXCLUDED.notional_usd,
                status = 'open',
                updated_at = NOW()
            "#,
        )
        .bind(symbol)
        .bind(notional_usd)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_position(&self, symbol: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ops_positions
            SET status = 'closed', updated_at = NOW()
            WHERE symbol = $1 AND status = 'open'
            "#,
        )
        .bind(symbol)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_terminal_steps_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM ops_mission_steps
            WHERE status IN ('succeeded', 'failed', 'cancelled')
              AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!("Purged {} terminal steps older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    async fn system_stats(&self) -> Result<SystemStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM ops_proposals WHERE status = 'pending'
                    AND created_at > NOW() - INTERVAL '24 hours') AS proposals_pending,
                (SELECT COUNT(*) FROM ops_proposals WHERE status = 'accepted'
                    AND created_at > NOW() - INTERVAL '24 hours') AS proposals_accepted,
                (SELECT COUNT(*) FROM ops_proposals WHERE status = 'rejected'
                    AND created_at > NOW() - INTERVAL '24 hours') AS proposals_rejected,
                (SELECT COUNT(*) FROM ops_missions WHERE status = 'running') AS missions_running,
                (SELECT COUNT(*) FROM ops_missions WHERE status = 'succeeded'
                    AND created_at > NOW() - INTERVAL '24 hours') AS missions_succeeded,
                (SELECT COUNT(*) FROM ops_missions WHERE status = 'failed'
                    AND created_at > NOW() - INTERVAL '24 hours') AS missions_failed,
                (SELECT COUNT(*) FROM ops_mission_steps WHERE status = 'queued') AS steps_queued,
                (SELECT COUNT(*) FROM ops_mission_steps WHERE status = 'running') AS steps_running,
                (SELECT COUNT(*) FROM ops_positions WHERE status = 'open') AS open_positions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SystemStats {
            proposals_pending: row.get("proposals_pending"),
            proposals_accepted: row.get("proposals_accepted"),
            proposals_rejected: row.get("proposals_rejected"),
            missions_running: row.get("missions_running"),
            missions_succeeded: row.get("missions_succeeded"),
            missions_failed: row.get("missions_failed"),
            steps_queued: row.get("steps_queued"),
            steps_running: row.get("steps_running"),
            open_positions: row.get("open_positions"),
        })
    }
}
