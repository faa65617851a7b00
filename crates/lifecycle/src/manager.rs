use std::sync::Arc;

use chrono::NaiveDate;
use tracing::info;

use checkin_config::{AppConfig, MaterializeMode};

use crate::align::{AlignRequest, AlignSummary, Aligner};
use crate::consistency::{AuditReport, AuditScope, Auditor};
use crate::error::{LifecycleError, Result};
use crate::journal::RepairJournal;
use crate::link::{LinkResolver, LinkResult, SubmitRequest};
use crate::redb_store::RedbStore;
use crate::repair::{RepairSummary, Repairer};
use crate::schedule::{EnrollmentParams, ScheduleGenerator, ScheduleSettings};
use crate::schema::{Collection, SeriesKey, Slot};
use crate::store::{
    DocumentStore, MemoryStore, Precondition, Query, RetryPolicy, WriteOp, with_write_retry,
};

/// Caller-facing surface of the lifecycle: one method per operation, each
/// returning a structured result that enumerates anything skipped or failed.
pub struct CheckInManager {
    store: Arc<dyn DocumentStore>,
    config: AppConfig,
    generator: ScheduleGenerator,
    journal: RepairJournal,
    retry: RetryPolicy,
}

impl CheckInManager {
    pub fn new(store: Arc<dyn DocumentStore>, config: AppConfig) -> Result<Self> {
        let settings = ScheduleSettings::from_config(&config.schedule)?;
        Ok(Self {
            generator: ScheduleGenerator::new(settings),
            journal: RepairJournal::new(&config.repair.journal_path),
            retry: RetryPolicy::from_config(&config.storage),
            store,
            config,
        })
    }

    /// Build the store named by `storage.backend` and wrap it.
    pub fn open(config: AppConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn DocumentStore> = match config.storage.backend.as_str() {
            "redb" => {
                Arc::new(RedbStore::open(&config.storage.path, config.storage.max_batch_ops)?)
            }
            "memory" => Arc::new(MemoryStore::new(config.storage.max_batch_ops)),
            other => anyhow::bail!("unknown storage backend '{other}' (expected redb or memory)"),
        };
        Ok(Self::new(store, config)?)
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn journal(&self) -> &RepairJournal {
        &self.journal
    }

    pub fn generator(&self) -> &ScheduleGenerator {
        &self.generator
    }

    /// Plan a new series and persist it.  Returns slot 1.
    pub async fn create_series(&self, params: &EnrollmentParams, today: NaiveDate) -> Result<Slot> {
        let slots = match self.config.schedule.materialize {
            MaterializeMode::Full => self.generator.generate_series(params, today)?,
            MaterializeMode::Rolling => vec![self.generator.generate_anchor(params, today)?],
        };
        let series = SeriesKey::new(&params.client_id, &params.form_id);

        let existing = self
            .store
            .query(Collection::Slots, &Query::new().filters(series.filters()))
            .await?;
        if !existing.is_empty() {
            return Err(LifecycleError::InvalidInput(format!(
                "series {series} already has {} slots",
                existing.len()
            )));
        }

        // Slot 1 goes last so a series cut short by a failed chunk has no
        // anchor and is reported by the auditor.
        let ops: Vec<WriteOp> = slots
            .iter()
            .skip(1)
            .chain(slots.first())
            .map(|slot| WriteOp::put_slot(slot).expect(Precondition::Absent))
            .collect();
        let limit = self.store.max_batch_ops().max(1);
        let mut written = 0usize;
        for chunk in ops.chunks(limit) {
            let result = with_write_retry(self.retry, "create-series", || {
                self.store.batch_write(chunk.to_vec())
            })
            .await;
            if let Err(err) = result {
                tracing::error!(
                    series = %series,
                    written,
                    error = %err,
                    "series creation stopped part-way"
                );
                return Err(err.into());
            }
            written += chunk.len();
        }

        let anchor = slots
            .into_iter()
            .next()
            .ok_or_else(|| {
                LifecycleError::InvalidInput(format!("series {series} planned no slots"))
            })?;
        info!(
            series = %series,
            slots = written,
            first_due = %anchor.due_at,
            materialize = ?self.config.schedule.materialize,
            "series created"
        );
        Ok(anchor)
    }

    pub async fn submit_response(&self, request: &SubmitRequest) -> Result<LinkResult> {
        LinkResolver::new(
            self.store.as_ref(),
            &self.generator,
            self.config.schedule.materialize,
            self.retry,
        )
        .submit(request)
        .await
    }

    pub async fn audit(&self, scope: &AuditScope) -> Result<AuditReport> {
        Auditor::new(self.store.as_ref()).audit(scope).await
    }

    pub async fn repair(&self, scope: &AuditScope, dry_run: bool) -> Result<RepairSummary> {
        Repairer::new(
            self.store.as_ref(),
            &self.journal,
            self.retry,
            self.config.repair.max_parallel_clients,
        )
        .repair(scope, dry_run)
        .await
    }

    pub async fn align(&self, request: &AlignRequest) -> Result<AlignSummary> {
        let chunk_size = self.config.align_chunk_size(self.store.max_batch_ops());
        Aligner::new(self.store.as_ref(), *self.generator.settings(), chunk_size, self.retry)
            .align(request)
            .await
    }
}
