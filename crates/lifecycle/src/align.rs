//! Schedule Aligner: shift a client's series so slot 1 lands on a reference
//! due date.
//!
//! Completed history is never moved (slot 1 excepted, since it defines the
//! base schedule).  Writes go out in chunks sized to the store's batch
//! limit.  Slot 1 rides in the last chunk and is held back if any earlier
//! chunk failed, so re-running the same alignment resumes it: the offset is
//! still measured from the unmoved anchor, and slots already stamped with the
//! alignment's `lastAlignment` marker are skipped.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{LifecycleError, Result};
use crate::schedule::ScheduleSettings;
use crate::schema::{Collection, SeriesKey, Slot, fields};
use crate::store::{
    DocumentStore, Precondition, Query, RetryPolicy, WriteOp, load_slots, with_write_retry,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum AlignReference {
    /// Match another client's slot 1 on the same form.
    Client(String),
    /// Match a calendar date at the configured due time.
    Date(NaiveDate),
}

#[derive(Debug, Clone)]
pub struct AlignRequest {
    pub client_id: String,
    /// Restrict to one form; all of the client's series otherwise.
    pub form_id: Option<String>,
    pub reference: AlignReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Completed slot after the anchor; history is never rewritten.
    CompletedHistory,
    /// Already moved by an earlier run of this same alignment.
    AlreadyAligned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftedSlot {
    pub slot_id: String,
    pub sequence_number: u32,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedSlot {
    pub slot_id: String,
    pub sequence_number: u32,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFailure {
    pub chunk: usize,
    pub slot_ids: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesAlignment {
    pub series: SeriesKey,
    pub offset_days: i64,
    pub reference_due_at: Option<DateTime<Utc>>,
    pub already_aligned: bool,
    pub anchor_committed: bool,
    pub shifted: Vec<ShiftedSlot>,
    pub skipped: Vec<SkippedSlot>,
    pub chunk_failures: Vec<ChunkFailure>,
    /// Why the series could not be aligned at all.
    pub error: Option<String>,
}

impl SeriesAlignment {
    fn empty(series: SeriesKey) -> Self {
        Self {
            series,
            offset_days: 0,
            reference_due_at: None,
            already_aligned: false,
            anchor_committed: false,
            shifted: Vec::new(),
            skipped: Vec::new(),
            chunk_failures: Vec::new(),
            error: None,
        }
    }

    fn failed(series: SeriesKey, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::empty(series)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.chunk_failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignSummary {
    pub client_id: String,
    pub reference: AlignReference,
    pub series: Vec<SeriesAlignment>,
}

impl AlignSummary {
    pub fn is_complete(&self) -> bool {
        self.series.iter().all(SeriesAlignment::is_complete)
    }
}

/// One slot's planned move.
struct Move {
    slot: Slot,
    from: DateTime<Utc>,
    op: WriteOp,
}

pub struct Aligner<'a> {
    store: &'a dyn DocumentStore,
    settings: ScheduleSettings,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl<'a> Aligner<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        settings: ScheduleSettings,
        chunk_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            settings,
            chunk_size: chunk_size.clamp(1, store.max_batch_ops().max(1)),
            retry,
        }
    }

    pub async fn align(&self, request: &AlignRequest) -> Result<AlignSummary> {
        if request.client_id.trim().is_empty() {
            return Err(LifecycleError::InvalidInput("clientId is required".to_string()));
        }
        let mut query = Query::new().filter(fields::CLIENT_ID, request.client_id.as_str());
        if let Some(form_id) = &request.form_id {
            query = query.filter(fields::FORM_ID, form_id.as_str());
        }
        let slots = load_slots(self.store, query).await?;
        if slots.is_empty() {
            return Err(LifecycleError::SlotNotFound(format!(
                "client {} has no slots{}",
                request.client_id,
                request
                    .form_id
                    .as_deref()
                    .map(|f| format!(" on form {f}"))
                    .unwrap_or_default()
            )));
        }

        let mut by_series: BTreeMap<SeriesKey, Vec<Slot>> = BTreeMap::new();
        for slot in slots {
            by_series.entry(slot.series_key()).or_default().push(slot);
        }

        let mut series = Vec::with_capacity(by_series.len());
        for (key, slots) in by_series {
            let outcome = match self.reference_due(&key, &request.reference).await {
                Ok(reference) => self.align_series(key, slots, reference).await,
                Err(err) => {
                    warn!(series = %key, error = %err, "no reference due date for series");
                    SeriesAlignment::failed(key, err.to_string())
                }
            };
            series.push(outcome);
        }

        Ok(AlignSummary {
            client_id: request.client_id.clone(),
            reference: request.reference.clone(),
            series,
        })
    }

    async fn reference_due(
        &self,
        series: &SeriesKey,
        reference: &AlignReference,
    ) -> Result<DateTime<Utc>> {
        match reference {
            AlignReference::Date(date) => {
                self.settings.combine(*date, self.settings.default_due_time)
            }
            AlignReference::Client(client_id) => {
                let reference_series = SeriesKey::new(client_id, &series.form_id);
                let query = Query::new()
                    .filters(reference_series.filters())
                    .filter(fields::SEQUENCE_NUMBER, 1);
                let anchors = self.store.query(Collection::Slots, &query).await?;
                match anchors.as_slice() {
                    [] => Err(LifecycleError::SlotNotFound(format!(
                        "slot 1 of {reference_series}"
                    ))),
                    [doc] => Ok(Slot::from_document(doc)?.due_at),
                    many => Err(LifecycleError::AmbiguousMatch {
                        target: format!("slot 1 of {reference_series}"),
                        count: many.len(),
                    }),
                }
            }
        }
    }

    async fn align_series(
        &self,
        series: SeriesKey,
        slots: Vec<Slot>,
        reference: DateTime<Utc>,
    ) -> SeriesAlignment {
        let anchors: Vec<&Slot> = slots.iter().filter(|s| s.is_anchor()).collect();
        let anchor = match anchors.as_slice() {
            [only] => (*only).clone(),
            [] => return SeriesAlignment::failed(series, "series has no slot 1"),
            many => {
                let detail = format!("series has {} slots numbered 1", many.len());
                return SeriesAlignment::failed(series, detail);
            }
        };

        let offset_days = offset_days(anchor.due_at, reference);
        let mut result = SeriesAlignment {
            offset_days,
            reference_due_at: Some(reference),
            ..SeriesAlignment::empty(series.clone())
        };
        info!(series = %series, offset_days, reference = %reference, "alignment computed");
        if offset_days == 0 {
            result.already_aligned = true;
            result.anchor_committed = true;
            return result;
        }

        let marker = self.settings.local_date(reference).format("%Y-%m-%d").to_string();
        let mut moves = Vec::new();
        for slot in slots.iter().filter(|s| !s.is_anchor()) {
            if slot.is_completed() {
                result.skipped.push(skipped(slot, SkipReason::CompletedHistory));
                continue;
            }
            if slot.last_alignment.as_deref() == Some(marker.as_str()) {
                result.skipped.push(skipped(slot, SkipReason::AlreadyAligned));
                continue;
            }
            let due_date = self.settings.local_date(slot.due_at) + Duration::days(offset_days);
            match self.settings.combine(due_date, self.settings.default_due_time) {
                Ok(to) => match self.plan_move(slot, to, &marker) {
                    Ok(m) => moves.push(m),
                    Err(err) => result.chunk_failures.push(ChunkFailure {
                        chunk: 0,
                        slot_ids: vec![slot.slot_id.clone()],
                        error: err.to_string(),
                    }),
                },
                Err(err) => result.chunk_failures.push(ChunkFailure {
                    chunk: 0,
                    slot_ids: vec![slot.slot_id.clone()],
                    error: err.to_string(),
                }),
            }
        }
        let anchor_move = match self.plan_move(&anchor, reference, &marker) {
            Ok(m) => m,
            Err(err) => {
                result.error = Some(err.to_string());
                return result;
            }
        };
        moves.push(anchor_move);

        let chunks: Vec<Vec<Move>> = chunked(moves, self.chunk_size);
        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let chunk: Vec<Move> = if index == last && !result.chunk_failures.is_empty() {
                warn!(series = %series, "earlier chunk failed; holding slot 1 back");
                chunk.into_iter().filter(|m| !m.slot.is_anchor()).collect()
            } else {
                chunk
            };
            if chunk.is_empty() {
                continue;
            }

            let ops: Vec<WriteOp> = chunk.iter().map(|m| m.op.clone()).collect();
            let written =
                with_write_retry(self.retry, "align", || self.store.batch_write(ops.clone())).await;
            match written {
                Ok(()) => {
                    for m in chunk {
                        if m.slot.is_anchor() {
                            result.anchor_committed = true;
                        }
                        result.shifted.push(ShiftedSlot {
                            slot_id: m.slot.slot_id.clone(),
                            sequence_number: m.slot.sequence_number,
                            from: m.from,
                            to: m.slot.due_at,
                        });
                    }
                }
                Err(err) => {
                    warn!(series = %series, chunk = index, error = %err, "alignment chunk failed");
                    result.chunk_failures.push(ChunkFailure {
                        chunk: index,
                        slot_ids: chunk.iter().map(|m| m.slot.slot_id.clone()).collect(),
                        error: err.to_string(),
                    });
                }
            }
        }

        result.shifted.sort_by_key(|s| s.sequence_number);
        result.skipped.sort_by_key(|s| s.sequence_number);
        info!(
            series = %series,
            shifted = result.shifted.len(),
            skipped = result.skipped.len(),
            failed_chunks = result.chunk_failures.len(),
            anchor_committed = result.anchor_committed,
            "alignment finished"
        );
        result
    }

    fn plan_move(&self, slot: &Slot, to: DateTime<Utc>, marker: &str) -> Result<Move> {
        let due_date = self.settings.local_date(to);
        let (window_start, window_end) =
            self.settings.window_around(due_date, &self.settings.window)?;
        let mut moved = slot.clone();
        moved.due_at = to;
        moved.check_in_window_start = window_start;
        moved.check_in_window_end = window_end;
        moved.last_alignment = Some(marker.to_string());

        let rendered = moved.to_fields();
        let patch: Map<String, Value> = [
            fields::DUE_AT,
            "checkInWindowStart",
            "checkInWindowEnd",
            "lastAlignment",
        ]
        .into_iter()
        .filter_map(|key| rendered.get(key).map(|v| (key.to_string(), v.clone())))
        .collect();

        // A slot completed since it was read must not move.
        let op = WriteOp {
            collection: Collection::Slots,
            id: slot.slot_id.clone(),
            fields: patch,
            precondition: None,
        }
        .expect(Precondition::FieldEquals {
            field: fields::STATUS.to_string(),
            value: Value::from(slot.status.slug()),
        });

        Ok(Move {
            slot: moved,
            from: slot.due_at,
            op,
        })
    }
}

fn skipped(slot: &Slot, reason: SkipReason) -> SkippedSlot {
    SkippedSlot {
        slot_id: slot.slot_id.clone(),
        sequence_number: slot.sequence_number,
        reason,
    }
}

/// Whole days from `current` to `reference`, rounded to nearest.
pub fn offset_days(current: DateTime<Utc>, reference: DateTime<Utc>) -> i64 {
    ((reference - current).num_seconds() as f64 / 86_400.0).round() as i64
}

fn chunked<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
