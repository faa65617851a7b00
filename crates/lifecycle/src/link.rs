//! Link Resolver: attach a submitted response to exactly one slot.
//!
//! Resolution order, first match wins:
//!
//! 1. A supplied slot id that resolves to a Pending slot of the same series.
//! 2. The single Pending slot with the request's `(clientId, formId,
//!    sequenceNumber)`.
//!
//! The response insert and the slot's flip to Completed are one
//! `atomic_write`, guarded by `status == pending` on the slot, so readers
//! never observe one side without the other.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use checkin_config::MaterializeMode;

use crate::error::{LifecycleError, Result, StoreError};
use crate::schedule::ScheduleGenerator;
use crate::schema::{Collection, Response, SeriesKey, Slot, SlotStatus, fields};
use crate::store::{
    DocumentStore, Precondition, Query, RetryPolicy, WriteOp, load_slots, resolve_reference,
    with_write_retry,
};

/// A client submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub client_id: String,
    pub form_id: String,
    pub coach_id: String,
    pub slot_id: Option<String>,
    pub sequence_number: Option<u32>,
    /// Caller-chosen id.  Resubmitting with the same id after a lost reply
    /// returns the existing link instead of failing.
    pub response_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub score: f64,
}

impl SubmitRequest {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.client_id, &self.form_id)
    }

    fn target(&self) -> String {
        match (&self.slot_id, self.sequence_number) {
            (Some(id), Some(seq)) => format!("slot {id} / {} #{seq}", self.series_key()),
            (Some(id), None) => format!("slot {id}"),
            (None, Some(seq)) => format!("{} #{seq}", self.series_key()),
            (None, None) => self.series_key().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResult {
    pub slot: Slot,
    pub response: Response,
    /// Slot created by rolling materialization in the same write.
    pub next_slot: Option<Slot>,
    /// True when the request replayed an already-committed link.
    pub replayed: bool,
}

enum Candidate {
    Pending(Slot),
    Replay(Slot),
}

pub struct LinkResolver<'a> {
    store: &'a dyn DocumentStore,
    generator: &'a ScheduleGenerator,
    materialize: MaterializeMode,
    retry: RetryPolicy,
}

impl<'a> LinkResolver<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        generator: &'a ScheduleGenerator,
        materialize: MaterializeMode,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            generator,
            materialize,
            retry,
        }
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<LinkResult> {
        validate(request)?;

        let slot = match self.find_candidate(request).await? {
            Candidate::Pending(slot) => slot,
            Candidate::Replay(slot) => return self.replay(slot).await,
        };

        let response = Response {
            response_id: request
                .response_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            client_id: request.client_id.clone(),
            form_id: request.form_id.clone(),
            coach_id: request.coach_id.clone(),
            linked_slot_id: Some(slot.slot_id.clone()),
            sequence_number: Some(slot.sequence_number),
            submitted_at: request.submitted_at,
            score: request.score,
        };
        let mut completed = slot.clone();
        completed.complete_with(&response);

        let next_slot = self.next_slot_to_create(&slot).await?;

        let mut ops = vec![
            WriteOp::put_response(&response).expect(Precondition::Absent),
            WriteOp::put_slot(&completed).expect(Precondition::FieldEquals {
                field: fields::STATUS.to_string(),
                value: Value::from(SlotStatus::Pending.slug()),
            }),
        ];
        if let Some(next) = &next_slot {
            ops.push(WriteOp::put_slot(next).expect(Precondition::Absent));
        }

        let committed =
            with_write_retry(self.retry, "link", || self.store.atomic_write(ops.clone())).await;
        match committed {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed { collection: Collection::Slots, .. }) => {
                return self.lost_race(&slot, &response).await;
            }
            Err(StoreError::PreconditionFailed { collection: Collection::Responses, id, .. }) => {
                // An earlier attempt may have committed before its reply was lost.
                let current = self.load_slot(&slot.slot_id).await?;
                if current.linked_response_id.as_deref() == Some(id.as_str()) {
                    return self.replay(current).await;
                }
                return Err(LifecycleError::InvalidInput(format!(
                    "response id {id} already exists"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            slot_id = %completed.slot_id,
            response_id = %response.response_id,
            series = %completed.series_key(),
            sequence = completed.sequence_number,
            "response linked; slot completed"
        );

        Ok(LinkResult {
            slot: completed,
            response,
            next_slot,
            replayed: false,
        })
    }

    async fn find_candidate(&self, request: &SubmitRequest) -> Result<Candidate> {
        let series = request.series_key();
        let mut completed_hit: Option<Slot> = None;

        if let Some(slot_id) = &request.slot_id {
            if let Some(doc) = resolve_reference(self.store, Collection::Slots, slot_id).await? {
                let slot = Slot::from_document(&doc)?;
                if slot.series_key() != series {
                    return Err(LifecycleError::InvalidInput(format!(
                        "slot {} belongs to series {}, not {series}",
                        slot.slot_id,
                        slot.series_key()
                    )));
                }
                if !slot.is_completed() {
                    return Ok(Candidate::Pending(slot));
                }
                completed_hit = Some(slot);
            }
        }

        if let Some(seq) = request.sequence_number {
            let query = Query::new()
                .filters(series.filters())
                .filter(fields::SEQUENCE_NUMBER, seq);
            let slots = load_slots(self.store, query).await?;
            let (mut pending, completed): (Vec<Slot>, Vec<Slot>) =
                slots.into_iter().partition(|s| !s.is_completed());
            match pending.len() {
                0 => {}
                1 => return Ok(Candidate::Pending(pending.swap_remove(0))),
                count => {
                    warn!(series = %series, sequence = seq, count, "ambiguous slot match");
                    return Err(LifecycleError::AmbiguousMatch {
                        target: request.target(),
                        count,
                    });
                }
            }
            if completed_hit.is_none() {
                let replay_match = completed.iter().position(|s| {
                    request.response_id.is_some() && s.linked_response_id == request.response_id
                });
                completed_hit = match replay_match {
                    Some(idx) => completed.into_iter().nth(idx),
                    None => completed.into_iter().next(),
                };
            }
        }

        match completed_hit {
            Some(slot) => {
                if request.response_id.is_some() && slot.linked_response_id == request.response_id {
                    return Ok(Candidate::Replay(slot));
                }
                Err(LifecycleError::AlreadyCompleted {
                    slot_id: slot.slot_id.clone(),
                    linked_response_id: slot.linked_response_id.unwrap_or_default(),
                })
            }
            None => Err(LifecycleError::SlotNotFound(request.target())),
        }
    }

    async fn next_slot_to_create(&self, slot: &Slot) -> Result<Option<Slot>> {
        if self.materialize != MaterializeMode::Rolling {
            return Ok(None);
        }
        let Some(next) = self.generator.generate_next(slot)? else {
            return Ok(None);
        };
        let query = Query::new()
            .filters(slot.series_key().filters())
            .filter(fields::SEQUENCE_NUMBER, next.sequence_number);
        let existing = self.store.query(Collection::Slots, &query).await?;
        Ok(existing.is_empty().then_some(next))
    }

    async fn load_slot(&self, slot_id: &str) -> Result<Slot> {
        let doc = self
            .store
            .get(Collection::Slots, slot_id)
            .await?
            .ok_or_else(|| LifecycleError::SlotNotFound(format!("slot {slot_id}")))?;
        Ok(Slot::from_document(&doc)?)
    }

    async fn replay(&self, slot: Slot) -> Result<LinkResult> {
        let response_id = slot.linked_response_id.clone().unwrap_or_default();
        let doc = self
            .store
            .get(Collection::Responses, &response_id)
            .await?
            .ok_or_else(|| LifecycleError::AlreadyCompleted {
                slot_id: slot.slot_id.clone(),
                linked_response_id: response_id.clone(),
            })?;
        info!(slot_id = %slot.slot_id, %response_id, "submission replayed existing link");
        Ok(LinkResult {
            slot,
            response: Response::from_document(&doc)?,
            next_slot: None,
            replayed: true,
        })
    }

    /// Another writer completed the slot between our read and our write.
    async fn lost_race(&self, slot: &Slot, response: &Response) -> Result<LinkResult> {
        let current = self.load_slot(&slot.slot_id).await?;
        if current.linked_response_id.as_deref() == Some(response.response_id.as_str()) {
            return self.replay(current).await;
        }
        warn!(slot_id = %slot.slot_id, "slot completed concurrently; refusing to overwrite");
        Err(LifecycleError::AlreadyCompleted {
            slot_id: current.slot_id,
            linked_response_id: current.linked_response_id.unwrap_or_default(),
        })
    }
}

fn validate(request: &SubmitRequest) -> Result<()> {
    if request.client_id.trim().is_empty() || request.form_id.trim().is_empty() {
        return Err(LifecycleError::InvalidInput("clientId and formId are required".to_string()));
    }
    if request.slot_id.is_none() && request.sequence_number.is_none() {
        return Err(LifecycleError::InvalidInput(
            "a slot id or a sequence number is required".to_string(),
        ));
    }
    if !request.score.is_finite() {
        return Err(LifecycleError::InvalidInput(format!("score {} is not finite", request.score)));
    }
    Ok(())
}
