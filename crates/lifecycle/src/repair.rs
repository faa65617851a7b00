//! Link Repairer: apply the minimal safe correction for each audit finding.
//!
//! Work is planned per series against working copies of the series'
//! documents, so a fix planned early in the pass (say, resetting a stale
//! slot) is visible to the findings planned after it.  The net change to the
//! series is then committed as one `atomic_write`, after re-reading every
//! touched document:
//!
//! - already in its target state → `AlreadyApplied`, nothing written
//! - changed since planning → `Conflict`, the series is skipped
//!
//! Contradictions with no safe resolution are reported as
//! `ManualReviewRequired` and never written.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::consistency::{AuditReport, AuditScope, Auditor, Finding, FindingKind, Reason};
use crate::error::{LifecycleError, Result, StoreError};
use crate::journal::{RepairJournal, RepairRecord};
use crate::schema::{Collection, Response, SeriesKey, Slot};
use crate::store::{
    DocumentStore, Precondition, Query, RetryPolicy, WriteOp, resolve_reference, with_write_retry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairActionKind {
    /// Return a slot to Pending, clearing link, `completedAt` and `score`.
    ResetSlot,
    /// Point a response at a slot and complete that slot with it.
    RelinkResponse,
    /// Complete a slot with the response that already points at it.
    CompleteSlot,
}

impl RepairActionKind {
    pub fn slug(self) -> &'static str {
        match self {
            Self::ResetSlot => "reset_slot",
            Self::RelinkResponse => "relink_response",
            Self::CompleteSlot => "complete_slot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    /// Dry run: the action would be written.
    Planned,
    Applied,
    AlreadyApplied,
    Conflict,
    ManualReviewRequired,
    /// No safe target exists; nothing was invented.
    Unresolved,
    Failed,
}

impl RepairOutcome {
    pub fn slug(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Applied => "applied",
            Self::AlreadyApplied => "already_applied",
            Self::Conflict => "conflict",
            Self::ManualReviewRequired => "manual_review_required",
            Self::Unresolved => "unresolved",
            Self::Failed => "failed",
        }
    }
}

/// What happened (or would happen) for one finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairAction {
    pub finding_id: String,
    pub kind: FindingKind,
    pub reason: Reason,
    pub series: SeriesKey,
    pub slot_id: Option<String>,
    pub response_id: Option<String>,
    pub action: Option<RepairActionKind>,
    pub outcome: RepairOutcome,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairSummary {
    pub scope: AuditScope,
    pub dry_run: bool,
    pub series_processed: usize,
    pub actions: Vec<RepairAction>,
    pub counts: BTreeMap<RepairOutcome, usize>,
}

impl RepairSummary {
    pub fn count(&self, outcome: RepairOutcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }
}

/// A planned fix with the document states around it.
#[derive(Debug, Clone)]
struct Fix {
    finding: Finding,
    action: Option<RepairActionKind>,
    outcome: RepairOutcome,
    note: String,
    before: BTreeMap<String, Value>,
    after: BTreeMap<String, Value>,
}

impl Fix {
    fn skipped(finding: &Finding, outcome: RepairOutcome, note: impl Into<String>) -> Self {
        Self {
            finding: finding.clone(),
            action: None,
            outcome,
            note: note.into(),
            before: BTreeMap::new(),
            after: BTreeMap::new(),
        }
    }

    fn manual(finding: &Finding, note: impl Into<String>) -> Self {
        Self::skipped(finding, RepairOutcome::ManualReviewRequired, note)
    }

    fn covered(finding: &Finding) -> Self {
        Self::skipped(
            finding,
            RepairOutcome::AlreadyApplied,
            "resolved by an earlier action on this series",
        )
    }

    fn writes(&self) -> bool {
        self.action.is_some() && self.outcome == RepairOutcome::Planned
    }

    fn into_action(self) -> RepairAction {
        RepairAction {
            finding_id: self.finding.finding_id,
            kind: self.finding.kind,
            reason: self.finding.reason,
            series: self.finding.series,
            slot_id: self.finding.slot_id,
            response_id: self.finding.response_id,
            action: self.action,
            outcome: self.outcome,
            note: self.note,
        }
    }
}

fn doc_key(collection: Collection, id: &str) -> String {
    format!("{collection}/{id}")
}

/// Working copies of one series plus the snapshot they were loaded from.
#[derive(Debug, Clone)]
struct SeriesState {
    slots: BTreeMap<String, Slot>,
    responses: BTreeMap<String, Response>,
    original_slots: BTreeMap<String, Slot>,
    original_responses: BTreeMap<String, Response>,
    slot_aliases: HashMap<String, Vec<String>>,
    response_aliases: HashMap<String, Vec<String>>,
    /// Keys of documents in the series that failed to decode.
    undecodable: BTreeSet<String>,
}

impl SeriesState {
    async fn load(store: &dyn DocumentStore, series: &SeriesKey) -> Result<Self> {
        let query = Query::new().filters(series.filters());
        let slot_docs = store.query(Collection::Slots, &query).await?;
        let response_docs = store.query(Collection::Responses, &query).await?;

        let mut undecodable = BTreeSet::new();
        let mut slots = BTreeMap::new();
        let mut slot_aliases: HashMap<String, Vec<String>> = HashMap::new();
        for doc in &slot_docs {
            if let Some(alias) = mirrored_id(&doc.fields, Collection::Slots, &doc.id) {
                slot_aliases.entry(alias).or_default().push(doc.id.clone());
            }
            match Slot::from_document(doc) {
                Ok(slot) => {
                    slots.insert(doc.id.clone(), slot);
                }
                Err(_) => {
                    undecodable.insert(doc_key(Collection::Slots, &doc.id));
                }
            }
        }
        let mut responses = BTreeMap::new();
        let mut response_aliases: HashMap<String, Vec<String>> = HashMap::new();
        for doc in &response_docs {
            if let Some(alias) = mirrored_id(&doc.fields, Collection::Responses, &doc.id) {
                response_aliases.entry(alias).or_default().push(doc.id.clone());
            }
            match Response::from_document(doc) {
                Ok(response) => {
                    responses.insert(doc.id.clone(), response);
                }
                Err(_) => {
                    undecodable.insert(doc_key(Collection::Responses, &doc.id));
                }
            }
        }

        Ok(Self {
            original_slots: slots.clone(),
            original_responses: responses.clone(),
            slots,
            responses,
            slot_aliases,
            response_aliases,
            undecodable,
        })
    }

    /// Document id of the in-series slot `reference` names, if exactly one.
    fn slot_ref(&self, reference: Option<&str>) -> Option<String> {
        let reference = reference?;
        if self.slots.contains_key(reference) {
            return Some(reference.to_string());
        }
        match self.slot_aliases.get(reference).map(Vec::as_slice) {
            Some([only]) => Some(only.clone()),
            _ => None,
        }
    }

    fn response_ref(&self, reference: Option<&str>) -> Option<String> {
        let reference = reference?;
        if self.responses.contains_key(reference) {
            return Some(reference.to_string());
        }
        match self.response_aliases.get(reference).map(Vec::as_slice) {
            Some([only]) => Some(only.clone()),
            _ => None,
        }
    }

    fn pair_consistent(&self, slot_id: &str, response_id: &str) -> bool {
        let (Some(slot), Some(response)) =
            (self.slots.get(slot_id), self.responses.get(response_id))
        else {
            return false;
        };
        slot.is_completed()
            && self.response_ref(slot.linked_response_id.as_deref()).as_deref() == Some(response_id)
            && self.slot_ref(response.linked_slot_id.as_deref()).as_deref() == Some(slot_id)
    }

    fn slot_settled(&self, slot_id: &str) -> bool {
        let Some(slot) = self.slots.get(slot_id) else {
            return false;
        };
        if slot.is_completed() {
            return self
                .response_ref(slot.linked_response_id.as_deref())
                .is_some_and(|rid| self.pair_consistent(slot_id, &rid));
        }
        slot.linked_response_id.is_none() && slot.completed_at.is_none() && slot.score.is_none()
    }

    fn response_settled(&self, response_id: &str) -> bool {
        self.responses
            .get(response_id)
            .and_then(|r| self.slot_ref(r.linked_slot_id.as_deref()))
            .is_some_and(|sid| self.pair_consistent(&sid, response_id))
    }

    /// In-series responses whose link resolves to `slot_id`.
    fn responses_pointing_at(&self, slot_id: &str) -> Vec<String> {
        self.responses
            .iter()
            .filter(|(_, r)| self.slot_ref(r.linked_slot_id.as_deref()).as_deref() == Some(slot_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn snapshot(
        &self,
        slot_id: Option<&str>,
        response_id: Option<&str>,
    ) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        if let Some(slot) = slot_id.and_then(|id| self.slots.get(id)) {
            out.insert(doc_key(Collection::Slots, &slot.slot_id), Value::Object(slot.to_fields()));
        }
        if let Some(response) = response_id.and_then(|id| self.responses.get(id)) {
            out.insert(
                doc_key(Collection::Responses, &response.response_id),
                Value::Object(response.to_fields()),
            );
        }
        out
    }

    /// Apply `kind` to the working copies and describe it as a fix.
    fn apply(
        &mut self,
        finding: &Finding,
        kind: RepairActionKind,
        slot_id: &str,
        response_id: Option<&str>,
        note: String,
    ) -> Fix {
        let before = self.snapshot(Some(slot_id), response_id);
        match (kind, response_id) {
            (RepairActionKind::ResetSlot, _) => {
                if let Some(slot) = self.slots.get_mut(slot_id) {
                    slot.reset_to_pending();
                }
            }
            (RepairActionKind::RelinkResponse, Some(rid)) => {
                let seq = self.slots.get(slot_id).map(|s| s.sequence_number);
                if let Some(response) = self.responses.get_mut(rid) {
                    response.linked_slot_id = Some(slot_id.to_string());
                    if response.sequence_number.is_none() {
                        response.sequence_number = seq;
                    }
                }
                self.complete(slot_id, rid);
            }
            (RepairActionKind::CompleteSlot, Some(rid)) => self.complete(slot_id, rid),
            (_, None) => {}
        }
        let after = self.snapshot(Some(slot_id), response_id);
        Fix {
            finding: finding.clone(),
            action: Some(kind),
            outcome: RepairOutcome::Planned,
            note,
            before,
            after,
        }
    }

    fn complete(&mut self, slot_id: &str, response_id: &str) {
        let Some(response) = self.responses.get(response_id).cloned() else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(slot_id) {
            slot.complete_with(&response);
        }
    }
}

fn mirrored_id(
    fields: &Map<String, Value>,
    collection: Collection,
    doc_id: &str,
) -> Option<String> {
    fields
        .get(collection.id_field())
        .and_then(Value::as_str)
        .filter(|alias| !alias.is_empty() && *alias != doc_id)
        .map(String::from)
}

/// Fields that differ between two renderings of the same document.
fn changed_fields(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Planning order: slot-side cleanup first so later fixes see clean slots.
fn phase(reason: Reason) -> u8 {
    match reason {
        Reason::CompletedWithoutResponse
        | Reason::ResponseMissing
        | Reason::PendingWithDanglingLink
        | Reason::PendingWithStaleFields => 0,
        Reason::ResponsePointsElsewhere | Reason::StatusNotCompleted => 1,
        Reason::SlotMissing => 2,
        Reason::SlotNotLinked | Reason::SlotPointsElsewhere => 3,
        Reason::Unlinked
        | Reason::AmbiguousReference
        | Reason::NoAnchor
        | Reason::SequenceReused
        | Reason::Undecodable => 4,
    }
}

enum DocState {
    Unchanged,
    AtTarget,
    Changed,
}

fn doc_state<T: PartialEq>(current: Option<&T>, original: &T, target: &T) -> DocState {
    match current {
        Some(c) if c == target => DocState::AtTarget,
        Some(c) if c == original => DocState::Unchanged,
        _ => DocState::Changed,
    }
}

pub struct Repairer<'a> {
    store: &'a dyn DocumentStore,
    journal: &'a RepairJournal,
    retry: RetryPolicy,
    max_parallel_clients: usize,
}

impl<'a> Repairer<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        journal: &'a RepairJournal,
        retry: RetryPolicy,
        max_parallel_clients: usize,
    ) -> Self {
        Self {
            store,
            journal,
            retry,
            max_parallel_clients: max_parallel_clients.max(1),
        }
    }

    /// Audit `scope` and repair what the audit finds.
    pub async fn repair(&self, scope: &AuditScope, dry_run: bool) -> Result<RepairSummary> {
        let report = Auditor::new(self.store).audit(scope).await?;
        Ok(self.repair_report(&report, dry_run).await)
    }

    /// Repair the findings of an existing report.  Clients are processed
    /// concurrently; series of one client run one after another.
    pub async fn repair_report(&self, report: &AuditReport, dry_run: bool) -> RepairSummary {
        let mut by_client: BTreeMap<String, Vec<(SeriesKey, Vec<Finding>)>> = BTreeMap::new();
        for (series, findings) in report.by_series() {
            by_client
                .entry(series.client_id.clone())
                .or_default()
                .push((series, findings));
        }
        let series_processed = by_client.values().map(Vec::len).sum();

        let jobs = by_client.into_values().map(|work| async move {
            let mut actions = Vec::new();
            for (series, findings) in work {
                actions.extend(self.repair_series(&series, &findings, dry_run).await);
            }
            actions
        });
        let per_client: Vec<Vec<RepairAction>> = stream::iter(jobs)
            .buffer_unordered(self.max_parallel_clients)
            .collect()
            .await;

        let mut actions: Vec<RepairAction> = per_client.into_iter().flatten().collect();
        actions.sort_by(|a, b| {
            (&a.series, a.kind, a.reason, &a.slot_id, &a.response_id, &a.finding_id).cmp(&(
                &b.series,
                b.kind,
                b.reason,
                &b.slot_id,
                &b.response_id,
                &b.finding_id,
            ))
        });
        let mut counts = BTreeMap::new();
        for action in &actions {
            *counts.entry(action.outcome).or_insert(0) += 1;
        }

        info!(
            scope = %report.scope,
            dry_run,
            series = series_processed,
            actions = actions.len(),
            "repair pass complete"
        );

        RepairSummary {
            scope: report.scope.clone(),
            dry_run,
            series_processed,
            actions,
            counts,
        }
    }

    async fn repair_series(
        &self,
        series: &SeriesKey,
        findings: &[Finding],
        dry_run: bool,
    ) -> Vec<RepairAction> {
        let (state, mut fixes) = match self.plan(series, findings).await {
            Ok(planned) => planned,
            Err(err) => {
                error!(series = %series, error = %err, "could not plan repairs for series");
                return findings
                    .iter()
                    .map(|f| Fix::skipped(f, RepairOutcome::Failed, err.to_string()).into_action())
                    .collect();
            }
        };

        for fix in &fixes {
            if fix.writes() {
                info!(
                    finding_id = %fix.finding.finding_id,
                    action = fix.action.map(RepairActionKind::slug).unwrap_or("-"),
                    series = %series,
                    dry_run,
                    "repair planned"
                );
            } else {
                warn!(
                    finding_id = %fix.finding.finding_id,
                    reason = %fix.finding.reason,
                    outcome = fix.outcome.slug(),
                    note = %fix.note,
                    "repair skipped"
                );
            }
        }

        if !dry_run {
            self.commit(&state, &mut fixes).await;
        }
        fixes.into_iter().map(Fix::into_action).collect()
    }

    async fn plan(
        &self,
        series: &SeriesKey,
        findings: &[Finding],
    ) -> Result<(SeriesState, Vec<Fix>)> {
        let mut state = SeriesState::load(self.store, series).await?;
        let mut ordered: Vec<&Finding> = findings.iter().collect();
        ordered.sort_by_key(|f| phase(f.reason));

        let mut fixes = Vec::with_capacity(ordered.len());
        for finding in ordered {
            // Links cannot be judged while part of the series is unreadable.
            if !state.undecodable.is_empty() && finding.reason != Reason::Undecodable {
                let keys: Vec<&str> = state.undecodable.iter().map(String::as_str).collect();
                let note = format!(
                    "series holds undecodable records ({}); fix those first",
                    keys.join(", ")
                );
                fixes.push(Fix::manual(finding, note));
                continue;
            }
            fixes.push(self.plan_one(&mut state, finding).await?);
        }
        Ok((state, fixes))
    }

    async fn plan_one(&self, state: &mut SeriesState, finding: &Finding) -> Result<Fix> {
        let slot_id = finding.slot_id.as_deref();
        let response_id = finding.response_id.as_deref();

        let fix = match finding.reason {
            Reason::CompletedWithoutResponse
            | Reason::ResponseMissing
            | Reason::PendingWithDanglingLink
            | Reason::PendingWithStaleFields => {
                let Some(sid) = slot_id.filter(|id| state.slots.contains_key(*id)) else {
                    return Ok(Fix::skipped(
                        finding,
                        RepairOutcome::Unresolved,
                        "slot no longer exists",
                    ));
                };
                if state.slot_settled(sid) {
                    return Ok(Fix::covered(finding));
                }
                state.apply(
                    finding,
                    RepairActionKind::ResetSlot,
                    sid,
                    None,
                    "reset slot to pending; its link can never be satisfied".to_string(),
                )
            }

            Reason::StatusNotCompleted => {
                let (Some(sid), Some(rid)) = (slot_id, response_id) else {
                    return Ok(Fix::manual(finding, "finding lacks a slot or response id"));
                };
                if state.pair_consistent(sid, rid) {
                    return Ok(Fix::covered(finding));
                }
                let slot_names_response = state.slots.get(sid).is_some_and(|s| {
                    state.response_ref(s.linked_response_id.as_deref()).as_deref() == Some(rid)
                });
                let response_names_slot = state.responses.get(rid).is_some_and(|r| {
                    state.slot_ref(r.linked_slot_id.as_deref()).as_deref() == Some(sid)
                });
                if !(slot_names_response && response_names_slot) {
                    return Ok(Fix::manual(
                        finding,
                        "slot and response no longer reference each other",
                    ));
                }
                state.apply(
                    finding,
                    RepairActionKind::CompleteSlot,
                    sid,
                    Some(rid),
                    "complete slot from the response that links to it".to_string(),
                )
            }

            Reason::ResponsePointsElsewhere => {
                self.plan_response_points_elsewhere(state, finding).await?
            }
            Reason::SlotMissing => plan_slot_missing(state, finding),
            Reason::SlotNotLinked | Reason::SlotPointsElsewhere => {
                plan_response_side(state, finding)
            }

            Reason::Unlinked => match response_id {
                Some(rid) if state.response_settled(rid) => Fix::covered(finding),
                _ => Fix::manual(finding, "response carries no slot reference to follow"),
            },
            Reason::AmbiguousReference => {
                Fix::manual(finding, "reference matches several documents")
            }
            Reason::NoAnchor => {
                Fix::manual(finding, "series has no anchor slot; regenerate or renumber by hand")
            }
            Reason::SequenceReused => {
                Fix::manual(finding, "duplicate sequence numbers need a human to pick the survivor")
            }
            Reason::Undecodable => {
                Fix::manual(finding, "stored record does not decode; correct or remove it by hand")
            }
        };
        Ok(fix)
    }

    /// Slot S is Completed with response R, but R points at X ≠ S.
    async fn plan_response_points_elsewhere(
        &self,
        state: &mut SeriesState,
        finding: &Finding,
    ) -> Result<Fix> {
        let (Some(sid), Some(rid)) = (finding.slot_id.as_deref(), finding.response_id.as_deref())
        else {
            return Ok(Fix::manual(finding, "finding lacks a slot or response id"));
        };
        if state.pair_consistent(sid, rid) {
            return Ok(Fix::covered(finding));
        }
        let (Some(slot), Some(response)) = (state.slots.get(sid), state.responses.get(rid)) else {
            return Ok(Fix::manual(finding, "response belongs to another series"));
        };
        let still_linked =
            state.response_ref(slot.linked_response_id.as_deref()).as_deref() == Some(rid);
        if !slot.is_completed() || !still_linked {
            return Ok(Fix::manual(finding, "slot changed while planning"));
        }
        let seq_agrees = response.sequence_number.is_none_or(|seq| seq == slot.sequence_number);

        let Some(target) = response.linked_slot_id.clone() else {
            if !seq_agrees {
                return Ok(Fix::manual(finding, "response sequence number disagrees with the slot"));
            }
            return Ok(state.apply(
                finding,
                RepairActionKind::RelinkResponse,
                sid,
                Some(rid),
                "response had no slot reference; point it back at the slot that owns it"
                    .to_string(),
            ));
        };

        if let Some(other) = state.slot_ref(Some(&target)) {
            if state.pair_consistent(&other, rid) {
                // R and its slot agree; S holds a stale link.
                return Ok(state.apply(
                    finding,
                    RepairActionKind::ResetSlot,
                    sid,
                    None,
                    format!(
                        "response is consistently linked to slot {other}; clear the stale link"
                    ),
                ));
            }
            return Ok(Fix::manual(
                finding,
                format!("slot {sid} and response {rid} disagree; slot {other} confirms neither"),
            ));
        }

        match resolve_reference(self.store, Collection::Slots, &target).await {
            Ok(None) if seq_agrees => Ok(state.apply(
                finding,
                RepairActionKind::RelinkResponse,
                sid,
                Some(rid),
                format!("response pointed at missing slot {target}; point it back at its owner"),
            )),
            Ok(None) => {
                Ok(Fix::manual(finding, "response sequence number disagrees with the slot"))
            }
            Ok(Some(_)) => Ok(Fix::manual(
                finding,
                format!("response points at slot {target} in another series"),
            )),
            Err(LifecycleError::AmbiguousMatch { count, .. }) => Ok(Fix::manual(
                finding,
                format!("response reference {target} matches {count} slots"),
            )),
            Err(err) => Err(err),
        }
    }

    async fn commit(&self, state: &SeriesState, fixes: &mut [Fix]) {
        if !fixes.iter().any(Fix::writes) {
            return;
        }
        let series = fixes[0].finding.series.clone();

        let mut ops = Vec::new();
        let mut conflicts = Vec::new();
        let mut pending = 0usize;
        let checked = self.compare_with_store(state, &mut ops, &mut conflicts, &mut pending).await;
        if let Err(err) = checked {
            mark(fixes, RepairOutcome::Failed, &format!("re-read before commit failed: {err}"));
            return;
        }

        if !conflicts.is_empty() {
            warn!(
                series = %series,
                documents = ?conflicts,
                "documents changed since planning; skipping series"
            );
            let note =
                format!("changed since planning: {}; re-run the audit", conflicts.join(", "));
            mark(fixes, RepairOutcome::Conflict, &note);
            return;
        }
        if pending == 0 {
            info!(series = %series, "repairs already present in store");
            mark(fixes, RepairOutcome::AlreadyApplied, "store already matches the repaired state");
            return;
        }

        let written =
            with_write_retry(self.retry, "repair", || self.store.atomic_write(ops.clone())).await;
        match written {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed { collection, id, detail }) => {
                let note = format!("{collection}/{id} changed during commit: {detail}");
                mark(fixes, RepairOutcome::Conflict, &note);
                return;
            }
            Err(err) => {
                error!(series = %series, error = %err, "repair write failed");
                mark(fixes, RepairOutcome::Failed, &err.to_string());
                return;
            }
        }

        let now = Utc::now();
        let mut records = Vec::new();
        for fix in fixes.iter_mut().filter(|f| f.writes()) {
            fix.outcome = RepairOutcome::Applied;
            if let Some(action) = fix.action {
                records.push(RepairRecord {
                    record_id: Uuid::new_v4(),
                    finding_id: fix.finding.finding_id.clone(),
                    series: series.clone(),
                    action,
                    before_state: fix.before.clone(),
                    after_state: fix.after.clone(),
                    recorded_at: now,
                });
            }
            info!(
                finding_id = %fix.finding.finding_id,
                action = fix.action.map(RepairActionKind::slug).unwrap_or("-"),
                series = %series,
                "repair applied"
            );
        }
        if let Err(err) = self.journal.append_all(&records).await {
            error!(
                series = %series,
                error = %err,
                path = %self.journal.path().display(),
                "repair journal append failed"
            );
            for fix in fixes.iter_mut().filter(|f| f.outcome == RepairOutcome::Applied) {
                fix.note = format!("{} (journal write failed: {err})", fix.note);
            }
        }
    }

    /// Re-read every document the plan changes.  Unchanged documents get a
    /// write op; documents already at their target are left alone.
    async fn compare_with_store(
        &self,
        state: &SeriesState,
        ops: &mut Vec<WriteOp>,
        conflicts: &mut Vec<String>,
        pending: &mut usize,
    ) -> std::result::Result<(), StoreError> {
        for (id, target) in &state.slots {
            let Some(original) = state.original_slots.get(id).filter(|o| *o != target) else {
                continue;
            };
            let current = match self.store.get(Collection::Slots, id).await? {
                Some(doc) => Slot::from_document(&doc).ok(),
                None => None,
            };
            match doc_state(current.as_ref(), original, target) {
                DocState::AtTarget => {}
                DocState::Changed => conflicts.push(doc_key(Collection::Slots, id)),
                DocState::Unchanged => {
                    *pending += 1;
                    ops.push(
                        WriteOp {
                            collection: Collection::Slots,
                            id: id.clone(),
                            fields: changed_fields(&original.to_fields(), &target.to_fields()),
                            precondition: None,
                        }
                        .expect(Precondition::FieldEquals {
                            field: crate::schema::fields::STATUS.to_string(),
                            value: Value::from(original.status.slug()),
                        }),
                    );
                }
            }
        }
        for (id, target) in &state.responses {
            let Some(original) = state.original_responses.get(id).filter(|o| *o != target) else {
                continue;
            };
            let current = match self.store.get(Collection::Responses, id).await? {
                Some(doc) => Response::from_document(&doc).ok(),
                None => None,
            };
            match doc_state(current.as_ref(), original, target) {
                DocState::AtTarget => {}
                DocState::Changed => conflicts.push(doc_key(Collection::Responses, id)),
                DocState::Unchanged => {
                    *pending += 1;
                    ops.push(
                        WriteOp {
                            collection: Collection::Responses,
                            id: id.clone(),
                            fields: changed_fields(&original.to_fields(), &target.to_fields()),
                            precondition: None,
                        }
                        .expect(Precondition::Exists),
                    );
                }
            }
        }
        Ok(())
    }
}

fn mark(fixes: &mut [Fix], outcome: RepairOutcome, note: &str) {
    for fix in fixes.iter_mut().filter(|f| f.writes()) {
        fix.outcome = outcome;
        fix.note = format!("{}; {note}", fix.note);
    }
}

/// Response R points at a slot that does not exist: look for the one slot
/// of the series that can take it, by sequence number.
fn plan_slot_missing(state: &mut SeriesState, finding: &Finding) -> Fix {
    let Some(rid) = finding.response_id.as_deref() else {
        return Fix::manual(finding, "finding lacks a response id");
    };
    if state.response_settled(rid) {
        return Fix::covered(finding);
    }
    let Some(response) = state.responses.get(rid) else {
        return Fix::skipped(finding, RepairOutcome::Unresolved, "response no longer exists");
    };
    let Some(seq) = response.sequence_number else {
        return Fix::skipped(
            finding,
            RepairOutcome::Unresolved,
            "response has no sequence number to match on",
        );
    };

    let candidates: Vec<String> = state
        .slots
        .values()
        .filter(|s| s.sequence_number == seq && s.linked_response_id.is_none())
        .map(|s| s.slot_id.clone())
        .collect();
    // A slot another response names explicitly is not free to take.
    if let Some((sid, claimant)) = candidates.iter().find_map(|sid| {
        state
            .responses_pointing_at(sid)
            .into_iter()
            .next()
            .map(|claimant| (sid.clone(), claimant))
    }) {
        return Fix::manual(
            finding,
            format!("slot {sid} with sequence number {seq} is claimed by response {claimant}"),
        );
    }
    match candidates.as_slice() {
        [] => Fix::skipped(
            finding,
            RepairOutcome::Unresolved,
            format!("no unlinked slot with sequence number {seq}"),
        ),
        [sid] => {
            let sid = sid.clone();
            state.apply(
                finding,
                RepairActionKind::RelinkResponse,
                &sid,
                Some(rid),
                format!("relink to slot #{seq}"),
            )
        }
        many => Fix::manual(
            finding,
            format!("{} unlinked slots share sequence number {seq}", many.len()),
        ),
    }
}

/// Response R points at slot S, and S does not point back.
fn plan_response_side(state: &mut SeriesState, finding: &Finding) -> Fix {
    let Some(rid) = finding.response_id.as_deref() else {
        return Fix::manual(finding, "finding lacks a response id");
    };
    if state.response_settled(rid) {
        return Fix::covered(finding);
    }
    let Some(response) = state.responses.get(rid) else {
        return Fix::skipped(finding, RepairOutcome::Unresolved, "response no longer exists");
    };
    let Some(sid) = state.slot_ref(response.linked_slot_id.as_deref()) else {
        return Fix::manual(finding, "linked slot is outside this series");
    };
    let Some(slot) = state.slots.get(&sid) else {
        return Fix::manual(finding, "linked slot is outside this series");
    };

    if let Some(other) = state.response_ref(slot.linked_response_id.as_deref()) {
        if state.pair_consistent(&sid, &other) {
            return Fix::manual(
                finding,
                format!(
                    "slot {sid} is already completed by response {other}; duplicate submission"
                ),
            );
        }
    }
    if slot.linked_response_id.is_some() {
        return Fix::manual(
            finding,
            format!("slot {sid} links to a response that does not confirm it"),
        );
    }
    if response.sequence_number.is_some_and(|seq| seq != slot.sequence_number) {
        return Fix::manual(finding, "response sequence number disagrees with the slot");
    }
    let claimants = state.responses_pointing_at(&sid);
    if claimants.len() > 1 {
        return Fix::manual(
            finding,
            format!("{} responses claim slot {sid}", claimants.len()),
        );
    }
    state.apply(
        finding,
        RepairActionKind::CompleteSlot,
        &sid,
        Some(rid),
        "complete slot from the response that links to it".to_string(),
    )
}
