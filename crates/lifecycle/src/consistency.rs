//! Consistency Auditor: read-only classification of slots and responses.
//!
//! Every slot and every response in scope is checked against its
//! counter-reference.  Anything that is not a clean bidirectional link (or a
//! clean Pending slot) becomes a [`Finding`] with a stable id, so two audits
//! of the same data produce the same report regardless of scan order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result, StoreError};
use crate::schema::{Collection, Response, SeriesKey, Slot, fields};
use crate::store::{Document, DocumentStore, Query, query_sorted, resolve_reference};

/// Which records an audit (or repair) covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum AuditScope {
    Client(String),
    Series(SeriesKey),
    All,
}

impl AuditScope {
    fn filters(&self) -> Vec<(String, Value)> {
        match self {
            Self::Client(client_id) => {
                vec![(fields::CLIENT_ID.to_string(), Value::from(client_id.as_str()))]
            }
            Self::Series(series) => series.filters(),
            Self::All => Vec::new(),
        }
    }
}

impl fmt::Display for AuditScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(client_id) => write!(f, "client {client_id}"),
            Self::Series(series) => write!(f, "series {series}"),
            Self::All => f.write_str("all clients"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    OrphanSlot,
    OrphanResponse,
    MismatchedLink,
    MissingAnchor,
    DuplicateSequence,
    CorruptRecord,
}

/// Machine-readable reason code.  Each code belongs to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Completed slot with no `linkedResponseId`.
    CompletedWithoutResponse,
    /// Completed slot whose `linkedResponseId` resolves to nothing.
    ResponseMissing,
    /// Pending slot carrying a link that does not resolve back to it.
    PendingWithDanglingLink,
    /// Pending slot with a leftover `completedAt` or `score`.
    PendingWithStaleFields,
    /// Response with a null `linkedSlotId`.
    Unlinked,
    /// Response whose `linkedSlotId` resolves to nothing.
    SlotMissing,
    /// Slot points at a response that points somewhere else.
    ResponsePointsElsewhere,
    /// Response points at a slot that is linked to a different response.
    SlotPointsElsewhere,
    /// Response points at a slot that has no link at all.
    SlotNotLinked,
    /// Pending slot and response point at each other.
    StatusNotCompleted,
    /// A reference matches several records through the mirrored id field.
    AmbiguousReference,
    NoAnchor,
    SequenceReused,
    /// Stored body does not decode into a slot or response.
    Undecodable,
}

impl Reason {
    pub fn kind(self) -> FindingKind {
        match self {
            Self::CompletedWithoutResponse
            | Self::ResponseMissing
            | Self::PendingWithDanglingLink
            | Self::PendingWithStaleFields => FindingKind::OrphanSlot,
            Self::Unlinked | Self::SlotMissing => FindingKind::OrphanResponse,
            Self::ResponsePointsElsewhere
            | Self::SlotPointsElsewhere
            | Self::SlotNotLinked
            | Self::StatusNotCompleted
            | Self::AmbiguousReference => FindingKind::MismatchedLink,
            Self::NoAnchor => FindingKind::MissingAnchor,
            Self::SequenceReused => FindingKind::DuplicateSequence,
            Self::Undecodable => FindingKind::CorruptRecord,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::CompletedWithoutResponse => "completed_without_response",
            Self::ResponseMissing => "response_missing",
            Self::PendingWithDanglingLink => "pending_with_dangling_link",
            Self::PendingWithStaleFields => "pending_with_stale_fields",
            Self::Unlinked => "unlinked",
            Self::SlotMissing => "slot_missing",
            Self::ResponsePointsElsewhere => "response_points_elsewhere",
            Self::SlotPointsElsewhere => "slot_points_elsewhere",
            Self::SlotNotLinked => "slot_not_linked",
            Self::StatusNotCompleted => "status_not_completed",
            Self::AmbiguousReference => "ambiguous_reference",
            Self::NoAnchor => "no_anchor",
            Self::SequenceReused => "sequence_reused",
            Self::Undecodable => "undecodable",
        }
    }
}

impl FindingKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::OrphanSlot => "orphan_slot",
            Self::OrphanResponse => "orphan_response",
            Self::MismatchedLink => "mismatched_link",
            Self::MissingAnchor => "missing_anchor",
            Self::DuplicateSequence => "duplicate_sequence",
            Self::CorruptRecord => "corrupt_record",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub finding_id: String,
    pub kind: FindingKind,
    pub reason: Reason,
    pub series: SeriesKey,
    pub slot_id: Option<String>,
    pub response_id: Option<String>,
    pub detail: String,
}

impl Finding {
    pub fn new(
        reason: Reason,
        series: SeriesKey,
        slot_id: Option<&str>,
        response_id: Option<&str>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            finding_id: finding_id(reason, &series, slot_id, response_id),
            kind: reason.kind(),
            reason,
            series,
            slot_id: slot_id.map(String::from),
            response_id: response_id.map(String::from),
            detail: detail.into(),
        }
    }

    fn sort_key(&self) -> (&SeriesKey, FindingKind, Reason, Option<&str>, Option<&str>) {
        (
            &self.series,
            self.kind,
            self.reason,
            self.slot_id.as_deref(),
            self.response_id.as_deref(),
        )
    }
}

/// First 16 hex chars of SHA-256 over the finding's identity.
fn finding_id(
    reason: Reason,
    series: &SeriesKey,
    slot_id: Option<&str>,
    response_id: Option<&str>,
) -> String {
    let mut h = Sha256::new();
    for part in [
        reason.kind().code(),
        reason.code(),
        series.client_id.as_str(),
        series.form_id.as_str(),
        slot_id.unwrap_or("-"),
        response_id.unwrap_or("-"),
    ] {
        h.update(part.as_bytes());
        h.update([0u8]);
    }
    let hex = format!("{:x}", h.finalize());
    hex[..16].to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub scope: AuditScope,
    pub slots_scanned: usize,
    pub responses_scanned: usize,
    /// Completed slots whose link agrees in both directions.
    pub consistent_links: usize,
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    /// Findings grouped by series, preserving report order inside a group.
    pub fn by_series(&self) -> BTreeMap<SeriesKey, Vec<Finding>> {
        let mut grouped: BTreeMap<SeriesKey, Vec<Finding>> = BTreeMap::new();
        for finding in &self.findings {
            grouped.entry(finding.series.clone()).or_default().push(finding.clone());
        }
        grouped
    }
}

/// What a reference points at, memoized per audit.
#[derive(Debug, Clone)]
enum Resolution {
    Found(Document),
    Missing,
    Ambiguous(usize),
}

struct ReferenceCache<'a> {
    store: &'a dyn DocumentStore,
    resolved: HashMap<(Collection, String), Resolution>,
}

impl<'a> ReferenceCache<'a> {
    fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            resolved: HashMap::new(),
        }
    }

    async fn resolve(&mut self, collection: Collection, reference: &str) -> Result<Resolution> {
        let key = (collection, reference.to_string());
        if let Some(hit) = self.resolved.get(&key) {
            return Ok(hit.clone());
        }
        let resolution = match resolve_reference(self.store, collection, reference).await {
            Ok(Some(doc)) => Resolution::Found(doc),
            Ok(None) => Resolution::Missing,
            Err(LifecycleError::AmbiguousMatch { count, .. }) => Resolution::Ambiguous(count),
            Err(err) => return Err(err),
        };
        self.resolved.insert(key, resolution.clone());
        Ok(resolution)
    }

    /// Whether `reference` (a raw link value) resolves to document `target_id`.
    async fn points_to(
        &mut self,
        collection: Collection,
        reference: Option<&str>,
        target_id: &str,
    ) -> Result<bool> {
        let Some(reference) = reference else {
            return Ok(false);
        };
        if reference == target_id {
            return Ok(true);
        }
        Ok(matches!(
            self.resolve(collection, reference).await?,
            Resolution::Found(doc) if doc.id == target_id
        ))
    }
}

pub struct Auditor<'a> {
    store: &'a dyn DocumentStore,
}

impl<'a> Auditor<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store }
    }

    pub async fn audit(&self, scope: &AuditScope) -> Result<AuditReport> {
        let filters = scope.filters();
        let slot_docs = query_sorted(
            self.store,
            Collection::Slots,
            Query::new().filters(filters.clone()),
            fields::SEQUENCE_NUMBER,
        )
        .await?;
        let response_docs = self
            .store
            .query(Collection::Responses, &Query::new().filters(filters))
            .await?;

        let mut refs = ReferenceCache::new(self.store);
        let mut findings = Vec::new();
        let mut consistent_links = 0usize;

        let slots = decode_each(&slot_docs, Collection::Slots, Slot::from_document, &mut findings);
        let responses = decode_each(
            &response_docs,
            Collection::Responses,
            Response::from_document,
            &mut findings,
        );

        findings.extend(series_shape_findings(&slots));

        for slot in &slots {
            match self.check_slot(&mut refs, slot).await? {
                Some(finding) => findings.push(finding),
                None if slot.is_completed() => consistent_links += 1,
                None => {}
            }
        }
        for response in &responses {
            if let Some(finding) = self.check_response(&mut refs, response).await? {
                findings.push(finding);
            }
        }

        findings.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        findings.dedup_by(|a, b| a.finding_id == b.finding_id);

        for finding in &findings {
            debug!(
                finding_id = %finding.finding_id,
                reason = %finding.reason,
                series = %finding.series,
                slot_id = finding.slot_id.as_deref().unwrap_or("-"),
                response_id = finding.response_id.as_deref().unwrap_or("-"),
                "finding recorded"
            );
        }
        info!(
            scope = %scope,
            slots = slot_docs.len(),
            responses = response_docs.len(),
            findings = findings.len(),
            "audit complete"
        );

        Ok(AuditReport {
            scope: scope.clone(),
            slots_scanned: slot_docs.len(),
            responses_scanned: response_docs.len(),
            consistent_links,
            findings,
        })
    }

    async fn check_slot(
        &self,
        refs: &mut ReferenceCache<'_>,
        slot: &Slot,
    ) -> Result<Option<Finding>> {
        let series = slot.series_key();
        let sid = slot.slot_id.as_str();

        let Some(link) = slot.linked_response_id.as_deref() else {
            if slot.is_completed() {
                return Ok(Some(Finding::new(
                    Reason::CompletedWithoutResponse,
                    series,
                    Some(sid),
                    None,
                    format!(
                        "slot #{} is completed but has no linked response",
                        slot.sequence_number
                    ),
                )));
            }
            if slot.completed_at.is_some() || slot.score.is_some() {
                return Ok(Some(Finding::new(
                    Reason::PendingWithStaleFields,
                    series,
                    Some(sid),
                    None,
                    "pending slot still carries completedAt or score",
                )));
            }
            return Ok(None);
        };

        let response_doc = match refs.resolve(Collection::Responses, link).await? {
            Resolution::Found(doc) => doc,
            Resolution::Missing => {
                let reason = if slot.is_completed() {
                    Reason::ResponseMissing
                } else {
                    Reason::PendingWithDanglingLink
                };
                return Ok(Some(Finding::new(
                    reason,
                    series,
                    Some(sid),
                    None,
                    format!("linked response {link} does not exist"),
                )));
            }
            Resolution::Ambiguous(count) => {
                return Ok(Some(Finding::new(
                    Reason::AmbiguousReference,
                    series,
                    Some(sid),
                    None,
                    format!("linked response {link} matches {count} documents"),
                )));
            }
        };
        let response = match Response::from_document(&response_doc) {
            Ok(response) => response,
            Err(err) => return Ok(Some(corrupt_record(Collection::Responses, &response_doc, &err))),
        };
        let points_back = refs
            .points_to(Collection::Slots, response.linked_slot_id.as_deref(), sid)
            .await?;

        let finding = match (slot.is_completed(), points_back) {
            (true, true) => None,
            (false, true) => Some(Finding::new(
                Reason::StatusNotCompleted,
                series,
                Some(sid),
                Some(&response.response_id),
                "slot and response are linked but the slot is still pending",
            )),
            (true, false) => Some(Finding::new(
                Reason::ResponsePointsElsewhere,
                series,
                Some(sid),
                Some(&response.response_id),
                format!(
                    "response links to {}",
                    response.linked_slot_id.as_deref().unwrap_or("nothing")
                ),
            )),
            (false, false) => Some(Finding::new(
                Reason::PendingWithDanglingLink,
                series,
                Some(sid),
                Some(&response.response_id),
                "pending slot references a response that belongs elsewhere",
            )),
        };
        Ok(finding)
    }

    async fn check_response(
        &self,
        refs: &mut ReferenceCache<'_>,
        response: &Response,
    ) -> Result<Option<Finding>> {
        let series = response.series_key();
        let rid = response.response_id.as_str();

        let Some(link) = response.linked_slot_id.as_deref() else {
            return Ok(Some(Finding::new(
                Reason::Unlinked,
                series,
                None,
                Some(rid),
                "response has no linked slot",
            )));
        };

        let slot_doc = match refs.resolve(Collection::Slots, link).await? {
            Resolution::Found(doc) => doc,
            Resolution::Missing => {
                return Ok(Some(Finding::new(
                    Reason::SlotMissing,
                    series,
                    None,
                    Some(rid),
                    format!("linked slot {link} does not exist"),
                )));
            }
            Resolution::Ambiguous(count) => {
                return Ok(Some(Finding::new(
                    Reason::AmbiguousReference,
                    series,
                    None,
                    Some(rid),
                    format!("linked slot {link} matches {count} documents"),
                )));
            }
        };
        let slot = match Slot::from_document(&slot_doc) {
            Ok(slot) => slot,
            Err(err) => return Ok(Some(corrupt_record(Collection::Slots, &slot_doc, &err))),
        };

        let Some(back) = slot.linked_response_id.as_deref() else {
            return Ok(Some(Finding::new(
                Reason::SlotNotLinked,
                series,
                Some(&slot.slot_id),
                Some(rid),
                format!("slot #{} has no link back", slot.sequence_number),
            )));
        };
        if refs.points_to(Collection::Responses, Some(back), rid).await? {
            // Agreement; the slot side reports anything else about this pair.
            return Ok(None);
        }
        Ok(Some(Finding::new(
            Reason::SlotPointsElsewhere,
            series,
            Some(&slot.slot_id),
            Some(rid),
            format!("slot #{} links to {back}", slot.sequence_number),
        )))
    }
}

/// Decode every document, turning the ones that fail into findings.
fn decode_each<T>(
    docs: &[Document],
    collection: Collection,
    decode: impl Fn(&Document) -> std::result::Result<T, StoreError>,
    findings: &mut Vec<Finding>,
) -> Vec<T> {
    let mut decoded = Vec::with_capacity(docs.len());
    for doc in docs {
        match decode(doc) {
            Ok(record) => decoded.push(record),
            Err(err) => {
                warn!(collection = %collection, id = %doc.id, error = %err, "undecodable document");
                findings.push(corrupt_record(collection, doc, &err));
            }
        }
    }
    decoded
}

/// Series is read from the raw body; fields that are missing or not strings
/// become empty.
fn corrupt_record(collection: Collection, doc: &Document, err: &StoreError) -> Finding {
    let text = |field: &str| {
        doc.fields
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let series = SeriesKey::new(text(fields::CLIENT_ID), text(fields::FORM_ID));
    let (slot_id, response_id) = match collection {
        Collection::Slots => (Some(doc.id.as_str()), None),
        Collection::Responses => (None, Some(doc.id.as_str())),
    };
    Finding::new(Reason::Undecodable, series, slot_id, response_id, err.to_string())
}

/// Series shape: one anchor, no reused sequence numbers.
fn series_shape_findings(slots: &[Slot]) -> Vec<Finding> {
    let mut by_series: BTreeMap<SeriesKey, BTreeMap<u32, BTreeSet<&str>>> = BTreeMap::new();
    for slot in slots {
        by_series
            .entry(slot.series_key())
            .or_default()
            .entry(slot.sequence_number)
            .or_default()
            .insert(slot.slot_id.as_str());
    }

    let mut findings = Vec::new();
    for (series, by_seq) in by_series {
        if !by_seq.contains_key(&1) {
            findings.push(Finding::new(
                Reason::NoAnchor,
                series.clone(),
                None,
                None,
                "series has no slot with sequenceNumber 1",
            ));
        }
        for (seq, ids) in by_seq {
            if ids.len() > 1 {
                for id in &ids {
                    findings.push(Finding::new(
                        Reason::SequenceReused,
                        series.clone(),
                        Some(*id),
                        None,
                        format!("sequenceNumber {seq} is shared by {} slots", ids.len()),
                    ));
                }
            }
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SlotStatus;
    use crate::schema::tests::{make_response, make_slot};
    use crate::store::{MemoryStore, WriteOp};

    fn linked_pair(slot_id: &str, response_id: &str, seq: u32) -> (Slot, Response) {
        let mut slot = make_slot(slot_id, "c1", "f1", seq);
        let response = make_response(response_id, "c1", "f1", Some(seq), Some(slot_id));
        slot.complete_with(&response);
        (slot, response)
    }

    async fn put(store: &MemoryStore, slots: &[Slot], responses: &[Response]) {
        let mut ops: Vec<WriteOp> = slots.iter().map(WriteOp::put_slot).collect();
        ops.extend(responses.iter().map(WriteOp::put_response));
        store.atomic_write(ops).await.unwrap();
    }

    fn reasons(report: &AuditReport) -> Vec<Reason> {
        report.findings.iter().map(|f| f.reason).collect()
    }

    #[tokio::test]
    async fn clean_series_has_no_findings() {
        let store = MemoryStore::default();
        let (s1, r1) = linked_pair("s1", "r1", 1);
        put(&store, &[s1, make_slot("s2", "c1", "f1", 2)], &[r1]).await;

        let report = Auditor::new(&store).audit(&AuditScope::All).await.unwrap();
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.consistent_links, 1);
        assert_eq!(report.slots_scanned, 2);
        assert_eq!(report.responses_scanned, 1);
    }

    #[tokio::test]
    async fn completed_slot_with_missing_response_is_orphan() {
        let store = MemoryStore::default();
        let (s1, _) = linked_pair("s1", "r-gone", 1);
        put(&store, &[s1], &[]).await;

        let report = Auditor::new(&store).audit(&AuditScope::Client("c1".into())).await.unwrap();
        assert_eq!(reasons(&report), vec![Reason::ResponseMissing]);
        assert_eq!(report.findings[0].kind, FindingKind::OrphanSlot);
        assert_eq!(report.findings[0].slot_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn response_pointing_at_missing_slot_is_orphan() {
        let store = MemoryStore::default();
        let response = make_response("r1", "c1", "f1", Some(2), Some("X"));
        let slots = [make_slot("s1", "c1", "f1", 1), make_slot("s2", "c1", "f1", 2)];
        put(&store, &slots, &[response]).await;

        let report = Auditor::new(&store).audit(&AuditScope::All).await.unwrap();
        assert_eq!(reasons(&report), vec![Reason::SlotMissing]);
        assert_eq!(report.count(FindingKind::OrphanResponse), 1);
    }

    #[tokio::test]
    async fn unlinked_response_is_surfaced() {
        let store = MemoryStore::default();
        let response = make_response("r1", "c1", "f1", Some(1), None);
        put(&store, &[make_slot("s1", "c1", "f1", 1)], &[response]).await;

        let report = Auditor::new(&store).audit(&AuditScope::All).await.unwrap();
        assert_eq!(reasons(&report), vec![Reason::Unlinked]);
    }

    #[tokio::test]
    async fn disagreeing_pair_is_mismatched() {
        let store = MemoryStore::default();
        let (s1, _) = linked_pair("s1", "r1", 1);
        let (s2, r2) = linked_pair("s2", "r2", 2);
        // r1 claims slot s2, which is linked to r2.
        let r1 = make_response("r1", "c1", "f1", Some(1), Some("s2"));
        put(&store, &[s1, s2], &[r1, r2]).await;

        let report = Auditor::new(&store).audit(&AuditScope::All).await.unwrap();
        assert_eq!(
            reasons(&report),
            vec![Reason::ResponsePointsElsewhere, Reason::SlotPointsElsewhere]
        );
        assert_eq!(report.count(FindingKind::MismatchedLink), 2);
    }

    #[tokio::test]
    async fn pending_slot_half_states_are_reported() {
        let store = MemoryStore::default();
        let mut stale = make_slot("s1", "c1", "f1", 1);
        stale.score = Some(3.0);
        let mut half_linked = make_slot("s2", "c1", "f1", 2);
        half_linked.linked_response_id = Some("r2".into());
        let r2 = make_response("r2", "c1", "f1", Some(2), Some("s2"));
        put(&store, &[stale, half_linked], &[r2]).await;

        let report = Auditor::new(&store).audit(&AuditScope::All).await.unwrap();
        assert_eq!(
            reasons(&report),
            vec![Reason::PendingWithStaleFields, Reason::StatusNotCompleted]
        );
    }

    #[tokio::test]
    async fn missing_anchor_and_reused_sequence() {
        let store = MemoryStore::default();
        put(
            &store,
            &[
                make_slot("a", "c1", "f1", 2),
                make_slot("b", "c1", "f1", 2),
                make_slot("c", "c1", "f1", 3),
            ],
            &[],
        )
        .await;

        let report = Auditor::new(&store).audit(&AuditScope::All).await.unwrap();
        assert_eq!(report.count(FindingKind::MissingAnchor), 1);
        assert_eq!(report.count(FindingKind::DuplicateSequence), 2);
    }

    #[tokio::test]
    async fn mirrored_id_links_count_as_consistent() {
        let store = MemoryStore::default();
        let mut slot = make_slot("s1", "c1", "f1", 1);
        slot.status = SlotStatus::Completed;
        slot.linked_response_id = Some("legacy-r".into());
        let response = make_response("r-doc", "c1", "f1", Some(1), Some("s1"));
        let mut fields = response.to_fields();
        fields.insert("responseId".into(), Value::from("legacy-r"));
        store.insert_raw(Collection::Responses, "r-doc", fields).await;
        put(&store, &[slot], &[]).await;

        let report = Auditor::new(&store).audit(&AuditScope::All).await.unwrap();
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.consistent_links, 1);
    }

    #[tokio::test]
    async fn audit_is_deterministic_and_read_only() {
        let store = MemoryStore::default();
        let mut slots = Vec::new();
        let mut responses = Vec::new();
        for n in 1..=6u32 {
            let (slot, response) = linked_pair(&format!("s{n}"), &format!("r{n}"), n);
            slots.push(slot);
            if n % 2 == 0 {
                responses.push(response);
            }
        }
        responses.push(make_response("stray", "c1", "f1", Some(9), Some("nowhere")));
        put(&store, &slots, &responses).await;

        let auditor = Auditor::new(&store);
        let first = auditor.audit(&AuditScope::All).await.unwrap();
        let second = auditor.audit(&AuditScope::All).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.count(FindingKind::OrphanSlot), 3);
        assert_eq!(first.count(FindingKind::OrphanResponse), 1);

        let ids: BTreeSet<&str> = first.findings.iter().map(|f| f.finding_id.as_str()).collect();
        assert_eq!(ids.len(), first.findings.len());
        assert_eq!(store.len(Collection::Slots).await, 6);
        let doc = store.get(Collection::Slots, "s1").await.unwrap().unwrap();
        assert_eq!(Slot::from_document(&doc).unwrap().status, SlotStatus::Completed);
    }

    #[tokio::test]
    async fn report_does_not_depend_on_scan_order() {
        let mut slots = Vec::new();
        let mut responses = Vec::new();
        for n in 1..=8u32 {
            let (slot, response) = linked_pair(&format!("s{n}"), &format!("r{n}"), n);
            slots.push(slot);
            if n % 3 != 0 {
                responses.push(response);
            }
        }
        responses.push(make_response("stray", "c1", "f1", Some(4), Some("nowhere")));
        responses.push(make_response("loose", "c1", "f1", Some(5), None));

        let unordered = MemoryStore::default();
        put(&unordered, &slots, &responses).await;
        let indexed = MemoryStore::default().with_sort_support(true);
        slots.reverse();
        responses.reverse();
        for slot in &slots {
            put(&indexed, std::slice::from_ref(slot), &[]).await;
        }
        for response in &responses {
            put(&indexed, &[], std::slice::from_ref(response)).await;
        }

        let a = Auditor::new(&unordered).audit(&AuditScope::All).await.unwrap();
        let b = Auditor::new(&indexed).audit(&AuditScope::All).await.unwrap();
        assert!(!a.is_clean());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn undecodable_document_is_reported_and_the_scan_continues() {
        let store = MemoryStore::default();
        let (s1, r1) = linked_pair("s1", "r1", 1);
        put(&store, &[s1], &[r1]).await;

        let mut o1 = make_slot("o1", "c2", "f1", 1);
        let migrated = make_response("r9", "c2", "f1", Some(1), Some("o1"));
        o1.complete_with(&migrated);
        let mut fields = migrated.to_fields();
        fields.remove("score");
        store.insert_raw(Collection::Responses, "r9", fields).await;
        put(&store, &[o1], &[]).await;

        let report = Auditor::new(&store).audit(&AuditScope::All).await.unwrap();
        assert_eq!(reasons(&report), vec![Reason::Undecodable]);
        let finding = &report.findings[0];
        assert_eq!(finding.kind, FindingKind::CorruptRecord);
        assert_eq!(finding.series, SeriesKey::new("c2", "f1"));
        assert_eq!(finding.response_id.as_deref(), Some("r9"));
        assert!(finding.detail.contains("score"));
        assert_eq!(report.responses_scanned, 2);
        assert_eq!(report.consistent_links, 1);
    }

    #[tokio::test]
    async fn scope_limits_records() {
        let store = MemoryStore::default();
        let (s1, _) = linked_pair("s1", "gone", 1);
        let mut other = make_slot("o1", "c2", "f1", 1);
        other.status = SlotStatus::Completed;
        put(&store, &[s1, other], &[]).await;

        let auditor = Auditor::new(&store);
        let client = auditor.audit(&AuditScope::Client("c2".into())).await.unwrap();
        assert_eq!(reasons(&client), vec![Reason::CompletedWithoutResponse]);
        let series = auditor
            .audit(&AuditScope::Series(SeriesKey::new("c1", "f1")))
            .await
            .unwrap();
        assert_eq!(reasons(&series), vec![Reason::ResponseMissing]);
    }

    #[test]
    fn finding_ids_are_stable() {
        let series = SeriesKey::new("c1", "f1");
        let a = Finding::new(Reason::SlotMissing, series.clone(), None, Some("r1"), "x");
        let b = Finding::new(Reason::SlotMissing, series.clone(), None, Some("r1"), "y");
        let c = Finding::new(Reason::SlotMissing, series, None, Some("r2"), "x");
        assert_eq!(a.finding_id, b.finding_id);
        assert_ne!(a.finding_id, c.finding_id);
        assert_eq!(a.finding_id.len(), 16);
    }
}
