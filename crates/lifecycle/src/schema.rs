use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::store::Document;

/// Stored field names shared by queries and write ops.
pub mod fields {
    pub const SLOT_ID: &str = "slotId";
    pub const RESPONSE_ID: &str = "responseId";
    pub const CLIENT_ID: &str = "clientId";
    pub const FORM_ID: &str = "formId";
    pub const SEQUENCE_NUMBER: &str = "sequenceNumber";
    pub const STATUS: &str = "status";
    pub const DUE_AT: &str = "dueAt";
}

/// Document collections the lifecycle reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Slots,
    Responses,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Self::Slots => "slots",
            Self::Responses => "responses",
        }
    }

    /// Field that mirrors the record's identifier inside the document body.
    /// Migrated records sometimes carry an id here that differs from the
    /// document id; reference resolution falls back to it.
    pub fn id_field(self) -> &'static str {
        match self {
            Self::Slots => fields::SLOT_ID,
            Self::Responses => fields::RESPONSE_ID,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Partition key of a recurring series: one client on one form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesKey {
    pub client_id: String,
    pub form_id: String,
}

impl SeriesKey {
    pub fn new(client_id: impl Into<String>, form_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            form_id: form_id.into(),
        }
    }

    /// Equality filters selecting every record of this series.
    pub fn filters(&self) -> Vec<(String, Value)> {
        vec![
            (fields::CLIENT_ID.to_string(), Value::from(self.client_id.as_str())),
            (fields::FORM_ID.to_string(), Value::from(self.form_id.as_str())),
        ]
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.form_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Pending,
    Completed,
}

impl SlotStatus {
    pub fn slug(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

/// Recurrence of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Once,
    #[default]
    Weekly,
    Fortnightly,
}

impl Frequency {
    /// Days between consecutive slots; `None` for one-off series.
    pub fn period_days(self) -> Option<i64> {
        match self {
            Self::Once => None,
            Self::Weekly => Some(7),
            Self::Fortnightly => Some(14),
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Weekly => "weekly",
            Self::Fortnightly => "fortnightly",
        }
    }
}

/// One scheduled occurrence of a recurring check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    /// Canonical id: always the document id once loaded from a store.
    #[serde(default)]
    pub slot_id: String,
    pub client_id: String,
    pub form_id: String,
    pub coach_id: String,
    pub sequence_number: u32,
    pub total_slots_planned: u32,
    #[serde(default)]
    pub frequency: Frequency,
    pub due_at: DateTime<Utc>,
    pub check_in_window_start: DateTime<Utc>,
    pub check_in_window_end: DateTime<Utc>,
    pub status: SlotStatus,
    #[serde(default)]
    pub linked_response_id: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub score: Option<f64>,
    /// Target date of the last alignment that moved this slot.
    #[serde(default)]
    pub last_alignment: Option<String>,
}

impl Slot {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.client_id, &self.form_id)
    }

    pub fn is_completed(&self) -> bool {
        self.status == SlotStatus::Completed
    }

    pub fn is_anchor(&self) -> bool {
        self.sequence_number == 1
    }

    /// Flip to Completed, denormalizing the response's timestamp and score.
    pub fn complete_with(&mut self, response: &Response) {
        self.status = SlotStatus::Completed;
        self.linked_response_id = Some(response.response_id.clone());
        self.completed_at = Some(response.submitted_at);
        self.score = Some(response.score);
    }

    pub fn reset_to_pending(&mut self) {
        self.status = SlotStatus::Pending;
        self.linked_response_id = None;
        self.completed_at = None;
        self.score = None;
    }

    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut slot: Slot = serde_json::from_value(Value::Object(doc.fields.clone()))
            .map_err(|err| StoreError::Corrupt {
                collection: Collection::Slots,
                id: doc.id.clone(),
                detail: err.to_string(),
            })?;
        slot.slot_id = doc.id.clone();
        Ok(slot)
    }

    pub fn to_fields(&self) -> Map<String, Value> {
        to_object(self)
    }
}

/// A client's submitted answer set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub response_id: String,
    pub client_id: String,
    pub form_id: String,
    pub coach_id: String,
    #[serde(default)]
    pub linked_slot_id: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<u32>,
    pub submitted_at: DateTime<Utc>,
    pub score: f64,
}

impl Response {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.client_id, &self.form_id)
    }

    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut response: Response = serde_json::from_value(Value::Object(doc.fields.clone()))
            .map_err(|err| StoreError::Corrupt {
                collection: Collection::Responses,
                id: doc.id.clone(),
                detail: err.to_string(),
            })?;
        response.response_id = doc.id.clone();
        Ok(response)
    }

    pub fn to_fields(&self) -> Map<String, Value> {
        to_object(self)
    }
}

fn to_object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        // Slot and Response are plain structs; they always serialize to objects.
        _ => Map::new(),
    }
}

/// First 8 characters of an id, used as a compact display identifier.
pub fn id_short(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((i, _)) => &id[..i],
        None => id,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;

    use super::*;

    pub(crate) fn make_slot(id: &str, client: &str, form: &str, seq: u32) -> Slot {
        let due = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
            + chrono::Duration::days(7 * (seq as i64 - 1));
        Slot {
            slot_id: id.to_string(),
            client_id: client.to_string(),
            form_id: form.to_string(),
            coach_id: "coach-1".to_string(),
            sequence_number: seq,
            total_slots_planned: 4,
            frequency: Frequency::Weekly,
            due_at: due,
            check_in_window_start: due - chrono::Duration::days(1),
            check_in_window_end: due + chrono::Duration::days(2),
            status: SlotStatus::Pending,
            linked_response_id: None,
            completed_at: None,
            score: None,
            last_alignment: None,
        }
    }

    pub(crate) fn make_response(
        id: &str,
        client: &str,
        form: &str,
        seq: Option<u32>,
        linked: Option<&str>,
    ) -> Response {
        Response {
            response_id: id.to_string(),
            client_id: client.to_string(),
            form_id: form.to_string(),
            coach_id: "coach-1".to_string(),
            linked_slot_id: linked.map(String::from),
            sequence_number: seq,
            submitted_at: Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
            score: 8.5,
        }
    }

    #[test]
    fn slot_fields_use_camel_case() {
        let slot = make_slot("s1", "c1", "f1", 1);
        let fields = slot.to_fields();
        assert!(fields.contains_key("sequenceNumber"));
        assert!(fields.contains_key("checkInWindowStart"));
        assert_eq!(fields["status"], Value::from("pending"));
        assert_eq!(fields["linkedResponseId"], Value::Null);
    }

    #[test]
    fn document_id_wins_over_mirrored_field() {
        let mut fields = make_slot("legacy-id", "c1", "f1", 2).to_fields();
        fields.insert("slotId".into(), Value::from("legacy-id"));
        let doc = Document { id: "doc-7".into(), fields };
        let slot = Slot::from_document(&doc).unwrap();
        assert_eq!(slot.slot_id, "doc-7");
        assert_eq!(slot.sequence_number, 2);
    }

    #[test]
    fn corrupt_document_is_reported() {
        let mut fields = Map::new();
        fields.insert("clientId".into(), Value::from("c1"));
        let doc = Document { id: "broken".into(), fields };
        let err = Response::from_document(&doc).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { collection: Collection::Responses, .. }));
    }

    #[test]
    fn complete_then_reset_clears_denormalized_fields() {
        let mut slot = make_slot("s1", "c1", "f1", 1);
        let response = make_response("r1", "c1", "f1", Some(1), Some("s1"));
        slot.complete_with(&response);
        assert!(slot.is_completed());
        assert_eq!(slot.linked_response_id.as_deref(), Some("r1"));
        assert_eq!(slot.score, Some(8.5));
        slot.reset_to_pending();
        assert_eq!(slot.status, SlotStatus::Pending);
        assert!(slot.linked_response_id.is_none());
        assert!(slot.completed_at.is_none());
        assert!(slot.score.is_none());
    }

    #[test]
    fn frequency_periods() {
        assert_eq!(Frequency::Weekly.period_days(), Some(7));
        assert_eq!(Frequency::Once.period_days(), None);
    }

    #[test]
    fn id_short_truncates() {
        assert_eq!(id_short("0123456789abcdef"), "01234567");
        assert_eq!(id_short("abc"), "abc");
    }
}
