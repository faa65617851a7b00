//! Storage collaborator contract and the in-memory backend.
//!
//! The lifecycle never talks to a concrete database.  Everything goes
//! through [`DocumentStore`], which models a managed document database with
//! four capabilities:
//!
//! | Call           | Semantics                                                  |
//! |----------------|------------------------------------------------------------|
//! | `get`          | Fetch one document by id                                   |
//! | `query`        | Equality filters plus an optional sort field               |
//! | `atomic_write` | All-or-nothing multi-document write with preconditions     |
//! | `batch_write`  | Bulk write capped at [`DocumentStore::max_batch_ops`] ops  |
//!
//! Ordered queries may be refused with [`StoreError::MissingIndex`] (no
//! composite index); [`query_sorted`] falls back to an unordered scan and
//! sorts in memory.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use checkin_config::StorageConfig;

use crate::error::{LifecycleError, StoreError};
use crate::schema::{Collection, Response, Slot};

/// A stored record: document id plus a JSON object body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn filters(mut self, filters: Vec<(String, Value)>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| fields.get(field) == Some(expected))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// The document must already exist.
    Exists,
    /// The document must not exist yet.
    Absent,
    /// The document must exist and `field` must currently equal `value`.
    FieldEquals { field: String, value: Value },
}

/// Merge `fields` into document `collection/id`, creating it if absent.
/// A `null` value clears the field.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub collection: Collection,
    pub id: String,
    pub fields: Map<String, Value>,
    pub precondition: Option<Precondition>,
}

impl WriteOp {
    pub fn put_slot(slot: &Slot) -> Self {
        Self {
            collection: Collection::Slots,
            id: slot.slot_id.clone(),
            fields: slot.to_fields(),
            precondition: None,
        }
    }

    pub fn put_response(response: &Response) -> Self {
        Self {
            collection: Collection::Responses,
            id: response.response_id.clone(),
            fields: response.to_fields(),
            precondition: None,
        }
    }

    pub fn expect(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Vec<Document>, StoreError>;

    /// Apply every op or none.  Preconditions are checked against the state
    /// before any op in the set is applied.
    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    /// Bulk write of at most [`Self::max_batch_ops`] operations.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    fn max_batch_ops(&self) -> usize;
}

// ── Shared write semantics ────────────────────────────────────────────────────

pub(crate) fn merge_fields(
    existing: Option<&Map<String, Value>>,
    patch: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = existing.cloned().unwrap_or_default();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

pub(crate) fn check_precondition(
    op: &WriteOp,
    current: Option<&Map<String, Value>>,
) -> Result<(), StoreError> {
    let failed = |detail: String| StoreError::PreconditionFailed {
        collection: op.collection,
        id: op.id.clone(),
        detail,
    };
    match (&op.precondition, current) {
        (None, _) => Ok(()),
        (Some(Precondition::Absent), None) => Ok(()),
        (Some(Precondition::Absent), Some(_)) => Err(failed("document already exists".to_string())),
        (Some(_), None) => Err(failed("document does not exist".to_string())),
        (Some(Precondition::Exists), Some(_)) => Ok(()),
        (Some(Precondition::FieldEquals { field, value }), Some(doc)) => {
            let actual = doc.get(field).cloned().unwrap_or(Value::Null);
            if &actual == value {
                Ok(())
            } else {
                Err(failed(format!("{field} is {actual}, expected {value}")))
            }
        }
    }
}

/// Total order over JSON scalars used for in-memory sorting.
pub(crate) fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .unwrap_or_default()
            .partial_cmp(&b.as_f64().unwrap_or_default())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

pub(crate) fn sort_documents(docs: &mut [Document], field: &str) {
    docs.sort_by(|a, b| {
        compare_values(a.fields.get(field), b.fields.get(field)).then_with(|| a.id.cmp(&b.id))
    });
}

// ── Helpers over any store ────────────────────────────────────────────────────

/// Ordered query that tolerates backends without a suitable index.
pub async fn query_sorted(
    store: &dyn DocumentStore,
    collection: Collection,
    query: Query,
    order_by: &str,
) -> Result<Vec<Document>, StoreError> {
    let ordered = query.clone().order_by(order_by);
    match store.query(collection, &ordered).await {
        Ok(docs) => Ok(docs),
        Err(StoreError::MissingIndex { .. }) => {
            debug!(%collection, order_by, "ordered query unsupported; sorting in memory");
            let mut docs = store.query(collection, &query).await?;
            sort_documents(&mut docs, order_by);
            Ok(docs)
        }
        Err(err) => Err(err),
    }
}

/// Resolve a reference that may hold either a document id or a value of the
/// collection's mirrored id field.
///
/// Document id lookup wins.  The field-equality fallback must hit exactly one
/// document; several hits are surfaced as [`LifecycleError::AmbiguousMatch`].
pub async fn resolve_reference(
    store: &dyn DocumentStore,
    collection: Collection,
    candidate_id: &str,
) -> Result<Option<Document>, LifecycleError> {
    if candidate_id.is_empty() {
        return Ok(None);
    }
    if let Some(doc) = store.get(collection, candidate_id).await? {
        return Ok(Some(doc));
    }

    let fallback = Query::new().filter(collection.id_field(), candidate_id);
    let mut hits = store.query(collection, &fallback).await?;
    match hits.len() {
        0 => Ok(None),
        1 => {
            debug!(
                %collection,
                candidate_id,
                doc_id = %hits[0].id,
                "reference resolved via mirrored id field"
            );
            Ok(hits.pop())
        }
        count => Err(LifecycleError::AmbiguousMatch {
            target: format!("{collection}.{}={candidate_id}", collection.id_field()),
            count,
        }),
    }
}

pub async fn load_slots(store: &dyn DocumentStore, query: Query) -> Result<Vec<Slot>, StoreError> {
    let docs =
        query_sorted(store, Collection::Slots, query, crate::schema::fields::SEQUENCE_NUMBER)
            .await?;
    docs.iter().map(Slot::from_document).collect()
}

pub async fn load_responses(
    store: &dyn DocumentStore,
    query: Query,
) -> Result<Vec<Response>, StoreError> {
    let mut docs = store.query(Collection::Responses, &query).await?;
    sort_documents(&mut docs, "submittedAt");
    docs.iter().map(Response::from_document).collect()
}

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Bounded retry for transient write failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            max_retries: config.max_write_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Run `op`, retrying only on [`StoreError::Unavailable`].
pub async fn with_write_retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(label, attempt, error = %err, "transient write failure; retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

type CollectionMap = HashMap<String, Map<String, Value>>;

/// Ephemeral [`DocumentStore`].  Iteration order is that of a `HashMap` and
/// therefore unspecified, like a real scan.
#[derive(Debug)]
pub struct MemoryStore {
    docs: Mutex<HashMap<Collection, CollectionMap>>,
    max_batch_ops: usize,
    sort_support: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(500)
    }
}

impl MemoryStore {
    pub fn new(max_batch_ops: usize) -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            max_batch_ops: max_batch_ops.max(1),
            sort_support: false,
        }
    }

    /// Serve ordered queries natively instead of reporting a missing index.
    pub fn with_sort_support(mut self, enabled: bool) -> Self {
        self.sort_support = enabled;
        self
    }

    pub async fn len(&self, collection: Collection) -> usize {
        self.docs
            .lock()
            .await
            .get(&collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Replace a document wholesale, bypassing merge semantics.  Used to seed
    /// migrated or hand-crafted data.
    pub async fn insert_raw(&self, collection: Collection, id: &str, fields: Map<String, Value>) {
        self.docs
            .lock()
            .await
            .entry(collection)
            .or_default()
            .insert(id.to_string(), fields);
    }

    fn apply(
        docs: &mut HashMap<Collection, CollectionMap>,
        ops: &[WriteOp],
    ) -> Result<(), StoreError> {
        for op in ops {
            let current = docs.get(&op.collection).and_then(|c| c.get(&op.id));
            check_precondition(op, current)?;
        }
        for op in ops {
            let table = docs.entry(op.collection).or_default();
            let merged = merge_fields(table.get(&op.id), &op.fields);
            table.insert(op.id.clone(), merged);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let docs = self.docs.lock().await;
        Ok(docs
            .get(&collection)
            .and_then(|c| c.get(id))
            .map(|fields| Document {
                id: id.to_string(),
                fields: fields.clone(),
            }))
    }

    async fn query(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Vec<Document>, StoreError> {
        if let Some(field) = &query.order_by {
            if !self.sort_support {
                return Err(StoreError::MissingIndex {
                    collection,
                    field: field.clone(),
                });
            }
        }
        let docs = self.docs.lock().await;
        let mut hits: Vec<Document> = docs
            .get(&collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, fields)| query.matches(fields))
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(field) = &query.order_by {
            sort_documents(&mut hits, field);
        }
        Ok(hits)
    }

    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().await;
        Self::apply(&mut docs, &ops)
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if ops.len() > self.max_batch_ops {
            return Err(StoreError::BatchTooLarge {
                len: ops.len(),
                max: self.max_batch_ops,
            });
        }
        let mut docs = self.docs.lock().await;
        Self::apply(&mut docs, &ops)
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}
