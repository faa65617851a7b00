/// Embedded [`DocumentStore`] backed by [`redb`].
///
/// One redb table per collection; values are the JSON-encoded document body.
/// Every `atomic_write` and `batch_write` is a single redb write transaction,
/// so a failed precondition or a crash leaves no partial state behind.
///
/// # Tables
///
/// | Name        | Key                | Value                     |
/// |-------------|--------------------|---------------------------|
/// | `slots`     | document id (str)  | JSON object (camelCase)   |
/// | `responses` | document id (str)  | JSON object (camelCase)   |
///
/// redb has no secondary indexes here: queries are full scans filtered in
/// memory, and ordered queries report [`StoreError::MissingIndex`] so callers
/// take the scan-then-sort path.
use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::schema::Collection;
use crate::store::{Document, DocumentStore, Query, WriteOp, check_precondition, merge_fields};

// ── redb table definitions ────────────────────────────────────────────────────

const SLOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("slots");
const RESPONSES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("responses");

fn table_for(collection: Collection) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match collection {
        Collection::Slots => SLOTS_TABLE,
        Collection::Responses => RESPONSES_TABLE,
    }
}

fn backend(err: impl Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn decode(
    collection: Collection,
    id: &str,
    bytes: &[u8],
) -> Result<Map<String, Value>, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Corrupt {
        collection,
        id: id.to_string(),
        detail: err.to_string(),
    })
}

/// Document counts per collection, for `checkin doctor`.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub slots: usize,
    pub responses: usize,
}

pub struct RedbStore {
    db: Database,
    path: PathBuf,
    max_batch_ops: usize,
}

impl RedbStore {
    /// Open or create the redb file at `path`.
    pub fn open(path: impl AsRef<Path>, max_batch_ops: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)
            .with_context(|| format!("opening redb store at {}", path.display()))?;

        // Ensure tables exist.
        {
            let tx = db.begin_write()?;
            tx.open_table(SLOTS_TABLE)?;
            tx.open_table(RESPONSES_TABLE)?;
            tx.commit()?;
        }

        tracing::debug!(path = %path.display(), "redb store opened");
        Ok(Self {
            db,
            path,
            max_batch_ops: max_batch_ops.max(1),
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let tx = self.db.begin_read()?;
        let slots = tx.open_table(SLOTS_TABLE)?.len()? as usize;
        let responses = tx.open_table(RESPONSES_TABLE)?.len()? as usize;
        Ok(StoreStats { slots, responses })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let tx = self.db.begin_write().map_err(backend)?;
        let outcome = (|| -> Result<(), StoreError> {
            for op in ops {
                let tbl = tx.open_table(table_for(op.collection)).map_err(backend)?;
                let current = match tbl.get(op.id.as_str()).map_err(backend)? {
                    Some(v) => Some(decode(op.collection, &op.id, v.value())?),
                    None => None,
                };
                check_precondition(op, current.as_ref())?;
            }
            for op in ops {
                let mut tbl = tx.open_table(table_for(op.collection)).map_err(backend)?;
                let current = match tbl.get(op.id.as_str()).map_err(backend)? {
                    Some(v) => Some(decode(op.collection, &op.id, v.value())?),
                    None => None,
                };
                let merged = merge_fields(current.as_ref(), &op.fields);
                let bytes = serde_json::to_vec(&merged).map_err(backend)?;
                tbl.insert(op.id.as_str(), bytes.as_slice()).map_err(backend)?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => tx.commit().map_err(backend),
            Err(err) => {
                tx.abort().map_err(backend)?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl DocumentStore for RedbStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let tx = self.db.begin_read().map_err(backend)?;
        let tbl = tx.open_table(table_for(collection)).map_err(backend)?;
        match tbl.get(id).map_err(backend)? {
            None => Ok(None),
            Some(v) => Ok(Some(Document {
                id: id.to_string(),
                fields: decode(collection, id, v.value())?,
            })),
        }
    }

    async fn query(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Vec<Document>, StoreError> {
        if let Some(field) = &query.order_by {
            return Err(StoreError::MissingIndex {
                collection,
                field: field.clone(),
            });
        }
        let tx = self.db.begin_read().map_err(backend)?;
        let tbl = tx.open_table(table_for(collection)).map_err(backend)?;
        let mut hits = Vec::new();
        for row in tbl.iter().map_err(backend)? {
            let (key, value) = row.map_err(backend)?;
            let id = key.value().to_string();
            let fields = decode(collection, &id, value.value())?;
            if query.matches(&fields) {
                hits.push(Document { id, fields });
            }
        }
        Ok(hits)
    }

    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.write_all(&ops)
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if ops.len() > self.max_batch_ops {
            return Err(StoreError::BatchTooLarge {
                len: ops.len(),
                max: self.max_batch_ops,
            });
        }
        self.write_all(&ops)
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::schema::Slot;
    use crate::schema::tests::make_slot;
    use crate::store::{Precondition, load_slots};

    #[tokio::test]
    async fn write_get_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.redb");
        {
            let store = RedbStore::open(&path, 10).unwrap();
            let slot = make_slot("s1", "c1", "f1", 1);
            store.atomic_write(vec![WriteOp::put_slot(&slot)]).await.unwrap();
        }
        let store = RedbStore::open(&path, 10).unwrap();
        let doc = store.get(Collection::Slots, "s1").await.unwrap().unwrap();
        let slot = Slot::from_document(&doc).unwrap();
        assert_eq!(slot.client_id, "c1");
        assert_eq!(store.stats().unwrap().slots, 1);
    }

    #[tokio::test]
    async fn precondition_failure_rolls_back_transaction() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path().join("store.redb"), 10).unwrap();
        let guarded =
            WriteOp::put_slot(&make_slot("s1", "c1", "f1", 1)).expect(Precondition::Exists);
        let other = WriteOp::put_slot(&make_slot("s2", "c1", "f1", 2));
        let err = store.atomic_write(vec![other, guarded]).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));
        assert_eq!(store.stats().unwrap().slots, 0);
    }

    #[tokio::test]
    async fn ordered_queries_take_the_scan_path() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path().join("store.redb"), 10).unwrap();
        for n in [2, 3, 1] {
            let slot = make_slot(&format!("s{n}"), "c1", "f1", n);
            store.atomic_write(vec![WriteOp::put_slot(&slot)]).await.unwrap();
        }
        store
            .atomic_write(vec![WriteOp::put_slot(&make_slot("x", "c2", "f1", 1))])
            .await
            .unwrap();

        let slots = load_slots(&store, Query::new().filter("clientId", "c1")).await.unwrap();
        let ids: Vec<&str> = slots.iter().map(|s| s.slot_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
    }

    #[tokio::test]
    async fn merge_clears_fields_set_to_null() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path().join("store.redb"), 10).unwrap();
        let mut slot = make_slot("s1", "c1", "f1", 1);
        slot.score = Some(4.0);
        store.atomic_write(vec![WriteOp::put_slot(&slot)]).await.unwrap();

        let mut patch = Map::new();
        patch.insert("score".into(), Value::Null);
        store
            .atomic_write(vec![WriteOp {
                collection: Collection::Slots,
                id: "s1".into(),
                fields: patch,
                precondition: None,
            }])
            .await
            .unwrap();
        let doc = store.get(Collection::Slots, "s1").await.unwrap().unwrap();
        assert_eq!(doc.fields["score"], Value::Null);
    }
}
