//! StateStore: redb-backed state persistence for WaterHack.
//!
//! Provides typed CRUD operations over fields, demands and delivery audit
//! records. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(FIELDS).map_err(map_err!(Table))?;
        txn.open_table(DEMANDS).map_err(map_err!(Table))?;
        txn.open_table(DELIVERIES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Fields ─────────────────────────────────────────────────────

    /// Insert or update a field.
    pub fn put_field(&self, field: &Field) -> StateResult<()> {
        self.put_json(FIELDS, &field.id, field)?;
        debug!(field_id = %field.id, "field stored");
        Ok(())
    }

    /// Get a field by id.
    pub fn get_field(&self, id: &str) -> StateResult<Option<Field>> {
        self.get_json(FIELDS, id)
    }

    /// List all fields, ordered by id.
    pub fn list_fields(&self) -> StateResult<Vec<Field>> {
        self.scan_json(FIELDS, "")
    }

    /// Delete a field by id. Returns true if it existed.
    pub fn delete_field(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove(FIELDS, id)?;
        debug!(field_id = %id, existed, "field deleted");
        Ok(existed)
    }

    // ── Demands ────────────────────────────────────────────────────

    /// Insert or update a demand.
    pub fn put_demand(&self, demand: &Demand) -> StateResult<()> {
        self.put_json(DEMANDS, &demand.table_key(), demand)?;
        debug!(demand_id = demand.id, status = %demand.status, "demand stored");
        Ok(())
    }

    /// Get a demand by id.
    pub fn get_demand(&self, id: DemandId) -> StateResult<Option<Demand>> {
        self.get_json(DEMANDS, &demand_key(id))
    }

    /// List all demands in submission order.
    pub fn list_demands(&self) -> StateResult<Vec<Demand>> {
        self.scan_json(DEMANDS, "")
    }

    // ── Deliveries ─────────────────────────────────────────────────

    /// Persist the demand and the audit record of its finished session in a
    /// single transaction.
    pub fn finish_delivery(&self, demand: &Demand, record: &DeliveryRecord) -> StateResult<()> {
        let demand_value = serde_json::to_vec(demand).map_err(map_err!(Serialize))?;
        let record_value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut demands = txn.open_table(DEMANDS).map_err(map_err!(Table))?;
            demands
                .insert(demand.table_key().as_str(), demand_value.as_slice())
                .map_err(map_err!(Write))?;
            let mut deliveries = txn.open_table(DELIVERIES).map_err(map_err!(Table))?;
            deliveries
                .insert(record.table_key().as_str(), record_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            demand_id = demand.id,
            seq = record.seq,
            delivered_m3 = record.delivered_volume_m3,
            "delivery record stored"
        );
        Ok(())
    }

    /// List the delivery records of a demand in session order.
    pub fn list_deliveries_for_demand(&self, id: DemandId) -> StateResult<Vec<DeliveryRecord>> {
        self.scan_json(DELIVERIES, &format!("{}:", demand_key(id)))
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every value whose key starts with `prefix`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
