use super::{apply_record_outcome, blocking_batch, invalid_transition};
use crate::domain::batch::{
    BatchId, BatchKind, BatchState, BatchUpdate, DivisionBatch, DivisionRecord, RecordOutcome,
    StuckQuery,
};
use crate::domain::order::{DivisionStatus, Order};
use crate::domain::ports::{DivisionLedger, OrderStore};
use crate::domain::receiver::ChannelCode;
use crate::error::{DivisionError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for captured orders, keyed by order id.
pub const CF_ORDERS: &str = "orders";
/// Column Family for division batches, keyed by the 16-byte batch id.
pub const CF_BATCHES: &str = "batches";
/// Column Family for division records, keyed by batch id then receiver id.
pub const CF_RECORDS: &str = "records";
/// Column Family indexing batch ids by order id.
pub const CF_ORDER_BATCHES: &str = "order_batches";

/// A persistent order store and division ledger backed by RocksDB.
///
/// Values are JSON. Every read-decide-write sequence runs under one
/// process-local write mutex and commits through a single `WriteBatch`, so
/// the open-batch and transition compare-and-swaps are atomic within the
/// process that owns the database.
///
/// `Clone` shares the underlying `Arc<DB>` and the write mutex.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

fn record_key(batch_id: BatchId, receiver_id: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(batch_id.as_bytes());
    key[16..].copy_from_slice(&receiver_id.to_be_bytes());
    key
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_ORDERS, CF_BATCHES, CF_RECORDS, CF_ORDER_BATCHES]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| DivisionError::internal(format!("{name} column family not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<()> {
        batch.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn batch_ids_for(&self, order_id: &str) -> Result<Vec<BatchId>> {
        Ok(self
            .read::<Vec<BatchId>>(CF_ORDER_BATCHES, order_id)?
            .unwrap_or_default())
    }

    fn load_batch(&self, batch_id: BatchId) -> Result<DivisionBatch> {
        self.read(CF_BATCHES, batch_id.as_bytes())?
            .ok_or(DivisionError::BatchNotFound(batch_id))
    }

    fn load_batches(&self, ids: &[BatchId]) -> Result<Vec<DivisionBatch>> {
        ids.iter().map(|id| self.load_batch(*id)).collect()
    }
}

#[async_trait]
impl OrderStore for RocksDBStore {
    async fn insert(&self, order: Order) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        // Re-importing an order must not reset a division already underway.
        let order = match self.read::<Order>(CF_ORDERS, &order.id)? {
            Some(existing) => Order {
                division_status: existing.division_status,
                ..order
            },
            None => order,
        };
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_ORDERS, &order.id, &order)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, order_id: &str) -> Result<Option<Order>> {
        self.read(CF_ORDERS, order_id)
    }

    async fn mark_finished(&self, order_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut order: Order = self
            .read(CF_ORDERS, order_id)?
            .ok_or_else(|| DivisionError::OrderNotFound(order_id.to_string()))?;
        if order.division_status == DivisionStatus::Finished {
            return Ok(());
        }
        order.division_status = DivisionStatus::Finished;
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_ORDERS, order_id, &order)?;
        self.db.write(batch)?;
        Ok(())
    }
}

#[async_trait]
impl DivisionLedger for RocksDBStore {
    async fn open_batch(
        &self,
        order_id: &str,
        channel: &ChannelCode,
        kind: BatchKind,
    ) -> Result<(DivisionBatch, bool)> {
        let _guard = self.write_lock.lock().await;
        let order: Option<Order> = self.read(CF_ORDERS, order_id)?;
        let mut ids = self.batch_ids_for(order_id)?;
        let existing = self.load_batches(&ids)?;
        if let Some(batch) = blocking_batch(order_id, order.as_ref(), &existing)? {
            return Ok((batch.clone(), false));
        }

        let batch = DivisionBatch::new(order_id, channel.clone(), kind, Utc::now());
        ids.push(batch.id);
        let mut write = WriteBatch::default();
        if let Some(mut order) = order {
            order.division_status = DivisionStatus::Processing;
            self.put(&mut write, CF_ORDERS, order_id, &order)?;
        }
        self.put(&mut write, CF_BATCHES, batch.id.as_bytes(), &batch)?;
        self.put(&mut write, CF_ORDER_BATCHES, order_id, &ids)?;
        self.db.write(write)?;
        Ok((batch, true))
    }

    async fn append_records(&self, batch_id: BatchId, records: Vec<DivisionRecord>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.load_batch(batch_id)?;
        let mut write = WriteBatch::default();
        for record in &records {
            self.put(&mut write, CF_RECORDS, record_key(batch_id, record.receiver_id), record)?;
        }
        self.db.write(write)?;
        Ok(())
    }

    async fn transition_batch(
        &self,
        batch_id: BatchId,
        from: &[BatchState],
        to: BatchState,
        update: BatchUpdate,
    ) -> Result<DivisionBatch> {
        let _guard = self.write_lock.lock().await;
        let mut batch = self.load_batch(batch_id)?;
        if !from.contains(&batch.state) {
            return Err(invalid_transition(batch_id, batch.state, to));
        }
        batch
            .apply(to, update, Utc::now())
            .map_err(|(from, to)| invalid_transition(batch_id, from, to))?;
        let mut write = WriteBatch::default();
        self.put(&mut write, CF_BATCHES, batch_id.as_bytes(), &batch)?;
        self.db.write(write)?;
        Ok(batch)
    }

    async fn transition_records(
        &self,
        batch_id: BatchId,
        outcomes: &[RecordOutcome],
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut write = WriteBatch::default();
        for outcome in outcomes {
            let key = record_key(batch_id, outcome.receiver_id);
            if let Some(mut record) = self.read::<DivisionRecord>(CF_RECORDS, key)?
                && apply_record_outcome(&mut record, outcome)
            {
                self.put(&mut write, CF_RECORDS, key, &record)?;
            }
        }
        self.db.write(write)?;
        Ok(())
    }

    async fn record_attempt(&self, batch_id: BatchId) -> Result<DivisionBatch> {
        let _guard = self.write_lock.lock().await;
        let mut batch = self.load_batch(batch_id)?;
        batch.attempts += 1;
        batch.updated_at = Utc::now();
        let mut write = WriteBatch::default();
        self.put(&mut write, CF_BATCHES, batch_id.as_bytes(), &batch)?;
        self.db.write(write)?;
        Ok(batch)
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<DivisionBatch>> {
        self.read(CF_BATCHES, batch_id.as_bytes())
    }

    async fn records(&self, batch_id: BatchId) -> Result<Vec<DivisionRecord>> {
        let prefix = batch_id.as_bytes();
        let iter = self.db.iterator_cf(
            self.cf(CF_RECORDS)?,
            IteratorMode::From(prefix, Direction::Forward),
        );
        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    async fn batches_for_order(&self, order_id: &str) -> Result<Vec<DivisionBatch>> {
        self.load_batches(&self.batch_ids_for(order_id)?)
    }

    async fn list_stuck(&self, query: &StuckQuery) -> Result<Vec<DivisionBatch>> {
        let cf = self.cf(CF_BATCHES)?;
        let iter = match &query.after {
            Some(after) => self
                .db
                .iterator_cf(cf, IteratorMode::From(after.as_bytes(), Direction::Forward)),
            None => self.db.iterator_cf(cf, IteratorMode::Start),
        };

        let mut page = Vec::new();
        for item in iter {
            let (_key, value) = item?;
            let batch: DivisionBatch = serde_json::from_slice(&value)?;
            if query.matches(&batch) {
                page.push(batch);
                if page.len() >= query.limit {
                    break;
                }
            }
        }
        Ok(page)
    }
}
