//! Single-writer actor for the ledger
//!
//! Every mutation of the store (row inserts, reconciliation updates, audit
//! records) is funnelled through one Tokio task, so two writes never
//! interleave inside RocksDB. Reads go straight to `Storage`.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │           HTTP handlers / CLI / service               │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │     Storage::insert_row / apply_updates / ...         │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Per-owner serialisation of whole read-compute-write cycles is not the
//! actor's job; see the reconciler's owner locks.

use crate::types::{LedgerRow, ReconciliationRecord, RowUpdate};
use crate::{Error, Result, Storage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Insert a new row
    InsertRow {
        row: LedgerRow,
        response: oneshot::Sender<Result<Uuid>>,
    },

    /// Rewrite rows atomically
    ApplyUpdates {
        updates: Vec<(Uuid, RowUpdate)>,
        at: DateTime<Utc>,
        response: oneshot::Sender<Result<usize>>,
    },

    /// Store a reconciliation record
    RecordReconciliation {
        record: ReconciliationRecord,
        response: oneshot::Sender<Result<()>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger writes
pub struct LedgerActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl std::fmt::Debug for LedgerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerActor").finish_non_exhaustive()
    }
}

impl LedgerActor {
    /// Create new actor
    pub fn new(storage: Arc<Storage>, mailbox: mpsc::Receiver<LedgerMessage>) -> Self {
        Self { storage, mailbox }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => {
                    tracing::debug!("Ledger actor shutting down");
                    break;
                }
                msg => self.handle_message(msg),
            }
        }
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::InsertRow { row, response } => {
                let result = self.storage.insert_row(&row).map(|_| row.id);
                if let Err(ref e) = result {
                    tracing::warn!(row_id = %row.id, "Row insert failed: {}", e);
                }
                let _ = response.send(result);
            }

            LedgerMessage::ApplyUpdates {
                updates,
                at,
                response,
            } => {
                let result = self.storage.apply_updates(&updates, at);
                if let Err(ref e) = result {
                    tracing::error!(rows = updates.len(), "Applying row updates failed: {}", e);
                }
                let _ = response.send(result);
            }

            LedgerMessage::RecordReconciliation { record, response } => {
                let _ = response.send(self.storage.put_reconciliation(&record));
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Insert a row
    pub async fn insert_row(&self, row: LedgerRow) -> Result<Uuid> {
        self.request(|response| LedgerMessage::InsertRow { row, response })
            .await
    }

    /// Rewrite rows atomically
    pub async fn apply_updates(
        &self,
        updates: Vec<(Uuid, RowUpdate)>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        self.request(|response| LedgerMessage::ApplyUpdates {
            updates,
            at,
            response,
        })
        .await
    }

    /// Store a reconciliation record
    pub async fn record_reconciliation(&self, record: ReconciliationRecord) -> Result<()> {
        self.request(|response| LedgerMessage::RecordReconciliation { record, response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(storage: Arc<Storage>, mailbox_capacity: usize) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let actor = LedgerActor::new(storage, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OwnerKey;
    use crate::Config;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn open_storage() -> (Arc<Storage>, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Arc::new(Storage::open(&config).unwrap()), temp_dir)
    }

    fn test_row() -> LedgerRow {
        LedgerRow {
            id: Uuid::now_v7(),
            owner: OwnerKey::new("0xabc"),
            principal: dec!(10),
            current_balance: dec!(10),
            sequence_key: Utc::now().timestamp_nanos_opt().unwrap(),
            accumulated_yield: dec!(1),
            tx_hash: format!("0x{}", Uuid::new_v4().simple()),
            chain_id: 1,
            last_reconciled_at: None,
        }
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let (storage, _temp) = open_storage();
        let handle = spawn_ledger_actor(storage, 16);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_insert_and_update() {
        let (storage, _temp) = open_storage();
        let handle = spawn_ledger_actor(storage.clone(), 16);

        let row = test_row();
        let row_id = handle.insert_row(row.clone()).await.unwrap();
        assert_eq!(row_id, row.id);

        let written = handle
            .apply_updates(vec![(row_id, RowUpdate::rebalance(dec!(4)))], Utc::now())
            .await
            .unwrap();
        assert_eq!(written, 1);

        let stored = storage.get_row(row_id).unwrap();
        assert_eq!(stored.current_balance, dec!(4));
        assert_eq!(stored.accumulated_yield, Decimal::ZERO);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_reports_storage_errors() {
        let (storage, _temp) = open_storage();
        let handle = spawn_ledger_actor(storage, 16);

        let result = handle
            .apply_updates(vec![(Uuid::now_v7(), RowUpdate::rebalance(dec!(1)))], Utc::now())
            .await;
        assert!(matches!(result, Err(Error::RowNotFound(_))));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_mailbox() {
        let (storage, _temp) = open_storage();
        let handle = spawn_ledger_actor(storage, 16);
        handle.shutdown().await.unwrap();

        // Give the actor a chance to drop its receiver
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let result = handle.insert_row(test_row()).await;
        assert!(matches!(result, Err(Error::Concurrency(_))));
    }
}
