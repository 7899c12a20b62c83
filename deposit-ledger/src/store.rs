//! Persistence boundary used by reconciliation

use crate::{
    error::Result,
    types::{LedgerRow, OwnerKey, RowUpdate},
};
use async_trait::async_trait;
use uuid::Uuid;

/// Row persistence as seen by reconciliation
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// All rows of an owner, ascending by `sequence_key`
    async fn list_by_owner(&self, owner: &OwnerKey) -> Result<Vec<LedgerRow>>;

    /// Overwrite balance and yield of one row.
    ///
    /// Plain overwrite, so retrying with the same values is harmless.
    async fn update(&self, row_id: Uuid, update: RowUpdate) -> Result<()>;
}
