//! On-write hooks that run inside the canonical write transaction.
//!
//! Whatever a hook writes commits or rolls back together with the canonical
//! row, so derived tables cannot be observed out of step with it.

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tivs_core::{TenderId, TenderItem};

use crate::{encode_ts, store_now, StoreResult};

#[async_trait]
pub trait CanonicalWriteHook: Send + Sync {
    /// Called after the canonical row for `item` has been inserted or updated.
    async fn on_write(&self, conn: &mut SqliteConnection, item: &TenderItem) -> StoreResult<()>;

    /// Called before the canonical row `tender_id` is physically deleted.
    async fn on_purge(&self, conn: &mut SqliteConnection, tender_id: TenderId) -> StoreResult<()>;
}

/// Keeps exactly one `search_index` row per tender, mirroring its searchable text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchIndexHook;

#[async_trait]
impl CanonicalWriteHook for SearchIndexHook {
    async fn on_write(&self, conn: &mut SqliteConnection, item: &TenderItem) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO search_index (tender_id, search_text, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (tender_id) DO UPDATE
               SET search_text = excluded.search_text,
                   updated_at = excluded.updated_at
             WHERE search_index.search_text <> excluded.search_text
            "#,
        )
        .bind(item.id)
        .bind(item.fields.search_text())
        .bind(encode_ts(store_now()))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn on_purge(&self, conn: &mut SqliteConnection, tender_id: TenderId) -> StoreResult<()> {
        sqlx::query("DELETE FROM search_index WHERE tender_id = ?")
            .bind(tender_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
