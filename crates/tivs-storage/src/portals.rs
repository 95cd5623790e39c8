//! Portal registry.

use chrono::{DateTime, Utc};
use tivs_core::{HealthStatus, Portal, PortalId};
use tracing::info;

use crate::rows::portal_from_row;
use crate::{encode_ts, StoreError, StoreResult, TenderStore};

const PORTAL_COLUMNS: &str =
    "id, slug, name, base_url, is_active, health_status, last_health_check_at";

impl TenderStore {
    /// Register a new portal; the slug must not exist yet.
    pub async fn register_portal(&self, slug: &str, name: &str, base_url: &str) -> StoreResult<PortalId> {
        let result = sqlx::query("INSERT INTO portals (slug, name, base_url) VALUES (?, ?, ?)")
            .bind(slug)
            .bind(name)
            .bind(base_url)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => {
                info!(slug, "portal registered");
                Ok(done.last_insert_rowid())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateSlug(slug.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Configuration-load path: register the slug or refresh its name/URL/active flag.
    pub async fn ensure_portal(
        &self,
        slug: &str,
        name: &str,
        base_url: &str,
        is_active: bool,
    ) -> StoreResult<PortalId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO portals (slug, name, base_url, is_active)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (slug) DO UPDATE
               SET name = excluded.name,
                   base_url = excluded.base_url,
                   is_active = excluded.is_active
            RETURNING id
            "#,
        )
        .bind(slug)
        .bind(name)
        .bind(base_url)
        .bind(is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_portal(&self, slug: &str) -> StoreResult<Portal> {
        let row = sqlx::query(&format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE slug = ?"))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::PortalNotFound(slug.to_string()))?;
        portal_from_row(&row)
    }

    pub async fn get_portal_by_id(&self, portal_id: PortalId) -> StoreResult<Portal> {
        let row = sqlx::query(&format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE id = ?"))
            .bind(portal_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::UnknownPortal(portal_id))?;
        portal_from_row(&row)
    }

    pub async fn list_portals(&self) -> StoreResult<Vec<Portal>> {
        let rows = sqlx::query(&format!("SELECT {PORTAL_COLUMNS} FROM portals ORDER BY slug"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(portal_from_row).collect()
    }

    pub async fn set_health(
        &self,
        portal_id: PortalId,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE portals SET health_status = ?, last_health_check_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(encode_ts(checked_at))
        .bind(portal_id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::UnknownPortal(portal_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_store;
    use chrono::TimeZone;

    #[tokio::test]
    async fn register_and_get_portal() {
        let (_dir, store) = temp_store().await;
        let id = store
            .register_portal("hp", "Himachal Pradesh eProcurement", "https://hptenders.gov.in")
            .await
            .unwrap();
        let portal = store.get_portal("hp").await.unwrap();
        assert_eq!(portal.id, id);
        assert!(portal.is_active);
        assert_eq!(portal.health_status, HealthStatus::Unknown);
        assert_eq!(portal.last_health_check_at, None);
    }

    #[tokio::test]
    async fn duplicate_slug_is_rejected() {
        let (_dir, store) = temp_store().await;
        store.register_portal("hp", "HP", "https://a").await.unwrap();
        let err = store.register_portal("hp", "HP again", "https://b").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSlug(slug) if slug == "hp"));
    }

    #[tokio::test]
    async fn missing_portal_is_not_found() {
        let (_dir, store) = temp_store().await;
        assert!(matches!(
            store.get_portal("nope").await,
            Err(StoreError::PortalNotFound(_))
        ));
        assert!(matches!(
            store.set_health(42, HealthStatus::Up, Utc::now()).await,
            Err(StoreError::UnknownPortal(42))
        ));
    }

    #[tokio::test]
    async fn ensure_portal_is_idempotent_on_slug() {
        let (_dir, store) = temp_store().await;
        let a = store.ensure_portal("mp", "MP", "https://old", true).await.unwrap();
        let b = store.ensure_portal("mp", "Madhya Pradesh", "https://new", false).await.unwrap();
        assert_eq!(a, b);
        let portal = store.get_portal("mp").await.unwrap();
        assert_eq!(portal.name, "Madhya Pradesh");
        assert_eq!(portal.base_url, "https://new");
        assert!(!portal.is_active);
    }

    #[tokio::test]
    async fn health_updates_are_persisted() {
        let (_dir, store) = temp_store().await;
        let id = store.register_portal("hp", "HP", "https://a").await.unwrap();
        let checked = Utc.with_ymd_and_hms(2026, 5, 4, 6, 0, 0).single().unwrap();
        store.set_health(id, HealthStatus::Degraded, checked).await.unwrap();
        let portal = store.get_portal_by_id(id).await.unwrap();
        assert_eq!(portal.health_status, HealthStatus::Degraded);
        assert_eq!(portal.last_health_check_at, Some(checked));
    }
}
