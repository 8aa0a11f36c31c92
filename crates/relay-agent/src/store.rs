use anyhow::Context;
use chrono::Utc;
use relay_db::entities::app_records;
use relay_db::sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use relay_job::{AppRecord, ItemId};
use relay_migration::Migrator;
use sea_orm_migration::MigratorTrait;
use tokio::sync::Mutex;

use crate::messenger::MessageId;

/// Persistence seen by a job. Every lookup is "the newest record for this id".
#[async_trait::async_trait]
pub trait AppStore: Send + Sync {
    async fn find_latest(&self, item_id: &ItemId) -> anyhow::Result<Option<AppRecord>>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete_latest(&self, item_id: &ItemId) -> anyhow::Result<bool>;

    async fn set_file_id(&self, item_id: &ItemId, file_id: MessageId) -> anyhow::Result<()>;

    /// Drops the connection; the next call reconnects.
    async fn close(&self);
}

pub fn record_from_model(m: app_records::Model) -> AppRecord {
    AppRecord {
        item_id: ItemId(m.item_id),
        file_id: m.file_id,
        bundle_id: m.bundle_id,
        filename: m.filename,
        track_name: m.track_name,
        version: m.version,
        release_notes: m.release_notes,
        release_date: m.release_date.map(|d| d.with_timezone(&Utc)),
        store_url: m.store_url,
        artwork_url: m.artwork_url,
        chat_id: m.chat_id,
        topic_id: m.topic_id,
    }
}

pub struct SeaOrmStore {
    database_url: String,
    conn: Mutex<Option<DatabaseConnection>>,
}

impl SeaOrmStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connection(&self) -> anyhow::Result<DatabaseConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(db) = guard.as_ref() {
            return Ok(db.clone());
        }
        let db = relay_db::connect(&self.database_url)
            .await
            .context("connect to database")?;
        tracing::info!("database connected");
        *guard = Some(db.clone());
        Ok(db)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        let db = self.connection().await?;
        Migrator::up(&db, None).await.context("run migrations")?;
        Ok(())
    }

    async fn latest_model(
        &self,
        db: &DatabaseConnection,
        item_id: &ItemId,
    ) -> anyhow::Result<Option<app_records::Model>> {
        app_records::Entity::find()
            .filter(app_records::Column::ItemId.eq(item_id.0.clone()))
            .order_by_desc(app_records::Column::CreatedAt)
            .one(db)
            .await
            .with_context(|| format!("find record for {item_id}"))
    }
}

#[async_trait::async_trait]
impl AppStore for SeaOrmStore {
    async fn find_latest(&self, item_id: &ItemId) -> anyhow::Result<Option<AppRecord>> {
        let db = self.connection().await?;
        Ok(self.latest_model(&db, item_id).await?.map(record_from_model))
    }

    async fn delete_latest(&self, item_id: &ItemId) -> anyhow::Result<bool> {
        let db = self.connection().await?;
        let Some(model) = self.latest_model(&db, item_id).await? else {
            return Ok(false);
        };
        let res = app_records::Entity::delete_by_id(model.id)
            .exec(&db)
            .await
            .with_context(|| format!("delete record for {item_id}"))?;
        Ok(res.rows_affected > 0)
    }

    async fn set_file_id(&self, item_id: &ItemId, file_id: MessageId) -> anyhow::Result<()> {
        let db = self.connection().await?;
        let Some(model) = self.latest_model(&db, item_id).await? else {
            tracing::warn!(item_id = %item_id, "no record to attach file id to");
            return Ok(());
        };
        let mut active: app_records::ActiveModel = model.into();
        active.file_id = Set(Some(file_id));
        active
            .update(&db)
            .await
            .with_context(|| format!("store file id for {item_id}"))?;
        Ok(())
    }

    async fn close(&self) {
        let Some(db) = self.conn.lock().await.take() else {
            return;
        };
        match db.close().await {
            Ok(()) => tracing::info!("database connection closed"),
            Err(e) => tracing::warn!(error = %e, "closing database connection failed"),
        }
    }
}
