use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AppRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AppRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AppRecords::ItemId).string().not_null())
                    .col(ColumnDef::new(AppRecords::FileId).big_integer().null())
                    .col(ColumnDef::new(AppRecords::BundleId).string().not_null())
                    .col(ColumnDef::new(AppRecords::Filename).string().not_null())
                    .col(ColumnDef::new(AppRecords::TrackName).string().not_null())
                    .col(ColumnDef::new(AppRecords::Version).string().not_null())
                    .col(
                        ColumnDef::new(AppRecords::ReleaseNotes)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(AppRecords::ReleaseDate)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(AppRecords::StoreUrl).string().not_null())
                    .col(ColumnDef::new(AppRecords::ArtworkUrl).string().not_null())
                    .col(ColumnDef::new(AppRecords::ChatId).string().not_null())
                    .col(ColumnDef::new(AppRecords::TopicId).string().null())
                    .col(
                        ColumnDef::new(AppRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Lookups always want the newest row for an item.
        manager
            .create_index(
                Index::create()
                    .name("idx_app_records_item_id_created_at")
                    .table(AppRecords::Table)
                    .col(AppRecords::ItemId)
                    .col(AppRecords::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_app_records_item_id_created_at")
                    .table(AppRecords::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(AppRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AppRecords {
    Table,
    Id,
    ItemId,
    FileId,
    BundleId,
    Filename,
    TrackName,
    Version,
    ReleaseNotes,
    ReleaseDate,
    StoreUrl,
    ArtworkUrl,
    ChatId,
    TopicId,
    CreatedAt,
}
