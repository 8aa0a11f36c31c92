use sea_orm::entity::prelude::*;

/// One acquisition of an app. Rows are appended by the acquisition tool; the
/// newest row per `item_id` is the current one.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "app_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub item_id: String,
    pub file_id: Option<i64>,
    pub bundle_id: String,
    pub filename: String,
    pub track_name: String,
    pub version: String,
    #[sea_orm(column_type = "Text")]
    pub release_notes: String,
    pub release_date: Option<DateTimeWithTimeZone>,
    pub store_url: String,
    pub artwork_url: String,
    pub chat_id: String,
    pub topic_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
