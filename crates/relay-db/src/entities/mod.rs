pub mod app_records;
