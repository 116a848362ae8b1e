pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod models;
pub mod ocr;
pub mod service;

pub use config::AppConfig;
pub use db::{create_pool, init_schema};
pub use ocr::OcrClient;
pub use service::{ExportService, RecognitionService};
