use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// 项目表行 (projects) - 发票分组
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
