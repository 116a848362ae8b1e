use std::sync::{Arc, Mutex};

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;

use crate::db::queries::{self, InvoiceFilter};
use crate::export::{CleanupQueue, ExportFormat};
use crate::models::{RecognitionOutcome, StoredInvoice, UploadStatus};
use crate::service::{ExportService, RecognitionService};

/// 共享状态: 识别服务、导出服务、连接池、待清理导出文件登记表
#[derive(Clone)]
pub struct AppState {
    pub recognizer: Arc<RecognitionService>,
    pub exporter: Arc<ExportService>,
    pub pool: PgPool,
    pub cleanup: Arc<Mutex<CleanupQueue>>,
}

/// 请求体: 上传一张发票 (图片/PDF 以 base64 传入)
#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    pub file_name: String,
    pub content_base64: String,
    pub project_id: Option<i64>,
}

/// 识别响应体
#[derive(Debug, Serialize)]
pub struct RecognizeResponse {
    pub success: bool,
    pub status: Option<UploadStatus>,
    pub invoice_id: Option<i64>,
    pub message: String,
}

/// 列表响应体
#[derive(Debug, Serialize)]
pub struct ListInvoicesResponse {
    pub success: bool,
    pub message: String,
    pub invoices: Option<Vec<StoredInvoice>>,
}

/// 导出响应体: 外层拿 file_path 负责实际下发
#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub success: bool,
    pub message: String,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub content_type: Option<&'static str>,
}

/// 清理响应体
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub message: String,
    pub deleted: usize,
}

/// 列表查询参数
#[derive(Debug, Deserialize, Default)]
pub struct ListInvoicesQuery {
    /// 0 表示未分组
    pub project_id: Option<i64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub number: Option<String>,
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 识别接口: base64 解码 -> 暂存 -> 识别编排
pub async fn recognize_invoice(
    State(state): State<AppState>,
    Json(req): Json<RecognizeRequest>,
) -> Response {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(&req.content_base64) {
        Ok(bytes) => bytes,
        Err(e) => {
            let response = RecognizeResponse {
                success: false,
                status: Some(UploadStatus::Failed),
                invoice_id: None,
                message: format!("base64 解码失败: {}", e),
            };
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let temp_path = match state.recognizer.stage_upload(&req.file_name, &bytes) {
        Ok(path) => path,
        Err(e) => {
            let response = RecognizeResponse {
                success: false,
                status: Some(UploadStatus::Failed),
                invoice_id: None,
                message: format!("Error: {}", e),
            };
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let RecognitionOutcome {
        status,
        invoice_id,
        message,
    } = state
        .recognizer
        .process_upload(&temp_path, req.project_id)
        .await;

    let (code, success) = match status {
        UploadStatus::New | UploadStatus::Duplicate => (StatusCode::OK, true),
        UploadStatus::Failed => (StatusCode::UNPROCESSABLE_ENTITY, false),
    };
    let response = RecognizeResponse {
        success,
        status: Some(status),
        invoice_id,
        message,
    };
    (code, Json(response)).into_response()
}

/// 发票列表接口，支持分组/日期区间/号码子串筛选
pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<ListInvoicesQuery>,
) -> Response {
    let filter = InvoiceFilter {
        project_id: query.project_id,
        date_from: query.date_from,
        date_to: query.date_to,
        number: query.number,
    };
    match queries::list_invoices(&state.pool, &filter).await {
        Ok(invoices) => {
            let response = ListInvoicesResponse {
                success: true,
                message: format!("共 {} 张发票", invoices.len()),
                invoices: Some(invoices),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let response = ListInvoicesResponse {
                success: false,
                message: format!("Error: {}", e),
                invoices: None,
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
        }
    }
}

/// 删除响应体
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

/// 删除接口: 记录、明细与票面文件一并清除
pub async fn delete_invoice(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.recognizer.delete_invoice(id).await {
        Ok(true) => {
            let response = DeleteResponse {
                success: true,
                message: "发票已删除".to_string(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(false) => {
            let response = DeleteResponse {
                success: false,
                message: format!("未找到发票记录: {}", id),
            };
            (StatusCode::NOT_FOUND, Json(response)).into_response()
        }
        Err(e) => {
            let response = DeleteResponse {
                success: false,
                message: format!("Error: {}", e),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
        }
    }
}

/// 单票导出接口: 格式取 csv 或 workbook
pub async fn export_invoice(
    State(state): State<AppState>,
    Path((id, format)): Path<(i64, String)>,
) -> Response {
    let format: ExportFormat = match format.parse() {
        Ok(format) => format,
        Err(e) => {
            return export_error(StatusCode::BAD_REQUEST, e);
        }
    };
    match state.exporter.export_invoice(id, format).await {
        Ok(file) => {
            register_cleanup(&state, file.path.clone());
            let response = ExportResponse {
                success: true,
                message: "导出成功".to_string(),
                file_path: Some(file.path.to_string_lossy().into_owned()),
                file_name: Some(file.file_name),
                content_type: Some(file.content_type),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => export_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// 项目导出接口: 固定产出多表工作簿
pub async fn export_project(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.exporter.export_project(id).await {
        Ok(file) => {
            register_cleanup(&state, file.path.clone());
            let response = ExportResponse {
                success: true,
                message: "导出成功".to_string(),
                file_path: Some(file.path.to_string_lossy().into_owned()),
                file_name: Some(file.file_name),
                content_type: Some(file.content_type),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => export_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// 清理接口: 删除所有已登记的导出文件
pub async fn cleanup_exported_files(State(state): State<AppState>) -> Response {
    let deleted = match state.cleanup.lock() {
        Ok(mut queue) => queue.drain(),
        Err(poisoned) => poisoned.into_inner().drain(),
    };
    let response = CleanupResponse {
        success: true,
        message: format!("已清理 {} 个导出文件", deleted),
        deleted,
    };
    (StatusCode::OK, Json(response)).into_response()
}

fn register_cleanup(state: &AppState, path: std::path::PathBuf) {
    match state.cleanup.lock() {
        Ok(mut queue) => queue.register(path),
        Err(poisoned) => {
            warn!("清理登记表锁中毒，继续登记");
            poisoned.into_inner().register(path);
        }
    }
}

fn export_error(code: StatusCode, err: crate::error::ExportError) -> Response {
    let code = match err {
        crate::error::ExportError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => code,
    };
    let response = ExportResponse {
        success: false,
        message: format!("Error: {}", err),
        file_path: None,
        file_name: None,
        content_type: None,
    };
    (code, Json(response)).into_response()
}
