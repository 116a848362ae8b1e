use std::fs;
use std::path::PathBuf;

use sqlx::PgPool;
use tracing::info;

use crate::db::queries;
use crate::error::ExportError;
use crate::export::{
    export_invoice_csv, export_invoice_workbook, export_project_workbook, ExportFormat,
};
use crate::models::{StoredInvoice, StoredInvoiceItem};

/// 一次导出的产物: 落盘路径与下载用的 Content-Type
#[derive(Debug, Clone)]
pub struct ExportFile {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: &'static str,
}

/// 导出服务: 查库、生成导出文件、返回可下载的文件句柄
pub struct ExportService {
    pool: PgPool,
    output_dir: PathBuf,
}

impl ExportService {
    pub fn new(pool: PgPool, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            output_dir: output_dir.into(),
        }
    }

    /// 导出单张发票为 CSV 或工作簿
    pub async fn export_invoice(
        &self,
        invoice_id: i64,
        format: ExportFormat,
    ) -> Result<ExportFile, ExportError> {
        let invoice = queries::get_invoice(&self.pool, invoice_id)
            .await?
            .ok_or(ExportError::NotFound(invoice_id))?;
        let items = queries::list_items(&self.pool, invoice_id).await?;

        fs::create_dir_all(&self.output_dir)?;
        let file_name = format!(
            "invoice_{}_{}.{}",
            invoice.combined_id(),
            chrono::Local::now().format("%Y%m%d%H%M%S"),
            format.extension()
        );
        let path = self.output_dir.join(&file_name);

        match format {
            ExportFormat::Csv => export_invoice_csv(&invoice, &items, &path)?,
            ExportFormat::Workbook => export_invoice_workbook(&invoice, &items, &path)?,
        }

        info!("导出发票 id={} -> {:?}", invoice_id, path);
        Ok(ExportFile {
            path,
            file_name,
            content_type: format.content_type(),
        })
    }

    /// 导出整个项目为多表工作簿
    pub async fn export_project(&self, project_id: i64) -> Result<ExportFile, ExportError> {
        let project = queries::get_project(&self.pool, project_id)
            .await?
            .ok_or(ExportError::NotFound(project_id))?;

        let filter = queries::InvoiceFilter {
            project_id: Some(project_id),
            ..Default::default()
        };
        let invoices = queries::list_invoices(&self.pool, &filter).await?;

        let mut with_items: Vec<(StoredInvoice, Vec<StoredInvoiceItem>)> =
            Vec::with_capacity(invoices.len());
        for invoice in invoices {
            let items = queries::list_items(&self.pool, invoice.id).await?;
            with_items.push((invoice, items));
        }

        fs::create_dir_all(&self.output_dir)?;
        let format = ExportFormat::Workbook;
        let file_name = format!(
            "project_{}_{}.{}",
            sanitize_file_token(&project.name),
            chrono::Local::now().format("%Y%m%d%H%M%S"),
            format.extension()
        );
        let path = self.output_dir.join(&file_name);

        export_project_workbook(&project, &with_items, &path)?;

        info!(
            "导出项目 id={} ({} 张发票) -> {:?}",
            project_id,
            with_items.len(),
            path
        );
        Ok(ExportFile {
            path,
            file_name,
            content_type: format.content_type(),
        })
    }
}

/// 项目名进文件名前的清洗，路径分隔符等一律替换为下划线
fn sanitize_file_token(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "project".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_token_sanitized() {
        assert_eq!(sanitize_file_token("报销/一季度"), "报销_一季度");
        assert_eq!(sanitize_file_token("Q1 2023"), "Q1_2023");
        assert_eq!(sanitize_file_token("///"), "___");
        assert_eq!(sanitize_file_token(""), "project");
    }
}
