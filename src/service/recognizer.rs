use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::queries;
use crate::error::RecognitionError;
use crate::models::{NormalizedInvoice, RecognitionOutcome};
use crate::ocr::{normalize_response, OcrClient};

/// 允许上传的文件类型
const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "pdf"];

/// 识别编排服务: 驱动一次上传从暂存走到唯一的终态
///
/// 终态三选一: 重复 (丢弃暂存文件)、新发票 (改名入库)、
/// 失败 (failed_ 前缀保留待查)。不留下孤儿暂存文件。
pub struct RecognitionService {
    pool: PgPool,
    client: OcrClient,
    upload_dir: PathBuf,
}

impl RecognitionService {
    pub fn new(pool: PgPool, client: OcrClient, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            client,
            upload_dir: upload_dir.into(),
        }
    }

    /// 把上传字节落到暂存文件 (temp_ 前缀)，返回暂存路径
    pub fn stage_upload(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf, RecognitionError> {
        let ext = file_extension(file_name).ok_or_else(|| {
            RecognitionError::UnrecognizedDocument(format!("不支持的文件类型: {}", file_name))
        })?;

        fs::create_dir_all(&self.upload_dir)?;
        let staged = self.upload_dir.join(staged_file_name(file_name, &ext));
        fs::write(&staged, bytes)?;
        Ok(staged)
    }

    /// 处理一次上传: 识别 -> 归一化 -> 去重 -> 入库 + 文件归位
    pub async fn process_upload(
        &self,
        temp_path: &Path,
        project_id: Option<i64>,
    ) -> RecognitionOutcome {
        match self.try_process(temp_path, project_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // 失败路径统一保留原始文件供人工排查
                preserve_failed(temp_path);
                warn!("处理发票失败: {}", err);
                RecognitionOutcome::failed(err.to_string())
            }
        }
    }

    async fn try_process(
        &self,
        temp_path: &Path,
        project_id: Option<i64>,
    ) -> Result<RecognitionOutcome, RecognitionError> {
        let bytes = fs::read(temp_path)?;

        // 1. 调用 OCR (网络失败不重试，由调用方决定是否重传)
        let raw_response = self.client.recognize(&bytes).await?;

        // 2. 归一化
        let NormalizedInvoice { record, document } = normalize_response(&raw_response)
            .map_err(|e| RecognitionError::UnrecognizedDocument(e.to_string()))?;
        if record.invoice_number.is_empty() {
            return Err(RecognitionError::UnrecognizedDocument(
                "未能识别出发票号码".to_string(),
            ));
        }

        // 3. 去重快路径 (真正的保证是库里的唯一约束)
        if let Some(existing) =
            queries::find_by_code_number(&self.pool, &record.invoice_code, &record.invoice_number)
                .await?
        {
            discard_temp(temp_path);
            info!(
                "发票 {} 已存在 (id={})，跳过入库",
                existing.combined_id(),
                existing.id
            );
            return Ok(RecognitionOutcome::duplicate(existing.id));
        }

        let final_name = final_file_name(
            &record.invoice_code,
            &record.invoice_number,
            temp_path,
            &bytes,
        );
        let final_path = self.upload_dir.join(&final_name);
        let json_data =
            serde_json::to_string(&document).map_err(std::io::Error::other)?;

        // 4. 主记录 + 明细同一事务；改名夹在插入与提交之间，
        //    任何一步失败都不会留下记录指向不存在的文件
        let mut tx = self.pool.begin().await?;
        let invoice_id = match queries::insert_invoice(
            &mut tx,
            &record,
            &final_name,
            &json_data,
            project_id,
        )
        .await
        {
            Ok(id) => id,
            Err(err) if queries::is_unique_violation(&err) => {
                // 并发上传撞唯一约束: 后发现的重复
                drop(tx);
                discard_temp(temp_path);
                let existing = queries::find_by_code_number(
                    &self.pool,
                    &record.invoice_code,
                    &record.invoice_number,
                )
                .await?;
                return Ok(match existing {
                    Some(invoice) => RecognitionOutcome::duplicate(invoice.id),
                    None => RecognitionOutcome::failed("发票重复但原记录已不存在"),
                });
            }
            Err(err) => return Err(err.into()),
        };
        queries::insert_items(&mut tx, invoice_id, &record.items).await?;

        fs::rename(temp_path, &final_path)?;

        if let Err(err) = tx.commit().await {
            // 提交失败: 文件移回暂存位置，走失败路径
            if let Err(rename_err) = fs::rename(&final_path, temp_path) {
                warn!("回滚文件改名失败: {}", rename_err);
            }
            return Err(err.into());
        }

        info!(
            "发票入库成功 id={} code={} number={} items={}",
            invoice_id,
            record.invoice_code,
            record.invoice_number,
            record.items.len()
        );
        Ok(RecognitionOutcome::new_record(invoice_id))
    }

    /// 删除发票: 记录和明细级联删除，随后清掉对应的票面文件
    pub async fn delete_invoice(&self, invoice_id: i64) -> Result<bool, RecognitionError> {
        let Some(image_path) = queries::delete_invoice(&self.pool, invoice_id).await? else {
            return Ok(false);
        };
        if let Some(image_path) = image_path {
            let path = self.upload_dir.join(&image_path);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("删除票面文件失败 {:?}: {}", path, err),
            }
        }
        info!("已删除发票 id={}", invoice_id);
        Ok(true)
    }
}

/// 校验扩展名白名单，返回小写扩展名
fn file_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)?
        .to_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// 暂存文件名: temp_{原名}_{时间戳}_{随机串}.{扩展名}，避免同名冲突
fn staged_file_name(file_name: &str, ext: &str) -> String {
    let stem: String = Path::new(file_name)
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or("upload")
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let token = Uuid::new_v4().simple().to_string();
    format!("temp_{}_{}_{}.{}", stem, timestamp, &token[..8], ext)
}

/// 最终文件名: {代码}_{号码}.{扩展名}；原名没有扩展名时按前导字节推断
fn final_file_name(code: &str, number: &str, original: &Path, bytes: &[u8]) -> String {
    let ext = original
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_lowercase)
        .unwrap_or_else(|| sniff_extension(bytes).to_string());
    if code.is_empty() {
        format!("{}.{}", number, ext)
    } else {
        format!("{}_{}.{}", code, number, ext)
    }
}

/// 按文件前导字节推断扩展名
fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"%PDF") {
        "pdf"
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else {
        "bin"
    }
}

/// 重复发票: 暂存文件已无价值，丢弃 (尽力而为，不影响结果)
fn discard_temp(temp_path: &Path) {
    if let Err(err) = fs::remove_file(temp_path) {
        warn!("删除重复发票暂存文件失败 {:?}: {}", temp_path, err);
    }
}

/// 失败发票: 暂存文件改成 failed_ 前缀保留
fn preserve_failed(temp_path: &Path) {
    let Some(name) = temp_path.file_name().and_then(OsStr::to_str) else {
        return;
    };
    let failed_name = match name.strip_prefix("temp_") {
        Some(rest) => format!("failed_{}", rest),
        None => format!("failed_{}", name),
    };
    let failed_path = temp_path.with_file_name(failed_name);
    if let Err(err) = fs::rename(temp_path, &failed_path) {
        warn!("保留失败发票文件出错 {:?}: {}", temp_path, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_whitelist() {
        assert_eq!(file_extension("invoice.PDF").as_deref(), Some("pdf"));
        assert_eq!(file_extension("scan.jpeg").as_deref(), Some("jpeg"));
        assert_eq!(file_extension("notes.txt"), None);
        assert_eq!(file_extension("noext"), None);
    }

    #[test]
    fn staged_name_shape() {
        let name = staged_file_name("发票 扫描件.pdf", "pdf");
        assert!(name.starts_with("temp_"));
        assert!(name.ends_with(".pdf"));
        // 非字母数字字符被替换
        assert!(!name.contains(' '));
    }

    #[test]
    fn final_name_uses_code_and_number() {
        let name = final_file_name("4400212130", "12345678", Path::new("temp_x.pdf"), b"%PDF-");
        assert_eq!(name, "4400212130_12345678.pdf");

        // 普票没有代码时只用号码
        let name = final_file_name("", "87654321", Path::new("temp_x.jpg"), &[0xFF, 0xD8, 0xFF]);
        assert_eq!(name, "87654321.jpg");
    }

    #[test]
    fn final_name_sniffs_extension_when_missing() {
        let name = final_file_name("c", "n", Path::new("temp_upload"), b"%PDF-1.4");
        assert_eq!(name, "c_n.pdf");
        let name = final_file_name("c", "n", Path::new("temp_upload"), &[0x89, b'P', b'N', b'G']);
        assert_eq!(name, "c_n.png");
        let name = final_file_name("c", "n", Path::new("temp_upload"), b"garbage");
        assert_eq!(name, "c_n.bin");
    }

    #[test]
    fn failed_preserve_renames_temp_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_scan_20240101_abcd1234.pdf");
        fs::write(&temp, b"%PDF-").unwrap();

        preserve_failed(&temp);

        assert!(!temp.exists());
        assert!(dir
            .path()
            .join("failed_scan_20240101_abcd1234.pdf")
            .exists());
    }
}
