pub mod csv;
pub mod workbook;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::error::ExportError;

pub use csv::export_invoice_csv;
pub use workbook::{export_invoice_workbook, export_project_workbook, DETAIL_SHEET_CAP};

/// 导出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Workbook,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Workbook => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Workbook => "xlsx",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(ExportFormat::Csv),
            "workbook" => Ok(ExportFormat::Workbook),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// 金额字符串的有损数值解析，仅供统计使用
///
/// 去掉货币符号、千分位和 "元"；解析失败返回 None，
/// 汇总时按零贡献跳过而不是中止导出。
pub fn parse_amount(amount: &str) -> Option<f64> {
    let cleaned: String = amount
        .chars()
        .filter(|c| !matches!(c, '¥' | '￥' | ',' | '元' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// 待删除导出文件登记表
///
/// 由调用方持有、传入并显式排空，取代进程级的全局待删列表。
#[derive(Debug, Default)]
pub struct CleanupQueue {
    paths: Vec<PathBuf>,
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个下载完即可删除的导出文件
    pub fn register(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// 删除所有登记的文件，返回删除成功的数量
    pub fn drain(&mut self) -> usize {
        let mut deleted = 0;
        for path in self.paths.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("删除导出文件失败 {:?}: {}", path, err),
            }
        }
        deleted
    }
}

/// 清理输出目录中超过保留天数的过期导出文件，返回删除数量
pub fn sweep_stale_exports(output_dir: &Path, max_age_days: u64) -> std::io::Result<usize> {
    let max_age = Duration::from_secs(max_age_days * 24 * 60 * 60);
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age {
            fs::remove_file(entry.path())?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// 先写临时文件再原子改名，避免留下看似完整的残缺文件
pub(crate) fn commit_output(tmp_path: &Path, path: &Path) -> Result<(), ExportError> {
    fs::rename(tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(tmp_path);
        ExportError::Write(format!("落盘导出文件失败: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_amount_handles_symbols_and_garbage() {
        assert_eq!(parse_amount("¥1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("￥88元"), Some(88.0));
        assert_eq!(parse_amount("  113.00 "), Some(113.0));
        assert_eq!(parse_amount("¥1O0.00"), None); // 乱码
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn format_token_parsing() {
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!(
            "workbook".parse::<ExportFormat>().unwrap(),
            ExportFormat::Workbook
        );
        assert!("excel".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn cleanup_queue_drains_registered_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.xlsx");
        fs::write(&a, "x").unwrap();
        fs::write(&b, "y").unwrap();

        let mut queue = CleanupQueue::new();
        queue.register(a.clone());
        queue.register(b.clone());
        queue.register(dir.path().join("missing.csv"));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn sweep_only_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh.csv");
        fs::write(&fresh, "x").unwrap();

        // 刚写入的文件不会被 7 天清理扫掉
        let deleted = sweep_stale_exports(dir.path(), 7).unwrap();
        assert_eq!(deleted, 0);
        assert!(fresh.exists());

        // 保留 0 天时一切文件都算过期
        std::thread::sleep(std::time::Duration::from_millis(50));
        let deleted = sweep_stale_exports(dir.path(), 0).unwrap();
        assert_eq!(deleted, 1);
    }
}
