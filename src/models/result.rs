use serde::Serialize;

/// 一次上传的终态，每次上传恰好落在其中之一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 新发票，已入库并保留图片
    New,
    /// 与已有记录重复，临时文件已丢弃，不覆盖旧记录
    Duplicate,
    /// 识别或持久化失败，临时文件以 failed_ 前缀保留待查
    Failed,
}

/// 识别编排的返回结果
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionOutcome {
    pub status: UploadStatus,
    pub invoice_id: Option<i64>,
    pub message: String,
}

impl RecognitionOutcome {
    pub fn new_record(invoice_id: i64) -> Self {
        Self {
            status: UploadStatus::New,
            invoice_id: Some(invoice_id),
            message: "发票识别成功".to_string(),
        }
    }

    pub fn duplicate(invoice_id: i64) -> Self {
        Self {
            status: UploadStatus::Duplicate,
            invoice_id: Some(invoice_id),
            message: "发票已存在，未重复入库".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Failed,
            invoice_id: None,
            message: message.into(),
        }
    }
}
