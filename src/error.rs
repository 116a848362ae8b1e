use thiserror::Error;

/// 识别流程错误分类
///
/// 重复发票不是错误 (见 `RecognitionOutcome::Duplicate`)，
/// 这里只覆盖真正需要上报给调用方的失败。
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// 缺少 API 密钥，发起识别前同步报告，不可重试
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 网络/HTTP 层失败，保留原始文件，不自动重试
    #[error("请求OCR服务失败: {0}")]
    Transport(String),

    /// 服务有响应但无法提取发票号码
    #[error("无法识别发票内容: {0}")]
    UnrecognizedDocument(String),

    /// 识别成功后写库失败，需要回滚并保留文件
    #[error("保存发票数据失败: {0}")]
    Persistence(#[from] sqlx::Error),

    /// 文件暂存/改名失败
    #[error("文件操作失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 归一化阶段错误，调用方需要区分 "服务不可达" 和 "数据不可用"
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("响应中不包含发票识别结果: {0}")]
    UnrecognizedDocument(String),
}

/// 导出阶段错误，任何一种都中止整个导出
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("未找到发票记录: {0}")]
    NotFound(i64),

    #[error("不支持的导出格式: {0}")]
    UnsupportedFormat(String),

    #[error("生成导出文件失败: {0}")]
    Write(String),

    #[error("查询导出数据失败: {0}")]
    Query(#[from] sqlx::Error),

    #[error("文件操作失败: {0}")]
    Io(#[from] std::io::Error),
}
