use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ocr: OcrConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// 腾讯云 OCR 接入配置，密钥从环境变量读取
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(skip_serializing)]
    pub secret_id: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub endpoint: String,
    pub region: String,
}

/// 上传文件与导出文件的存放目录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: String,
    pub output_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: std::env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/fapiao_ocr".to_string()),
            },
            ocr: OcrConfig {
                secret_id: std::env::var("TENCENT_SECRET_ID").unwrap_or_default(),
                secret_key: std::env::var("TENCENT_SECRET_KEY").unwrap_or_default(),
                endpoint: std::env::var("OCR_ENDPOINT")
                    .unwrap_or_else(|_| "ocr.tencentcloudapi.com".to_string()),
                region: std::env::var("OCR_REGION")
                    .unwrap_or_else(|_| "ap-guangzhou".to_string()),
            },
            storage: StorageConfig {
                upload_dir: std::env::var("UPLOAD_DIR")
                    .unwrap_or_else(|_| "data/uploads".to_string()),
                output_dir: std::env::var("OUTPUT_DIR")
                    .unwrap_or_else(|_| "data/output".to_string()),
            },
        }
    }
}
