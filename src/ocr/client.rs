use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::OcrConfig;
use crate::error::RecognitionError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "TC3-HMAC-SHA256";
const SERVICE: &str = "ocr";
const ACTION: &str = "VatInvoiceOCR";
const VERSION: &str = "2018-11-19";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// 增值税发票 OCR 请求体
///
/// PDF 是多页格式，需要附带页码提示，图片则不带
#[derive(Debug, Serialize)]
struct RecognizeRequest {
    #[serde(rename = "ImageBase64")]
    image_base64: String,
    #[serde(rename = "IsPdf", skip_serializing_if = "Option::is_none")]
    is_pdf: Option<bool>,
    #[serde(rename = "PdfPageNumber", skip_serializing_if = "Option::is_none")]
    pdf_page_number: Option<u32>,
}

/// 腾讯云 OCR 签名客户端
///
/// 只负责发起一次带签名的调用并返回原始响应体；
/// 非 2xx 的错误载荷原样透传，业务语义由调用方解释，内部不做重试。
pub struct OcrClient {
    http: reqwest::Client,
    secret_id: String,
    secret_key: String,
    endpoint: String,
    region: String,
}

impl OcrClient {
    /// 构造客户端，密钥为空时立即失败，不发起任何网络请求
    pub fn new(config: &OcrConfig) -> Result<Self, RecognitionError> {
        if config.secret_id.is_empty() || config.secret_key.is_empty() {
            return Err(RecognitionError::Configuration(
                "未找到腾讯云API密钥，请设置 TENCENT_SECRET_ID 和 TENCENT_SECRET_KEY".to_string(),
            ));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            secret_id: config.secret_id.clone(),
            secret_key: config.secret_key.clone(),
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
        })
    }

    /// 识别一张发票，返回服务端原始 JSON 响应体
    pub async fn recognize(&self, document: &[u8]) -> Result<String, RecognitionError> {
        let pdf = is_pdf(document);
        let request = RecognizeRequest {
            image_base64: BASE64.encode(document),
            is_pdf: pdf.then_some(true),
            pdf_page_number: pdf.then_some(1),
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| RecognitionError::Transport(format!("构造请求体失败: {}", e)))?;

        let timestamp = chrono::Utc::now().timestamp();
        let authorization = build_authorization(
            &self.secret_id,
            &self.secret_key,
            &self.endpoint,
            &payload,
            timestamp,
        );

        debug!("调用 {} {} ({} bytes)", self.endpoint, ACTION, document.len());

        let response = self
            .http
            .post(format!("https://{}/", self.endpoint))
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("Host", self.endpoint.clone())
            .header("X-TC-Action", ACTION)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", VERSION)
            .header("X-TC-Region", self.region.clone())
            .body(payload)
            .send()
            .await
            .map_err(|e| RecognitionError::Transport(format!("API请求失败: {}", e)))?;

        response
            .text()
            .await
            .map_err(|e| RecognitionError::Transport(format!("读取响应失败: {}", e)))
    }
}

/// 按前导字节判断是否为 PDF
pub fn is_pdf(document: &[u8]) -> bool {
    document.starts_with(b"%PDF")
}

/// 计算 TC3-HMAC-SHA256 的 Authorization 头
///
/// 固定文档/时间戳/密钥下结果逐字节可复现。步骤与服务商协议一致:
/// 规范请求串 -> 待签名字符串 -> 三级派生密钥 -> 最终签名。
pub(crate) fn build_authorization(
    secret_id: &str,
    secret_key: &str,
    host: &str,
    payload: &str,
    timestamp: i64,
) -> String {
    let date = DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    // 1. 拼接规范请求串
    let canonical_headers = format!(
        "content-type:{}\nhost:{}\nx-tc-action:{}\n",
        CONTENT_TYPE,
        host,
        ACTION.to_lowercase()
    );
    let signed_headers = "content-type;host;x-tc-action";
    let hashed_payload = sha256_hex(payload.as_bytes());
    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers, signed_headers, hashed_payload
    );

    // 2. 拼接待签名字符串
    let credential_scope = format!("{}/{}/tc3_request", date, SERVICE);
    let hashed_canonical_request = sha256_hex(canonical_request.as_bytes());
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM, timestamp, credential_scope, hashed_canonical_request
    );

    // 3. 计算签名 (三级 HMAC 派生)
    let secret_date = hmac_sha256(format!("TC3{}", secret_key).as_bytes(), &date);
    let secret_service = hmac_sha256(&secret_date, SERVICE);
    let secret_signing = hmac_sha256(&secret_service, "tc3_request");
    let signature = hex::encode(hmac_sha256(&secret_signing, &string_to_sign));

    // 4. 拼接 Authorization
    format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, secret_id, credential_scope, signed_headers, signature
    )
}

fn hmac_sha256(key: &[u8], msg: &str) -> Vec<u8> {
    // HMAC 接受任意长度密钥，new_from_slice 不会失败
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length");
    mac.update(msg.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OcrConfig;

    fn test_config(secret_id: &str, secret_key: &str) -> OcrConfig {
        OcrConfig {
            secret_id: secret_id.to_string(),
            secret_key: secret_key.to_string(),
            endpoint: "ocr.tencentcloudapi.com".to_string(),
            region: "ap-guangzhou".to_string(),
        }
    }

    #[test]
    fn missing_credentials_fail_before_any_io() {
        assert!(matches!(
            OcrClient::new(&test_config("", "")),
            Err(RecognitionError::Configuration(_))
        ));
        assert!(matches!(
            OcrClient::new(&test_config("id", "")),
            Err(RecognitionError::Configuration(_))
        ));
        assert!(OcrClient::new(&test_config("id", "key")).is_ok());
    }

    #[test]
    fn signature_matches_pinned_vector() {
        // 固定输入下的回归基准，对齐服务商签名协议
        let authorization = build_authorization(
            "TestSecretId",
            "TestSecretKey",
            "ocr.tencentcloudapi.com",
            r#"{"ImageBase64":"dGVzdA=="}"#,
            1678838400,
        );
        assert_eq!(
            authorization,
            "TC3-HMAC-SHA256 Credential=TestSecretId/2023-03-15/ocr/tc3_request, \
             SignedHeaders=content-type;host;x-tc-action, \
             Signature=06441070d4bd264e385bd4e53160a6fb56ba309d1b782bd1d70da64625c6885f"
        );
    }

    #[test]
    fn signature_is_deterministic() {
        let a = build_authorization("id", "key", "ocr.tencentcloudapi.com", "{}", 1700000000);
        let b = build_authorization("id", "key", "ocr.tencentcloudapi.com", "{}", 1700000000);
        assert_eq!(a, b);
    }

    #[test]
    fn pdf_detection_uses_leading_bytes() {
        assert!(is_pdf(b"%PDF-1.7 ..."));
        assert!(!is_pdf(b"\x89PNG\r\n\x1a\n"));
        assert!(!is_pdf(b""));
    }
}
