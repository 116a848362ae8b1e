use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 交易方信息 (销售方与购买方同构)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub tax_id: String,
    pub address_phone: String,
    pub bank_account: String,
}

/// 归一化后的规范发票记录
///
/// 金额字段保留字符串形态 (统一前缀单个 ¥)，OCR 偶尔返回部分乱码的
/// 数字文本，为了审计必须原样保存；需要算术时再做有损解析。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalInvoice {
    pub invoice_type: String,
    pub invoice_code: String,
    pub invoice_number: String,
    pub check_code: String,
    pub machine_number: String,
    /// 票面原始日期文本
    pub issue_date_raw: String,
    /// 标准化日期，解析失败时为 None 而不是默认值
    pub issue_date: Option<NaiveDate>,
    pub seller: Party,
    pub buyer: Party,
    pub subtotal: String,
    pub tax_total: String,
    pub total_in_words: String,
    pub total_in_figures: String,
    pub notes: String,
    pub payee: String,
    pub reviewer: String,
    pub issuer: String,
    pub items: Vec<InvoiceItem>,
}

/// 发票明细行，字段全部为字符串 (与金额字段同理)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub name: String,
    pub specification: String,
    pub unit: String,
    pub quantity: String,
    pub unit_price: String,
    pub amount: String,
    pub tax_rate: String,
    pub tax_amount: String,
}

/// 归一化输出: 规范记录 + 完整归一化文档 (审计用，可离线重新抽取字段)
#[derive(Debug, Clone)]
pub struct NormalizedInvoice {
    pub record: CanonicalInvoice,
    pub document: serde_json::Value,
}

/// 发票表行 (invoices)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StoredInvoice {
    pub id: i64,
    pub invoice_type: Option<String>,
    pub invoice_code: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub invoice_date_raw: Option<String>,
    pub check_code: Option<String>,
    pub machine_number: Option<String>,
    pub seller_name: Option<String>,
    pub seller_tax_id: Option<String>,
    pub seller_address: Option<String>,
    pub seller_bank_info: Option<String>,
    pub buyer_name: Option<String>,
    pub buyer_tax_id: Option<String>,
    pub buyer_address: Option<String>,
    pub buyer_bank_info: Option<String>,
    pub total_amount: Option<String>,
    pub total_tax: Option<String>,
    pub amount_in_words: Option<String>,
    pub amount_in_figures: Option<String>,
    pub remarks: Option<String>,
    pub payee: Option<String>,
    pub reviewer: Option<String>,
    pub issuer: Option<String>,
    pub image_path: Option<String>,
    pub json_data: Option<String>,
    pub project_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl StoredInvoice {
    /// 发票代码+号码的组合标识，普通发票可能只有号码
    pub fn combined_id(&self) -> String {
        match (
            self.invoice_number.as_deref().filter(|s| !s.is_empty()),
            self.invoice_code.as_deref().filter(|s| !s.is_empty()),
        ) {
            (Some(number), Some(code)) => format!("{}{}", code, number),
            (Some(number), None) => format!("NO.{}", number),
            _ => format!("ID{}", self.id),
        }
    }

    /// 价税合计(小写)的有损数值解析，仅用于统计汇总
    pub fn total_amount_value(&self) -> Option<f64> {
        crate::export::parse_amount(self.amount_in_figures.as_deref().unwrap_or(""))
    }
}

/// 发票明细表行 (invoice_items)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StoredInvoiceItem {
    pub id: i64,
    pub invoice_id: i64,
    pub name: Option<String>,
    pub specification: Option<String>,
    pub unit: Option<String>,
    pub quantity: Option<String>,
    pub unit_price: Option<String>,
    pub amount: Option<String>,
    pub tax_rate: Option<String>,
    pub tax_amount: Option<String>,
}
