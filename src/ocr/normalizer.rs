use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::NormalizeError;
use crate::models::{CanonicalInvoice, InvoiceItem, NormalizedInvoice, Party};

/// 发票号码超过该长度时，前缀截为发票代码
///
/// 部分票面把代码和号码连排印在同一字段里。10 是沿用的经验值，
/// 对畸形输入可能误切，只做尽力而为的回填。
pub const CODE_BACKFILL_LEN: usize = 10;

/// 把 OCR 原始响应归一化为规范发票记录
///
/// 响应结构: `Response.VatInvoiceInfos` 为 `{Name, Value}` 扁平字段数组，
/// `Response.Items` 为明细行数组。两个容器都缺失时判定为不可识别。
pub fn normalize_response(raw: &str) -> Result<NormalizedInvoice, NormalizeError> {
    let response: Value = serde_json::from_str(raw)
        .map_err(|e| NormalizeError::UnrecognizedDocument(format!("响应不是有效JSON: {}", e)))?;

    let body = &response["Response"];
    let infos = body.get("VatInvoiceInfos").and_then(Value::as_array);
    let items = body.get("Items").and_then(Value::as_array);
    if infos.is_none() && items.is_none() {
        let detail = body
            .pointer("/Error/Message")
            .and_then(Value::as_str)
            .unwrap_or("响应中没有发票字段");
        return Err(NormalizeError::UnrecognizedDocument(detail.to_string()));
    }

    // 构建扁平查找表，字段顺序无关；重名字段后者覆盖前者 (OCR 字段
    // 合并的惯例行为，必须保留)
    let mut fields: HashMap<String, String> = HashMap::new();
    for info in infos.into_iter().flatten() {
        if let (Some(name), Some(value)) = (
            info.get("Name").and_then(Value::as_str),
            info.get("Value").and_then(Value::as_str),
        ) {
            fields.insert(name.to_string(), value.to_string());
        }
    }

    let invoice_type = field(&fields, "发票类型");
    let layout = detect_layout(&invoice_type);
    debug!("发票类型 {:?} -> {:?}", invoice_type, layout.tag());

    // 发票号码清洗 + 代码回填
    let mut invoice_number = strip_number_prefix(&field(&fields, "发票号码"));
    let mut invoice_code = field(&fields, "发票代码");
    if invoice_code.is_empty() && invoice_number.chars().count() > CODE_BACKFILL_LEN {
        let split = invoice_number
            .char_indices()
            .nth(CODE_BACKFILL_LEN)
            .map(|(i, _)| i)
            .unwrap_or(invoice_number.len());
        invoice_code = invoice_number[..split].to_string();
        invoice_number = invoice_number[split..].to_string();
    }

    let amounts = layout.amounts(&fields);
    let issue_date_raw = field(&fields, "开票日期");
    let issue_date = normalize_issue_date(&issue_date_raw);

    let line_items: Vec<InvoiceItem> = items
        .into_iter()
        .flatten()
        .map(remap_line_item)
        .collect();

    let record = CanonicalInvoice {
        invoice_type,
        invoice_code,
        invoice_number,
        check_code: field(&fields, "校验码"),
        machine_number: field(&fields, "机器编号"),
        issue_date_raw,
        issue_date,
        seller: Party {
            name: field(&fields, "销售方名称"),
            tax_id: layout.tax_id(&fields, "销售方"),
            address_phone: field(&fields, "销售方地址、电话"),
            bank_account: field(&fields, "销售方开户行及账号"),
        },
        buyer: Party {
            name: field(&fields, "购买方名称"),
            tax_id: layout.tax_id(&fields, "购买方"),
            address_phone: field(&fields, "购买方地址、电话"),
            bank_account: field(&fields, "购买方开户行及账号"),
        },
        subtotal: amounts.subtotal,
        tax_total: amounts.tax_total,
        total_in_words: amounts.total_in_words,
        total_in_figures: amounts.total_in_figures,
        notes: field(&fields, "备注"),
        payee: field(&fields, "收款人"),
        reviewer: field(&fields, "复核"),
        issuer: field(&fields, "开票人"),
        items: line_items,
    };

    let document = build_document(&record);
    Ok(NormalizedInvoice { record, document })
}

fn field(fields: &HashMap<String, String>, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

/// 金额四件套
struct Amounts {
    subtotal: String,
    tax_total: String,
    total_in_words: String,
    total_in_figures: String,
}

/// 版式策略: 专票与普票的字段集不同，各自的映射表独立成体
trait LayoutStrategy {
    fn tag(&self) -> &'static str;
    fn amounts(&self, fields: &HashMap<String, String>) -> Amounts;
    fn tax_id(&self, fields: &HashMap<String, String>, party: &str) -> String;
}

/// 增值税专用发票: 金额/税额/价税合计分列，字段名固定
struct SpecialLayout;

/// 增值税普通发票: 可能只有一个合并的总额字段，识别号字段名不统一
struct GeneralLayout;

impl LayoutStrategy for SpecialLayout {
    fn tag(&self) -> &'static str {
        "special"
    }

    fn amounts(&self, fields: &HashMap<String, String>) -> Amounts {
        Amounts {
            subtotal: normalize_amount(&field(fields, "合计金额")),
            tax_total: normalize_amount(&field(fields, "合计税额")),
            total_in_words: field(fields, "价税合计(大写)"),
            total_in_figures: normalize_amount(&first_present(
                fields,
                &["小写金额", "价税合计(小写)"],
            )),
        }
    }

    fn tax_id(&self, fields: &HashMap<String, String>, party: &str) -> String {
        field(fields, &format!("{}识别号", party))
    }
}

impl GeneralLayout {
    /// 总额候选字段，固定优先级: 明确的合计金额 -> 价税合计 -> 合计 -> 金额
    const TOTAL_CANDIDATES: [&'static str; 4] = ["合计金额", "价税合计", "合计", "金额"];
}

impl LayoutStrategy for GeneralLayout {
    fn tag(&self) -> &'static str {
        "general"
    }

    fn amounts(&self, fields: &HashMap<String, String>) -> Amounts {
        // 普票可能只带一个合并总额，用它补齐缺失的合计金额
        let combined = first_present(fields, &Self::TOTAL_CANDIDATES);
        let figures = first_present(fields, &["小写金额", "价税合计(小写)"]);
        Amounts {
            subtotal: normalize_amount(&combined),
            tax_total: normalize_amount(&field(fields, "合计税额")),
            total_in_words: field(fields, "价税合计(大写)"),
            total_in_figures: normalize_amount(if figures.is_empty() {
                &combined
            } else {
                &figures
            }),
        }
    }

    fn tax_id(&self, fields: &HashMap<String, String>, party: &str) -> String {
        // 普票上识别号可能用工商登记的长名称
        let short = field(fields, &format!("{}识别号", party));
        if !short.is_empty() {
            return short;
        }
        field(
            fields,
            &format!("{}统一社会信用代码/纳税人识别号", party),
        )
    }
}

/// 按发票类型字段中的 "专用" 标记选择版式策略
fn detect_layout(invoice_type: &str) -> Box<dyn LayoutStrategy> {
    if invoice_type.contains("专用") {
        Box::new(SpecialLayout)
    } else {
        Box::new(GeneralLayout)
    }
}

fn first_present(fields: &HashMap<String, String>, candidates: &[&str]) -> String {
    candidates
        .iter()
        .map(|name| field(fields, name))
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

/// 去除发票号码的 No. / No 前缀 (大小写敏感，只剥前缀)
///
/// 该号码是去重键，剥前缀不一致会破坏唯一性。
pub fn strip_number_prefix(number: &str) -> String {
    if let Some(rest) = number.strip_prefix("No.") {
        rest.to_string()
    } else if let Some(rest) = number.strip_prefix("No") {
        rest.to_string()
    } else {
        number.to_string()
    }
}

/// 金额规范化: 去掉所有货币符号变体、千分位和首尾空白，统一补一个 ¥
///
/// 不在此处转数值，乱码文本必须原样保留。幂等。
pub fn normalize_amount(amount: &str) -> String {
    let cleaned: String = amount
        .chars()
        .filter(|c| !matches!(c, '¥' | '￥' | ','))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return String::new();
    }
    format!("¥{}", cleaned)
}

/// 日期标准化
///
/// 接受 "YYYY年MM月DD日" 或以 - / . 分隔的形式；月日补零，
/// 两位年份前补 "20"。无法匹配时返回 None，原始文本另行保留。
pub fn normalize_issue_date(raw: &str) -> Option<NaiveDate> {
    if raw.is_empty() {
        return None;
    }

    let (year, month, day) = if raw.contains('年') && raw.contains('月') && raw.contains('日') {
        let year = raw.split('年').next()?.trim().to_string();
        let rest = raw.split('年').nth(1)?;
        let month = rest.split('月').next()?.trim().to_string();
        let day = rest.split('月').nth(1)?.split('日').next()?.trim().to_string();
        (year, month, day)
    } else {
        let sep = ['-', '/', '.'].into_iter().find(|s| raw.contains(*s))?;
        let parts: Vec<&str> = raw.split(sep).collect();
        if parts.len() < 3 {
            return None;
        }
        (
            parts[0].trim().to_string(),
            parts[1].trim().to_string(),
            parts[2].trim().to_string(),
        )
    };

    let year = if year.len() == 2 {
        format!("20{}", year)
    } else {
        year
    };
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// 明细行字段名映射到规范形态，兼容服务端的几种命名
fn remap_line_item(item: &Value) -> InvoiceItem {
    let get = |names: &[&str]| -> String {
        names
            .iter()
            .filter_map(|n| item.get(*n).and_then(Value::as_str))
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_string()
    };

    InvoiceItem {
        name: get(&["Name", "项目名称", "LineNo"]),
        specification: get(&["Specification", "规格型号", "Spec"]),
        unit: get(&["Unit", "单位"]),
        quantity: get(&["Quantity", "数量"]),
        unit_price: get(&["Price", "单价", "UnitPrice"]),
        amount: get(&["Amount", "金额", "AmountWithoutTax"]),
        tax_rate: get(&["TaxRate", "税率"]),
        tax_amount: get(&["Tax", "税额", "TaxAmount"]),
    }
}

/// 完整归一化文档，入库后可离线重新抽取字段，无需再调 OCR
fn build_document(record: &CanonicalInvoice) -> Value {
    let mut basic = json!({
        "发票类型": record.invoice_type,
        "发票代码": record.invoice_code,
        "发票号码": record.invoice_number,
        "开票日期": record.issue_date_raw,
        "校验码": record.check_code,
        "机器编号": record.machine_number,
    });
    if let Some(date) = record.issue_date {
        basic["开票日期标准格式"] = json!(date.format("%Y-%m-%d").to_string());
    }

    json!({
        "基本信息": basic,
        "销售方信息": {
            "名称": record.seller.name,
            "识别号": record.seller.tax_id,
            "地址电话": record.seller.address_phone,
            "开户行及账号": record.seller.bank_account,
        },
        "购买方信息": {
            "名称": record.buyer.name,
            "识别号": record.buyer.tax_id,
            "地址电话": record.buyer.address_phone,
            "开户行及账号": record.buyer.bank_account,
        },
        "金额信息": {
            "合计金额": record.subtotal,
            "合计税额": record.tax_total,
            "价税合计(大写)": record.total_in_words,
            "价税合计(小写)": record.total_in_figures,
        },
        "商品信息": record.items,
        "其他信息": {
            "备注": record.notes,
            "收款人": record.payee,
            "复核": record.reviewer,
            "开票人": record.issuer,
        },
        "处理时间": chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(fields: &[(&str, &str)], items: Value) -> String {
        let infos: Vec<Value> = fields
            .iter()
            .map(|(n, v)| json!({"Name": n, "Value": v}))
            .collect();
        json!({"Response": {"VatInvoiceInfos": infos, "Items": items}}).to_string()
    }

    #[test]
    fn missing_containers_is_unrecognized() {
        let raw = json!({"Response": {"Error": {"Code": "FailedOperation.UnKnowError",
            "Message": "图片中未识别到发票"}}})
        .to_string();
        let err = normalize_response(&raw).unwrap_err();
        assert!(matches!(err, NormalizeError::UnrecognizedDocument(_)));
        assert!(err.to_string().contains("未识别到发票"));
    }

    #[test]
    fn duplicate_field_names_last_wins() {
        let raw = response_with(
            &[("发票号码", "11111111"), ("发票号码", "22222222")],
            json!([]),
        );
        let normalized = normalize_response(&raw).unwrap();
        assert_eq!(normalized.record.invoice_number, "22222222");
    }

    #[test]
    fn number_prefix_stripping() {
        assert_eq!(strip_number_prefix("No.12345678"), "12345678");
        assert_eq!(strip_number_prefix("No12345678"), "12345678");
        assert_eq!(strip_number_prefix("12345678"), "12345678");
        // 大小写敏感，no 前缀不剥
        assert_eq!(strip_number_prefix("no.12345678"), "no.12345678");
    }

    #[test]
    fn code_backfill_from_long_number() {
        let raw = response_with(&[("发票号码", "144031809110012345678")], json!([]));
        let normalized = normalize_response(&raw).unwrap();
        assert_eq!(normalized.record.invoice_code, "1440318091");
        assert_eq!(normalized.record.invoice_number, "10012345678");
    }

    #[test]
    fn code_backfill_skips_short_numbers_and_explicit_codes() {
        // 恰好 10 位不触发回填
        let raw = response_with(&[("发票号码", "1234567890")], json!([]));
        let normalized = normalize_response(&raw).unwrap();
        assert_eq!(normalized.record.invoice_code, "");
        assert_eq!(normalized.record.invoice_number, "1234567890");

        // 已有代码时号码保持原样
        let raw = response_with(
            &[("发票代码", "044001234567"), ("发票号码", "144031809110012345678")],
            json!([]),
        );
        let normalized = normalize_response(&raw).unwrap();
        assert_eq!(normalized.record.invoice_code, "044001234567");
        assert_eq!(normalized.record.invoice_number, "144031809110012345678");
    }

    #[test]
    fn amount_normalization_is_idempotent() {
        assert_eq!(normalize_amount("￥1,234.56"), "¥1234.56");
        assert_eq!(normalize_amount("¥1234.56"), "¥1234.56");
        assert_eq!(normalize_amount(&normalize_amount("  ¥¥88.00 ")), "¥88.00");
        assert_eq!(normalize_amount(""), "");
    }

    #[test]
    fn date_normalization_cases() {
        assert_eq!(
            normalize_issue_date("2023年03月15日"),
            NaiveDate::from_ymd_opt(2023, 3, 15)
        );
        assert_eq!(
            normalize_issue_date("23-3-5"),
            NaiveDate::from_ymd_opt(2023, 3, 5)
        );
        assert_eq!(
            normalize_issue_date("2024/1/9"),
            NaiveDate::from_ymd_opt(2024, 1, 9)
        );
        assert_eq!(
            normalize_issue_date("2024.12.31"),
            NaiveDate::from_ymd_opt(2024, 12, 31)
        );
        assert_eq!(normalize_issue_date("unknown"), None);
        assert_eq!(normalize_issue_date("2023年13月40日"), None);
    }

    #[test]
    fn unparseable_date_keeps_raw_text() {
        let raw = response_with(
            &[("发票号码", "12345678"), ("开票日期", "unknown")],
            json!([]),
        );
        let normalized = normalize_response(&raw).unwrap();
        assert_eq!(normalized.record.issue_date, None);
        assert_eq!(normalized.record.issue_date_raw, "unknown");
        // 审计文档里不出现标准格式键
        assert!(normalized.document["基本信息"]
            .get("开票日期标准格式")
            .is_none());
    }

    #[test]
    fn special_layout_extracts_separate_amounts() {
        let raw = response_with(
            &[
                ("发票类型", "增值税专用发票"),
                ("发票代码", "4400212130"),
                ("发票号码", "12345678"),
                ("合计金额", "¥100.00"),
                ("合计税额", "¥13.00"),
                ("价税合计(大写)", "壹佰壹拾叁圆整"),
                ("小写金额", "￥113.00"),
                ("销售方识别号", "91440300MA5EXW2A8F"),
            ],
            json!([]),
        );
        let record = normalize_response(&raw).unwrap().record;
        assert_eq!(record.subtotal, "¥100.00");
        assert_eq!(record.tax_total, "¥13.00");
        assert_eq!(record.total_in_words, "壹佰壹拾叁圆整");
        assert_eq!(record.total_in_figures, "¥113.00");
        assert_eq!(record.seller.tax_id, "91440300MA5EXW2A8F");
    }

    #[test]
    fn general_layout_backfills_subtotal_from_combined_total() {
        // 只有合并总额、无税额字段时，补出的合计金额等于该总额
        let raw = response_with(
            &[
                ("发票类型", "增值税电子普通发票"),
                ("发票号码", "87654321"),
                ("价税合计", "¥66.00"),
            ],
            json!([]),
        );
        let record = normalize_response(&raw).unwrap().record;
        assert_eq!(record.subtotal, "¥66.00");
        assert_eq!(record.tax_total, "");
        assert_eq!(record.total_in_figures, "¥66.00");
    }

    #[test]
    fn general_layout_total_candidates_follow_priority() {
        let raw = response_with(
            &[
                ("发票类型", "增值税普通发票"),
                ("发票号码", "87654321"),
                ("金额", "¥1.00"),
                ("合计", "¥2.00"),
                ("合计金额", "¥3.00"),
            ],
            json!([]),
        );
        let record = normalize_response(&raw).unwrap().record;
        assert_eq!(record.subtotal, "¥3.00");
    }

    #[test]
    fn general_layout_maps_long_tax_id_field() {
        let raw = response_with(
            &[
                ("发票类型", "增值税电子普通发票"),
                ("发票号码", "87654321"),
                ("购买方统一社会信用代码/纳税人识别号", "91110108795671ABC"),
            ],
            json!([]),
        );
        let record = normalize_response(&raw).unwrap().record;
        assert_eq!(record.buyer.tax_id, "91110108795671ABC");
    }

    #[test]
    fn line_items_remap_alternate_keys() {
        let raw = response_with(
            &[("发票类型", "增值税专用发票"), ("发票号码", "12345678")],
            json!([
                {"Name": "办公用品", "Unit": "个", "Quantity": "2",
                 "UnitPrice": "50.00", "AmountWithoutTax": "100.00",
                 "TaxRate": "13%", "TaxAmount": "13.00"},
                {"项目名称": "咨询服务", "金额": "200.00"}
            ]),
        );
        let record = normalize_response(&raw).unwrap().record;
        assert_eq!(record.items.len(), 2);
        assert_eq!(record.items[0].name, "办公用品");
        assert_eq!(record.items[0].unit_price, "50.00");
        assert_eq!(record.items[0].amount, "100.00");
        assert_eq!(record.items[0].tax_amount, "13.00");
        assert_eq!(record.items[1].name, "咨询服务");
        assert_eq!(record.items[1].amount, "200.00");
    }

    #[test]
    fn empty_items_container_is_valid() {
        let raw = response_with(&[("发票号码", "12345678")], json!([]));
        let record = normalize_response(&raw).unwrap().record;
        assert!(record.items.is_empty());
        assert_eq!(record.invoice_number, "12345678");
    }
}
