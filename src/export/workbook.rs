use std::collections::BTreeMap;
use std::path::Path;

use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};

use crate::error::ExportError;
use crate::models::{Project, StoredInvoice, StoredInvoiceItem};

use super::parse_amount;

/// 项目导出中单票详情工作表的数量上限，防止工作表爆炸
pub const DETAIL_SHEET_CAP: usize = 10;

/// Excel 工作表名长度上限
const SHEET_NAME_MAX: usize = 31;

const ITEM_HEADERS: [&str; 8] = [
    "商品名称",
    "规格型号",
    "单位",
    "数量",
    "单价",
    "金额",
    "税率",
    "税额",
];

fn xe(err: XlsxError) -> ExportError {
    ExportError::Write(err.to_string())
}

/// 导出单张发票为工作簿: 基本信息表 + 商品明细表
pub fn export_invoice_workbook(
    invoice: &StoredInvoice,
    items: &[StoredInvoiceItem],
    path: &Path,
) -> Result<(), ExportError> {
    let mut workbook = Workbook::new();

    let sheet = workbook.add_worksheet();
    sheet.set_name("发票基本信息").map_err(xe)?;
    write_basic_info(sheet, invoice, 0).map_err(xe)?;

    if !items.is_empty() {
        let sheet = workbook.add_worksheet();
        sheet.set_name("商品明细").map_err(xe)?;
        write_item_grid(sheet, items, 0).map_err(xe)?;
    }

    save_workbook(workbook, path)
}

/// 项目 (发票分组) 导出为多表工作簿
///
/// 摘要、发票列表、商品明细、按月/按类型/按销售方/按购买方统计，
/// 以及前 DETAIL_SHEET_CAP 张发票的单票详情表。
pub fn export_project_workbook(
    project: &Project,
    invoices: &[(StoredInvoice, Vec<StoredInvoiceItem>)],
    path: &Path,
) -> Result<(), ExportError> {
    let aggregates = collect_aggregates(invoices);
    let mut workbook = Workbook::new();

    // 1. 项目摘要
    let sheet = workbook.add_worksheet();
    sheet.set_name("项目摘要").map_err(xe)?;
    write_summary(sheet, project, &aggregates).map_err(xe)?;

    // 2. 发票列表
    let sheet = workbook.add_worksheet();
    sheet.set_name("发票列表").map_err(xe)?;
    write_invoice_list(sheet, invoices).map_err(xe)?;

    // 3. 商品明细 (跨发票)
    if invoices.iter().any(|(_, items)| !items.is_empty()) {
        let sheet = workbook.add_worksheet();
        sheet.set_name("商品明细").map_err(xe)?;
        write_all_items(sheet, invoices).map_err(xe)?;
    }

    // 4. 统计表，分组键缺失的记录不进入对应分组
    write_stat_sheet(&mut workbook, "按月统计", "月份", &aggregates.monthly).map_err(xe)?;
    write_stat_sheet(&mut workbook, "发票类型分析", "发票类型", &aggregates.by_type)
        .map_err(xe)?;
    write_stat_sheet(&mut workbook, "销售方分析", "销售方", &aggregates.by_seller)
        .map_err(xe)?;
    write_stat_sheet(&mut workbook, "购买方分析", "购买方", &aggregates.by_buyer)
        .map_err(xe)?;

    // 5. 单票详情表
    for (idx, (invoice, items)) in invoices.iter().take(DETAIL_SHEET_CAP).enumerate() {
        let sheet = workbook.add_worksheet();
        sheet
            .set_name(detail_sheet_name(idx, invoice))
            .map_err(xe)?;
        write_basic_info(sheet, invoice, 0).map_err(xe)?;
        if !items.is_empty() {
            // 明细从第 25 行起，给基本信息留固定空间
            write_item_grid(sheet, items, 25).map_err(xe)?;
        }
    }

    save_workbook(workbook, path)
}

/// 按分组键汇总出的统计数据
#[derive(Debug, Default)]
pub(crate) struct Aggregates {
    pub count: usize,
    pub total: f64,
    pub monthly: BTreeMap<String, GroupStat>,
    pub by_type: BTreeMap<String, GroupStat>,
    pub by_seller: BTreeMap<String, GroupStat>,
    pub by_buyer: BTreeMap<String, GroupStat>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GroupStat {
    pub count: usize,
    pub total: f64,
}

impl GroupStat {
    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// 汇总统计
///
/// 金额解析失败的记录计数但按零贡献；分组键 (日期/类型/交易方)
/// 缺失的记录只是不进入该分组，不会中止导出。
pub(crate) fn collect_aggregates(
    invoices: &[(StoredInvoice, Vec<StoredInvoiceItem>)],
) -> Aggregates {
    let mut aggregates = Aggregates {
        count: invoices.len(),
        ..Default::default()
    };

    for (invoice, _) in invoices {
        let amount = invoice.total_amount_value().unwrap_or(0.0);
        aggregates.total += amount;

        let mut bump = |map: &mut BTreeMap<String, GroupStat>, key: String| {
            let stat = map.entry(key).or_default();
            stat.count += 1;
            stat.total += amount;
        };

        if let Some(date) = invoice.invoice_date {
            bump(&mut aggregates.monthly, date.format("%Y-%m").to_string());
        }
        if let Some(kind) = invoice.invoice_type.as_deref().filter(|s| !s.is_empty()) {
            bump(&mut aggregates.by_type, kind.to_string());
        }
        if let Some(seller) = invoice.seller_name.as_deref().filter(|s| !s.is_empty()) {
            bump(&mut aggregates.by_seller, seller.to_string());
        }
        if let Some(buyer) = invoice.buyer_name.as_deref().filter(|s| !s.is_empty()) {
            bump(&mut aggregates.by_buyer, buyer.to_string());
        }
    }
    aggregates
}

fn write_summary(
    sheet: &mut Worksheet,
    project: &Project,
    aggregates: &Aggregates,
) -> Result<(), XlsxError> {
    sheet.write_string(0, 0, "项目信息")?;
    sheet.write_string(0, 1, "内容")?;

    let average = if aggregates.count == 0 {
        0.0
    } else {
        aggregates.total / aggregates.count as f64
    };
    let rows: [(&str, String); 8] = [
        ("项目名称", project.name.clone()),
        (
            "项目描述",
            project.description.clone().unwrap_or_default(),
        ),
        ("创建日期", project.created_at.format("%Y-%m-%d").to_string()),
        (
            "最后更新日期",
            project.updated_at.format("%Y-%m-%d").to_string(),
        ),
        ("发票总数", aggregates.count.to_string()),
        ("总金额", format!("{:.2}", aggregates.total)),
        ("平均金额", format!("{:.2}", average)),
        (
            "导出日期",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        ),
    ];
    for (i, (label, value)) in rows.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_string(row, 0, *label)?;
        sheet.write_string(row, 1, value)?;
    }
    Ok(())
}

fn write_invoice_list(
    sheet: &mut Worksheet,
    invoices: &[(StoredInvoice, Vec<StoredInvoiceItem>)],
) -> Result<(), XlsxError> {
    let headers = [
        "发票代码",
        "发票号码",
        "发票ID",
        "发票类型",
        "开票日期",
        "销售方",
        "销售方税号",
        "购买方",
        "购买方税号",
        "金额",
        "税额",
        "价税合计",
        "项目数量",
        "创建时间",
    ];
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }

    let opt = |value: &Option<String>| value.clone().unwrap_or_default();
    for (i, (invoice, items)) in invoices.iter().enumerate() {
        let row = (i + 1) as u32;
        let cells = [
            opt(&invoice.invoice_code),
            opt(&invoice.invoice_number),
            invoice.combined_id(),
            opt(&invoice.invoice_type),
            invoice
                .invoice_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            opt(&invoice.seller_name),
            opt(&invoice.seller_tax_id),
            opt(&invoice.buyer_name),
            opt(&invoice.buyer_tax_id),
            opt(&invoice.total_amount),
            opt(&invoice.total_tax),
            opt(&invoice.amount_in_figures),
            items.len().to_string(),
            invoice.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ];
        for (col, cell) in cells.iter().enumerate() {
            sheet.write_string(row, col as u16, cell)?;
        }
    }
    Ok(())
}

fn write_all_items(
    sheet: &mut Worksheet,
    invoices: &[(StoredInvoice, Vec<StoredInvoiceItem>)],
) -> Result<(), XlsxError> {
    let headers = [
        "发票ID",
        "发票号码",
        "开票日期",
        "商品名称",
        "规格型号",
        "单位",
        "数量",
        "单价",
        "金额",
        "税率",
        "税额",
    ];
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }

    let opt = |value: &Option<String>| value.clone().unwrap_or_default();
    let mut row: u32 = 1;
    for (invoice, items) in invoices {
        for item in items {
            let cells = [
                invoice.combined_id(),
                opt(&invoice.invoice_number),
                invoice
                    .invoice_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
                opt(&item.name),
                opt(&item.specification),
                opt(&item.unit),
                opt(&item.quantity),
                opt(&item.unit_price),
                opt(&item.amount),
                opt(&item.tax_rate),
                opt(&item.tax_amount),
            ];
            for (col, cell) in cells.iter().enumerate() {
                sheet.write_string(row, col as u16, cell)?;
            }
            row += 1;
        }
    }
    Ok(())
}

fn write_stat_sheet(
    workbook: &mut Workbook,
    sheet_name: &str,
    key_header: &str,
    stats: &BTreeMap<String, GroupStat>,
) -> Result<(), XlsxError> {
    if stats.is_empty() {
        return Ok(());
    }
    let sheet = workbook.add_worksheet();
    sheet.set_name(sheet_name)?;

    for (col, header) in [key_header, "发票数量", "总金额", "平均金额"]
        .iter()
        .enumerate()
    {
        sheet.write_string(0, col as u16, *header)?;
    }

    // 金额降序 (按月统计保持月份升序)
    let mut rows: Vec<(&String, &GroupStat)> = stats.iter().collect();
    if sheet_name != "按月统计" {
        rows.sort_by(|a, b| b.1.total.total_cmp(&a.1.total));
    }

    for (i, (key, stat)) in rows.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_string(row, 0, key.as_str())?;
        sheet.write_number(row, 1, stat.count as f64)?;
        sheet.write_number(row, 2, stat.total)?;
        sheet.write_number(row, 3, stat.average())?;
    }
    Ok(())
}

/// 单票基本信息的 项目/内容 两列块
fn write_basic_info(
    sheet: &mut Worksheet,
    invoice: &StoredInvoice,
    start_row: u32,
) -> Result<(), XlsxError> {
    let opt = |value: &Option<String>| value.clone().unwrap_or_default();
    let rows: [(&str, String); 22] = [
        ("发票类型", opt(&invoice.invoice_type)),
        ("发票代码", opt(&invoice.invoice_code)),
        ("发票号码", opt(&invoice.invoice_number)),
        ("开票日期", opt(&invoice.invoice_date_raw)),
        ("校验码", opt(&invoice.check_code)),
        ("机器编号", opt(&invoice.machine_number)),
        ("销售方名称", opt(&invoice.seller_name)),
        ("销售方识别号", opt(&invoice.seller_tax_id)),
        ("销售方地址电话", opt(&invoice.seller_address)),
        ("销售方开户行及账号", opt(&invoice.seller_bank_info)),
        ("购买方名称", opt(&invoice.buyer_name)),
        ("购买方识别号", opt(&invoice.buyer_tax_id)),
        ("购买方地址电话", opt(&invoice.buyer_address)),
        ("购买方开户行及账号", opt(&invoice.buyer_bank_info)),
        ("合计金额", opt(&invoice.total_amount)),
        ("合计税额", opt(&invoice.total_tax)),
        ("价税合计(大写)", opt(&invoice.amount_in_words)),
        ("价税合计(小写)", opt(&invoice.amount_in_figures)),
        ("备注", opt(&invoice.remarks)),
        ("收款人", opt(&invoice.payee)),
        ("复核", opt(&invoice.reviewer)),
        ("开票人", opt(&invoice.issuer)),
    ];

    sheet.write_string(start_row, 0, "项目")?;
    sheet.write_string(start_row, 1, "内容")?;
    for (i, (label, value)) in rows.iter().enumerate() {
        let row = start_row + 1 + i as u32;
        sheet.write_string(row, 0, *label)?;
        sheet.write_string(row, 1, value)?;
    }
    Ok(())
}

fn write_item_grid(
    sheet: &mut Worksheet,
    items: &[StoredInvoiceItem],
    start_row: u32,
) -> Result<(), XlsxError> {
    for (col, header) in ITEM_HEADERS.iter().enumerate() {
        sheet.write_string(start_row, col as u16, *header)?;
    }

    let opt = |value: &Option<String>| value.clone().unwrap_or_default();
    for (i, item) in items.iter().enumerate() {
        let row = start_row + 1 + i as u32;
        let cells = [
            opt(&item.name),
            opt(&item.specification),
            opt(&item.unit),
            opt(&item.quantity),
            opt(&item.unit_price),
            opt(&item.amount),
            opt(&item.tax_rate),
            opt(&item.tax_amount),
        ];
        for (col, cell) in cells.iter().enumerate() {
            sheet.write_string(row, col as u16, cell)?;
        }
    }
    Ok(())
}

/// 详情表名: 发票{序号}_{号码后6位}，截断到 Excel 的 31 字符限制
fn detail_sheet_name(idx: usize, invoice: &StoredInvoice) -> String {
    let number = invoice.invoice_number.clone().unwrap_or_default();
    let tail_start = number.char_indices().rev().nth(5).map(|(i, _)| i).unwrap_or(0);
    let name = format!("发票{}_{}", idx + 1, &number[tail_start..]);
    name.chars().take(SHEET_NAME_MAX).collect()
}

/// 先保存到临时文件再改名，避免留下残缺的工作簿
fn save_workbook(mut workbook: Workbook, path: &Path) -> Result<(), ExportError> {
    let tmp_path = path.with_extension("xlsx.tmp");
    if let Err(err) = workbook.save(&tmp_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(ExportError::Write(format!("写工作簿失败: {}", err)));
    }
    super::commit_output(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn invoice(
        number: &str,
        date: Option<NaiveDate>,
        seller: Option<&str>,
        amount: Option<&str>,
    ) -> StoredInvoice {
        StoredInvoice {
            id: 1,
            invoice_type: Some("增值税普通发票".to_string()),
            invoice_code: Some("4400212130".to_string()),
            invoice_number: Some(number.to_string()),
            invoice_date: date,
            invoice_date_raw: None,
            check_code: None,
            machine_number: None,
            seller_name: seller.map(str::to_string),
            seller_tax_id: None,
            seller_address: None,
            seller_bank_info: None,
            buyer_name: Some("购买方公司".to_string()),
            buyer_tax_id: None,
            buyer_address: None,
            buyer_bank_info: None,
            total_amount: None,
            total_tax: None,
            amount_in_words: None,
            amount_in_figures: amount.map(str::to_string),
            remarks: None,
            payee: None,
            reviewer: None,
            issuer: None,
            image_path: None,
            json_data: None,
            project_id: Some(1),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn aggregates_exclude_records_missing_group_keys() {
        let date = NaiveDate::from_ymd_opt(2023, 3, 15);
        let invoices = vec![
            (invoice("10000001", date, None, Some("¥100.00")), vec![]),
            (invoice("10000002", date, None, Some("¥50.00")), vec![]),
            (invoice("10000003", None, None, Some("¥25.00")), vec![]),
        ];

        let aggregates = collect_aggregates(&invoices);
        // 销售方全缺: 销售方分析为空，但总数和总额照算
        assert!(aggregates.by_seller.is_empty());
        assert_eq!(aggregates.count, 3);
        assert_eq!(aggregates.total, 175.0);
        // 无日期的一张不进入月度分组
        assert_eq!(aggregates.monthly.len(), 1);
        assert_eq!(aggregates.monthly["2023-03"].count, 2);
        assert_eq!(aggregates.monthly["2023-03"].total, 150.0);
    }

    #[test]
    fn malformed_amounts_contribute_zero_without_aborting() {
        let invoices = vec![
            (invoice("10000001", None, Some("甲"), Some("¥1O0.00")), vec![]),
            (invoice("10000002", None, Some("甲"), Some("¥40.00")), vec![]),
        ];
        let aggregates = collect_aggregates(&invoices);
        assert_eq!(aggregates.total, 40.0);
        let stat = &aggregates.by_seller["甲"];
        assert_eq!(stat.count, 2);
        assert_eq!(stat.total, 40.0);
        assert_eq!(stat.average(), 20.0);
    }

    #[test]
    fn detail_sheet_name_uses_number_tail() {
        let inv = invoice("144031809110012345678", None, None, None);
        assert_eq!(detail_sheet_name(0, &inv), "发票1_345678");

        let short = invoice("88", None, None, None);
        assert_eq!(detail_sheet_name(2, &short), "发票3_88");
    }

    #[test]
    fn single_invoice_workbook_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice.xlsx");
        let inv = invoice("12345678", NaiveDate::from_ymd_opt(2023, 3, 15), Some("甲"), None);
        export_invoice_workbook(&inv, &[], &path).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("invoice.xlsx.tmp").exists());
    }

    #[test]
    fn project_workbook_saves_with_aggregate_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.xlsx");
        let project = Project {
            id: 1,
            name: "报销一季度".to_string(),
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let invoices = vec![
            (
                invoice(
                    "10000001",
                    NaiveDate::from_ymd_opt(2023, 3, 15),
                    Some("甲"),
                    Some("¥100.00"),
                ),
                vec![],
            ),
            (
                invoice(
                    "10000002",
                    NaiveDate::from_ymd_opt(2023, 4, 2),
                    Some("乙"),
                    Some("¥60.00"),
                ),
                vec![],
            ),
        ];
        export_project_workbook(&project, &invoices, &path).unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
