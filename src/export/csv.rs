use std::fs::File;
use std::path::Path;

use crate::error::ExportError;
use crate::models::{StoredInvoice, StoredInvoiceItem};

/// 单票 CSV 表头: 票头字段 + 明细字段
const HEADERS: [&str; 19] = [
    "发票类型",
    "发票代码",
    "发票号码",
    "开票日期",
    "销售方名称",
    "销售方识别号",
    "购买方名称",
    "购买方识别号",
    "合计金额",
    "合计税额",
    "价税合计(小写)",
    "商品名称",
    "规格型号",
    "单位",
    "数量",
    "单价",
    "金额",
    "税率",
    "税额",
];

/// 导出单张发票为 CSV
///
/// 每条明细一行，行内重复票头字段；没有明细时也输出恰好一行，
/// 明细列留空，绝不输出零行。
pub fn export_invoice_csv(
    invoice: &StoredInvoice,
    items: &[StoredInvoiceItem],
    path: &Path,
) -> Result<(), ExportError> {
    let tmp_path = path.with_extension("csv.tmp");
    let file = File::create(&tmp_path)?;
    let mut writer = csv::Writer::from_writer(file);

    let write_result = write_rows(&mut writer, invoice, items);
    if let Err(err) = write_result.and_then(|_| writer.flush().map_err(csv::Error::from)) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(ExportError::Write(format!("写CSV失败: {}", err)));
    }
    drop(writer);

    super::commit_output(&tmp_path, path)
}

fn write_rows(
    writer: &mut csv::Writer<File>,
    invoice: &StoredInvoice,
    items: &[StoredInvoiceItem],
) -> Result<(), csv::Error> {
    writer.write_record(HEADERS)?;

    let opt = |value: &Option<String>| value.clone().unwrap_or_default();
    let head = [
        opt(&invoice.invoice_type),
        opt(&invoice.invoice_code),
        opt(&invoice.invoice_number),
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
    ];

    if items.is_empty() {
        let mut row = head.to_vec();
        row.extend(std::iter::repeat(String::new()).take(8));
        writer.write_record(&row)?;
        return Ok(());
    }

    for item in items {
        let mut row = head.to_vec();
        row.extend([
            opt(&item.name),
            opt(&item.specification),
            opt(&item.unit),
            opt(&item.quantity),
            opt(&item.unit_price),
            opt(&item.amount),
            opt(&item.tax_rate),
            opt(&item.tax_amount),
        ]);
        writer.write_record(&row)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn invoice() -> StoredInvoice {
        StoredInvoice {
            id: 1,
            invoice_type: Some("增值税专用发票".to_string()),
            invoice_code: Some("4400212130".to_string()),
            invoice_number: Some("12345678".to_string()),
            invoice_date: NaiveDate::from_ymd_opt(2023, 3, 15),
            invoice_date_raw: Some("2023年03月15日".to_string()),
            check_code: None,
            machine_number: None,
            seller_name: Some("深圳某某科技有限公司".to_string()),
            seller_tax_id: Some("91440300MA5EXW2A8F".to_string()),
            seller_address: None,
            seller_bank_info: None,
            buyer_name: Some("北京客户公司".to_string()),
            buyer_tax_id: Some("91110108795671ABC".to_string()),
            buyer_address: None,
            buyer_bank_info: None,
            total_amount: Some("¥100.00".to_string()),
            total_tax: Some("¥13.00".to_string()),
            amount_in_words: Some("壹佰壹拾叁圆整".to_string()),
            amount_in_figures: Some("¥113.00".to_string()),
            remarks: None,
            payee: None,
            reviewer: None,
            issuer: None,
            image_path: Some("4400212130_12345678.pdf".to_string()),
            json_data: None,
            project_id: None,
            created_at: Utc::now(),
        }
    }

    fn item(name: &str, amount: &str) -> StoredInvoiceItem {
        StoredInvoiceItem {
            id: 0,
            invoice_id: 1,
            name: Some(name.to_string()),
            specification: None,
            unit: Some("个".to_string()),
            quantity: Some("1".to_string()),
            unit_price: Some(amount.to_string()),
            amount: Some(amount.to_string()),
            tax_rate: Some("13%".to_string()),
            tax_amount: None,
        }
    }

    #[test]
    fn one_row_per_line_item() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice.csv");
        export_invoice_csv(&invoice(), &[item("甲", "50.00"), item("乙", "50.00")], &path)
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3); // 表头 + 两行明细
        assert!(lines[1].contains("甲"));
        assert!(lines[1].contains("12345678"));
        assert!(lines[2].contains("乙"));
        assert!(lines[2].contains("12345678"));
    }

    #[test]
    fn zero_items_emit_exactly_one_blank_item_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice.csv");
        export_invoice_csv(&invoice(), &[], &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2); // 表头 + 一行
        let fields: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(fields.len(), 19);
        assert_eq!(fields[2], "12345678");
        // 明细列全部留空
        assert!(fields[11..].iter().all(|f| f.is_empty()));
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice.csv");
        export_invoice_csv(&invoice(), &[], &path).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("invoice.csv.tmp").exists());
    }
}
