use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use crate::models::{CanonicalInvoice, InvoiceItem, Project, StoredInvoice, StoredInvoiceItem};

/// 发票列表筛选条件
#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    /// Some(0) 表示未分组
    pub project_id: Option<i64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// 发票号码子串匹配
    pub number: Option<String>,
}

/// 按去重键 (发票代码, 发票号码) 查询已有记录
pub async fn find_by_code_number(
    pool: &PgPool,
    invoice_code: &str,
    invoice_number: &str,
) -> Result<Option<StoredInvoice>, sqlx::Error> {
    sqlx::query_as::<_, StoredInvoice>(
        r#"
        SELECT * FROM invoices
        WHERE invoice_code = $1 AND invoice_number = $2
        "#,
    )
    .bind(invoice_code)
    .bind(invoice_number)
    .fetch_optional(pool)
    .await
}

pub async fn get_invoice(pool: &PgPool, id: i64) -> Result<Option<StoredInvoice>, sqlx::Error> {
    sqlx::query_as::<_, StoredInvoice>("SELECT * FROM invoices WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// 在事务内插入发票主记录，返回新ID
///
/// (code, number) 撞上唯一约束时由调用方捕获并按后发现的重复处理。
pub async fn insert_invoice(
    tx: &mut Transaction<'_, Postgres>,
    record: &CanonicalInvoice,
    image_path: &str,
    json_data: &str,
    project_id: Option<i64>,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO invoices (
            invoice_type, invoice_code, invoice_number,
            invoice_date, invoice_date_raw, check_code, machine_number,
            seller_name, seller_tax_id, seller_address, seller_bank_info,
            buyer_name, buyer_tax_id, buyer_address, buyer_bank_info,
            total_amount, total_tax, amount_in_words, amount_in_figures,
            remarks, payee, reviewer, issuer,
            image_path, json_data, project_id
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
            $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
        )
        RETURNING id
        "#,
    )
    .bind(&record.invoice_type)
    .bind(&record.invoice_code)
    .bind(&record.invoice_number)
    .bind(record.issue_date)
    .bind(&record.issue_date_raw)
    .bind(&record.check_code)
    .bind(&record.machine_number)
    .bind(&record.seller.name)
    .bind(&record.seller.tax_id)
    .bind(&record.seller.address_phone)
    .bind(&record.seller.bank_account)
    .bind(&record.buyer.name)
    .bind(&record.buyer.tax_id)
    .bind(&record.buyer.address_phone)
    .bind(&record.buyer.bank_account)
    .bind(&record.subtotal)
    .bind(&record.tax_total)
    .bind(&record.total_in_words)
    .bind(&record.total_in_figures)
    .bind(&record.notes)
    .bind(&record.payee)
    .bind(&record.reviewer)
    .bind(&record.issuer)
    .bind(image_path)
    .bind(json_data)
    .bind(project_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row.0)
}

/// 在同一事务内批量插入明细行，与主记录同进退
pub async fn insert_items(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: i64,
    items: &[InvoiceItem],
) -> Result<(), sqlx::Error> {
    if items.is_empty() {
        return Ok(());
    }

    let mut query_builder = QueryBuilder::new(
        "INSERT INTO invoice_items (
            invoice_id, name, specification, unit, quantity,
            unit_price, amount, tax_rate, tax_amount
        ) ",
    );
    query_builder.push_values(items, |mut b, item| {
        b.push_bind(invoice_id)
            .push_bind(&item.name)
            .push_bind(&item.specification)
            .push_bind(&item.unit)
            .push_bind(&item.quantity)
            .push_bind(&item.unit_price)
            .push_bind(&item.amount)
            .push_bind(&item.tax_rate)
            .push_bind(&item.tax_amount);
    });
    query_builder.build().execute(&mut **tx).await?;

    Ok(())
}

pub async fn list_items(
    pool: &PgPool,
    invoice_id: i64,
) -> Result<Vec<StoredInvoiceItem>, sqlx::Error> {
    sqlx::query_as::<_, StoredInvoiceItem>(
        "SELECT * FROM invoice_items WHERE invoice_id = $1 ORDER BY id",
    )
    .bind(invoice_id)
    .fetch_all(pool)
    .await
}

/// 发票列表查询，支持分组/日期区间/号码子串筛选
pub async fn list_invoices(
    pool: &PgPool,
    filter: &InvoiceFilter,
) -> Result<Vec<StoredInvoice>, sqlx::Error> {
    let mut query_builder: QueryBuilder<Postgres> =
        QueryBuilder::new("SELECT * FROM invoices WHERE TRUE");

    match filter.project_id {
        Some(0) => {
            query_builder.push(" AND project_id IS NULL");
        }
        Some(project_id) => {
            query_builder.push(" AND project_id = ");
            query_builder.push_bind(project_id);
        }
        None => {}
    }
    if let Some(date_from) = filter.date_from {
        query_builder.push(" AND invoice_date >= ");
        query_builder.push_bind(date_from);
    }
    if let Some(date_to) = filter.date_to {
        query_builder.push(" AND invoice_date <= ");
        query_builder.push_bind(date_to);
    }
    if let Some(number) = filter.number.as_deref().filter(|n| !n.is_empty()) {
        query_builder.push(" AND invoice_number LIKE ");
        query_builder.push_bind(format!("%{}%", number));
    }
    query_builder.push(" ORDER BY invoice_date DESC NULLS LAST, id DESC");

    query_builder
        .build_query_as::<StoredInvoice>()
        .fetch_all(pool)
        .await
}

pub async fn get_project(pool: &PgPool, id: i64) -> Result<Option<Project>, sqlx::Error> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// 删除发票及其明细 (明细经外键级联删除)
///
/// 外层 None 表示记录不存在，内层为待清理的票面文件名。
pub async fn delete_invoice(
    pool: &PgPool,
    id: i64,
) -> Result<Option<Option<String>>, sqlx::Error> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("DELETE FROM invoices WHERE id = $1 RETURNING image_path")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(path,)| path))
}

/// 判断是否为唯一约束冲突 (PostgreSQL 23505)
///
/// 并发上传同一张发票时，插入被约束拒绝要当成后发现的重复，
/// 不能当成普通失败上报。
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}
