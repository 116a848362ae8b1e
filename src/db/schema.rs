use sqlx::PgPool;
use tracing::info;

/// 启动时建表
///
/// (invoice_code, invoice_number) 上的唯一约束是去重的真正正确性保证，
/// 编排层的先查后插只是快路径优化。
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS invoices (
            id BIGSERIAL PRIMARY KEY,
            invoice_type TEXT,
            invoice_code TEXT,
            invoice_number TEXT,
            invoice_date DATE,
            invoice_date_raw TEXT,
            check_code TEXT,
            machine_number TEXT,
            seller_name TEXT,
            seller_tax_id TEXT,
            seller_address TEXT,
            seller_bank_info TEXT,
            buyer_name TEXT,
            buyer_tax_id TEXT,
            buyer_address TEXT,
            buyer_bank_info TEXT,
            total_amount TEXT,
            total_tax TEXT,
            amount_in_words TEXT,
            amount_in_figures TEXT,
            remarks TEXT,
            payee TEXT,
            reviewer TEXT,
            issuer TEXT,
            image_path TEXT,
            json_data TEXT,
            project_id BIGINT REFERENCES projects(id),
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT uix_invoice_code_number UNIQUE (invoice_code, invoice_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS invoice_items (
            id BIGSERIAL PRIMARY KEY,
            invoice_id BIGINT NOT NULL REFERENCES invoices(id) ON DELETE CASCADE,
            name TEXT,
            specification TEXT,
            unit TEXT,
            quantity TEXT,
            unit_price TEXT,
            amount TEXT,
            tax_rate TEXT,
            tax_amount TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_invoices_project ON invoices(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_invoice_items_invoice ON invoice_items(invoice_id)")
        .execute(pool)
        .await?;

    info!("Database schema ready");
    Ok(())
}
