use std::sync::{Arc, Mutex};

use axum::{
    routing::{get, post},
    Router,
};
use fapiao_ocr_rust::{
    api, create_pool, export::CleanupQueue, init_schema, AppConfig, ExportService, OcrClient,
    RecognitionService,
};
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 本地时间格式
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置 (密钥只从环境变量读取，不落日志)
    let config = AppConfig::from_env();
    info!("Starting server with config: {:?}", config);

    // 创建数据库连接池并确保表结构
    let pool = create_pool(&config.database.url).await?;
    init_schema(&pool).await?;
    info!("Database pool created");

    // 创建识别与导出服务
    let client = OcrClient::new(&config.ocr)?;
    let recognizer = Arc::new(RecognitionService::new(
        pool.clone(),
        client,
        &config.storage.upload_dir,
    ));
    let exporter = Arc::new(ExportService::new(pool.clone(), &config.storage.output_dir));

    let state = api::AppState {
        recognizer,
        exporter,
        pool,
        cleanup: Arc::new(Mutex::new(CleanupQueue::new())),
    };

    // 构建路由
    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/api/invoices/recognize", post(api::recognize_invoice))
        .route("/api/invoices", get(api::list_invoices))
        .route("/api/invoices/:id", axum::routing::delete(api::delete_invoice))
        .route("/api/invoices/:id/export/:format", get(api::export_invoice))
        .route("/api/projects/:id/export", get(api::export_project))
        .route(
            "/api/cleanup-exported-files",
            post(api::cleanup_exported_files),
        )
        .layer(ServiceBuilder::new())
        .with_state(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/invoices/recognize           - 上传并识别发票");
    info!("  GET  /api/invoices                     - 发票列表");
    info!("  DELETE /api/invoices/:id               - 删除发票及票面文件");
    info!("  GET  /api/invoices/:id/export/:format  - 单票导出 (csv|workbook)");
    info!("  GET  /api/projects/:id/export          - 项目导出");
    info!("  POST /api/cleanup-exported-files       - 清理已下载的导出文件");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
