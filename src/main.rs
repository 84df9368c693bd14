//! request-lens
//!
//! 请求日志看板的查询服务。
//!
//! ```bash
//! request-lens serve
//! request-lens seed --days 14 --interval-minutes 60
//! request-lens clear
//! request-lens init
//! request-lens query "status=500&regions=fra" --pages 3
//! ```

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;

use request_lens::model::config::Config;
use request_lens::requests::client::{HttpTransport, execute};
use request_lens::requests::seed::SeedOptions;
use request_lens::requests::session::QueryPhase;
use request_lens::requests::{QueryService, QuerySession, SqliteStore, create_requests_router};

#[derive(Parser, Debug)]
#[command(name = "request-lens", version, about = "请求日志查询服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, env = "REQUEST_LENS_CONFIG", default_value = Config::default_config_path())]
    config: String,

    /// 数据库路径（覆盖配置文件）
    #[arg(long, env = "REQUEST_LENS_DATABASE")]
    database: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动 HTTP 服务（默认）
    Serve,
    /// 写入模拟数据
    Seed {
        #[arg(long, default_value_t = 14)]
        days: u32,
        #[arg(long, default_value_t = 60)]
        interval_minutes: u32,
    },
    /// 清空全部记录
    Clear,
    /// 写出默认配置文件
    Init {
        /// 覆盖已存在的配置文件
        #[arg(long)]
        force: bool,
    },
    /// 通过 HTTP 查询远端服务并输出摘要
    Query {
        /// 查询参数，与看板 URL 相同，如 `status=500&regions=fra`
        #[arg(default_value = "")]
        query: String,
        /// 服务地址（默认使用配置中的 host/port）
        #[arg(long)]
        url: Option<String>,
        /// 最多加载的页数
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(database) = args.database {
        config.database_path = database;
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Init { force } => init(&config, force),
        Command::Query { query, url, pages } => query_remote(&config, &query, url, pages).await,
        local => run_local(&config, local).await,
    }
}

/// 直接操作本地数据库的子命令
async fn run_local(config: &Config, command: Command) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("打开数据库失败: {}", config.database_path))?;
    let service = Arc::new(QueryService::new(
        Arc::new(store),
        config.query_timeout(),
        config.max_page_size,
    ));

    match command {
        Command::Seed {
            days,
            interval_minutes,
        } => {
            let count = service
                .seed(SeedOptions {
                    days,
                    interval_minutes,
                    ..SeedOptions::default()
                })
                .await?;
            println!("已写入 {} 条记录", count);
            Ok(())
        }
        Command::Clear => {
            let count = service.clear().await?;
            println!("已清除 {} 条记录", count);
            Ok(())
        }
        _ => serve(config, service).await,
    }
}

fn init(config: &Config, force: bool) -> anyhow::Result<()> {
    let path = config
        .config_path()
        .context("配置文件路径未知")?;
    anyhow::ensure!(
        force || !path.exists(),
        "配置文件已存在: {}（使用 --force 覆盖）",
        path.display()
    );
    config.save()?;
    println!("已写入配置文件: {}", path.display());
    Ok(())
}

async fn query_remote(
    config: &Config,
    query: &str,
    url: Option<String>,
    pages: usize,
) -> anyhow::Result<()> {
    let base_url = url.unwrap_or_else(|| format!("http://{}:{}", config.host, config.port));
    let proxy_url = config.effective_proxy_url();
    if let Some(proxy) = proxy_url {
        tracing::info!("使用代理: {}", proxy);
    }
    let transport = HttpTransport::new(&base_url, config.query_timeout(), proxy_url)?;
    let mut session = QuerySession::from_query_string(query)?;

    let mut next = session.start();
    let mut loaded = 0;
    while let Some(request) = next {
        tracing::debug!("GET {}?{}", transport.endpoint(), request.query_string());
        execute(&transport, request).await.apply(&mut session);
        loaded += 1;
        next = if loaded < pages { session.load_more() } else { None };
    }

    if session.phase() == QueryPhase::Failed {
        let e = session.last_error().map(ToString::to_string).unwrap_or_default();
        anyhow::bail!("查询失败: {}", e);
    }

    let percentiles = session.snapshot().map(|s| s.percentiles).unwrap_or_default();
    let summary = json!({
        "url": session.url(),
        "totalRowCount": session.total_rows(),
        "filterRowCount": session.filtered_rows(),
        "fetched": session.fetched_count(),
        "hasMore": session.has_more(),
        "percentiles": percentiles,
        "selected": session.selected_row().map(|row| &row.record),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn serve(config: &Config, service: Arc<QueryService>) -> anyhow::Result<()> {
    let admin_api_key = config.effective_admin_api_key().map(String::from);
    if admin_api_key.is_none() {
        tracing::warn!("未配置 adminApiKey，/api/seed 不做认证");
    }

    let app = create_requests_router(service, admin_api_key, config.default_page_size)
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;
    tracing::info!("request-lens 监听于 http://{}", addr);
    tracing::info!("数据库: {}", config.database_path);

    axum::serve(listener, app).await.context("HTTP 服务异常退出")?;
    Ok(())
}
