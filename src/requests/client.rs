//! 查询传输层
//!
//! 会话只产出 `FetchRequest`，由传输层实际执行：
//! - `HttpTransport`：通过 HTTP 访问远端 `/api`
//! - `LocalTransport`：同进程直接调用 `QueryService`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::error::QueryError;
use super::search_params::SearchParams;
use super::service::QueryService;
use super::session::{FetchRequest, FetchTicket, QuerySession, Receipt};
use super::types::{ApiErrorResponse, QueryResponse};
use crate::http_client::build_client;

#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn fetch(&self, params: &SearchParams) -> Result<QueryResponse, QueryError>;
}

/// 一次拉取的结果，带回原始票据
#[derive(Debug)]
pub struct FetchOutcome {
    pub ticket: FetchTicket,
    pub result: Result<QueryResponse, QueryError>,
}

impl FetchOutcome {
    /// 交给会话处理
    pub fn apply(self, session: &mut QuerySession) -> Receipt {
        session.receive(self.ticket, self.result)
    }
}

/// 执行一个拉取请求
///
/// 不持有会话，多个请求可并发执行，结果再按到达顺序交给会话
pub async fn execute(transport: &dyn QueryTransport, request: FetchRequest) -> FetchOutcome {
    let result = transport.fetch(&request.params).await;
    FetchOutcome {
        ticket: request.ticket,
        result,
    }
}

// ============ HTTP ============

pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    /// `base_url` 形如 `http://127.0.0.1:8080`
    pub fn new(base_url: &str, timeout: Duration, proxy_url: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(proxy_url, timeout)?,
            endpoint: format!("{}/api", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url_for(&self, params: &SearchParams) -> String {
        let query = params.to_request_string();
        if query.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?{}", self.endpoint, query)
        }
    }
}

#[async_trait]
impl QueryTransport for HttpTransport {
    async fn fetch(&self, params: &SearchParams) -> Result<QueryResponse, QueryError> {
        let url = self.url_for(params);
        tracing::debug!("GET {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                QueryError::store(format!("请求超时: {}", e))
            } else {
                QueryError::store(format!("请求失败: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<QueryResponse>()
                .await
                .map_err(|e| QueryError::store(format!("响应解析失败: {}", e)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| QueryError::store(format!("HTTP {} 响应读取失败: {}", status, e)))?;
        match serde_json::from_str::<ApiErrorResponse>(&body) {
            Ok(api) => Err(QueryError::from_api(&api.error.error_type, api.error.message)),
            Err(_) if status == reqwest::StatusCode::BAD_REQUEST => {
                Err(QueryError::invalid(format!("HTTP {}: {}", status, body)))
            }
            Err(_) => Err(QueryError::store(format!("HTTP {}: {}", status, body))),
        }
    }
}

// ============ 本地 ============

pub struct LocalTransport {
    service: Arc<QueryService>,
}

impl LocalTransport {
    pub fn new(service: Arc<QueryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl QueryTransport for LocalTransport {
    async fn fetch(&self, params: &SearchParams) -> Result<QueryResponse, QueryError> {
        self.service.query(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::filter::{Constraint, FilterField};
    use crate::requests::seed::{self, SeedOptions};
    use crate::requests::session::{Command, QueryPhase};
    use crate::requests::store::{MemoryStore, RecordStore};
    use chrono::DateTime;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local_service(days: u32, interval_minutes: u32) -> Arc<QueryService> {
        local_service_capped(days, interval_minutes, 200)
    }

    fn local_service_capped(days: u32, interval_minutes: u32, max_page_size: u32) -> Arc<QueryService> {
        let store = Arc::new(MemoryStore::new());
        let options = SeedOptions {
            days,
            interval_minutes,
            now: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        };
        store
            .insert_batch(&seed::generate(&options, &mut fastrand::Rng::with_seed(7)))
            .unwrap();
        Arc::new(QueryService::new(store, Duration::from_secs(30), max_page_size))
    }

    /// 在随机端口上启动查询 API
    async fn spawn_api(service: Arc<QueryService>, default_page_size: u32) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::requests::create_requests_router(service, None, default_page_size);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// 驱动会话加载全部页，返回拉取次数
    async fn drain(transport: &dyn QueryTransport, session: &mut QuerySession) -> usize {
        let mut loads = 0;
        let mut next = session.start();
        while let Some(request) = next {
            loads += 1;
            execute(transport, request).await.apply(session);
            next = session.load_more();
        }
        loads
    }

    /// 前 N 次失败的传输
    struct FlakyTransport {
        inner: LocalTransport,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl QueryTransport for FlakyTransport {
        async fn fetch(&self, params: &SearchParams) -> Result<QueryResponse, QueryError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(QueryError::store("connection refused"));
            }
            self.inner.fetch(params).await
        }
    }

    #[test]
    fn test_http_url_building() {
        let transport = HttpTransport::new("http://127.0.0.1:8080/", Duration::from_secs(1), None).unwrap();
        assert_eq!(transport.endpoint(), "http://127.0.0.1:8080/api");
        // 页大小总是显式携带，不依赖服务端默认值
        assert_eq!(
            transport.url_for(&SearchParams::default()),
            "http://127.0.0.1:8080/api?size=40"
        );

        let params = SearchParams::parse("status=500").unwrap().for_window(40, 40);
        assert_eq!(
            transport.url_for(&params),
            "http://127.0.0.1:8080/api?status=500&size=40&start=40"
        );
    }

    #[tokio::test]
    async fn test_http_unreachable_is_store_unavailable() {
        // 端口 9 一般无人监听
        let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_millis(500), None).unwrap();
        let err = transport.fetch(&SearchParams::default()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_session_end_to_end_with_local_transport() {
        let transport = LocalTransport::new(local_service(1, 60));
        let mut session = QuerySession::new(SearchParams {
            size: 50,
            ..SearchParams::default()
        });

        let first = session.start().unwrap();
        execute(&transport, first).await.apply(&mut session);
        assert_eq!(session.phase(), QueryPhase::Settled);
        assert_eq!(session.total_rows(), 144);

        while let Some(next) = session.load_more() {
            execute(&transport, next).await.apply(&mut session);
        }
        assert_eq!(session.fetched_count(), 144);
        assert_eq!(session.page_count(), 3);

        let commands = session
            .change_filter(FilterField::Regions, Constraint::set(["ams"]))
            .unwrap();
        let Some(Command::Fetch(refetch)) = commands.into_iter().find(|c| matches!(c, Command::Fetch(_)))
        else {
            panic!("过滤变化后应重新拉取");
        };
        execute(&transport, refetch).await.apply(&mut session);
        assert_eq!(session.filtered_rows(), 24);
        assert!(session.rows().all(|r| r.record.regions.contains(&crate::requests::model::Region::Ams)));
        assert!(!session.has_more());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_discard_superseded() {
        let transport = LocalTransport::new(local_service(1, 60));
        let mut session = QuerySession::new(SearchParams::default());

        let stale = session.start().unwrap();
        let commands = session
            .change_filter(FilterField::Method, Constraint::set(["POST"]))
            .unwrap();
        let Some(Command::Fetch(current)) = commands.into_iter().find(|c| matches!(c, Command::Fetch(_)))
        else {
            panic!("过滤变化后应重新拉取");
        };

        let (stale_outcome, current_outcome) =
            tokio::join!(execute(&transport, stale), execute(&transport, current));

        // 按任意顺序到达，旧代结果都会被丢弃
        assert!(matches!(current_outcome.apply(&mut session), Receipt::Applied(_)));
        assert_eq!(stale_outcome.apply(&mut session), Receipt::Discarded);
        assert!(session.rows().all(|r| r.record.method == crate::requests::model::Method::Post));
    }

    #[tokio::test]
    async fn test_retry_after_transport_failure() {
        let transport = FlakyTransport {
            inner: LocalTransport::new(local_service(1, 60)),
            failures_left: AtomicUsize::new(1),
        };
        let mut session = QuerySession::new(SearchParams::default());

        let first = session.start().unwrap();
        execute(&transport, first.clone()).await.apply(&mut session);
        assert_eq!(session.phase(), QueryPhase::Failed);
        assert!(session.last_error().unwrap().is_retryable());

        let retried = session.retry().unwrap();
        assert_eq!(retried, first);
        execute(&transport, retried).await.apply(&mut session);
        assert_eq!(session.phase(), QueryPhase::Settled);
        assert_eq!(session.fetched_count(), 40);
    }

    #[tokio::test]
    async fn test_proxy_routes_requests() {
        // 代理地址不可达时，请求在代理处失败而不是直连目标
        let base_url = spawn_api(local_service(1, 60), 40).await;
        let transport =
            HttpTransport::new(&base_url, Duration::from_millis(500), Some("http://127.0.0.1:9")).unwrap();
        let err = transport.fetch(&SearchParams::default()).await.unwrap_err();
        assert!(err.is_retryable());

        assert!(HttpTransport::new(&base_url, Duration::from_secs(1), Some("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_client_page_larger_than_server_cap_fails_loudly() {
        let transport = LocalTransport::new(local_service_capped(1, 60, 100));
        let mut session = QuerySession::new(SearchParams {
            size: 500,
            ..SearchParams::default()
        });

        let loads = drain(&transport, &mut session).await;
        assert_eq!(loads, 1);
        assert_eq!(session.phase(), QueryPhase::Failed);
        assert!(matches!(
            session.last_error(),
            Some(QueryError::InvalidFilterState(_))
        ));
        assert_eq!(session.fetched_count(), 0);
        assert!(!session.has_more());
    }

    #[tokio::test]
    async fn test_http_windows_cover_population_when_server_default_differs() {
        // 服务端默认页大小 100，客户端用默认的 40
        let base_url = spawn_api(local_service(1, 60), 100).await;
        let transport = HttpTransport::new(&base_url, Duration::from_secs(5), None).unwrap();
        let mut session = QuerySession::new(SearchParams::default());

        let loads = drain(&transport, &mut session).await;
        assert_eq!(session.phase(), QueryPhase::Settled);
        assert_eq!(session.filtered_rows(), 144);
        assert_eq!(session.fetched_count(), 144);
        let unique: HashSet<&str> = session.rows().map(|r| r.record.uuid.as_str()).collect();
        assert_eq!(unique.len(), 144);
        assert_eq!(loads, 144usize.div_ceil(40));
        assert!(!session.has_more());
    }

    #[tokio::test]
    async fn test_http_error_envelope_maps_to_invalid_filter() {
        let base_url = spawn_api(local_service(1, 60), 40).await;
        let transport = HttpTransport::new(&base_url, Duration::from_secs(5), None).unwrap();
        let params = SearchParams {
            size: 500,
            ..SearchParams::default()
        };
        let err = transport.fetch(&params).await.unwrap_err();
        assert!(matches!(err, QueryError::InvalidFilterState(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_truncated_error_body_is_store_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            // 声明 100 字节但只发 5 字节就断开
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 100\r\n\r\nshort")
                .await
                .unwrap();
        });

        let transport =
            HttpTransport::new(&format!("http://{}", addr), Duration::from_secs(5), None).unwrap();
        let err = transport.fetch(&SearchParams::default()).await.unwrap_err();
        match err {
            QueryError::StoreUnavailable(message) => assert!(message.contains("响应读取失败")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
