//! 查询 API 路由

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};

use crate::common::auth;

use super::handlers::{clear_requests, get_request, query_requests, seed_requests};
use super::service::QueryService;
use super::types::ApiErrorResponse;

/// 查询 API 状态
#[derive(Clone)]
pub struct RequestsState {
    pub service: Arc<QueryService>,
    /// 为 None 时管理端点不做认证
    pub admin_api_key: Option<String>,
    pub default_page_size: u32,
}

/// 管理端点认证中间件
async fn admin_auth_middleware(
    State(state): State<RequestsState>,
    request: Request<Body>,
    next: Next,
) -> axum::response::Response {
    let Some(ref expected) = state.admin_api_key else {
        return next.run(request).await;
    };
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, expected) => next.run(request).await,
        _ => {
            tracing::warn!("管理端点认证失败: {} {}", request.method(), request.uri().path());
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiErrorResponse::new("authentication_error", "Invalid API key")),
            )
                .into_response()
        }
    }
}

/// 创建查询 API 路由
///
/// - `GET|HEAD /api`：查询
/// - `GET /api/requests/{uuid}`：单条记录
/// - `POST|DELETE /api/seed`：写入 / 清空模拟数据（受管理密钥保护）
pub fn create_requests_router(
    service: Arc<QueryService>,
    admin_api_key: Option<String>,
    default_page_size: u32,
) -> Router {
    let state = RequestsState {
        service,
        admin_api_key,
        default_page_size: default_page_size.max(1),
    };

    let admin = Router::new()
        .route("/api/seed", post(seed_requests).delete(clear_requests))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/api", get(query_requests))
        .route("/api/requests/{uuid}", get(get_request))
        .merge(admin)
        .with_state(state)
}
