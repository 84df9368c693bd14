//! 查询 API 处理器

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

use super::error::QueryError;
use super::router::RequestsState;
use super::search_params::SearchParams;
use super::seed::SeedOptions;
use super::types::{ApiErrorResponse, MutationResponse, RecordDetail, SeedQuery};

fn error_response(e: &QueryError) -> Response {
    let status = match e {
        QueryError::InvalidFilterState(_) => StatusCode::BAD_REQUEST,
        QueryError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ApiErrorResponse::from(e))).into_response()
}

/// GET /api
pub async fn query_requests(
    State(state): State<RequestsState>,
    RawQuery(query): RawQuery,
) -> Response {
    let raw = query.as_deref().unwrap_or("");
    let params = match SearchParams::parse_with_size(raw, state.default_page_size) {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!("拒绝无效查询参数: {}", e);
            return error_response(&e);
        }
    };

    match state.service.query(&params).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/requests/{uuid}
pub async fn get_request(
    State(state): State<RequestsState>,
    Path(uuid): Path<String>,
) -> Response {
    match state.service.find(uuid.clone()).await {
        Ok(Some(record)) => Json(RecordDetail::from(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse::new(
                "not_found",
                format!("记录不存在: {}", uuid),
            )),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/seed
pub async fn seed_requests(
    State(state): State<RequestsState>,
    Query(query): Query<SeedQuery>,
) -> Response {
    let defaults = SeedOptions::default();
    let options = SeedOptions {
        days: query.days.unwrap_or(defaults.days),
        interval_minutes: query.interval_minutes.unwrap_or(defaults.interval_minutes),
        now: defaults.now,
    };
    match state.service.seed(options).await {
        Ok(count) => Json(MutationResponse {
            success: true,
            count,
            message: format!("已写入 {} 条记录", count),
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/seed
pub async fn clear_requests(State(state): State<RequestsState>) -> Response {
    match state.service.clear().await {
        Ok(count) => Json(MutationResponse {
            success: true,
            count,
            message: format!("已清除 {} 条记录", count),
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}
