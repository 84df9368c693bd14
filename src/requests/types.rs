//! 查询端点请求/响应类型

use serde::{Deserialize, Serialize};

use super::aggregate::{ChartPoint, Facets, Percentiles};
use super::error::QueryError;
use super::model::{self, RequestRecord, StatusClass};

/// 返回给客户端的一行：记录 + 在本批次中的延迟百分位排名
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    #[serde(flatten)]
    pub record: RequestRecord,
    pub percentile: f64,
}

/// 单条记录详情：附带状态码分类和原因短语
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDetail {
    #[serde(flatten)]
    pub record: RequestRecord,
    pub status_class: StatusClass,
    pub status_label: String,
}

impl From<RequestRecord> for RecordDetail {
    fn from(record: RequestRecord) -> Self {
        Self {
            status_class: StatusClass::of(record.status),
            status_label: model::status_label(record.status),
            record,
        }
    }
}

/// 响应元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    pub total_row_count: u64,
    pub filter_row_count: u64,
    pub total_filters: Facets,
    pub current_percentiles: Percentiles,
    pub chart_data: Vec<ChartPoint>,
}

/// 查询响应：记录批次 + 元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: Vec<RecordRow>,
    pub meta: QueryMeta,
}

/// 聚合快照：分位数、图表序列、facet
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    pub percentiles: Percentiles,
    pub chart: Vec<ChartPoint>,
    pub facets: Facets,
}

impl From<&QueryMeta> for AggregateSnapshot {
    fn from(meta: &QueryMeta) -> Self {
        Self {
            percentiles: meta.current_percentiles,
            chart: meta.chart_data.clone(),
            facets: meta.total_filters.clone(),
        }
    }
}

/// 种子数据请求参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedQuery {
    pub days: Option<u32>,
    pub interval_minutes: Option<u32>,
}

/// 统一错误响应
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiError,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ApiErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiError {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

impl From<&QueryError> for ApiErrorResponse {
    fn from(e: &QueryError) -> Self {
        Self::new(e.error_type(), e.message())
    }
}

/// 种子 / 清空操作结果
#[derive(Debug, Serialize, Deserialize)]
pub struct MutationResponse {
    pub success: bool,
    pub count: u64,
    pub message: String,
}
