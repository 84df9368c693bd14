//! 查询错误类型

/// 查询链路错误
///
/// 空结果不是错误：零行是合法的终态，由会话的 `Settled` 状态表达
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// 存储执行失败或超时（可按原请求重试）
    StoreUnavailable(String),
    /// 过滤值校验失败（在编译之前拒绝，保留上一个有效的过滤状态）
    InvalidFilterState(String),
}

impl QueryError {
    pub fn store(message: impl Into<String>) -> Self {
        QueryError::StoreUnavailable(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        QueryError::InvalidFilterState(message.into())
    }

    /// 错误类型标识（用于 API 错误响应）
    pub fn error_type(&self) -> &'static str {
        match self {
            QueryError::StoreUnavailable(_) => "store_unavailable",
            QueryError::InvalidFilterState(_) => "invalid_filter_state",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            QueryError::StoreUnavailable(msg) | QueryError::InvalidFilterState(msg) => msg,
        }
    }

    /// 从 API 错误类型还原，未知类型按存储错误处理
    pub fn from_api(error_type: &str, message: impl Into<String>) -> Self {
        match error_type {
            "invalid_filter_state" => QueryError::invalid(message),
            _ => QueryError::store(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::StoreUnavailable(_))
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            QueryError::InvalidFilterState(msg) => write!(f, "Invalid filter state: {}", msg),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<rusqlite::Error> for QueryError {
    fn from(e: rusqlite::Error) -> Self {
        QueryError::StoreUnavailable(e.to_string())
    }
}
