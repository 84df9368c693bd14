//! 请求日志查询模块
//!
//! 过滤编译、记录存储、聚合、分页和客户端查询状态同步

pub mod aggregate;
pub mod client;
pub mod error;
pub mod filter;
pub mod model;
pub mod pagination;
pub mod predicate;
pub mod search_params;
pub mod seed;
pub mod service;
pub mod session;
pub mod store;
pub mod types;
mod handlers;
mod router;

pub use error::QueryError;
pub use router::create_requests_router;
pub use search_params::{DEFAULT_PAGE_SIZE, SearchParams};
pub use service::QueryService;
pub use session::QuerySession;
pub use store::{MemoryStore, RecordStore, SqliteStore};
