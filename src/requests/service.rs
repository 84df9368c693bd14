//! 查询服务（服务端编排）
//!
//! 编译过滤条件 → 并发执行总数/过滤数/分页/facet → 计算分位数与图表。
//! 存储操作在阻塞线程池中执行，超时转换为 `StoreUnavailable`。

use std::sync::Arc;
use std::time::Duration;

use super::aggregate;
use super::error::QueryError;
use super::model::RequestRecord;
use super::pagination::PageWindow;
use super::predicate::compile;
use super::search_params::SearchParams;
use super::seed::{self, SeedOptions};
use super::store::RecordStore;
use super::types::{QueryMeta, QueryResponse, RecordRow};

/// 种子数据分批写入大小
const SEED_BATCH_SIZE: usize = 100;

pub struct QueryService {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
    max_page_size: u32,
}

impl QueryService {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration, max_page_size: u32) -> Self {
        Self {
            store,
            timeout,
            max_page_size: max_page_size.max(1),
        }
    }

    /// 在阻塞线程池中执行存储操作，可选超时
    async fn run<T, F>(&self, op: &'static str, timeout: Option<Duration>, f: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RecordStore) -> Result<T, QueryError> + Send + 'static,
    {
        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::error!("存储操作 {} 超时（{:?}）", op, limit);
                    return Err(QueryError::store(format!("{} 超时", op)));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!("存储操作 {} 失败: {}", op, e);
                Err(e)
            }
            Err(e) => {
                tracing::error!("存储任务 {} 异常退出: {}", op, e);
                Err(QueryError::store(format!("{} 任务异常: {}", op, e)))
            }
        }
    }

    /// 执行一次完整查询
    pub async fn query(&self, params: &SearchParams) -> Result<QueryResponse, QueryError> {
        // 截断页大小会让客户端按自己的页大小推算的偏移跳过记录，超限直接拒绝
        if params.size == 0 || params.size > self.max_page_size {
            return Err(QueryError::invalid(format!(
                "size 必须在 1..={} 之间，实际为 {}",
                self.max_page_size, params.size
            )));
        }
        let predicate = Arc::new(compile(&params.filters));
        let limit = params.size;
        let window = PageWindow {
            index: params.start / limit as u64,
            offset: params.start,
            limit,
        };
        let sort = params.sort_or_default();
        let timeout = Some(self.timeout);

        tracing::debug!(
            query = %params.query_key(),
            offset = window.offset,
            limit = window.limit,
            "执行查询"
        );

        // 计数和分页之间可能有并发写入，结果允许短暂不一致
        let (for_count, for_page, for_facets) = (predicate.clone(), predicate.clone(), predicate);
        let (total_row_count, filter_row_count, page, total_filters) = futures::try_join!(
            self.run("totalCount", timeout, |s| s.total_count()),
            self.run("filteredCount", timeout, move |s| s.filtered_count(&for_count)),
            self.run("page", timeout, move |s| s.page(&for_page, window, sort)),
            self.run("facets", timeout, move |s| s.facets(&for_facets)),
        )?;

        let current_percentiles = aggregate::percentiles(&page);
        let chart_data = aggregate::chart_series(&page, params.filters.date_range());
        let ranks = aggregate::percentile_ranks(&page);
        let data = page
            .into_iter()
            .zip(ranks)
            .map(|(record, percentile)| RecordRow { record, percentile })
            .collect();

        Ok(QueryResponse {
            data,
            meta: QueryMeta {
                total_row_count,
                filter_row_count,
                total_filters,
                current_percentiles,
                chart_data,
            },
        })
    }

    /// 按 uuid 查询单条记录
    pub async fn find(&self, uuid: String) -> Result<Option<RequestRecord>, QueryError> {
        self.run("find", Some(self.timeout), move |s| s.find(&uuid)).await
    }

    /// 写入模拟数据，返回写入条数
    pub async fn seed(&self, options: SeedOptions) -> Result<u64, QueryError> {
        options.validate()?;
        let (days, interval_minutes) = (options.days, options.interval_minutes);
        let count = self
            .run("seed", None, move |s| {
                let mut rng = fastrand::Rng::new();
                let mut batch = Vec::with_capacity(SEED_BATCH_SIZE);
                let mut count = 0u64;
                for record in seed::records(&options, &mut rng) {
                    batch.push(record);
                    if batch.len() == SEED_BATCH_SIZE {
                        s.insert_batch(&batch)?;
                        count += batch.len() as u64;
                        batch.clear();
                    }
                }
                if !batch.is_empty() {
                    s.insert_batch(&batch)?;
                    count += batch.len() as u64;
                }
                Ok(count)
            })
            .await?;
        tracing::info!(
            "已写入 {} 条模拟记录（{} 天，间隔 {} 分钟）",
            count,
            days,
            interval_minutes
        );
        Ok(count)
    }

    /// 清空全部记录
    pub async fn clear(&self) -> Result<u64, QueryError> {
        let count = self.run("clear", None, |s| s.clear()).await?;
        tracing::info!("已清除 {} 条记录", count);
        Ok(count)
    }
}
