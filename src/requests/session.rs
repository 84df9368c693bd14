//! 客户端查询状态同步器
//!
//! 一个视图对应一个查询会话，会话持有：
//! - 唯一权威的搜索状态（过滤 + 排序 + 选中记录），可序列化到 URL
//! - 已加载的分页缓存
//! - 单调递增的状态代数（generation），晚到的旧代响应直接丢弃
//! - 在途请求表
//!
//! 状态变化通过纯函数 `apply_filter_change` / `apply_sort_change` /
//! `apply_selection` 计算新状态和副作用列表，会话执行状态侧的副作用，
//! 再把需要外部执行的指令（发起请求、同步 URL）交给调用方。
//!
//! 状态机：`Idle -> Fetching -> (Settled | Failed)`；
//! `Settled` 可经"加载更多"或过滤/排序变化回到 `Fetching`；
//! `Failed` 可通过原样重发同一窗口重试。

use std::collections::BTreeSet;

use super::error::QueryError;
use super::filter::{Constraint, FilterField, SortState};
use super::pagination::{PageWindow, PaginationController};
use super::search_params::SearchParams;
use super::types::{AggregateSnapshot, QueryResponse, RecordRow};

// ============ 纯状态转换 ============

/// 状态转换产生的副作用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// 丢弃已加载的分页并重置页号
    ResetPages,
    /// 需要重新拉取第一页及聚合
    Refetch,
    /// 地址栏需要同步为新的查询串
    SyncUrl(String),
}

/// 新状态 + 副作用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: SearchParams,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: &SearchParams) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
        }
    }

    fn reset(state: SearchParams) -> Self {
        let url = state.to_query_string();
        Self {
            state,
            effects: vec![Effect::ResetPages, Effect::Refetch, Effect::SyncUrl(url)],
        }
    }
}

/// 修改一个字段的过滤约束
///
/// 校验失败时返回 `InvalidFilterState`，调用方保留原状态
pub fn apply_filter_change(
    state: &SearchParams,
    field: FilterField,
    constraint: Constraint,
) -> Result<Transition, QueryError> {
    let filters = state.filters.with(field, constraint)?;
    if filters == state.filters {
        return Ok(Transition::unchanged(state));
    }
    Ok(Transition::reset(SearchParams {
        filters,
        start: 0,
        ..state.clone()
    }))
}

/// 修改排序，规则与过滤变化相同
pub fn apply_sort_change(state: &SearchParams, sort: Option<SortState>) -> Transition {
    if sort == state.sort {
        return Transition::unchanged(state);
    }
    Transition::reset(SearchParams {
        sort,
        start: 0,
        ..state.clone()
    })
}

/// 选中 / 取消选中记录（单选），不触发重新拉取
pub fn apply_selection(state: &SearchParams, uuid: Option<String>) -> Transition {
    if uuid == state.uuid {
        return Transition::unchanged(state);
    }
    let state = SearchParams {
        uuid,
        ..state.clone()
    };
    let url = state.to_query_string();
    Transition {
        state,
        effects: vec![Effect::SyncUrl(url)],
    }
}

// ============ 会话 ============

/// 会话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Idle,
    Fetching,
    Settled,
    Failed,
}

/// 一次拉取的身份：代数 + 窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchTicket {
    pub generation: u64,
    pub index: u64,
    pub offset: u64,
    pub limit: u32,
}

impl FetchTicket {
    fn new(generation: u64, window: PageWindow) -> Self {
        Self {
            generation,
            index: window.index,
            offset: window.offset,
            limit: window.limit,
        }
    }
}

/// 交给调用方执行的拉取请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub ticket: FetchTicket,
    pub params: SearchParams,
}

impl FetchRequest {
    pub fn query_string(&self) -> String {
        self.params.to_request_string()
    }
}

/// 交给调用方（UI 事件循环）执行的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Fetch(FetchRequest),
    SyncUrl(String),
    /// 选中的记录不在已加载的结果中，已自动取消选中
    SelectionCleared(String),
}

/// 响应处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    Applied(Vec<Command>),
    /// 代数不匹配或不在在途表中，已丢弃
    Discarded,
}

#[derive(Debug)]
pub struct QuerySession {
    state: SearchParams,
    generation: u64,
    pagination: PaginationController,
    pages: Vec<Vec<RecordRow>>,
    total_rows: u64,
    filtered_rows: u64,
    snapshot: Option<AggregateSnapshot>,
    snapshot_generation: Option<u64>,
    snapshot_refreshes: u64,
    phase: QueryPhase,
    in_flight: BTreeSet<FetchTicket>,
    last_error: Option<QueryError>,
    /// 收到空页：数据在两次拉取之间变少，不再继续加载
    exhausted: bool,
}

impl QuerySession {
    pub fn new(initial: SearchParams) -> Self {
        let pagination = PaginationController::new(initial.size);
        Self {
            state: SearchParams {
                start: 0,
                ..initial
            },
            generation: 0,
            pagination,
            pages: Vec::new(),
            total_rows: 0,
            filtered_rows: 0,
            snapshot: None,
            snapshot_generation: None,
            snapshot_refreshes: 0,
            phase: QueryPhase::Idle,
            in_flight: BTreeSet::new(),
            last_error: None,
            exhausted: false,
        }
    }

    /// 从分享链接恢复会话
    pub fn from_query_string(query: &str) -> Result<Self, QueryError> {
        Ok(Self::new(SearchParams::parse(query)?))
    }

    // ---------- 读取 ----------

    pub fn state(&self) -> &SearchParams {
        &self.state
    }

    pub fn url(&self) -> String {
        self.state.to_query_string()
    }

    pub fn phase(&self) -> QueryPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rows(&self) -> impl Iterator<Item = &RecordRow> {
        self.pages.iter().flatten()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn fetched_count(&self) -> u64 {
        self.pages.iter().map(|p| p.len() as u64).sum()
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    pub fn filtered_rows(&self) -> u64 {
        self.filtered_rows
    }

    pub fn snapshot(&self) -> Option<&AggregateSnapshot> {
        self.snapshot.as_ref()
    }

    /// 聚合快照被替换的累计次数
    pub fn snapshot_refreshes(&self) -> u64 {
        self.snapshot_refreshes
    }

    pub fn selected(&self) -> Option<&str> {
        self.state.uuid.as_deref()
    }

    pub fn selected_row(&self) -> Option<&RecordRow> {
        let uuid = self.selected()?;
        self.rows().find(|r| r.record.uuid == uuid)
    }

    pub fn last_error(&self) -> Option<&QueryError> {
        self.last_error.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_more(&self) -> bool {
        !self.exhausted && PaginationController::has_more(self.fetched_count(), self.filtered_rows)
    }

    /// 成功加载但结果为空（不是错误）
    pub fn is_empty_result(&self) -> bool {
        self.phase == QueryPhase::Settled && self.filtered_rows == 0 && self.pages.iter().all(Vec::is_empty)
    }

    // ---------- 驱动 ----------

    /// 首次加载
    pub fn start(&mut self) -> Option<FetchRequest> {
        if self.phase != QueryPhase::Idle {
            return None;
        }
        Some(self.issue_next())
    }

    /// 加载下一页
    ///
    /// 上一页响应（或失败）到达前不会发出下一页，避免乱序插入
    pub fn load_more(&mut self) -> Option<FetchRequest> {
        if self.phase != QueryPhase::Settled || !self.current_in_flight_is_empty() || !self.has_more() {
            return None;
        }
        Some(self.issue_next())
    }

    /// 失败后原样重发同一窗口
    pub fn retry(&mut self) -> Option<FetchRequest> {
        if self.phase != QueryPhase::Failed {
            return None;
        }
        Some(self.issue_next())
    }

    pub fn change_filter(
        &mut self,
        field: FilterField,
        constraint: Constraint,
    ) -> Result<Vec<Command>, QueryError> {
        let transition = apply_filter_change(&self.state, field, constraint)?;
        Ok(self.commit(transition))
    }

    pub fn change_sort(&mut self, sort: Option<SortState>) -> Vec<Command> {
        let transition = apply_sort_change(&self.state, sort);
        self.commit(transition)
    }

    /// 选中一条已加载的记录，传 None 取消选中
    pub fn select(&mut self, uuid: Option<String>) -> Vec<Command> {
        if let Some(ref id) = uuid {
            if !self.rows().any(|r| &r.record.uuid == id) {
                tracing::warn!("忽略对未加载记录的选中: {}", id);
                return Vec::new();
            }
        }
        let transition = apply_selection(&self.state, uuid);
        self.commit(transition)
    }

    /// 执行状态转换中的副作用
    fn commit(&mut self, transition: Transition) -> Vec<Command> {
        self.state = transition.state;
        let mut commands = Vec::new();
        for effect in transition.effects {
            match effect {
                Effect::ResetPages => self.reset_pages(),
                Effect::Refetch => commands.push(Command::Fetch(self.issue_next())),
                Effect::SyncUrl(url) => commands.push(Command::SyncUrl(url)),
            }
        }
        commands
    }

    /// 新的一代：丢弃分页、快照和在途请求
    fn reset_pages(&mut self) {
        self.generation += 1;
        self.pagination.reset();
        self.pages.clear();
        self.snapshot = None;
        self.in_flight.clear();
        self.last_error = None;
        self.exhausted = false;
        tracing::debug!("查询状态变化，进入第 {} 代", self.generation);
    }

    fn current_in_flight_is_empty(&self) -> bool {
        !self.in_flight.iter().any(|t| t.generation == self.generation)
    }

    fn issue_next(&mut self) -> FetchRequest {
        let window = self.pagination.request_next_window();
        let ticket = FetchTicket::new(self.generation, window);
        self.in_flight.insert(ticket);
        self.phase = QueryPhase::Fetching;
        FetchRequest {
            ticket,
            params: self.state.for_window(window.offset, window.limit),
        }
    }

    /// 处理一次拉取结果
    pub fn receive(
        &mut self,
        ticket: FetchTicket,
        result: Result<QueryResponse, QueryError>,
    ) -> Receipt {
        let known = self.in_flight.remove(&ticket);
        if !known || ticket.generation != self.generation {
            tracing::warn!(
                "丢弃过期响应: 第 {} 代第 {} 页（当前第 {} 代）",
                ticket.generation,
                ticket.index,
                self.generation
            );
            return Receipt::Discarded;
        }

        match result {
            Ok(response) => {
                self.total_rows = response.meta.total_row_count;
                self.filtered_rows = response.meta.filter_row_count;
                // 聚合快照每代只替换一次，加载更多页不改变它
                if self.snapshot_generation != Some(self.generation) || self.snapshot.is_none() {
                    self.snapshot = Some(AggregateSnapshot::from(&response.meta));
                    self.snapshot_generation = Some(self.generation);
                    self.snapshot_refreshes += 1;
                }
                if response.data.is_empty() && ticket.index > 0 {
                    tracing::warn!("第 {} 页为空，停止加载更多", ticket.index);
                    self.exhausted = true;
                }
                self.pages.push(response.data);
                self.phase = QueryPhase::Settled;
                self.last_error = None;
                Receipt::Applied(self.reconcile_selection())
            }
            Err(e) => {
                tracing::error!("第 {} 页加载失败: {}", ticket.index, e);
                // 回退页号，重试时发出同一窗口
                self.pagination.rewind();
                self.phase = QueryPhase::Failed;
                self.last_error = Some(e);
                Receipt::Applied(Vec::new())
            }
        }
    }

    /// 选中的记录不在已加载结果中时自动取消选中
    fn reconcile_selection(&mut self) -> Vec<Command> {
        let Some(uuid) = self.state.uuid.clone() else {
            return Vec::new();
        };
        if self.rows().any(|r| r.record.uuid == uuid) {
            return Vec::new();
        }
        tracing::warn!("选中的记录 {} 不在当前结果中，已取消选中", uuid);
        let mut commands = self.commit(apply_selection(&self.state, None));
        commands.push(Command::SelectionCleared(uuid));
        commands
    }
}
