//! 过滤状态与排序状态
//!
//! 过滤状态是"当前展示内容"的唯一事实来源：字段 → 约束。
//! 缺失的字段等价于不约束，而不是"不匹配任何记录"。

use std::collections::{BTreeMap, BTreeSet};

use super::error::QueryError;
use super::model::{Method, Region};
use super::predicate::Column;

/// 可过滤字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterField {
    Method,
    Host,
    Pathname,
    Status,
    Latency,
    Regions,
    Date,
    TimingDns,
    TimingConnection,
    TimingTls,
    TimingTtfb,
    TimingTransfer,
}

/// 约束种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Range,
    Set,
    Substring,
}

impl FilterField {
    /// 规范顺序（URL 序列化按此顺序输出）
    pub const ALL: [FilterField; 12] = [
        FilterField::Method,
        FilterField::Host,
        FilterField::Pathname,
        FilterField::Status,
        FilterField::Latency,
        FilterField::Regions,
        FilterField::Date,
        FilterField::TimingDns,
        FilterField::TimingConnection,
        FilterField::TimingTls,
        FilterField::TimingTtfb,
        FilterField::TimingTransfer,
    ];

    pub const TIMINGS: [FilterField; 5] = [
        FilterField::TimingDns,
        FilterField::TimingConnection,
        FilterField::TimingTls,
        FilterField::TimingTtfb,
        FilterField::TimingTransfer,
    ];

    /// URL / API 中使用的键名
    pub fn key(&self) -> &'static str {
        match self {
            FilterField::Method => "method",
            FilterField::Host => "host",
            FilterField::Pathname => "pathname",
            FilterField::Status => "status",
            FilterField::Latency => "latency",
            FilterField::Regions => "regions",
            FilterField::Date => "date",
            FilterField::TimingDns => "timing.dns",
            FilterField::TimingConnection => "timing.connection",
            FilterField::TimingTls => "timing.tls",
            FilterField::TimingTtfb => "timing.ttfb",
            FilterField::TimingTransfer => "timing.transfer",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        FilterField::ALL.into_iter().find(|f| f.key() == key)
    }

    pub fn kind(&self) -> ConstraintKind {
        match self {
            FilterField::Method | FilterField::Status | FilterField::Regions => ConstraintKind::Set,
            FilterField::Host | FilterField::Pathname => ConstraintKind::Substring,
            FilterField::Latency
            | FilterField::Date
            | FilterField::TimingDns
            | FilterField::TimingConnection
            | FilterField::TimingTls
            | FilterField::TimingTtfb
            | FilterField::TimingTransfer => ConstraintKind::Range,
        }
    }

    pub fn column(&self) -> Column {
        match self {
            FilterField::Method => Column::Method,
            FilterField::Host => Column::Host,
            FilterField::Pathname => Column::Pathname,
            FilterField::Status => Column::Status,
            FilterField::Latency => Column::Latency,
            FilterField::Regions => Column::Regions,
            FilterField::Date => Column::Date,
            FilterField::TimingDns => Column::TimingDns,
            FilterField::TimingConnection => Column::TimingConnection,
            FilterField::TimingTls => Column::TimingTls,
            FilterField::TimingTtfb => Column::TimingTtfb,
            FilterField::TimingTransfer => Column::TimingTransfer,
        }
    }

    /// 数组列不参与排序
    pub fn is_sortable(&self) -> bool {
        !matches!(self, FilterField::Regions)
    }
}

/// 单个字段上的约束
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// 不约束
    None,
    /// 闭区间，任一端为 None 表示该方向无界；日期以毫秒时间戳表示
    Range { lo: Option<i64>, hi: Option<i64> },
    /// 可接受的离散值集合
    Set(BTreeSet<String>),
    /// 大小写敏感的子串匹配
    Substring(String),
}

static UNCONSTRAINED: Constraint = Constraint::None;

impl Constraint {
    pub fn range(lo: Option<i64>, hi: Option<i64>) -> Self {
        Constraint::Range { lo, hi }
    }

    /// 从二元数组构造区间，元素个数不为 2 时拒绝
    pub fn try_range(bounds: &[Option<i64>]) -> Result<Self, QueryError> {
        match bounds {
            [lo, hi] => Ok(Constraint::Range { lo: *lo, hi: *hi }),
            _ => Err(QueryError::invalid(format!(
                "区间必须恰好包含两个元素，实际为 {} 个",
                bounds.len()
            ))),
        }
    }

    pub fn set<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Constraint::Set(values.into_iter().map(Into::into).collect())
    }

    pub fn substring(needle: impl Into<String>) -> Self {
        Constraint::Substring(needle.into())
    }

    pub fn kind(&self) -> Option<ConstraintKind> {
        match self {
            Constraint::None => None,
            Constraint::Range { .. } => Some(ConstraintKind::Range),
            Constraint::Set(_) => Some(ConstraintKind::Set),
            Constraint::Substring(_) => Some(ConstraintKind::Substring),
        }
    }

    /// 清空后的约束与"不约束"等价
    pub fn is_unconstrained(&self) -> bool {
        match self {
            Constraint::None => true,
            Constraint::Range { lo, hi } => lo.is_none() && hi.is_none(),
            Constraint::Set(values) => values.is_empty(),
            Constraint::Substring(needle) => needle.is_empty(),
        }
    }
}

/// 校验约束是否适用于字段
fn validate(field: FilterField, constraint: &Constraint) -> Result<(), QueryError> {
    let Some(kind) = constraint.kind() else {
        return Ok(());
    };
    if kind != field.kind() {
        return Err(QueryError::invalid(format!(
            "字段 {} 不支持 {:?} 约束",
            field.key(),
            kind
        )));
    }

    match constraint {
        Constraint::Range { lo, hi } => {
            if let (Some(lo), Some(hi)) = (lo, hi) {
                if lo > hi {
                    return Err(QueryError::invalid(format!(
                        "字段 {} 的区间下界 {} 大于上界 {}",
                        field.key(),
                        lo,
                        hi
                    )));
                }
            }
            if field != FilterField::Date && lo.iter().chain(hi.iter()).any(|v| *v < 0) {
                return Err(QueryError::invalid(format!(
                    "字段 {} 的区间不能为负数",
                    field.key()
                )));
            }
        }
        Constraint::Set(values) => {
            for value in values {
                let ok = match field {
                    FilterField::Method => value.parse::<Method>().is_ok(),
                    FilterField::Regions => value.parse::<Region>().is_ok(),
                    FilterField::Status => value
                        .parse::<u16>()
                        .map(|s| (100..=599).contains(&s))
                        .unwrap_or(false),
                    _ => true,
                };
                if !ok {
                    return Err(QueryError::invalid(format!(
                        "字段 {} 不接受值 {:?}",
                        field.key(),
                        value
                    )));
                }
            }
        }
        Constraint::Substring(_) | Constraint::None => {}
    }
    Ok(())
}

/// 过滤状态（不可变值，修改返回新实例）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    constraints: BTreeMap<FilterField, Constraint>,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回设置了新约束的过滤状态
    ///
    /// 校验失败时返回 `InvalidFilterState`，原状态不受影响；
    /// 不约束的值会移除对应键
    pub fn with(&self, field: FilterField, constraint: Constraint) -> Result<Self, QueryError> {
        validate(field, &constraint)?;
        let mut next = self.clone();
        if constraint.is_unconstrained() {
            next.constraints.remove(&field);
        } else {
            next.constraints.insert(field, constraint);
        }
        Ok(next)
    }

    pub fn without(&self, field: FilterField) -> Self {
        let mut next = self.clone();
        next.constraints.remove(&field);
        next
    }

    pub fn get(&self, field: FilterField) -> &Constraint {
        self.constraints.get(&field).unwrap_or(&UNCONSTRAINED)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FilterField, &Constraint)> {
        self.constraints.iter().map(|(f, c)| (*f, c))
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// 当前日期区间（毫秒），用于图表分桶
    pub fn date_range(&self) -> Option<(Option<i64>, Option<i64>)> {
        match self.get(FilterField::Date) {
            Constraint::Range { lo, hi } => Some((*lo, *hi)),
            _ => None,
        }
    }
}

/// 排序状态，默认按日期降序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortState {
    pub field: FilterField,
    pub desc: bool,
}

impl Default for SortState {
    fn default() -> Self {
        Self {
            field: FilterField::Date,
            desc: true,
        }
    }
}

impl SortState {
    pub fn new(field: FilterField, desc: bool) -> Result<Self, QueryError> {
        if !field.is_sortable() {
            return Err(QueryError::invalid(format!(
                "字段 {} 不支持排序",
                field.key()
            )));
        }
        Ok(Self { field, desc })
    }
}
