//! 可寻址的搜索状态（URL 查询串编解码）
//!
//! 扁平的 key=value 编码，可嵌入分享链接：
//! - 区间：`lo-hi`，任一端可为空（`100-`、`-500`），日期为毫秒时间戳
//! - 集合：逗号分隔（`method=GET,POST`）
//! - 子串：原文
//! - `sort=<字段>.<asc|desc>`、`size`、`start`、`uuid`
//!
//! 未知键忽略，缺失键表示不约束。

use super::error::QueryError;
use super::filter::{Constraint, ConstraintKind, FilterField, FilterState, SortState};

pub const DEFAULT_PAGE_SIZE: u32 = 40;

const ARRAY_DELIMITER: &str = ",";
const RANGE_DELIMITER: char = '-';
const SORT_DELIMITER: char = '.';

/// 完整的搜索状态：过滤 + 排序 + 分页窗口 + 选中记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub filters: FilterState,
    /// None 表示默认排序
    pub sort: Option<SortState>,
    pub size: u32,
    pub start: u64,
    pub uuid: Option<String>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            filters: FilterState::new(),
            sort: None,
            size: DEFAULT_PAGE_SIZE,
            start: 0,
            uuid: None,
        }
    }
}

impl SearchParams {
    /// 解析查询串（可带前导 `?`）
    pub fn parse(query: &str) -> Result<Self, QueryError> {
        Self::parse_with_size(query, DEFAULT_PAGE_SIZE)
    }

    /// 解析查询串，缺少 size 时使用给定页大小
    pub fn parse_with_size(query: &str, default_size: u32) -> Result<Self, QueryError> {
        let mut params = SearchParams {
            size: default_size,
            ..SearchParams::default()
        };
        let query = query.strip_prefix('?').unwrap_or(query);

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode(raw_key)?;
            let value = decode(raw_value)?;

            match key.as_str() {
                "sort" => params.sort = parse_sort(&value)?,
                "size" => params.size = parse_number(&key, &value)?,
                "start" => params.start = parse_number(&key, &value)?,
                "uuid" => params.uuid = Some(value).filter(|v| !v.is_empty()),
                other => {
                    let Some(field) = FilterField::from_key(other) else {
                        continue;
                    };
                    let constraint = parse_constraint(field, &value)?;
                    params.filters = params.filters.with(field, constraint)?;
                }
            }
        }
        Ok(params)
    }

    /// 序列化为查询串（不带前导 `?`），键按规范顺序输出
    pub fn to_query_string(&self) -> String {
        self.encode(false)
    }

    /// 发给查询端点的查询串：总是携带 size，不依赖服务端的默认页大小
    pub fn to_request_string(&self) -> String {
        self.encode(true)
    }

    fn encode(&self, explicit_size: bool) -> String {
        let mut pairs = self.filter_pairs();
        if let Some(sort) = self.sort {
            pairs.push(("sort", format_sort(&sort)));
        }
        if explicit_size || self.size != DEFAULT_PAGE_SIZE {
            pairs.push(("size", self.size.to_string()));
        }
        if self.start != 0 {
            pairs.push(("start", self.start.to_string()));
        }
        if let Some(ref uuid) = self.uuid {
            pairs.push(("uuid", uuid.clone()));
        }
        join_pairs(&pairs)
    }

    /// 查询身份：只包含过滤与排序，选中记录和分页窗口不影响数据集
    pub fn query_key(&self) -> String {
        let mut pairs = self.filter_pairs();
        if let Some(sort) = self.sort {
            pairs.push(("sort", format_sort(&sort)));
        }
        join_pairs(&pairs)
    }

    /// 生成指定窗口的请求参数（去掉 uuid，避免选中变化触发重新拉取）
    pub fn for_window(&self, offset: u64, limit: u32) -> Self {
        Self {
            filters: self.filters.clone(),
            sort: self.sort,
            size: limit,
            start: offset,
            uuid: None,
        }
    }

    pub fn sort_or_default(&self) -> SortState {
        self.sort.unwrap_or_default()
    }

    fn filter_pairs(&self) -> Vec<(&'static str, String)> {
        FilterField::ALL
            .into_iter()
            .filter_map(|field| format_constraint(self.filters.get(field)).map(|v| (field.key(), v)))
            .collect()
    }
}

fn decode(raw: &str) -> Result<String, QueryError> {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|s| s.into_owned())
        .map_err(|e| QueryError::invalid(format!("无法解码查询参数 {:?}: {}", raw, e)))
}

fn join_pairs(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, QueryError> {
    value
        .parse::<T>()
        .map_err(|_| QueryError::invalid(format!("参数 {} 不是合法数字: {:?}", key, value)))
}

fn parse_bound(field: FilterField, raw: &str) -> Result<Option<i64>, QueryError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<i64>().map(Some).map_err(|_| {
        QueryError::invalid(format!("字段 {} 的区间端点不是整数: {:?}", field.key(), raw))
    })
}

/// 拆分 `lo-hi`
///
/// 端点本身可以是负数（1970 年之前的日期），因此分隔符是唯一一个
/// 左右两侧都能解析为空或整数的 `-`
fn split_range(field: FilterField, value: &str) -> Result<(Option<i64>, Option<i64>), QueryError> {
    let is_bound = |raw: &str| raw.is_empty() || raw.parse::<i64>().is_ok();
    let (lo, hi) = value
        .match_indices(RANGE_DELIMITER)
        .map(|(i, _)| (&value[..i], &value[i + 1..]))
        .find(|(lo, hi)| is_bound(lo) && is_bound(hi))
        .ok_or_else(|| {
            QueryError::invalid(format!(
                "字段 {} 的区间必须形如 lo-hi，实际为 {:?}",
                field.key(),
                value
            ))
        })?;
    Ok((parse_bound(field, lo)?, parse_bound(field, hi)?))
}

fn parse_constraint(field: FilterField, value: &str) -> Result<Constraint, QueryError> {
    if value.is_empty() {
        return Ok(Constraint::None);
    }
    match field.kind() {
        ConstraintKind::Range => {
            let (lo, hi) = split_range(field, value)?;
            Constraint::try_range(&[lo, hi])
        }
        ConstraintKind::Set => Ok(Constraint::set(
            value.split(ARRAY_DELIMITER).filter(|v| !v.is_empty()),
        )),
        ConstraintKind::Substring => Ok(Constraint::substring(value)),
    }
}

fn format_constraint(constraint: &Constraint) -> Option<String> {
    if constraint.is_unconstrained() {
        return None;
    }
    match constraint {
        Constraint::None => None,
        Constraint::Range { lo, hi } => Some(format!(
            "{}{}{}",
            lo.map(|v| v.to_string()).unwrap_or_default(),
            RANGE_DELIMITER,
            hi.map(|v| v.to_string()).unwrap_or_default()
        )),
        Constraint::Set(values) => Some(
            values
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(ARRAY_DELIMITER),
        ),
        Constraint::Substring(needle) => Some(needle.clone()),
    }
}

fn parse_sort(value: &str) -> Result<Option<SortState>, QueryError> {
    if value.is_empty() {
        return Ok(None);
    }
    let (key, direction) = value
        .rsplit_once(SORT_DELIMITER)
        .ok_or_else(|| QueryError::invalid(format!("无效的排序参数: {:?}", value)))?;
    let field = FilterField::from_key(key)
        .ok_or_else(|| QueryError::invalid(format!("未知的排序字段: {:?}", key)))?;
    let desc = match direction {
        "desc" => true,
        "asc" => false,
        other => {
            return Err(QueryError::invalid(format!("未知的排序方向: {:?}", other)));
        }
    };
    SortState::new(field, desc).map(Some)
}

fn format_sort(sort: &SortState) -> String {
    format!(
        "{}{}{}",
        sort.field.key(),
        SORT_DELIMITER,
        if sort.desc { "desc" } else { "asc" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SearchParams {
        let filters = FilterState::new()
            .with(FilterField::Method, Constraint::set(["GET", "POST"]))
            .unwrap()
            .with(FilterField::Host, Constraint::substring("acme shop&co"))
            .unwrap()
            .with(FilterField::Latency, Constraint::range(Some(100), None))
            .unwrap()
            .with(FilterField::TimingTtfb, Constraint::range(None, Some(300)))
            .unwrap()
            .with(
                FilterField::Date,
                Constraint::range(Some(1_700_000_000_000), Some(1_700_086_400_000)),
            )
            .unwrap()
            .with(FilterField::Regions, Constraint::set(["ams", "iad"]))
            .unwrap();
        SearchParams {
            filters,
            sort: Some(SortState::new(FilterField::TimingDns, false).unwrap()),
            size: 20,
            start: 60,
            uuid: Some("0f6f1f1c".to_string()),
        }
    }

    #[test]
    fn test_round_trip() {
        let params = sample();
        let encoded = params.to_query_string();
        let decoded = SearchParams::parse(&encoded).unwrap();
        assert_eq!(decoded, params);
        // 规范顺序：相等状态编码为相同字符串
        assert_eq!(decoded.to_query_string(), encoded);
    }

    #[test]
    fn test_missing_and_unknown_keys() {
        let params = SearchParams::parse("?foo=bar&theme=dark").unwrap();
        assert_eq!(params, SearchParams::default());
        assert_eq!(params.to_query_string(), "");
    }

    #[test]
    fn test_empty_values_are_unconstrained() {
        let params = SearchParams::parse("method=&host=&latency=-").unwrap();
        assert!(params.filters.is_empty());
    }

    #[test]
    fn test_range_must_have_two_bounds() {
        let err = SearchParams::parse("latency=100").unwrap_err();
        assert!(matches!(err, QueryError::InvalidFilterState(_)));
        let err = SearchParams::parse("latency=1-2-3").unwrap_err();
        assert!(matches!(err, QueryError::InvalidFilterState(_)));
    }

    #[test]
    fn test_negative_date_bounds_round_trip() {
        let before_epoch = FilterState::new()
            .with(FilterField::Date, Constraint::range(Some(-86_400_000), Some(0)))
            .unwrap();
        let params = SearchParams {
            filters: before_epoch,
            ..SearchParams::default()
        };
        let encoded = params.to_query_string();
        assert_eq!(encoded, "date=-86400000-0");
        assert_eq!(SearchParams::parse(&encoded).unwrap(), params);

        for (raw, lo, hi) in [
            ("date=-500", None, Some(500)),
            ("date=--500", None, Some(-500)),
            ("date=-500-", Some(-500), None),
            ("date=-900--100", Some(-900), Some(-100)),
        ] {
            let parsed = SearchParams::parse(raw).unwrap();
            assert_eq!(
                parsed.filters.get(FilterField::Date),
                &Constraint::range(lo, hi),
                "{}",
                raw
            );
            assert_eq!(SearchParams::parse(&parsed.to_query_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn test_request_string_always_carries_size() {
        let params = SearchParams::parse("status=500").unwrap().for_window(0, DEFAULT_PAGE_SIZE);
        assert_eq!(params.to_query_string(), "status=500");
        assert_eq!(params.to_request_string(), "status=500&size=40");
    }

    #[test]
    fn test_sort_parsing() {
        let params = SearchParams::parse("sort=timing.tls.desc").unwrap();
        assert_eq!(
            params.sort,
            Some(SortState::new(FilterField::TimingTls, true).unwrap())
        );
        assert!(SearchParams::parse("sort=regions.asc").is_err());
        assert!(SearchParams::parse("sort=latency.sideways").is_err());
    }

    #[test]
    fn test_query_key_ignores_selection_and_window() {
        let params = sample();
        let other = SearchParams {
            uuid: None,
            start: 0,
            size: 40,
            ..params.clone()
        };
        assert_eq!(params.query_key(), other.query_key());
        assert_ne!(params.to_query_string(), other.to_query_string());
    }

    #[test]
    fn test_for_window_drops_uuid() {
        let window = sample().for_window(80, 20);
        assert_eq!(window.start, 80);
        assert_eq!(window.size, 20);
        assert!(window.uuid.is_none());
    }
}
