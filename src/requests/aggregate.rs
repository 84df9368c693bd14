//! 聚合引擎
//!
//! 三项相互独立的计算，都是输入批次的纯函数：
//! - 延迟分位数（最近秩法，无插值）
//! - 按时间分桶的成功/失败图表序列
//! - 各字段的去重取值及计数（facet）

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::filter::FilterField;
use super::model::RequestRecord;
use super::predicate::Value;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

// ============ 分位数 ============

/// 支持的分位点
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Percentile {
    P50,
    P75,
    P90,
    P95,
    P99,
}

impl Percentile {
    pub const ALL: [Percentile; 5] = [
        Percentile::P50,
        Percentile::P75,
        Percentile::P90,
        Percentile::P95,
        Percentile::P99,
    ];

    pub fn value(&self) -> usize {
        match self {
            Percentile::P50 => 50,
            Percentile::P75 => 75,
            Percentile::P90 => 90,
            Percentile::P95 => 95,
            Percentile::P99 => 99,
        }
    }
}

/// 分位数快照（毫秒）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentiles {
    #[serde(rename = "50")]
    pub p50: i64,
    #[serde(rename = "75")]
    pub p75: i64,
    #[serde(rename = "90")]
    pub p90: i64,
    #[serde(rename = "95")]
    pub p95: i64,
    #[serde(rename = "99")]
    pub p99: i64,
}

impl Percentiles {
    pub fn get(&self, percentile: Percentile) -> i64 {
        match percentile {
            Percentile::P50 => self.p50,
            Percentile::P75 => self.p75,
            Percentile::P90 => self.p90,
            Percentile::P95 => self.p95,
            Percentile::P99 => self.p99,
        }
    }
}

fn sorted_latencies(records: &[RequestRecord]) -> Vec<i64> {
    let mut latencies: Vec<i64> = records.iter().map(|r| r.latency).collect();
    latencies.sort_unstable();
    latencies
}

/// 最近秩：rank = ceil(p/100 * n)，取第 rank 个（从 1 开始）
fn nearest_rank(sorted: &[i64], percentile: Percentile) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (percentile.value() * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

/// 计算批次内的延迟分位数，空批次全部为 0
///
/// 只覆盖调用方传入的批次（当前页），不是全量扫描
pub fn percentiles(records: &[RequestRecord]) -> Percentiles {
    let sorted = sorted_latencies(records);
    Percentiles {
        p50: nearest_rank(&sorted, Percentile::P50),
        p75: nearest_rank(&sorted, Percentile::P75),
        p90: nearest_rank(&sorted, Percentile::P90),
        p95: nearest_rank(&sorted, Percentile::P95),
        p99: nearest_rank(&sorted, Percentile::P99),
    }
}

/// 每条记录在批次中的百分位排名（0-100）：延迟不超过它的记录占比
pub fn percentile_ranks(records: &[RequestRecord]) -> Vec<f64> {
    let sorted = sorted_latencies(records);
    let n = sorted.len() as f64;
    records
        .iter()
        .map(|r| {
            let at_or_below = sorted.partition_point(|v| *v <= r.latency);
            at_or_below as f64 / n * 100.0
        })
        .collect()
}

// ============ 图表序列 ============

/// 图表中的一个时间桶
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartPoint {
    /// 桶起始时间（毫秒时间戳）
    pub timestamp: i64,
    pub success: u64,
    pub error: u64,
}

/// 根据日期过滤区间选择桶宽（毫秒）
///
/// 没有区间或区间半开时按小时分桶
pub fn chart_interval(date_range: Option<(Option<i64>, Option<i64>)>) -> i64 {
    let Some((Some(lo), Some(hi))) = date_range else {
        return HOUR_MS;
    };
    let span = (hi - lo).abs();
    if span <= HOUR_MS {
        MINUTE_MS
    } else if span <= 12 * HOUR_MS {
        10 * MINUTE_MS
    } else if span <= 2 * DAY_MS {
        HOUR_MS
    } else if span <= 14 * DAY_MS {
        6 * HOUR_MS
    } else {
        DAY_MS
    }
}

/// 按固定宽度时间桶统计成功/失败数
///
/// 只输出至少含一条记录的桶，按起始时间升序；空桶由 UI 补齐
pub fn chart_series(
    records: &[RequestRecord],
    date_range: Option<(Option<i64>, Option<i64>)>,
) -> Vec<ChartPoint> {
    let width = chart_interval(date_range);
    let buckets = records.iter().fold(BTreeMap::new(), |mut acc, record| {
        let ts = record.date.timestamp_millis();
        let start = ts.div_euclid(width) * width;
        let entry: &mut (u64, u64) = acc.entry(start).or_default();
        if record.success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
        acc
    });

    buckets
        .into_iter()
        .map(|(timestamp, (success, error))| ChartPoint {
            timestamp,
            success,
            error,
        })
        .collect()
}

// ============ Facet ============

/// 单个取值及其出现次数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: Value,
    pub count: u64,
}

/// 字段的 facet：离散字段列出取值，数值字段给出观测到的 [min, max]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Facet {
    Values { values: Vec<FacetCount> },
    Range { min: i64, max: i64 },
}

/// 字段键 → facet
pub type Facets = BTreeMap<String, Facet>;

/// 列出取值的字段
pub const VALUE_FACET_FIELDS: [FilterField; 5] = [
    FilterField::Method,
    FilterField::Status,
    FilterField::Host,
    FilterField::Pathname,
    FilterField::Regions,
];

/// 给出 [min, max] 的数值字段
pub const RANGE_FACET_FIELDS: [FilterField; 6] = [
    FilterField::Latency,
    FilterField::TimingDns,
    FilterField::TimingConnection,
    FilterField::TimingTls,
    FilterField::TimingTtfb,
    FilterField::TimingTransfer,
];

impl Facet {
    /// 从 (取值, 计数) 构造，按取值排序
    pub fn from_counts(counts: impl IntoIterator<Item = (Value, u64)>) -> Self {
        let mut values: Vec<FacetCount> = counts
            .into_iter()
            .map(|(value, count)| FacetCount { value, count })
            .collect();
        values.sort_by(|a, b| a.value.cmp(&b.value));
        Facet::Values { values }
    }

    pub fn count_of(&self, value: &Value) -> u64 {
        match self {
            Facet::Values { values } => values
                .iter()
                .find(|fc| &fc.value == value)
                .map(|fc| fc.count)
                .unwrap_or(0),
            Facet::Range { .. } => 0,
        }
    }
}

/// 在一批记录上计算 facet
///
/// 数组字段（区域）的每个元素各自计数一次
pub fn facets_from_records(records: &[RequestRecord]) -> Facets {
    let counted: BTreeMap<(FilterField, Value), u64> = records
        .iter()
        .flat_map(|record| {
            VALUE_FACET_FIELDS.into_iter().flat_map(move |field| {
                field
                    .column()
                    .values_of(record)
                    .into_iter()
                    .map(move |value| (field, value))
            })
        })
        .fold(BTreeMap::new(), |mut acc, key| {
            *acc.entry(key).or_insert(0) += 1;
            acc
        });

    let mut facets: Facets = VALUE_FACET_FIELDS
        .into_iter()
        .map(|field| {
            let counts = counted
                .iter()
                .filter(|((f, _), _)| *f == field)
                .map(|((_, v), c)| (v.clone(), *c));
            (field.key().to_string(), Facet::from_counts(counts))
        })
        .collect();

    for field in RANGE_FACET_FIELDS {
        let observed = records
            .iter()
            .flat_map(|r| field.column().values_of(r))
            .filter_map(|v| match v {
                Value::Int(i) => Some(i),
                Value::Text(_) => None,
            });
        let bounds = observed.fold(None, |acc: Option<(i64, i64)>, v| match acc {
            None => Some((v, v)),
            Some((min, max)) => Some((min.min(v), max.max(v))),
        });
        if let Some((min, max)) = bounds {
            facets.insert(field.key().to_string(), Facet::Range { min, max });
        }
    }
    facets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::model::{Method, Region, Timing};
    use chrono::DateTime;

    fn record(uuid: &str, latency: i64, success: bool, ts: i64, regions: Vec<Region>) -> RequestRecord {
        RequestRecord {
            uuid: uuid.to_string(),
            method: Method::Get,
            host: "acme-shop.com".to_string(),
            pathname: "/bikes/gravel".to_string(),
            success,
            latency,
            status: if success { 200 } else { 500 },
            regions,
            date: DateTime::from_timestamp_millis(ts).unwrap(),
            headers: Default::default(),
            message: None,
            timing: Timing {
                dns: latency / 10,
                connection: latency / 5,
                tls: latency / 10,
                ttfb: latency / 2,
                transfer: 1,
            },
        }
    }

    fn batch(latencies: &[i64]) -> Vec<RequestRecord> {
        latencies
            .iter()
            .enumerate()
            .map(|(i, l)| record(&format!("r{}", i), *l, true, 0, vec![Region::Ams]))
            .collect()
    }

    #[test]
    fn test_empty_batch_percentiles_are_zero() {
        assert_eq!(percentiles(&[]), Percentiles::default());
        assert!(percentile_ranks(&[]).is_empty());
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let records = batch(&(1..=100).rev().collect::<Vec<_>>());
        let p = percentiles(&records);
        assert_eq!(p.p50, 50);
        assert_eq!(p.p75, 75);
        assert_eq!(p.p90, 90);
        assert_eq!(p.p95, 95);
        assert_eq!(p.p99, 99);

        let single = percentiles(&batch(&[42]));
        assert_eq!(single.p50, 42);
        assert_eq!(single.p99, 42);
    }

    #[test]
    fn test_percentiles_monotonic() {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..50 {
            let n = rng.usize(1..60);
            let latencies: Vec<i64> = (0..n).map(|_| rng.i64(0..5000)).collect();
            let p = percentiles(&batch(&latencies));
            assert!(p.p50 <= p.p75 && p.p75 <= p.p90 && p.p90 <= p.p95 && p.p95 <= p.p99);
        }
    }

    #[test]
    fn test_percentile_ranks() {
        let ranks = percentile_ranks(&batch(&[10, 20, 20, 40]));
        assert_eq!(ranks, vec![25.0, 75.0, 75.0, 100.0]);
    }

    #[test]
    fn test_chart_interval_selection() {
        assert_eq!(chart_interval(None), HOUR_MS);
        assert_eq!(chart_interval(Some((Some(0), None))), HOUR_MS);
        assert_eq!(chart_interval(Some((Some(0), Some(30 * MINUTE_MS)))), MINUTE_MS);
        assert_eq!(chart_interval(Some((Some(0), Some(DAY_MS)))), HOUR_MS);
        assert_eq!(chart_interval(Some((Some(0), Some(7 * DAY_MS)))), 6 * HOUR_MS);
        assert_eq!(chart_interval(Some((Some(0), Some(30 * DAY_MS)))), DAY_MS);
    }

    #[test]
    fn test_chart_series_skips_empty_buckets() {
        let records = vec![
            record("a", 1, true, 5 * HOUR_MS + 10, vec![Region::Ams]),
            record("b", 1, false, 5 * HOUR_MS + 20, vec![Region::Ams]),
            record("c", 1, true, 2 * HOUR_MS, vec![Region::Ams]),
        ];
        let series = chart_series(&records, None);
        assert_eq!(
            series,
            vec![
                ChartPoint { timestamp: 2 * HOUR_MS, success: 1, error: 0 },
                ChartPoint { timestamp: 5 * HOUR_MS, success: 1, error: 1 },
            ]
        );
    }

    #[test]
    fn test_region_facet_fans_out() {
        let records = vec![
            record("a", 10, true, 0, vec![Region::Ams, Region::Iad]),
            record("b", 30, true, 0, vec![Region::Ams]),
        ];
        let facets = facets_from_records(&records);
        let regions = &facets["regions"];
        assert_eq!(regions.count_of(&Value::Text("ams".into())), 2);
        assert_eq!(regions.count_of(&Value::Text("iad".into())), 1);
        assert_eq!(facets["method"].count_of(&Value::Text("GET".into())), 2);
        assert_eq!(facets["status"].count_of(&Value::Int(200)), 2);
        assert_eq!(facets["latency"], Facet::Range { min: 10, max: 30 });
        assert_eq!(facets["timing.transfer"], Facet::Range { min: 1, max: 1 });
    }

    #[test]
    fn test_facets_on_empty_batch_have_no_ranges() {
        let facets = facets_from_records(&[]);
        assert_eq!(facets["method"], Facet::Values { values: vec![] });
        assert!(!facets.contains_key("latency"));
    }
}
