//! 过滤编译器
//!
//! 把过滤状态编译为与存储无关的谓词树，再由存储适配器渲染为具体查询。
//! 编译是纯函数且总能成功：空约束编译为"恒真"。

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use super::filter::{Constraint, FilterField, FilterState};
use super::model::RequestRecord;

/// 存储列
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    Uuid,
    Method,
    Host,
    Pathname,
    Success,
    Latency,
    Status,
    Regions,
    Date,
    TimingDns,
    TimingConnection,
    TimingTls,
    TimingTtfb,
    TimingTransfer,
}

impl Column {
    pub fn sql_name(&self) -> &'static str {
        match self {
            Column::Uuid => "uuid",
            Column::Method => "method",
            Column::Host => "host",
            Column::Pathname => "pathname",
            Column::Success => "success",
            Column::Latency => "latency",
            Column::Status => "status",
            Column::Regions => "regions",
            Column::Date => "date",
            Column::TimingDns => "timing_dns",
            Column::TimingConnection => "timing_connection",
            Column::TimingTls => "timing_tls",
            Column::TimingTtfb => "timing_ttfb",
            Column::TimingTransfer => "timing_transfer",
        }
    }

    /// 数组类型的列（区域）
    pub fn is_array(&self) -> bool {
        matches!(self, Column::Regions)
    }

    /// 取记录在该列上的值，数组列返回每个元素
    pub fn values_of(&self, record: &RequestRecord) -> Vec<Value> {
        let scalar = match self {
            Column::Uuid => Value::Text(record.uuid.clone()),
            Column::Method => Value::Text(record.method.as_str().to_string()),
            Column::Host => Value::Text(record.host.clone()),
            Column::Pathname => Value::Text(record.pathname.clone()),
            Column::Success => Value::Int(record.success as i64),
            Column::Latency => Value::Int(record.latency),
            Column::Status => Value::Int(record.status as i64),
            Column::Date => Value::Int(record.date.timestamp_millis()),
            Column::TimingDns => Value::Int(record.timing.dns),
            Column::TimingConnection => Value::Int(record.timing.connection),
            Column::TimingTls => Value::Int(record.timing.tls),
            Column::TimingTtfb => Value::Int(record.timing.ttfb),
            Column::TimingTransfer => Value::Int(record.timing.transfer),
            Column::Regions => {
                return record
                    .regions
                    .iter()
                    .map(|r| Value::Text(r.as_str().to_string()))
                    .collect();
            }
        };
        vec![scalar]
    }
}

/// 谓词中的字面值
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl Value {
    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    fn to_sql(&self) -> SqlValue {
        match self {
            Value::Int(v) => SqlValue::Integer(*v),
            Value::Text(s) => SqlValue::Text(s.clone()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// 谓词树
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    True,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Eq { column: Column, value: Value },
    Gte { column: Column, value: i64 },
    Lte { column: Column, value: i64 },
    Between { column: Column, lo: i64, hi: i64 },
    In { column: Column, values: Vec<Value> },
    /// 大小写敏感的子串匹配
    Contains { column: Column, needle: String },
    /// 数组列包含某个元素
    ArrayContains { column: Column, value: Value },
}

/// 编译过滤状态
///
/// 各字段谓词以 AND 组合；暂不支持跨字段 OR
pub fn compile(filters: &FilterState) -> Predicate {
    let mut parts: Vec<Predicate> = filters
        .iter()
        .filter_map(|(field, constraint)| compile_field(field, constraint))
        .collect();

    match parts.len() {
        0 => Predicate::True,
        1 => parts.remove(0),
        _ => Predicate::And(parts),
    }
}

fn compile_field(field: FilterField, constraint: &Constraint) -> Option<Predicate> {
    let column = field.column();
    match constraint {
        Constraint::None => None,
        Constraint::Range { lo, hi } => match (*lo, *hi) {
            (None, None) => None,
            (Some(lo), None) => Some(Predicate::Gte { column, value: lo }),
            (None, Some(hi)) => Some(Predicate::Lte { column, value: hi }),
            (Some(lo), Some(hi)) if lo == hi => Some(Predicate::Eq {
                column,
                value: Value::Int(lo),
            }),
            (Some(lo), Some(hi)) => Some(Predicate::Between { column, lo, hi }),
        },
        Constraint::Set(values) if values.is_empty() => None,
        Constraint::Set(values) if column.is_array() => {
            let mut any: Vec<Predicate> = values
                .iter()
                .map(|v| Predicate::ArrayContains {
                    column,
                    value: Value::Text(v.clone()),
                })
                .collect();
            if any.len() == 1 {
                any.pop()
            } else {
                Some(Predicate::Or(any))
            }
        }
        Constraint::Set(values) => Some(Predicate::In {
            column,
            values: values.iter().map(|v| set_value(field, v)).collect(),
        }),
        Constraint::Substring(needle) if needle.is_empty() => None,
        Constraint::Substring(needle) => Some(Predicate::Contains {
            column,
            needle: needle.clone(),
        }),
    }
}

fn set_value(field: FilterField, raw: &str) -> Value {
    match field {
        FilterField::Status => raw
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        _ => Value::Text(raw.to_string()),
    }
}

impl Predicate {
    /// 是否恒真
    pub fn is_always_true(&self) -> bool {
        match self {
            Predicate::True => true,
            Predicate::And(parts) => parts.iter().all(Predicate::is_always_true),
            _ => false,
        }
    }

    /// 在内存中对单条记录求值
    pub fn matches(&self, record: &RequestRecord) -> bool {
        match self {
            Predicate::True => true,
            Predicate::And(parts) => parts.iter().all(|p| p.matches(record)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(record)),
            Predicate::Eq { column, value } => column.values_of(record).contains(value),
            Predicate::Gte { column, value } => int_of(*column, record).is_some_and(|v| v >= *value),
            Predicate::Lte { column, value } => int_of(*column, record).is_some_and(|v| v <= *value),
            Predicate::Between { column, lo, hi } => {
                int_of(*column, record).is_some_and(|v| v >= *lo && v <= *hi)
            }
            Predicate::In { column, values } => column
                .values_of(record)
                .iter()
                .any(|v| values.contains(v)),
            Predicate::Contains { column, needle } => {
                column.values_of(record).iter().any(|v| match v {
                    Value::Text(s) => s.contains(needle.as_str()),
                    Value::Int(_) => false,
                })
            }
            Predicate::ArrayContains { column, value } => column.values_of(record).contains(value),
        }
    }

    /// 渲染为 SQLite WHERE 子句（不含 WHERE 关键字），参数按 ?N 顺序追加到 params
    pub fn to_sql(&self, params: &mut Vec<SqlValue>) -> String {
        match self {
            Predicate::True => "1 = 1".to_string(),
            Predicate::And(parts) if parts.is_empty() => "1 = 1".to_string(),
            Predicate::Or(parts) if parts.is_empty() => "1 = 0".to_string(),
            Predicate::And(parts) => join_sql(parts, " AND ", params),
            Predicate::Or(parts) => join_sql(parts, " OR ", params),
            Predicate::Eq { column, value } => {
                format!("{} = {}", column.sql_name(), bind(params, value.to_sql()))
            }
            Predicate::Gte { column, value } => {
                format!("{} >= {}", column.sql_name(), bind(params, SqlValue::Integer(*value)))
            }
            Predicate::Lte { column, value } => {
                format!("{} <= {}", column.sql_name(), bind(params, SqlValue::Integer(*value)))
            }
            Predicate::Between { column, lo, hi } => {
                let lo = bind(params, SqlValue::Integer(*lo));
                let hi = bind(params, SqlValue::Integer(*hi));
                format!("{} BETWEEN {} AND {}", column.sql_name(), lo, hi)
            }
            Predicate::In { column, values } => {
                let placeholders: Vec<String> =
                    values.iter().map(|v| bind(params, v.to_sql())).collect();
                format!("{} IN ({})", column.sql_name(), placeholders.join(", "))
            }
            // instr 区分大小写，LIKE 对 ASCII 不区分
            Predicate::Contains { column, needle } => format!(
                "instr({}, {}) > 0",
                column.sql_name(),
                bind(params, SqlValue::Text(needle.clone()))
            ),
            Predicate::ArrayContains { column, value } => format!(
                "EXISTS (SELECT 1 FROM json_each(requests.{}) AS elem WHERE elem.value = {})",
                column.sql_name(),
                bind(params, value.to_sql())
            ),
        }
    }

    /// 完整的 WHERE 子句，恒真时为空串
    pub fn where_sql(&self, params: &mut Vec<SqlValue>) -> String {
        if self.is_always_true() {
            String::new()
        } else {
            format!("WHERE {}", self.to_sql(params))
        }
    }
}

fn int_of(column: Column, record: &RequestRecord) -> Option<i64> {
    column.values_of(record).first().and_then(Value::as_int)
}

fn bind(params: &mut Vec<SqlValue>, value: SqlValue) -> String {
    params.push(value);
    format!("?{}", params.len())
}

fn join_sql(parts: &[Predicate], sep: &str, params: &mut Vec<SqlValue>) -> String {
    let rendered: Vec<String> = parts.iter().map(|p| p.to_sql(params)).collect();
    format!("({})", rendered.join(sep))
}
