//! 请求记录存储适配器
//!
//! 只负责把谓词树 + 窗口 + 排序翻译为存储操作，不包含业务逻辑。
//! 任何存储层错误都以 `StoreUnavailable` 返回，适配器自身不重试。

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::DateTime;
use parking_lot::{Mutex, RwLock};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{Connection, Row};

use super::aggregate::{self, Facet, Facets, RANGE_FACET_FIELDS, VALUE_FACET_FIELDS};
use super::error::QueryError;
use super::filter::{FilterField, SortState};
use super::model::{Method, RequestRecord, Timing};
use super::pagination::PageWindow;
use super::predicate::{Column, Predicate, Value};

/// 记录存储需要满足的语义
///
/// 页序稳定：按排序字段排序，同值时按 uuid 升序
pub trait RecordStore: Send + Sync {
    /// 不带谓词的总数
    fn total_count(&self) -> Result<u64, QueryError>;

    fn filtered_count(&self, predicate: &Predicate) -> Result<u64, QueryError>;

    fn page(
        &self,
        predicate: &Predicate,
        window: PageWindow,
        sort: SortState,
    ) -> Result<Vec<RequestRecord>, QueryError>;

    /// 过滤后全量数据上的 facet（不仅是当前页）
    fn facets(&self, predicate: &Predicate) -> Result<Facets, QueryError>;

    fn find(&self, uuid: &str) -> Result<Option<RequestRecord>, QueryError>;

    fn insert_batch(&self, records: &[RequestRecord]) -> Result<(), QueryError>;

    /// 批量清空，返回删除条数
    fn clear(&self) -> Result<u64, QueryError>;
}

const SELECT_COLUMNS: &str = "uuid, method, host, pathname, success, latency, status, regions, date, headers, message, timing_dns, timing_connection, timing_tls, timing_ttfb, timing_transfer";

/// SQLite 存储
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self, QueryError> {
        Self::with_connection(Connection::open(db_path)?)
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> Result<Self, QueryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, QueryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS requests (
                uuid TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                host TEXT NOT NULL,
                pathname TEXT NOT NULL,
                success INTEGER NOT NULL,
                latency INTEGER NOT NULL,
                status INTEGER NOT NULL,
                regions TEXT NOT NULL,
                date INTEGER NOT NULL,
                headers TEXT NOT NULL,
                message TEXT,
                timing_dns INTEGER NOT NULL,
                timing_connection INTEGER NOT NULL,
                timing_tls INTEGER NOT NULL,
                timing_ttfb INTEGER NOT NULL,
                timing_transfer INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_requests_date ON requests(date);
            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);
            CREATE INDEX IF NOT EXISTS idx_requests_host ON requests(host);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn count_where(&self, predicate: &Predicate) -> Result<u64, QueryError> {
        let conn = self.conn.lock();
        let mut params: Vec<SqlValue> = Vec::new();
        let where_sql = predicate.where_sql(&mut params);
        let sql = format!("SELECT COUNT(*) FROM requests {}", where_sql);
        let total: i64 = conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
            row.get(0)
        })?;
        Ok(total as u64)
    }

    fn value_facet(
        conn: &Connection,
        field: FilterField,
        predicate: &Predicate,
    ) -> Result<Facet, QueryError> {
        let mut params: Vec<SqlValue> = Vec::new();
        let where_sql = predicate.where_sql(&mut params);
        let column = field.column();
        // 数组列展开后分组：一条记录对它包含的每个元素各计一次
        let sql = if column.is_array() {
            format!(
                "SELECT fan.value, COUNT(*) FROM requests, json_each(requests.{}) AS fan {} GROUP BY fan.value",
                column.sql_name(),
                where_sql
            )
        } else {
            format!(
                "SELECT {col}, COUNT(*) FROM requests {w} GROUP BY {col}",
                col = column.sql_name(),
                w = where_sql
            )
        };

        let mut stmt = conn.prepare(&sql)?;
        let counts = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let value = match row.get::<_, SqlValue>(0)? {
                    SqlValue::Integer(i) => Value::Int(i),
                    SqlValue::Text(s) => Value::Text(s),
                    other => Value::Text(format!("{:?}", other)),
                };
                let count: i64 = row.get(1)?;
                Ok((value, count as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Facet::from_counts(counts))
    }

    fn range_facets(conn: &Connection, predicate: &Predicate) -> Result<Facets, QueryError> {
        let mut params: Vec<SqlValue> = Vec::new();
        let where_sql = predicate.where_sql(&mut params);
        let selects: Vec<String> = RANGE_FACET_FIELDS
            .iter()
            .map(|f| {
                let col = f.column().sql_name();
                format!("MIN({col}), MAX({col})")
            })
            .collect();
        let sql = format!("SELECT {} FROM requests {}", selects.join(", "), where_sql);

        conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
            let mut facets = Facets::new();
            for (i, field) in RANGE_FACET_FIELDS.iter().enumerate() {
                let min: Option<i64> = row.get(i * 2)?;
                let max: Option<i64> = row.get(i * 2 + 1)?;
                // 空结果集时 MIN/MAX 为 NULL，不输出区间
                if let (Some(min), Some(max)) = (min, max) {
                    facets.insert(field.key().to_string(), Facet::Range { min, max });
                }
            }
            Ok(facets)
        })
        .map_err(Into::into)
    }
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let method: String = row.get(1)?;
    let regions: String = row.get(7)?;
    let date_ms: i64 = row.get(8)?;
    let headers: String = row.get(9)?;

    Ok(RequestRecord {
        uuid: row.get(0)?,
        method: method.parse::<Method>().map_err(|e| conversion_error(1, e))?,
        host: row.get(2)?,
        pathname: row.get(3)?,
        success: row.get::<_, i64>(4)? != 0,
        latency: row.get(5)?,
        status: row.get::<_, i64>(6)? as u16,
        regions: serde_json::from_str(&regions).map_err(|e| conversion_error(7, e))?,
        date: DateTime::from_timestamp_millis(date_ms)
            .ok_or_else(|| conversion_error(8, format!("无效的时间戳: {}", date_ms)))?,
        headers: serde_json::from_str(&headers).map_err(|e| conversion_error(9, e))?,
        message: row.get(10)?,
        timing: Timing {
            dns: row.get(11)?,
            connection: row.get(12)?,
            tls: row.get(13)?,
            ttfb: row.get(14)?,
            transfer: row.get(15)?,
        },
    })
}

impl RecordStore for SqliteStore {
    fn total_count(&self) -> Result<u64, QueryError> {
        self.count_where(&Predicate::True)
    }

    fn filtered_count(&self, predicate: &Predicate) -> Result<u64, QueryError> {
        self.count_where(predicate)
    }

    fn page(
        &self,
        predicate: &Predicate,
        window: PageWindow,
        sort: SortState,
    ) -> Result<Vec<RequestRecord>, QueryError> {
        let conn = self.conn.lock();
        let mut params: Vec<SqlValue> = Vec::new();
        let where_sql = predicate.where_sql(&mut params);
        let sort_column = sort_column(sort);
        let sql = format!(
            "SELECT {} FROM requests {} ORDER BY {} {}, uuid ASC LIMIT ?{} OFFSET ?{}",
            SELECT_COLUMNS,
            where_sql,
            sort_column.sql_name(),
            if sort.desc { "DESC" } else { "ASC" },
            params.len() + 1,
            params.len() + 2
        );
        params.push(SqlValue::Integer(window.limit as i64));
        params.push(SqlValue::Integer(window.offset as i64));

        tracing::debug!("分页查询: {}", sql);
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn facets(&self, predicate: &Predicate) -> Result<Facets, QueryError> {
        let conn = self.conn.lock();
        let mut facets = Self::range_facets(&conn, predicate)?;
        for field in VALUE_FACET_FIELDS {
            let facet = Self::value_facet(&conn, field, predicate)?;
            facets.insert(field.key().to_string(), facet);
        }
        Ok(facets)
    }

    fn find(&self, uuid: &str) -> Result<Option<RequestRecord>, QueryError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM requests WHERE uuid = ?1", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map([uuid], row_to_record)?;
        Ok(rows.next().transpose()?)
    }

    fn insert_batch(&self, records: &[RequestRecord]) -> Result<(), QueryError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO requests ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                SELECT_COLUMNS
            ))?;
            for record in records {
                let regions = serde_json::to_string(&record.regions)
                    .map_err(|e| QueryError::store(e.to_string()))?;
                let headers = serde_json::to_string(&record.headers)
                    .map_err(|e| QueryError::store(e.to_string()))?;
                stmt.execute(rusqlite::params![
                    record.uuid,
                    record.method.as_str(),
                    record.host,
                    record.pathname,
                    record.success as i64,
                    record.latency,
                    record.status as i64,
                    regions,
                    record.date.timestamp_millis(),
                    headers,
                    record.message,
                    record.timing.dns,
                    record.timing.connection,
                    record.timing.tls,
                    record.timing.ttfb,
                    record.timing.transfer,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<u64, QueryError> {
        let conn = self.conn.lock();
        let count = conn.execute("DELETE FROM requests", [])?;
        Ok(count as u64)
    }
}

/// 数组列不可排序，回退到日期
fn sort_column(sort: SortState) -> Column {
    if sort.field.is_sortable() {
        sort.field.column()
    } else {
        Column::Date
    }
}

/// 内存存储，用谓词树直接求值
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<RequestRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn filtered(&self, predicate: &Predicate) -> Vec<RequestRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| predicate.matches(r))
            .cloned()
            .collect()
    }
}

fn compare_records(a: &RequestRecord, b: &RequestRecord, sort: SortState) -> Ordering {
    let column = sort_column(sort);
    let primary = column.values_of(a).cmp(&column.values_of(b));
    let primary = if sort.desc { primary.reverse() } else { primary };
    primary.then_with(|| a.uuid.cmp(&b.uuid))
}

impl RecordStore for MemoryStore {
    fn total_count(&self) -> Result<u64, QueryError> {
        Ok(self.records.read().len() as u64)
    }

    fn filtered_count(&self, predicate: &Predicate) -> Result<u64, QueryError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| predicate.matches(r))
            .count() as u64)
    }

    fn page(
        &self,
        predicate: &Predicate,
        window: PageWindow,
        sort: SortState,
    ) -> Result<Vec<RequestRecord>, QueryError> {
        let mut matched = self.filtered(predicate);
        matched.sort_by(|a, b| compare_records(a, b, sort));
        Ok(matched
            .into_iter()
            .skip(window.offset as usize)
            .take(window.limit as usize)
            .collect())
    }

    fn facets(&self, predicate: &Predicate) -> Result<Facets, QueryError> {
        Ok(aggregate::facets_from_records(&self.filtered(predicate)))
    }

    fn find(&self, uuid: &str) -> Result<Option<RequestRecord>, QueryError> {
        Ok(self.records.read().iter().find(|r| r.uuid == uuid).cloned())
    }

    fn insert_batch(&self, records: &[RequestRecord]) -> Result<(), QueryError> {
        let mut stored = self.records.write();
        let mut seen: HashSet<&str> = stored.iter().map(|r| r.uuid.as_str()).collect();
        // 与 SQLite 主键约束一致：批次内重复同样整批拒绝
        for record in records {
            if !seen.insert(record.uuid.as_str()) {
                return Err(QueryError::store(format!("记录已存在: {}", record.uuid)));
            }
        }
        stored.extend_from_slice(records);
        Ok(())
    }

    fn clear(&self) -> Result<u64, QueryError> {
        let mut stored = self.records.write();
        let count = stored.len() as u64;
        stored.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::filter::{Constraint, FilterState};
    use crate::requests::model::Region;
    use crate::requests::pagination::PaginationController;
    use crate::requests::predicate::compile;

    fn record(uuid: &str, ts: i64, status: u16, regions: Vec<Region>, host: &str) -> RequestRecord {
        RequestRecord {
            uuid: uuid.to_string(),
            method: if status == 200 { Method::Get } else { Method::Post },
            host: host.to_string(),
            pathname: "/v1/products".to_string(),
            success: status == 200,
            latency: ts % 1000,
            status,
            regions,
            date: DateTime::from_timestamp_millis(ts).unwrap(),
            headers: [("Server".to_string(), "Cloudflare".to_string())].into(),
            message: (status == 500).then(|| "boom".to_string()),
            timing: Timing {
                dns: 1,
                connection: 2,
                tls: 3,
                ttfb: ts % 1000 - 7,
                transfer: 1,
            },
        }
    }

    fn fixture() -> Vec<RequestRecord> {
        vec![
            record("c", 1_000_500, 200, vec![Region::Ams, Region::Iad], "acme-shop.com"),
            record("a", 1_000_500, 500, vec![Region::Iad], "api.acme-shop.com"),
            record("b", 1_000_300, 404, vec![Region::Gru], "acme-shop.com"),
            record("d", 1_000_900, 200, vec![Region::Ams], "api.acme-shop.com"),
            record("e", 1_000_100, 200, vec![Region::Syd], "Acme.io"),
        ]
    }

    fn stores() -> Vec<Box<dyn RecordStore>> {
        let sqlite = SqliteStore::in_memory().unwrap();
        sqlite.insert_batch(&fixture()).unwrap();
        let memory = MemoryStore::new();
        memory.insert_batch(&fixture()).unwrap();
        vec![Box::new(sqlite), Box::new(memory)]
    }

    fn uuids(records: &[RequestRecord]) -> Vec<&str> {
        records.iter().map(|r| r.uuid.as_str()).collect()
    }

    #[test]
    fn test_default_order_is_date_desc_then_uuid_asc() {
        for store in stores() {
            let window = PaginationController::new(10).request_next_window();
            let page = store.page(&Predicate::True, window, SortState::default()).unwrap();
            assert_eq!(uuids(&page), vec!["d", "a", "c", "b", "e"]);
        }
    }

    #[test]
    fn test_round_trip_through_sqlite() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_batch(&fixture()).unwrap();
        let found = store.find("a").unwrap().unwrap();
        assert_eq!(found, fixture()[1]);
        assert!(store.find("zzz").unwrap().is_none());
    }

    #[test]
    fn test_counts_and_filters_agree_across_stores() {
        let filters = FilterState::new()
            .with(FilterField::Host, Constraint::substring("acme"))
            .unwrap()
            .with(FilterField::Regions, Constraint::set(["iad", "gru"]))
            .unwrap();
        let predicate = compile(&filters);

        for store in stores() {
            assert_eq!(store.total_count().unwrap(), 5);
            assert_eq!(store.filtered_count(&predicate).unwrap(), 3);
            let window = PaginationController::new(2).request_next_window();
            let page = store.page(&predicate, window, SortState::default()).unwrap();
            assert_eq!(uuids(&page), vec!["a", "c"]);
        }
    }

    #[test]
    fn test_sort_by_latency_asc() {
        let sort = SortState::new(FilterField::Latency, false).unwrap();
        for store in stores() {
            let window = PaginationController::new(10).request_next_window();
            let page = store.page(&Predicate::True, window, sort).unwrap();
            assert_eq!(uuids(&page), vec!["e", "b", "a", "c", "d"]);
        }
    }

    #[test]
    fn test_facets_cover_filtered_population_with_fan_out() {
        let filters = FilterState::new()
            .with(FilterField::Status, Constraint::set(["200", "500"]))
            .unwrap();
        let predicate = compile(&filters);

        for store in stores() {
            let facets = store.facets(&predicate).unwrap();
            let regions = &facets["regions"];
            assert_eq!(regions.count_of(&Value::Text("ams".into())), 2);
            assert_eq!(regions.count_of(&Value::Text("iad".into())), 2);
            assert_eq!(regions.count_of(&Value::Text("gru".into())), 0);
            assert_eq!(facets["status"].count_of(&Value::Int(200)), 3);
            assert_eq!(facets["status"].count_of(&Value::Int(404)), 0);
            assert_eq!(facets["latency"], Facet::Range { min: 100, max: 900 });
        }
    }

    #[test]
    fn test_facets_of_empty_population() {
        let filters = FilterState::new()
            .with(FilterField::Host, Constraint::substring("nope"))
            .unwrap();
        for store in stores() {
            let facets = store.facets(&compile(&filters)).unwrap();
            assert!(!facets.contains_key("latency"));
            assert_eq!(facets["host"], Facet::Values { values: vec![] });
        }
    }

    #[test]
    fn test_clear() {
        for store in stores() {
            assert_eq!(store.clear().unwrap(), 5);
            assert_eq!(store.total_count().unwrap(), 0);
        }
    }

    #[test]
    fn test_duplicate_uuid_rejects_whole_batch() {
        let mut batch = fixture();
        batch.push(fixture()[0].clone());
        let stores: Vec<Box<dyn RecordStore>> = vec![
            Box::new(SqliteStore::in_memory().unwrap()),
            Box::new(MemoryStore::new()),
        ];
        for store in stores {
            assert!(matches!(
                store.insert_batch(&batch),
                Err(QueryError::StoreUnavailable(_))
            ));
            assert_eq!(store.total_count().unwrap(), 0);

            store.insert_batch(&fixture()).unwrap();
            assert!(store.insert_batch(&fixture()[..1]).is_err());
            assert_eq!(store.total_count().unwrap(), 5);
        }
    }
}
