//! 模拟请求记录生成
//!
//! 每个时间点为每个区域各生成一条记录，时间点从 `now` 起按固定间隔向前回溯

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::error::QueryError;
use super::model::{Method, Region, RequestRecord, Timing};

pub const MAX_SEED_DAYS: u32 = 31;
pub const MAX_INTERVAL_MINUTES: u32 = 24 * 60;

const PATHNAMES: [&str; 3] = ["/bikes/gravel", "/bikes/racing", "/bikes/mountain"];
const ERROR_MESSAGE: &str = "ERR_INTERNAL_DISASTER: \"The server spilled coffee on itself.\"";

/// 生成参数
#[derive(Debug, Clone)]
pub struct SeedOptions {
    pub days: u32,
    pub interval_minutes: u32,
    pub now: DateTime<Utc>,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            days: 14,
            interval_minutes: 60,
            now: Utc::now(),
        }
    }
}

impl SeedOptions {
    /// 时间点数量
    pub fn ticks(&self) -> u64 {
        let minutes = self.days as u64 * 24 * 60;
        minutes / self.interval_minutes.max(1) as u64
    }

    /// 生成前校验，拒绝会写入海量数据的参数
    pub fn validate(&self) -> Result<(), QueryError> {
        if !(1..=MAX_SEED_DAYS).contains(&self.days) {
            return Err(QueryError::invalid(format!(
                "days 必须在 1..={} 之间，实际为 {}",
                MAX_SEED_DAYS, self.days
            )));
        }
        if !(1..=MAX_INTERVAL_MINUTES).contains(&self.interval_minutes) {
            return Err(QueryError::invalid(format!(
                "intervalMinutes 必须在 1..={} 之间，实际为 {}",
                MAX_INTERVAL_MINUTES, self.interval_minutes
            )));
        }
        Ok(())
    }
}

/// 状态码分布：90% 200，4% 400，4% 404，1% 429，1% 500
fn random_status(rng: &mut fastrand::Rng) -> u16 {
    let roll = rng.f64();
    if roll < 0.9 {
        200
    } else if roll < 0.94 {
        400
    } else if roll < 0.98 {
        404
    } else if roll < 0.99 {
        429
    } else {
        500
    }
}

/// 按比例拆分总延迟，剩余部分计入 ttfb
fn random_timing(rng: &mut fastrand::Rng, latency: i64) -> Timing {
    let dns = rng.f64() * 0.10 + 0.05;
    let connection = rng.f64() * 0.20 + 0.10;
    let tls = rng.f64() * 0.05 + 0.05;
    let transfer = rng.f64() * 0.004;
    let ttfb = 1.0 - (dns + connection + tls + transfer);
    let part = |ratio: f64| (latency as f64 * ratio).round() as i64;

    Timing {
        dns: part(dns),
        connection: part(connection),
        tls: part(tls),
        ttfb: part(ttfb),
        transfer: part(transfer),
    }
}

fn random_target(rng: &mut fastrand::Rng) -> (Method, &'static str, &'static str) {
    if rng.bool() {
        (Method::Post, "api.acme-shop.com", "/v1/products")
    } else {
        let pathname = PATHNAMES[rng.usize(..PATHNAMES.len())];
        (Method::Get, "acme-shop.com", pathname)
    }
}

fn headers() -> BTreeMap<String, String> {
    [
        ("Age", "0"),
        (
            "Cache-Control",
            "private, no-cache, no-store, max-age=0, must-revalidate",
        ),
        ("Server", "Cloudflare"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// 生成一个时间点上所有区域的记录
fn records_at(rng: &mut fastrand::Rng, date: DateTime<Utc>) -> Vec<RequestRecord> {
    let factor = rng.f64();
    let (method, host, pathname) = random_target(rng);

    Region::ALL
        .into_iter()
        .map(|region| {
            let status = random_status(rng);
            let multiplier = region.latency_multiplier();
            let latency = (1000.0 * (factor * (1.0 - multiplier) + multiplier)).round() as i64;
            RequestRecord {
                uuid: uuid::Uuid::new_v4().to_string(),
                method,
                host: host.to_string(),
                pathname: pathname.to_string(),
                success: status == 200,
                latency,
                status,
                regions: vec![region],
                date,
                headers: headers(),
                message: (status == 500).then(|| ERROR_MESSAGE.to_string()),
                timing: random_timing(rng, latency),
            }
        })
        .collect()
}

/// 按时间点惰性生成模拟记录，调用方可以边生成边分批写入
pub fn records<'a>(
    options: &'a SeedOptions,
    rng: &'a mut fastrand::Rng,
) -> impl Iterator<Item = RequestRecord> + 'a {
    let interval = options.interval_minutes.max(1) as i64;
    (0..options.ticks()).flat_map(move |i| {
        let date = options.now - Duration::minutes(interval * i as i64);
        records_at(rng, date)
    })
}

/// 生成全部模拟记录
pub fn generate(options: &SeedOptions, rng: &mut fastrand::Rng) -> Vec<RequestRecord> {
    records(options, rng).collect()
}
