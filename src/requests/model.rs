//! 请求记录数据模型

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTTP 方法（固定集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Get,
        Method::Post,
        Method::Head,
        Method::Put,
        Method::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("未知的 HTTP 方法: {}", s))
    }
}

/// 部署区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Ams,
    Iad,
    Gru,
    Syd,
    Fra,
    Hkg,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::Ams,
        Region::Iad,
        Region::Gru,
        Region::Syd,
        Region::Fra,
        Region::Hkg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Ams => "ams",
            Region::Iad => "iad",
            Region::Gru => "gru",
            Region::Syd => "syd",
            Region::Fra => "fra",
            Region::Hkg => "hkg",
        }
    }

    /// 区域延迟倍率（生成模拟数据用）
    pub fn latency_multiplier(&self) -> f64 {
        match self {
            Region::Ams => 1.0,
            Region::Iad => 0.6,
            Region::Gru => 1.6,
            Region::Syd => 1.3,
            Region::Fra => 0.8,
            Region::Hkg => 1.4,
        }
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("未知的区域: {}", s))
    }
}

/// 请求各阶段耗时（毫秒）
///
/// 五段之和近似等于总延迟，但不保证相等
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    #[serde(rename = "timing.dns")]
    pub dns: i64,
    #[serde(rename = "timing.connection")]
    pub connection: i64,
    #[serde(rename = "timing.tls")]
    pub tls: i64,
    #[serde(rename = "timing.ttfb")]
    pub ttfb: i64,
    #[serde(rename = "timing.transfer")]
    pub transfer: i64,
}

impl Timing {
    pub fn total(&self) -> i64 {
        self.dns + self.connection + self.tls + self.ttfb + self.transfer
    }
}

/// 请求记录（写入后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub uuid: String,
    pub method: Method,
    pub host: String,
    pub pathname: String,
    pub success: bool,
    pub latency: i64,
    pub status: u16,
    pub regions: Vec<Region>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub timing: Timing,
}

/// 状态码分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusClass {
    Informational,
    Success,
    Redirect,
    ClientError,
    ServerError,
    Unknown,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            100..=199 => StatusClass::Informational,
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirect,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Unknown,
        }
    }
}

/// 常见状态码的原因短语
pub fn reason_phrase(status: u16) -> Option<&'static str> {
    let phrase = match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        418 => "I'm A Teapot",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => return None,
    };
    Some(phrase)
}

/// 详情视图中展示的状态码标签，未知状态码回退为 `Status {code}`
pub fn status_label(status: u16) -> String {
    reason_phrase(status)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Status {}", status))
}
