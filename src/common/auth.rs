//! 管理端点的 API Key 校验

use axum::{body::Body, http::Request};
use subtle::ConstantTimeEq;

/// 从请求头提取 API Key
///
/// 优先读取 `x-api-key`，其次 `Authorization: Bearer <key>`
pub fn extract_api_key(request: &Request<Body>) -> Option<String> {
    let headers = request.headers();
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

/// 常量时间比较，防止时序攻击
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(name: &str, value: &str) -> Request<Body> {
        Request::builder()
            .uri("/api/seed")
            .header(name, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_extract_from_x_api_key() {
        let request = request_with("x-api-key", "secret");
        assert_eq!(extract_api_key(&request).as_deref(), Some("secret"));
    }

    #[test]
    fn test_extract_from_bearer() {
        let request = request_with("authorization", "Bearer secret");
        assert_eq!(extract_api_key(&request).as_deref(), Some("secret"));

        let request = request_with("authorization", "Basic c2VjcmV0");
        assert_eq!(extract_api_key(&request), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secret-longer"));
    }
}
