//! Client address resolution for anonymous rate limiting

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Extensions};
use std::net::SocketAddr;

pub const UNKNOWN_CLIENT: &str = "unknown";

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `X-Forwarded-For` first entry, then `X-Real-IP`, then the peer address
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(first) = header_value(headers, "x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_value(headers, "x-real-ip") {
        return real_ip.to_string();
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_resolution_order() {
        let mut headers = HeaderMap::new();
        let mut extensions = Extensions::new();
        assert_eq!(client_ip(&headers, &extensions), "unknown");

        extensions.insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 4], 5050))));
        assert_eq!(client_ip(&headers, &extensions), "192.168.1.4");

        headers.insert("x-real-ip", HeaderValue::from_static("10.1.1.1"));
        assert_eq!(client_ip(&headers, &extensions), "10.1.1.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.7 , 10.0.0.2"));
        assert_eq!(client_ip(&headers, &extensions), "203.0.113.7");
    }
}
