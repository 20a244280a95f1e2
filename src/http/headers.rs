//! Hop-by-hop header filtering.
//!
//! Names are compared case-insensitively. Filtering an already filtered list
//! leaves it unchanged.

use crate::envelope::HeaderList;

/// Request headers that never cross the tunnel toward the upstream.
pub const REQUEST_HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-connection",
    "upgrade",
    "trailers",
];

/// Response headers that never reach the local client.
pub const RESPONSE_HOP_BY_HOP: &[&str] = &[
    "connection",
    "transfer-encoding",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "trailer",
    "upgrade",
];

fn is_listed(name: &str, list: &[&str]) -> bool {
    list.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Drop hop-by-hop headers before proxying a request upstream.
pub fn strip_request_headers(headers: &mut HeaderList) {
    headers.retain(|(name, _)| !is_listed(name, REQUEST_HOP_BY_HOP));
}

/// Drop hop-by-hop headers before returning a response to the local client.
pub fn strip_response_headers(headers: &mut HeaderList) {
    headers.retain(|(name, _)| !is_listed(name, RESPONSE_HOP_BY_HOP));
}

/// Flatten an `http::HeaderMap` into an ordered list. Non-UTF-8 values are
/// carried lossily.
pub fn header_list(map: &http::HeaderMap) -> HeaderList {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Build an `http::HeaderMap`, skipping names or values that are not valid
/// HTTP tokens.
pub fn header_map(headers: &HeaderList) -> http::HeaderMap {
    let mut map = http::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let Ok(name) = http::header::HeaderName::from_bytes(name.as_bytes()) else {
            log::debug!("Skipping invalid header name: {}", name);
            continue;
        };
        let Ok(value) = http::header::HeaderValue::from_str(value) else {
            log::debug!("Skipping invalid value for header {}", name);
            continue;
        };
        map.append(name, value);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(pairs: &[(&str, &str)]) -> HeaderList {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_strip_request_headers() {
        let mut headers = list(&[
            ("Host", "example.com"),
            ("Content-Length", "5"),
            ("Connection", "keep-alive"),
            ("Keep-Alive", "timeout=5"),
            ("Proxy-Connection", "close"),
            ("Upgrade", "websocket"),
            ("Trailers", "x"),
            ("Accept", "*/*"),
            ("X-Custom", "1"),
            ("x-custom", "2"),
        ]);
        strip_request_headers(&mut headers);
        assert_eq!(
            headers,
            list(&[("Accept", "*/*"), ("X-Custom", "1"), ("x-custom", "2")])
        );

        let once = headers.clone();
        strip_request_headers(&mut headers);
        assert_eq!(headers, once);
    }

    #[test]
    fn test_strip_response_headers() {
        let mut headers = list(&[
            ("content-type", "text/plain"),
            ("TRANSFER-ENCODING", "chunked"),
            ("Proxy-Authenticate", "Basic"),
            ("Proxy-Authorization", "secret"),
            ("Trailer", "x"),
            ("Upgrade", "h2c"),
            ("connection", "close"),
            ("keep-alive", "5"),
            ("set-cookie", "a=1"),
        ]);
        strip_response_headers(&mut headers);
        assert_eq!(
            headers,
            list(&[("content-type", "text/plain"), ("set-cookie", "a=1")])
        );

        strip_response_headers(&mut headers);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_request_and_response_sets_differ() {
        // "host" is only a request concern; "transfer-encoding" only a response one.
        let mut req = list(&[("transfer-encoding", "chunked"), ("host", "a")]);
        strip_request_headers(&mut req);
        assert_eq!(req, list(&[("transfer-encoding", "chunked")]));

        let mut res = list(&[("transfer-encoding", "chunked"), ("host", "a")]);
        strip_response_headers(&mut res);
        assert_eq!(res, list(&[("host", "a")]));
    }

    #[test]
    fn test_header_map_conversion() {
        let headers = list(&[("x-a", "1"), ("x-a", "2"), ("bad name", "v"), ("x-b", "ok")]);
        let map = header_map(&headers);
        assert_eq!(map.get_all("x-a").iter().count(), 2);
        assert!(map.get("x-b").is_some());
        assert_eq!(map.len(), 3);

        let back = header_list(&map);
        assert!(back.contains(&("x-b".to_string(), "ok".to_string())));
    }
}
