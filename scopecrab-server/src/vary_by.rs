//! Throttling bucket keys derived from request attributes

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::header;
use std::net::SocketAddr;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Derives the bucket key a request is throttled under
///
/// Implementations must be deterministic: the same request always yields the
/// same key.
pub trait VaryByKeyer: Send + Sync {
    fn key(&self, parts: &Parts) -> String;
}

/// Puts every request of a scope into one global bucket
#[derive(Debug, Clone, Copy, Default)]
pub struct NullKeyer;

impl VaryByKeyer for NullKeyer {
    fn key(&self, _parts: &Parts) -> String {
        String::new()
    }
}

/// Concatenates selected request attributes into a key
///
/// Segments always appear in the same order, each followed by the separator:
/// remote address, method, headers, path, query parameters, cookies. Missing
/// values produce an empty segment so positions never shift.
///
/// ```
/// use scopecrab_server::vary_by::{CompositeKeyer, VaryByKeyer};
/// use axum::http::Request;
///
/// let keyer = CompositeKeyer::new().method(true).path(true).separator("|");
/// let (parts, ()) = Request::post("/cart?x=1").body(()).unwrap().into_parts();
/// assert_eq!(keyer.key(&parts), "POST|/cart|");
/// ```
#[derive(Debug, Clone)]
pub struct CompositeKeyer {
    remote_addr: bool,
    forwarded_for: bool,
    method: bool,
    path: bool,
    headers: Vec<String>,
    params: Vec<String>,
    cookies: Vec<String>,
    separator: String,
    case_fold: bool,
}

impl Default for CompositeKeyer {
    fn default() -> Self {
        Self {
            remote_addr: false,
            forwarded_for: false,
            method: false,
            path: false,
            headers: Vec::new(),
            params: Vec::new(),
            cookies: Vec::new(),
            separator: "\n".to_string(),
            case_fold: false,
        }
    }
}

impl CompositeKeyer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include the client IP address
    pub fn remote_addr(mut self, enabled: bool) -> Self {
        self.remote_addr = enabled;
        self
    }

    /// Take the client address from the first `X-Forwarded-For` entry when present
    pub fn forwarded_for(mut self, enabled: bool) -> Self {
        self.forwarded_for = enabled;
        self
    }

    pub fn method(mut self, enabled: bool) -> Self {
        self.method = enabled;
        self
    }

    pub fn path(mut self, enabled: bool) -> Self {
        self.path = enabled;
        self
    }

    pub fn headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.headers = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.params = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        self
    }

    pub fn cookies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cookies = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        self
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Lowercase the final key
    pub fn case_fold(mut self, enabled: bool) -> Self {
        self.case_fold = enabled;
        self
    }

    fn client_ip(&self, parts: &Parts) -> String {
        if self.forwarded_for {
            let first = parts
                .headers
                .get(FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = first {
                return addr.to_string();
            }
        }

        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default()
    }

    fn push(&self, key: &mut String, segment: &str) {
        key.push_str(segment);
        key.push_str(&self.separator);
    }
}

impl VaryByKeyer for CompositeKeyer {
    fn key(&self, parts: &Parts) -> String {
        let mut key = String::new();

        if self.remote_addr || self.forwarded_for {
            self.push(&mut key, &self.client_ip(parts));
        }
        if self.method {
            self.push(&mut key, parts.method.as_str());
        }
        for name in &self.headers {
            let values: Vec<&str> = parts
                .headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            self.push(&mut key, &values.join(","));
        }
        if self.path {
            self.push(&mut key, parts.uri.path());
        }
        if !self.params.is_empty() {
            let query: Vec<(String, String)> = parts
                .uri
                .query()
                .and_then(|q| serde_urlencoded::from_str(q).ok())
                .unwrap_or_default();
            for name in &self.params {
                let value = query
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("");
                self.push(&mut key, value);
            }
        }
        if !self.cookies.is_empty() {
            let jar = parse_cookies(parts);
            for name in &self.cookies {
                let value = jar
                    .iter()
                    .find(|(k, _)| *k == name.as_str())
                    .map(|(_, v)| *v)
                    .unwrap_or("");
                self.push(&mut key, value);
            }
        }

        if self.case_fold {
            key.to_lowercase()
        } else {
            key
        }
    }
}

fn parse_cookies(parts: &Parts) -> Vec<(&str, &str)> {
    parts
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}
