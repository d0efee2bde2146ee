//! Web request matchers
//!
//! Each web service declares one or more matchers; the dispatcher scores
//! every registered matcher against an incoming request and hands the
//! request to the single best non-zero match. Scores are deterministic:
//! each present predicate adds a fixed weight, longer paths and explicit
//! priorities win ties between similar matchers.

use crate::dict::Dict;

/// The request facts a matcher is scored against
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Remote client address, when known
    pub ip: String,
    /// Client software identification (User-Agent)
    pub client: String,
}

impl RequestInfo {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            protocol: "http".to_string(),
            host: String::new(),
            port: 0,
            path: path.to_string(),
            ip: String::new(),
            client: String::new(),
        }
    }
}

/// One matcher entry from a web service's `match[]` list
#[derive(Debug, Clone, PartialEq)]
pub struct WebMatcher {
    pub method: Option<String>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub path: String,
    pub auth: bool,
    pub prio: i32,
}

impl WebMatcher {
    pub fn from_dict(dict: &Dict) -> Self {
        Self {
            method: dict
                .get_str("method")
                .filter(|m| !m.is_empty())
                .map(|m| m.to_ascii_uppercase()),
            protocol: dict
                .get_str("protocol")
                .filter(|p| !p.is_empty())
                .map(str::to_string),
            host: dict
                .get_str("host")
                .filter(|h| !h.is_empty())
                .map(str::to_string),
            port: dict.int_or("port", 0).clamp(0, u16::MAX as i64) as u16,
            path: dict.str_or("path", "/").to_string(),
            auth: dict.bool_or("auth", false),
            prio: dict.int_or("prio", 0) as i32,
        }
    }

    /// The matcher's full score with every predicate satisfied
    pub fn score(&self) -> i32 {
        self.method.as_ref().map_or(0, |_| 400)
            + self.protocol.as_ref().map_or(0, |_| 300)
            + self.host.as_ref().map_or(0, |_| 200)
            + if self.port > 0 { 100 } else { 0 }
            + 1
            + self.path.len() as i32
            + self.prio
    }

    /// Score this matcher against a request, 0 on any mismatch
    ///
    /// A request path equal to the matcher path, or continuing past it at
    /// a `/` boundary, earns the full score; a bare prefix continuation
    /// (matcher path without a trailing `/`) earns one less.
    pub fn match_score(&self, request: &RequestInfo) -> i32 {
        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(&request.method) {
                return 0;
            }
        }
        if let Some(protocol) = &self.protocol {
            if protocol != &request.protocol {
                return 0;
            }
        }
        if let Some(host) = &self.host {
            if !host.eq_ignore_ascii_case(&request.host) {
                return 0;
            }
        }
        if self.port > 0 && self.port != request.port {
            return 0;
        }

        let full = self.score();
        let trimmed = self.path.trim_end_matches('/');
        if request.path == self.path || request.path == trimmed {
            return full;
        }
        let mut boundary = String::with_capacity(trimmed.len() + 1);
        boundary.push_str(trimmed);
        boundary.push('/');
        if request.path.starts_with(&boundary) {
            return full;
        }
        if request.path.starts_with(&self.path) {
            return full - 1;
        }
        0
    }
}

/// Pick the best matcher for a request from `(index, matcher)` entries
///
/// Returns the index of the single highest-scoring non-zero matcher;
/// ties go to the earliest declaration.
pub fn select_best<'a, I>(matchers: I, request: &RequestInfo) -> Option<usize>
where
    I: IntoIterator<Item = (usize, &'a WebMatcher)>,
{
    let mut best: Option<(usize, i32)> = None;
    for (index, matcher) in matchers {
        let score = matcher.match_score(request);
        if score <= 0 {
            continue;
        }
        match best {
            Some((_, top)) if top >= score => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}
