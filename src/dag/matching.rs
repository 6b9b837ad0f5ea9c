//! Route match specifications, their precedence order, and evaluation against
//! a concrete request.
//!
//! Precedence (highest first):
//! 1. exact path, then prefix (longer literal first), then regex (longer
//!    pattern first);
//! 2. for equal paths, more header matchers before fewer, then more query
//!    matchers before fewer;
//! 3. otherwise the derived order of the specification, so the result never
//!    depends on insertion order.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use regex::Regex;

use crate::config::AbsentHeaderPolicy;

/// A regular expression matched against the whole value.
///
/// Compiled once; compares, orders and hashes by its source text.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    anchored: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, String> {
        let anchored = Regex::new(&format!("^(?:{source})$"))
            .map_err(|e| format!("invalid regex {source:?}: {e}"))?;
        Ok(Self { source: source.to_string(), anchored })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_full_match(&self, value: &str) -> bool {
        self.anchored.is_match(value)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.source, f)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl PartialOrd for Pattern {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pattern {
    fn cmp(&self, other: &Self) -> Ordering {
        self.source.cmp(&other.source)
    }
}

impl Hash for Pattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

/// Path matcher of a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(Pattern),
}

impl PathMatch {
    fn rank(&self) -> u8 {
        match self {
            PathMatch::Exact(_) => 0,
            PathMatch::Prefix(_) => 1,
            PathMatch::Regex(_) => 2,
        }
    }

    fn literal(&self) -> &str {
        match self {
            PathMatch::Exact(s) | PathMatch::Prefix(s) => s,
            PathMatch::Regex(p) => p.as_str(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(p) => path == p,
            PathMatch::Prefix(p) => path.starts_with(p.as_str()),
            PathMatch::Regex(p) => p.is_full_match(path),
        }
    }
}

/// Header condition kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderCondition {
    Present,
    NotPresent,
    Exact(String),
    NotExact(String),
    Contains(String),
    NotContains(String),
    Regex(Pattern),
}

impl HeaderCondition {
    /// `NotExact` and `NotContains` are the only conditions whose outcome on
    /// a missing header depends on the absent-header policy.
    pub fn is_negated_value(&self) -> bool {
        matches!(self, HeaderCondition::NotExact(_) | HeaderCondition::NotContains(_))
    }
}

/// One header matcher. Names are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderMatch {
    pub name: String,
    pub condition: HeaderCondition,
    pub absent: AbsentHeaderPolicy,
}

impl HeaderMatch {
    pub fn new(name: &str, condition: HeaderCondition, absent: AbsentHeaderPolicy) -> Self {
        let absent = if condition.is_negated_value() { absent } else { AbsentHeaderPolicy::NoMatch };
        Self { name: name.to_ascii_lowercase(), condition, absent }
    }

    /// Evaluate against the header value, `None` when the header is absent.
    pub fn matches(&self, value: Option<&str>) -> bool {
        let value = match (value, &self.condition) {
            (None, HeaderCondition::NotPresent) => return true,
            (None, c) if c.is_negated_value() && self.absent == AbsentHeaderPolicy::Match => "",
            (None, _) => return false,
            (Some(v), _) => v,
        };
        match &self.condition {
            HeaderCondition::Present => true,
            HeaderCondition::NotPresent => false,
            HeaderCondition::Exact(t) => value == t,
            HeaderCondition::NotExact(t) => value != t,
            HeaderCondition::Contains(t) => value.contains(t.as_str()),
            HeaderCondition::NotContains(t) => !value.contains(t.as_str()),
            HeaderCondition::Regex(p) => p.is_full_match(value),
        }
    }
}

/// Query parameter condition kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryCondition {
    Present,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(Pattern),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryMatch {
    pub name: String,
    pub condition: QueryCondition,
    pub ignore_case: bool,
}

impl QueryMatch {
    pub fn new(name: &str, condition: QueryCondition, ignore_case: bool) -> Self {
        Self { name: name.to_string(), condition, ignore_case }
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        let Some(value) = value else { return false };
        let fold = |s: &str| if self.ignore_case { s.to_lowercase() } else { s.to_string() };
        match &self.condition {
            QueryCondition::Present => true,
            QueryCondition::Exact(t) => fold(value) == fold(t),
            QueryCondition::Prefix(t) => fold(value).starts_with(&fold(t)),
            QueryCondition::Suffix(t) => fold(value).ends_with(&fold(t)),
            QueryCondition::Contains(t) => fold(value).contains(&fold(t)),
            QueryCondition::Regex(p) => p.is_full_match(value),
        }
    }
}

/// Path AND headers AND query parameters.
///
/// Header and query matchers are kept sorted and de-duplicated so two
/// specifications written in a different order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchSpec {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub query: Vec<QueryMatch>,
}

impl MatchSpec {
    pub fn new(path: PathMatch, mut headers: Vec<HeaderMatch>, mut query: Vec<QueryMatch>) -> Self {
        headers.sort();
        headers.dedup();
        query.sort();
        query.dedup();
        Self { path, headers, query }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::new(PathMatch::Prefix(prefix.into()), Vec::new(), Vec::new())
    }

    /// Whether every matcher holds for `request`.
    pub fn matches(&self, request: &Request) -> bool {
        self.path.matches(request.path())
            && self.headers.iter().all(|h| h.matches(request.header(&h.name).as_deref()))
            && self.query.iter().all(|q| q.matches(request.query_param(&q.name)))
    }

    /// Total precedence order; `Less` means `self` is tried first.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.path
            .rank()
            .cmp(&other.path.rank())
            .then_with(|| other.path.literal().len().cmp(&self.path.literal().len()))
            .then_with(|| other.headers.len().cmp(&self.headers.len()))
            .then_with(|| other.query.len().cmp(&self.query.len()))
            .then_with(|| self.cmp(other))
    }
}

/// A concrete HTTP request, used to evaluate routes without a proxy.
#[derive(Debug, Clone, Default)]
pub struct Request {
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl Request {
    /// A request for `target`, which may carry a `?query` string.
    pub fn get(target: &str) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let query = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| {
                let (k, v) = p.split_once('=').unwrap_or((p, ""));
                (k.to_string(), v.to_string())
            })
            .collect();
        Self { path: path.to_string(), query, headers: Vec::new() }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Header value; repeated headers are joined with `,`.
    pub fn header(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        let values: Vec<&str> =
            self.headers.iter().filter(|(k, _)| *k == name).map(|(_, v)| v.as_str()).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(","))
        }
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}
