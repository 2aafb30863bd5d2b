//! Filter options scoping a subscription.
//!
//! Options are plain values: two subscriptions with deep-equal options can
//! share a session, anything else gets a new one. The predicates can also be
//! evaluated locally against an [`Entity`], for transports that cannot push
//! them to the server.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Entity, NamespaceName};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("field selector `{0}` has no operator")]
    MissingOperator(String),
    #[error("field selector `{0}` has an empty path")]
    EmptyPath(String),
    #[error("label selector term `{0}` is malformed")]
    BadLabelTerm(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Combinator {
    #[default]
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldOp {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "^=")]
    Prefix,
    /// Case-insensitive substring match.
    #[serde(rename = "*=")]
    Contains,
    #[serde(rename = "~=")]
    In,
    #[serde(rename = "!~=")]
    NotIn,
}

impl FieldOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldOp::Equal => "=",
            FieldOp::NotEqual => "!=",
            FieldOp::Prefix => "^=",
            FieldOp::Contains => "*=",
            FieldOp::In => "~=",
            FieldOp::NotIn => "!~=",
        }
    }
}

/// `path op value[|value..]`, e.g. `metadata.name*=web` or `status.phase~=Running|Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelector {
    pub field_path: String,
    pub operator: FieldOp,
    pub values: SmallVec<[String; 2]>,
}

impl FieldSelector {
    pub fn new(path: impl Into<String>, op: FieldOp, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { field_path: path.into(), operator: op, values: values.into_iter().map(Into::into).collect() }
    }

    pub fn equals(path: impl Into<String>, value: impl Into<String>) -> Self { Self::new(path, FieldOp::Equal, [value.into()]) }

    pub fn matches(&self, raw: &serde_json::Value) -> bool {
        let found = resolve_path(raw, &self.field_path);
        let any = |f: &dyn Fn(&str, &str) -> bool| {
            found.iter().any(|v| self.values.iter().any(|want| f(v.as_str(), want.as_str())))
        };
        match self.operator {
            FieldOp::Equal | FieldOp::In => any(&|v: &str, w: &str| v == w),
            FieldOp::NotEqual | FieldOp::NotIn => !any(&|v: &str, w: &str| v == w),
            FieldOp::Prefix => any(&|v: &str, w: &str| v.starts_with(w)),
            FieldOp::Contains => any(&|v: &str, w: &str| v.to_lowercase().contains(&w.to_lowercase())),
        }
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.field_path, self.operator.as_str(), self.values.join("|"))
    }
}

impl FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let idx = s.find('=').ok_or_else(|| SelectorError::MissingOperator(s.to_string()))?;
        let (head, mut rest) = (&s[..idx], &s[idx + 1..]);
        let (path, op) = if let Some(p) = head.strip_suffix("!~") {
            (p, FieldOp::NotIn)
        } else if let Some(p) = head.strip_suffix('~') {
            (p, FieldOp::In)
        } else if let Some(p) = head.strip_suffix('!') {
            (p, FieldOp::NotEqual)
        } else if let Some(p) = head.strip_suffix('^') {
            (p, FieldOp::Prefix)
        } else if let Some(p) = head.strip_suffix('*') {
            (p, FieldOp::Contains)
        } else {
            // `==` reads as `=`
            if let Some(r) = rest.strip_prefix('=') { rest = r; }
            (head, FieldOp::Equal)
        };
        let path = path.trim();
        if path.is_empty() {
            return Err(SelectorError::EmptyPath(s.to_string()));
        }
        Ok(FieldSelector::new(path, op, rest.split('|').map(str::trim)))
    }
}

/// Resolve a dotted path into scalar strings. `[*]` fans out over arrays,
/// `[n]` indexes, `\.` escapes a dot inside a key (annotation names).
pub fn resolve_path(raw: &serde_json::Value, path: &str) -> Vec<String> {
    let mut cur: Vec<&serde_json::Value> = vec![raw];
    for seg in split_path(path) {
        let (key, index) = match seg.find('[') {
            Some(i) if seg.ends_with(']') => (&seg[..i], Some(&seg[i + 1..seg.len() - 1])),
            _ => (seg.as_str(), None),
        };
        let mut next = Vec::new();
        for v in cur {
            let v = if key.is_empty() { Some(v) } else { v.get(key) };
            let Some(v) = v else { continue };
            match index {
                None => next.push(v),
                Some("*") => {
                    if let Some(arr) = v.as_array() { next.extend(arr.iter()); }
                }
                Some(n) => {
                    if let Some(item) = n.parse::<usize>().ok().and_then(|i| v.get(i)) { next.push(item); }
                }
            }
        }
        cur = next;
    }
    cur.into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
        .collect()
}

fn split_path(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => { buf.push('.'); chars.next(); }
            '.' => out.push(std::mem::take(&mut buf)),
            c => buf.push(c),
        }
    }
    out.push(buf);
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelectorGroup {
    pub operator: Combinator,
    pub field_selectors: Vec<FieldSelector>,
}

impl FieldSelectorGroup {
    pub fn is_empty(&self) -> bool { self.field_selectors.is_empty() }

    /// An empty group matches everything.
    pub fn matches(&self, raw: &serde_json::Value) -> bool {
        if self.field_selectors.is_empty() { return true; }
        match self.operator {
            Combinator::And => self.field_selectors.iter().all(|s| s.matches(raw)),
            Combinator::Or => self.field_selectors.iter().any(|s| s.matches(raw)),
        }
    }
}

/// One Kubernetes label selector requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelRequirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    NotExists(String),
}

impl LabelRequirement {
    fn matches(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        match self {
            LabelRequirement::Equals(k, v) => labels.get(k) == Some(v),
            LabelRequirement::NotEquals(k, v) => labels.get(k) != Some(v),
            LabelRequirement::In(k, vs) => labels.get(k).is_some_and(|have| vs.contains(have)),
            LabelRequirement::NotIn(k, vs) => labels.get(k).map_or(true, |have| !vs.contains(have)),
            LabelRequirement::Exists(k) => labels.contains_key(k),
            LabelRequirement::NotExists(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for LabelRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelRequirement::Equals(k, v) => write!(f, "{}={}", k, v),
            LabelRequirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            LabelRequirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(",")),
            LabelRequirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(",")),
            LabelRequirement::Exists(k) => f.write_str(k),
            LabelRequirement::NotExists(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label requirements in `kubectl -l` syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSelector {
    pub requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }

    pub fn matches(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for term in split_terms(s) {
            let term = term.trim();
            if term.is_empty() { continue; }
            requirements.push(parse_label_term(term)?);
        }
        Ok(LabelSelector { requirements })
    }
}

// Split on commas that are not inside `( .. )`.
fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut depth, mut start) = (0i32, 0usize);
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => { out.push(&s[start..i]); start = i + 1; }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_label_term(term: &str) -> Result<LabelRequirement, SelectorError> {
    let bad = || SelectorError::BadLabelTerm(term.to_string());
    let set = |rest: &str| -> Result<Vec<String>, SelectorError> {
        let inner = rest.trim().strip_prefix('(').and_then(|r| r.strip_suffix(')')).ok_or_else(bad)?;
        Ok(inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
    };
    if let Some((k, rest)) = term.split_once(" notin ") {
        return Ok(LabelRequirement::NotIn(k.trim().to_string(), set(rest)?));
    }
    if let Some((k, rest)) = term.split_once(" in ") {
        return Ok(LabelRequirement::In(k.trim().to_string(), set(rest)?));
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Ok(LabelRequirement::NotEquals(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
        if k.trim().is_empty() { return Err(bad()); }
        return Ok(LabelRequirement::Equals(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some(k) = term.strip_prefix('!') {
        return Ok(LabelRequirement::NotExists(k.trim().to_string()));
    }
    if term.contains(char::is_whitespace) { return Err(bad()); }
    Ok(LabelRequirement::Exists(term.to_string()))
}

/// Scope of one subscription. Compared by deep equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterOptions {
    pub namespace: Option<String>,
    pub field_selector_group: FieldSelectorGroup,
    pub label_selector: LabelSelector,
    /// Restrict to explicit identities (empty = no restriction).
    pub namespace_names: Vec<NamespaceName>,
}

impl FilterOptions {
    pub fn all() -> Self { Self::default() }

    pub fn in_namespace(ns: impl Into<String>) -> Self { Self { namespace: Some(ns.into()), ..Self::default() } }

    pub fn with_field(mut self, selector: FieldSelector) -> Self {
        self.field_selector_group.field_selectors.push(selector);
        self
    }

    pub fn with_combinator(mut self, c: Combinator) -> Self {
        self.field_selector_group.operator = c;
        self
    }

    pub fn with_labels(mut self, labels: LabelSelector) -> Self {
        self.label_selector = labels;
        self
    }

    pub fn with_identities(mut self, ids: impl IntoIterator<Item = NamespaceName>) -> Self {
        self.namespace_names.extend(ids);
        self
    }

    /// Single-object scope, as used by detail views.
    pub fn single(nn: &NamespaceName) -> Self {
        FilterOptions::all()
            .with_field(FieldSelector::equals("metadata.namespace", nn.namespace.clone()))
            .with_field(FieldSelector::equals("metadata.name", nn.name.clone()))
    }

    pub fn is_unfiltered(&self) -> bool {
        self.namespace.as_deref().map_or(true, str::is_empty)
            && self.field_selector_group.is_empty()
            && self.label_selector.is_empty()
            && self.namespace_names.is_empty()
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        let meta = entity.metadata();
        if let Some(ns) = self.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            if meta.namespace.as_deref() != Some(ns) { return false; }
        }
        if !self.namespace_names.is_empty() && !self.namespace_names.iter().any(|nn| nn.key() == *entity.key()) {
            return false;
        }
        self.label_selector.matches(&meta.labels) && self.field_selector_group.matches(entity.raw())
    }

    /// Which facets differ from `other`; empty when deep-equal.
    pub fn diff(&self, other: &FilterOptions) -> SmallVec<[&'static str; 4]> {
        let mut out = SmallVec::new();
        if self.namespace != other.namespace { out.push("namespace"); }
        if self.field_selector_group != other.field_selector_group { out.push("fields"); }
        if self.label_selector != other.label_selector { out.push("labels"); }
        if self.namespace_names != other.namespace_names { out.push("identities"); }
        out
    }
}
