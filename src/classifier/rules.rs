//! Black/white list rules and the shared TTL cache that serves them.

use crate::db::{Database, RuleRow};
use crate::error::{Error, Result};
use crate::nntp::RawHeader;
use regex::{Regex, RegexBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Header field a rule is matched against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleField {
    /// Subject header
    Subject,
    /// From header
    From,
    /// Message-ID header
    MessageId,
}

impl RuleField {
    /// Stored tag for this field
    pub fn tag(self) -> i64 {
        match self {
            RuleField::Subject => 1,
            RuleField::From => 2,
            RuleField::MessageId => 3,
        }
    }

    /// Parse a stored tag; `None` for anything unknown
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(RuleField::Subject),
            2 => Some(RuleField::From),
            3 => Some(RuleField::MessageId),
            _ => None,
        }
    }

    fn value(self, header: &RawHeader) -> &str {
        match self {
            RuleField::Subject => &header.subject,
            RuleField::From => &header.from,
            RuleField::MessageId => &header.message_id,
        }
    }
}

/// Whether a rule rejects or admits matching headers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Matching headers are dropped
    Blacklist,
    /// Only matching headers are kept
    Whitelist,
}

impl RuleKind {
    /// Stored tag for this kind
    pub fn tag(self) -> i64 {
        match self {
            RuleKind::Blacklist => 1,
            RuleKind::Whitelist => 2,
        }
    }

    /// Parse a stored tag; `None` for anything unknown
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(RuleKind::Blacklist),
            2 => Some(RuleKind::Whitelist),
            _ => None,
        }
    }
}

/// A compiled black/white list rule
#[derive(Clone, Debug)]
pub struct FilterRule {
    /// Database id
    pub id: i64,
    /// Case-insensitive pattern matched against [`FilterRule::field`]
    pub regex: Regex,
    /// Header field the pattern applies to
    pub field: RuleField,
    /// Black or white list
    pub kind: RuleKind,
}

impl FilterRule {
    /// Build a rule, rejecting unknown tags and invalid patterns
    pub fn new(id: i64, pattern: &str, field: i64, kind: i64) -> Result<Self> {
        let field = RuleField::from_tag(field).ok_or_else(|| Error::InvalidRule {
            id,
            reason: format!("unknown field tag {field}"),
        })?;
        let kind = RuleKind::from_tag(kind).ok_or_else(|| Error::InvalidRule {
            id,
            reason: format!("unknown rule kind {kind}"),
        })?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::InvalidRule {
                id,
                reason: format!("invalid pattern: {e}"),
            })?;
        Ok(Self {
            id,
            regex,
            field,
            kind,
        })
    }

    /// True when the rule's field of `header` matches
    pub fn matches(&self, header: &RawHeader) -> bool {
        self.regex.is_match(self.field.value(header))
    }
}

/// Result of running a header through a [`RuleSet`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Keep the header; carries the rule that admitted it, if any
    Accept(Option<i64>),
    /// Drop the header; carries the rule that rejected it, if any
    Reject(Option<i64>),
}

impl FilterVerdict {
    /// True for [`FilterVerdict::Accept`]
    pub fn is_accepted(self) -> bool {
        matches!(self, FilterVerdict::Accept(_))
    }

    /// The rule that decided the verdict
    pub fn rule(self) -> Option<i64> {
        match self {
            FilterVerdict::Accept(rule) | FilterVerdict::Reject(rule) => rule,
        }
    }
}

/// The enabled rules that apply to one group, ordered by id
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    whitelist: Vec<FilterRule>,
    blacklist: Vec<FilterRule>,
}

impl RuleSet {
    /// Build a rule set from already compiled rules
    pub fn new(mut rules: Vec<FilterRule>) -> Self {
        rules.sort_by_key(|r| r.id);
        let (whitelist, blacklist) = rules
            .into_iter()
            .partition(|r| r.kind == RuleKind::Whitelist);
        Self {
            whitelist,
            blacklist,
        }
    }

    /// Compile the stored rules whose group pattern matches `group`.
    ///
    /// Disabled rows are skipped. Any row with an unknown tag or a bad
    /// pattern fails the whole load.
    pub fn compile(group: &str, rows: &[RuleRow]) -> Result<Self> {
        let mut rules = Vec::new();
        for row in rows.iter().filter(|r| r.enabled) {
            let scope = RegexBuilder::new(&row.group_pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| Error::InvalidRule {
                    id: row.id,
                    reason: format!("invalid group pattern: {e}"),
                })?;
            let rule = FilterRule::new(row.id, &row.regex, row.field, row.kind)?;
            if scope.is_match(group) {
                rules.push(rule);
            }
        }
        Ok(Self::new(rules))
    }

    /// True when no rule applies
    pub fn is_empty(&self) -> bool {
        self.whitelist.is_empty() && self.blacklist.is_empty()
    }

    /// Decide whether a header passes.
    ///
    /// With any whitelist present a header must match one of them and the
    /// blacklist is not consulted. Otherwise the first matching blacklist
    /// rule rejects it.
    pub fn evaluate(&self, header: &RawHeader) -> FilterVerdict {
        if !self.whitelist.is_empty() {
            return match self.whitelist.iter().find(|r| r.matches(header)) {
                Some(rule) => FilterVerdict::Accept(Some(rule.id)),
                None => FilterVerdict::Reject(None),
            };
        }
        match self.blacklist.iter().find(|r| r.matches(header)) {
            Some(rule) => FilterVerdict::Reject(Some(rule.id)),
            None => FilterVerdict::Accept(None),
        }
    }
}

struct Cached<T> {
    loaded_at: Instant,
    value: Arc<T>,
}

/// Process-wide cache of per-group rule sets and the multigroup poster set.
///
/// Entries are reloaded from the database once older than the TTL, or
/// immediately after [`FilterCache::refresh`]. Workers share one instance.
pub struct FilterCache {
    db: Arc<Database>,
    ttl: Duration,
    rules: RwLock<HashMap<String, Cached<RuleSet>>>,
    posters: RwLock<Option<Cached<HashSet<String>>>>,
}

impl FilterCache {
    /// Create an empty cache
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            rules: RwLock::new(HashMap::new()),
            posters: RwLock::new(None),
        }
    }

    /// Rules that apply to `group`
    pub async fn rules_for(&self, group: &str) -> Result<Arc<RuleSet>> {
        if let Some(cached) = self.rules.read().await.get(group)
            && cached.loaded_at.elapsed() < self.ttl
        {
            return Ok(cached.value.clone());
        }

        let rows = self.db.list_rules(true).await?;
        let set = Arc::new(RuleSet::compile(group, &rows)?);
        tracing::debug!(
            group,
            whitelist = set.whitelist.len(),
            blacklist = set.blacklist.len(),
            "Loaded filter rules"
        );
        self.rules.write().await.insert(
            group.to_string(),
            Cached {
                loaded_at: Instant::now(),
                value: set.clone(),
            },
        );
        Ok(set)
    }

    /// Posters whose postings go to the multigroup table set
    pub async fn multigroup_posters(&self) -> Result<Arc<HashSet<String>>> {
        if let Some(cached) = self.posters.read().await.as_ref()
            && cached.loaded_at.elapsed() < self.ttl
        {
            return Ok(cached.value.clone());
        }

        let posters: HashSet<String> = self.db.list_multigroup_posters().await?.into_iter().collect();
        let posters = Arc::new(posters);
        *self.posters.write().await = Some(Cached {
            loaded_at: Instant::now(),
            value: posters.clone(),
        });
        Ok(posters)
    }

    /// Drop every cached entry so the next lookup hits the database
    pub async fn refresh(&self) {
        self.rules.write().await.clear();
        *self.posters.write().await = None;
    }
}
