//! Header classification: part-descriptor parsing, black/white list
//! filtering and multigroup routing.

pub mod rules;

use crate::nntp::RawHeader;
use crate::types::TableSet;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, LazyLock};

pub use rules::{FilterCache, FilterRule, FilterVerdict, RuleField, RuleKind, RuleSet};

/// `<title> (<part>/<total>)`, tolerant of anything after the part count
static PART_DESCRIPTOR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(.+)\s+\((\d+)/(\d+)\)").ok());

const INDEX_POST_MARKER: &str = "\"usenet index post";

/// A header that passed classification
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedHeader {
    /// The overview record as received
    pub raw: RawHeader,
    /// Subject with the part descriptor removed (and ` yEnc` appended when
    /// the poster left it out)
    pub base_subject: String,
    /// Part index from the descriptor
    pub part_number: u32,
    /// Declared number of parts
    pub total_parts: u32,
    /// Table set the header is assembled into
    pub destination: TableSet,
}

/// Everything [`HeaderClassifier::classify`] learned about one chunk
#[derive(Debug, Default)]
pub struct ClassifiedBatch {
    /// Accepted headers from multigroup posters, assembled first
    pub multigroup: Vec<ClassifiedHeader>,
    /// Accepted group-scoped headers
    pub standard: Vec<ClassifiedHeader>,
    /// Headers rejected by black/white lists
    pub blacklisted: usize,
    /// Headers without a part descriptor
    pub not_yenc: usize,
    /// Rules that decided at least one header
    pub used_rules: BTreeSet<i64>,
}

impl ClassifiedBatch {
    /// Accepted headers in assembly order
    pub fn accepted(&self) -> impl Iterator<Item = &ClassifiedHeader> {
        self.multigroup.iter().chain(self.standard.iter())
    }
}

/// Split a subject into `(base subject, part, total)`.
///
/// Index-post announcements are never binaries and yield `None`.
pub fn parse_part_descriptor(subject: &str) -> Option<(String, u32, u32)> {
    let trimmed = subject.trim_start();
    if trimmed
        .get(..INDEX_POST_MARKER.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(INDEX_POST_MARKER))
    {
        return None;
    }

    let caps = PART_DESCRIPTOR.as_ref()?.captures(subject)?;
    let part = caps.get(2)?.as_str().parse().ok()?;
    let total = caps.get(3)?.as_str().parse().ok()?;
    let mut base = caps.get(1)?.as_str().to_string();
    if !subject.to_ascii_lowercase().contains("yenc") {
        base.push_str(" yEnc");
    }
    Some((base, part, total))
}

/// Classifies the headers of one group's chunk.
///
/// Rules and posters are injected so tests can supply fixed sets; in a run
/// they come from the shared [`FilterCache`].
pub struct HeaderClassifier {
    group: String,
    rules: Arc<RuleSet>,
    posters: Arc<HashSet<String>>,
    all_as_multigroup: bool,
    log_dropped: bool,
}

impl HeaderClassifier {
    /// Create a classifier for one group
    pub fn new(
        group: impl Into<String>,
        rules: Arc<RuleSet>,
        posters: Arc<HashSet<String>>,
        all_as_multigroup: bool,
    ) -> Self {
        Self {
            group: group.into(),
            rules,
            posters,
            all_as_multigroup,
            log_dropped: false,
        }
    }

    /// Log every dropped non-yEnc subject at debug level
    pub fn with_dropped_logging(mut self, enabled: bool) -> Self {
        self.log_dropped = enabled;
        self
    }

    /// Classify headers in arrival order
    pub fn classify(&self, headers: Vec<RawHeader>) -> ClassifiedBatch {
        let mut batch = ClassifiedBatch::default();

        for raw in headers {
            let Some((base_subject, part_number, total_parts)) = parse_part_descriptor(&raw.subject)
            else {
                if self.log_dropped {
                    tracing::debug!(
                        target: "usenet_indexer::dropped",
                        group = %self.group,
                        number = raw.number,
                        subject = %raw.subject,
                        "Dropped header without part descriptor"
                    );
                }
                batch.not_yenc += 1;
                continue;
            };

            let verdict = self.rules.evaluate(&raw);
            if let Some(rule) = verdict.rule() {
                batch.used_rules.insert(rule);
            }
            if !verdict.is_accepted() {
                batch.blacklisted += 1;
                continue;
            }

            let destination = if self.all_as_multigroup || self.posters.contains(&raw.from) {
                TableSet::MultiGroup
            } else {
                TableSet::Standard
            };

            let header = ClassifiedHeader {
                raw,
                base_subject,
                part_number,
                total_parts,
                destination,
            };
            match destination {
                TableSet::MultiGroup => batch.multigroup.push(header),
                TableSet::Standard => batch.standard.push(header),
            }
        }

        batch
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64, subject: &str, from: &str) -> RawHeader {
        RawHeader {
            number,
            subject: subject.to_string(),
            from: from.to_string(),
            date: None,
            message_id: format!("<{number}@example.com>"),
            bytes: 500,
            xref: String::new(),
        }
    }

    fn classifier(rules: RuleSet, posters: &[&str]) -> HeaderClassifier {
        HeaderClassifier::new(
            "alt.binaries.test",
            Arc::new(rules),
            Arc::new(posters.iter().map(|p| p.to_string()).collect()),
            false,
        )
    }

    #[test]
    fn part_descriptor_is_stripped() {
        let (base, part, total) = parse_part_descriptor("Foo (1/2) yEnc").unwrap();
        assert_eq!(base, "Foo");
        assert_eq!((part, total), (1, 2));
    }

    #[test]
    fn yenc_is_inferred_when_missing() {
        let (base, _, _) = parse_part_descriptor("My.Release - \"a.rar\" (3/40)").unwrap();
        assert_eq!(base, "My.Release - \"a.rar\" yEnc");
    }

    #[test]
    fn trailing_metadata_and_last_descriptor_win() {
        let (base, part, total) =
            parse_part_descriptor("[01/10] - \"file.r00\" yEnc (12/99) 50.2 MB").unwrap();
        assert_eq!(base, "[01/10] - \"file.r00\" yEnc");
        assert_eq!((part, total), (12, 99));
    }

    #[test]
    fn index_posts_and_plain_subjects_are_not_binaries() {
        assert!(parse_part_descriptor("\"Usenet Index Post\" something (1/3)").is_none());
        assert!(parse_part_descriptor("just a discussion").is_none());
        assert!(parse_part_descriptor("(1/2)").is_none());
    }

    #[test]
    fn counts_non_yenc_and_blacklisted() {
        let rules = RuleSet::new(vec![
            FilterRule::new(4, "spam", RuleField::Subject.tag(), RuleKind::Blacklist.tag())
                .unwrap(),
        ]);
        let batch = classifier(rules, &[]).classify(vec![
            header(1, "Foo (1/2) yEnc", "a"),
            header(2, "no descriptor", "a"),
            header(3, "spam (1/1) yEnc", "a"),
        ]);

        assert_eq!(batch.standard.len(), 1);
        assert_eq!(batch.not_yenc, 1);
        assert_eq!(batch.blacklisted, 1);
        assert_eq!(batch.used_rules, BTreeSet::from([4]));
    }

    #[test]
    fn multigroup_posters_are_routed_separately_and_first() {
        let batch = classifier(RuleSet::default(), &["mgr@example.com"]).classify(vec![
            header(1, "Std (1/1) yEnc", "someone@example.com"),
            header(2, "Mgr (1/1) yEnc", "mgr@example.com"),
        ]);

        assert_eq!(batch.multigroup.len(), 1);
        assert_eq!(batch.multigroup[0].destination, TableSet::MultiGroup);
        assert_eq!(batch.standard.len(), 1);
        let order: Vec<u64> = batch.accepted().map(|h| h.raw.number).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn all_as_multigroup_routes_every_poster() {
        let classifier = HeaderClassifier::new(
            "alt.binaries.test",
            Arc::new(RuleSet::default()),
            Arc::new(HashSet::new()),
            true,
        );
        let batch = classifier.classify(vec![header(1, "A (1/1)", "x"), header(2, "B (1/1)", "y")]);
        assert_eq!(batch.multigroup.len(), 2);
        assert!(batch.standard.is_empty());
    }
}
