//! Mapping of `XOVER` and `HDR Xref` records into [`RawHeader`]s.

use super::RawHeader;
use chrono::{DateTime, Utc};
use nntp_rs::{HdrEntry, XoverEntry};
use std::collections::HashMap;

/// Convert one overview entry. Entries whose article number could not be
/// parsed arrive as number 0 and are dropped.
pub fn from_xover(entry: XoverEntry) -> Option<RawHeader> {
    if entry.article_number == 0 {
        return None;
    }
    Some(RawHeader {
        number: entry.article_number,
        date: parse_article_date(&entry.date),
        subject: entry.subject,
        from: entry.author,
        message_id: entry.message_id.trim().to_string(),
        bytes: entry.bytes as u64,
        xref: String::new(),
    })
}

/// Fill in `xref` from an `HDR Xref` listing over the same range.
///
/// Headers missing from the listing keep an empty xref.
pub fn attach_xrefs(headers: &mut [RawHeader], entries: Vec<HdrEntry>) {
    let mut by_number: HashMap<u64, String> = entries
        .into_iter()
        .map(|entry| (entry.article_number, xref_value(&entry.value)))
        .collect();
    for header in headers.iter_mut() {
        if let Some(xref) = by_number.remove(&header.number) {
            header.xref = xref;
        }
    }
}

/// Some servers repeat the header name in `HDR` output
fn xref_value(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.split_once(':') {
        Some((name, rest)) if name.eq_ignore_ascii_case("xref") => rest.trim().to_string(),
        _ => trimmed.to_string(),
    }
}

/// Parse an article Date header.
///
/// Accepts RFC 2822 dates with or without a weekday (`31 Mar 2014 15:36:04
/// GMT`, `Mon, 6 Oct 1998 04:38:40 -0500`), a trailing zone comment such as
/// `(UTC)`, and bare unix timestamps. Dates in the future are clamped to now.
pub fn parse_article_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        trimmed
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    } else {
        let without_comment = match trimmed.find(" (") {
            Some(idx) => &trimmed[..idx],
            None => trimmed,
        };
        DateTime::parse_from_rfc2822(without_comment)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }?;

    Some(parsed.min(Utc::now()))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(number: u64, date: &str) -> XoverEntry {
        XoverEntry {
            article_number: number,
            subject: "My.Release.S01E01 - \"file.part01.rar\" yEnc (1/50)".to_string(),
            author: "poster <p@example.com>".to_string(),
            date: date.to_string(),
            message_id: "<part1of50@example.com>".to_string(),
            references: String::new(),
            bytes: 768000,
            lines: 5900,
        }
    }

    #[test]
    fn maps_overview_entry_fields() {
        let header = from_xover(entry(3000, "Mon, 31 Mar 2014 15:36:04 GMT")).unwrap();

        assert_eq!(header.number, 3000);
        assert!(header.subject.ends_with("(1/50)"));
        assert_eq!(header.from, "poster <p@example.com>");
        assert_eq!(
            header.date.unwrap(),
            Utc.with_ymd_and_hms(2014, 3, 31, 15, 36, 4).unwrap()
        );
        assert_eq!(header.message_id, "<part1of50@example.com>");
        assert_eq!(header.bytes, 768000);
        assert!(header.xref.is_empty());
    }

    #[test]
    fn unparseable_article_number_is_dropped() {
        assert!(from_xover(entry(0, "")).is_none());
        assert!(from_xover(entry(42, "")).unwrap().date.is_none());
    }

    #[test]
    fn xrefs_are_matched_by_article_number() {
        let mut headers = vec![
            from_xover(entry(10, "")).unwrap(),
            from_xover(entry(11, "")).unwrap(),
            from_xover(entry(12, "")).unwrap(),
        ];
        attach_xrefs(
            &mut headers,
            vec![
                HdrEntry {
                    article_number: 12,
                    value: "news.example.com alt.binaries.test:12".to_string(),
                },
                HdrEntry {
                    article_number: 10,
                    value: "Xref: news.example.com alt.binaries.test:10 a.b.misc:7".to_string(),
                },
            ],
        );

        assert_eq!(headers[0].xref, "news.example.com alt.binaries.test:10 a.b.misc:7");
        assert!(headers[1].xref.is_empty());
        assert_eq!(headers[2].xref, "news.example.com alt.binaries.test:12");
    }

    #[test]
    fn date_without_weekday_and_numeric_offset() {
        let date = parse_article_date("6 Oct 1998 04:38:40 -0500").unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(1998, 10, 6, 9, 38, 40).unwrap());
    }

    #[test]
    fn date_with_zone_comment() {
        let date = parse_article_date("Tue, 1 Apr 2014 10:00:00 +0000 (UTC)").unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2014, 4, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn unix_timestamp_dates_are_accepted() {
        let date = parse_article_date("1396278964").unwrap();
        assert_eq!(date.timestamp(), 1396278964);
    }

    #[test]
    fn future_dates_are_clamped_to_now() {
        let date = parse_article_date("1 Jan 2999 00:00:00 GMT").unwrap();
        assert!(date <= Utc::now());
    }

    #[test]
    fn garbage_date_is_none() {
        assert!(parse_article_date("yesterday-ish").is_none());
    }
}
