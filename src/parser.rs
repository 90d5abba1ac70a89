use crate::config::Config;
use crate::models::{Rank, RankEntry};
use std::collections::HashMap;
use thiserror::Error;

/// Row-level problem found while parsing a snapshot. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseIssue {
    #[error("line {line}: rank '{value}' is not a positive integer")]
    InvalidRank { line: usize, value: String },

    #[error("line {line}: missing domain")]
    MissingDomain { line: usize },

    #[error("line {line}: domain '{value}' is not a valid host name")]
    InvalidDomain { line: usize, value: String },

    #[error("line {line}: '{domain}' already ranked {first_rank} earlier in the snapshot")]
    DuplicateDomain {
        line: usize,
        domain: String,
        first_rank: Rank,
    },

    #[error("line {line}: not valid UTF-8")]
    InvalidUtf8 { line: usize },
}

/// Output of [`parse_snapshot`]: surviving entries in input order plus every skipped row.
#[derive(Debug, Clone, Default)]
pub struct ParsedSnapshot {
    pub entries: Vec<RankEntry>,
    pub issues: Vec<ParseIssue>,
    pub header_skipped: bool,
}

impl ParsedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a two-column `rank,domain` table.
///
/// A leading row whose first field is not numeric is treated as a header.
/// Bad rows are skipped and reported in `issues`; duplicate domains keep the
/// rank of their first occurrence.
pub fn parse_snapshot(raw: &[u8]) -> ParsedSnapshot {
    let mut parsed = ParsedSnapshot::default();
    let mut seen: HashMap<String, Rank> = HashMap::new();
    let mut first_row = true;

    for (index, raw_line) in raw.split(|b| *b == b'\n').enumerate() {
        let line_no = index + 1;
        let line = match std::str::from_utf8(raw_line) {
            Ok(line) => line.trim_end_matches('\r'),
            Err(_) => {
                first_row = false;
                parsed.issues.push(ParseIssue::InvalidUtf8 { line: line_no });
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.splitn(3, ',');
        let rank_field = fields.next().unwrap_or_default().trim();
        let domain_field = fields.next().map(str::trim).unwrap_or_default();

        if first_row {
            first_row = false;
            if rank_field.parse::<i64>().is_err() {
                parsed.header_skipped = true;
                continue;
            }
        }

        let rank = match rank_field.parse::<Rank>() {
            Ok(rank) if rank > 0 => rank,
            _ => {
                parsed.issues.push(ParseIssue::InvalidRank {
                    line: line_no,
                    value: rank_field.to_string(),
                });
                continue;
            }
        };

        if domain_field.is_empty() {
            parsed.issues.push(ParseIssue::MissingDomain { line: line_no });
            continue;
        }
        let Some(domain) = normalize_domain(domain_field) else {
            parsed.issues.push(ParseIssue::InvalidDomain {
                line: line_no,
                value: domain_field.to_string(),
            });
            continue;
        };

        if let Some(first_rank) = seen.get(&domain) {
            parsed.issues.push(ParseIssue::DuplicateDomain {
                line: line_no,
                domain,
                first_rank: *first_rank,
            });
            continue;
        }
        seen.insert(domain.clone(), rank);
        parsed.entries.push(RankEntry { rank, domain });
    }

    report_issues(&parsed);
    parsed
}

/// Lower-case, trim and drop a trailing root dot. Rejects names with
/// whitespace or quoting that would corrupt the delimited outputs.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty()
        || domain
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == ',')
    {
        return None;
    }
    Some(domain)
}

fn report_issues(parsed: &ParsedSnapshot) {
    if parsed.entries.is_empty() {
        tracing::warn!(
            skipped_rows = parsed.issues.len(),
            "snapshot contained no valid rows"
        );
    }
    for issue in parsed.issues.iter().take(Config::MAX_LOGGED_PARSE_ISSUES) {
        tracing::warn!("skipping row: {}", issue);
    }
    if parsed.issues.len() > Config::MAX_LOGGED_PARSE_ISSUES {
        tracing::warn!(
            "{} more malformed rows skipped",
            parsed.issues.len() - Config::MAX_LOGGED_PARSE_ISSUES
        );
    }
}
