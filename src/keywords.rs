//! Keyword frequencies over the domains of one snapshot.
//!
//! A domain's keywords are the alphanumeric and hyphen runs of its first label,
//! so `shop-online.example.com` contributes `shop-online`.

use crate::models::RankEntry;
use crate::parser::parse_snapshot;
use crate::table_writer::TableWriter;
use std::collections::HashMap;
use std::path::Path;

pub const KEYWORD_HEADER: [&str; 2] = ["keyword", "count"];

/// Outcome of [`run_keywords`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordSummary {
    pub domains: usize,
    pub skipped_rows: usize,
    pub distinct: usize,
    /// Most frequent keywords first.
    pub top: Vec<(String, usize)>,
}

fn keywords_of(domain: &str) -> impl Iterator<Item = &str> {
    let label = domain.split('.').next().unwrap_or_default();
    label
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .filter(|word| !word.is_empty())
}

/// Count keywords across `entries`, most frequent first, ties by keyword.
pub fn keyword_counts(entries: &[RankEntry]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for entry in entries {
        for word in keywords_of(&entry.domain) {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut sorted: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(word, count)| (word.to_string(), count))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted
}

pub fn write_keyword_counts(path: &Path, counts: &[(String, usize)]) -> std::io::Result<usize> {
    let mut writer = TableWriter::with_header(path, &KEYWORD_HEADER)?;
    for (word, count) in counts {
        let count = count.to_string();
        writer.write_fields(&[word.as_str(), count.as_str()])?;
    }
    writer.finish()
}

/// Parse the snapshot file at `input` and write its keyword counts to `output`.
#[tracing::instrument(skip_all, fields(input = %input.display()))]
pub fn run_keywords(input: &Path, output: &Path, top: usize) -> std::io::Result<KeywordSummary> {
    let raw = std::fs::read(input)?;
    let parsed = parse_snapshot(&raw);
    let counts = keyword_counts(&parsed.entries);
    write_keyword_counts(output, &counts)?;

    tracing::info!(
        domains = parsed.entries.len(),
        distinct = counts.len(),
        "keyword counts written to {}",
        output.display()
    );
    Ok(KeywordSummary {
        domains: parsed.entries.len(),
        skipped_rows: parsed.issues.len(),
        distinct: counts.len(),
        top: counts.into_iter().take(top).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_label_only() {
        let words: Vec<&str> = keywords_of("shop-online.example.com").collect();
        assert_eq!(words, vec!["shop-online"]);
        assert_eq!(keywords_of("").count(), 0);
    }

    #[test]
    fn test_counts_sorted_by_frequency_then_keyword() {
        let entries = vec![
            RankEntry::new(1, "news.com"),
            RankEntry::new(2, "news.org"),
            RankEntry::new(3, "blog.net"),
            RankEntry::new(4, "app.io"),
            RankEntry::new(5, "blog.dev"),
            RankEntry::new(6, "news.co.uk"),
        ];
        assert_eq!(
            keyword_counts(&entries),
            vec![
                ("news".to_string(), 3),
                ("blog".to_string(), 2),
                ("app".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_run_keywords_writes_table() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("top-1m.csv");
        std::fs::write(&input, "rank,domain\n1,mail.com\n2,mail.net\nbad,row\n3,maps.org\n").unwrap();
        let output = dir.path().join("out").join("keyword_counts.csv");

        let summary = run_keywords(&input, &output, 1).unwrap();

        assert_eq!(summary.domains, 3);
        assert_eq!(summary.skipped_rows, 1);
        assert_eq!(summary.distinct, 2);
        assert_eq!(summary.top, vec![("mail".to_string(), 2)]);
        let content = std::fs::read_to_string(&output).unwrap();
        assert_eq!(content, "keyword,count\nmail,2\nmaps,1\n");
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(run_keywords(&dir.path().join("nope.csv"), &dir.path().join("out.csv"), 5).is_err());
    }
}
