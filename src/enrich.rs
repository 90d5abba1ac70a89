//! Registration-date lookups for newly seen domains over RDAP.
//!
//! Every domain in a day's feed is looked up with bounded concurrency. A
//! failed lookup is recorded in its result row and never holds up the rest.

use crate::backoff::{RetryPolicy, Retryable};
use crate::config::EnrichConfig;
use crate::feed::NewDomainFeed;
use crate::network::{FetchError, HttpClient};
use crate::table_writer::TableWriter;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("lookup failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("lookup timed out after {0}s")]
    Timeout(u64),

    #[error("no registration event")]
    NoRegistrationDate,

    #[error("unparseable registration date '{0}'")]
    BadDate(String),

    #[error("lookup pool closed")]
    PoolClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Retryable for EnrichError {
    fn is_retryable(&self) -> bool {
        match self {
            EnrichError::Fetch(e) => e.is_retryable(),
            EnrichError::Timeout(_) => true,
            _ => false,
        }
    }
}

#[async_trait]
pub trait RegistrationLookup: Send + Sync {
    async fn registration_date(&self, domain: &str) -> Result<NaiveDate, EnrichError>;
}

#[derive(Debug, Deserialize)]
struct RdapDomain {
    #[serde(default)]
    events: Vec<RdapEvent>,
}

#[derive(Debug, Deserialize)]
struct RdapEvent {
    #[serde(rename = "eventAction")]
    action: String,
    #[serde(rename = "eventDate")]
    date: String,
}

/// Looks domains up through an RDAP bootstrap service such as rdap.org.
pub struct RdapLookup {
    http: HttpClient,
    base: url::Url,
}

impl RdapLookup {
    pub fn new(http: HttpClient, base_url: &str) -> Result<Self, FetchError> {
        let mut base = url::Url::parse(base_url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { http, base })
    }

    fn domain_url(&self, domain: &str) -> Result<url::Url, FetchError> {
        self.base
            .join(&format!("domain/{}", domain))
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl RegistrationLookup for RdapLookup {
    async fn registration_date(&self, domain: &str) -> Result<NaiveDate, EnrichError> {
        let url = self.domain_url(domain)?;
        let body: RdapDomain = self.http.fetch_json(url.as_str()).await?;
        registration_event(&body)
    }
}

fn registration_event(body: &RdapDomain) -> Result<NaiveDate, EnrichError> {
    let event = body
        .events
        .iter()
        .find(|event| event.action.eq_ignore_ascii_case("registration"))
        .ok_or(EnrichError::NoRegistrationDate)?;
    parse_event_date(&event.date)
}

fn parse_event_date(raw: &str) -> Result<NaiveDate, EnrichError> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.date_naive());
    }
    raw.get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
        .ok_or_else(|| EnrichError::BadDate(raw.to_string()))
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BornDate {
    pub domain: String,
    pub registered: Option<NaiveDate>,
    pub error: Option<String>,
}

impl BornDate {
    fn fields(&self) -> [String; 3] {
        [
            self.domain.clone(),
            self.registered
                .map(|date| date.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            self.error
                .as_ref()
                .map(|e| format!("error: {}", e.replace(',', ";")))
                .unwrap_or_default(),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichSummary {
    pub looked_up: usize,
    pub resolved: usize,
    pub failed: usize,
}

/// One domain's lookup, run once a permit is free.
async fn lookup_one(
    permits: Arc<Semaphore>,
    lookup: Arc<dyn RegistrationLookup>,
    retry: Arc<RetryPolicy>,
    timeout_secs: u64,
    domain: String,
) -> BornDate {
    let result = match permits.acquire_owned().await {
        Ok(_permit) => {
            retry
                .run(&domain, || {
                    let lookup = Arc::clone(&lookup);
                    let domain = domain.clone();
                    async move {
                        match tokio::time::timeout(
                            Duration::from_secs(timeout_secs),
                            lookup.registration_date(&domain),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(EnrichError::Timeout(timeout_secs)),
                        }
                    }
                })
                .await
        }
        Err(_) => Err(EnrichError::PoolClosed),
    };

    match result {
        Ok(date) => BornDate {
            domain,
            registered: Some(date),
            error: None,
        },
        Err(e) => {
            tracing::debug!("registration lookup for {} failed: {}", domain, e);
            BornDate {
                domain,
                registered: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Look up every domain, at most `config.concurrency` at a time. Rows come
/// back sorted by domain.
pub async fn enrich_domains(
    lookup: Arc<dyn RegistrationLookup>,
    domains: Vec<String>,
    config: &EnrichConfig,
) -> Vec<BornDate> {
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let retry = Arc::new(RetryPolicy::fixed(
        config.attempts,
        Duration::from_millis(config.retry_delay_ms),
    ));
    let timeout_secs = config.timeout_secs;

    let mut in_flight = JoinSet::new();
    for domain in domains {
        let permits = Arc::clone(&permits);
        let lookup = Arc::clone(&lookup);
        let retry = Arc::clone(&retry);
        in_flight.spawn(lookup_one(permits, lookup, retry, timeout_secs, domain));
    }

    let mut rows = Vec::with_capacity(in_flight.len());
    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok(row) => rows.push(row),
            Err(e) => tracing::warn!("lookup task join error: {}", e),
        }
    }
    rows.sort_by(|a, b| a.domain.cmp(&b.domain));
    rows
}

/// Enrich the feed for `date` and write `borndate_results/YYYY-MM-DD.csv`.
#[tracing::instrument(skip(lookup, config))]
pub async fn enrich_feed_date(
    lookup: Arc<dyn RegistrationLookup>,
    config: &EnrichConfig,
    date: NaiveDate,
) -> Result<EnrichSummary, EnrichError> {
    let domains = NewDomainFeed::new(config.feed_dir()).read(date)?;
    tracing::info!("looking up {} new domains for {}", domains.len(), date);

    let rows = enrich_domains(lookup, domains, config).await;
    let summary = EnrichSummary {
        looked_up: rows.len(),
        resolved: rows.iter().filter(|row| row.registered.is_some()).count(),
        failed: rows.iter().filter(|row| row.error.is_some()).count(),
    };

    let path = config.results_path(date);
    let mut writer = TableWriter::with_header(&path, &["domain", "registered", "error"])?;
    for row in &rows {
        writer.write_fields(&row.fields())?;
    }
    writer.finish()?;

    tracing::info!(
        resolved = summary.resolved,
        failed = summary.failed,
        "wrote {}",
        path.display()
    );
    Ok(summary)
}
