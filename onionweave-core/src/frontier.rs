// Frontier: domain/URL bookkeeping and politeness-bounded re-injection

use crate::error::{PipelineError, Result};
use crate::mailbox::Message;
use crate::runtime::{Emitter, Stage};
use crate::storage::{Storage, current_timestamp};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const FRONTIER_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS domain (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    location TEXT NOT NULL UNIQUE,
    found INTEGER NOT NULL,
    accessible BOOLEAN,
    last_emit INTEGER,
    last_seen INTEGER
);

CREATE TABLE IF NOT EXISTS url (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain_id INTEGER NOT NULL,
    url TEXT NOT NULL UNIQUE,
    last_visited INTEGER,
    last_emit INTEGER,
    description TEXT,
    title TEXT,
    http_code INTEGER,
    partial BOOLEAN,
    rejected BOOLEAN,
    http_server TEXT,
    FOREIGN KEY(domain_id) REFERENCES domain(id)
);

-- Append only, duplicates expected
CREATE TABLE IF NOT EXISTS graph (
    src TEXT NOT NULL,
    dst TEXT NOT NULL,
    found INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_domain_last_emit ON domain(last_emit);
CREATE INDEX IF NOT EXISTS idx_url_domain ON url(domain_id);
CREATE INDEX IF NOT EXISTS idx_url_last_emit ON url(last_emit);
CREATE INDEX IF NOT EXISTS idx_graph_src ON graph(src);
";

/// Prefix of re-injected messages; sorts ahead of anything else in the
/// fetcher inbox.
pub const EMIT_PREFIX: &str = "0-";

#[derive(Debug, Clone)]
pub struct FrontierSettings {
    pub tick_interval: Duration,
    /// Minimum time between two emissions for the same domain.
    pub politeness: Duration,
    /// Top level labels whose links are followed, e.g. `onion`.
    pub allowed_tlds: Vec<String>,
}

impl Default for FrontierSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            politeness: Duration::from_secs(60),
            allowed_tlds: vec!["onion".to_string()],
        }
    }
}

/// The fields of a crawl result the frontier cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlReport {
    pub origin: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub rejected: Option<bool>,
    #[serde(default)]
    pub partial: Option<bool>,
    #[serde(default)]
    pub http_code: Option<i64>,
    #[serde(default)]
    pub header: Option<Value>,
}

impl CrawlReport {
    pub fn from_message(message: Message) -> Result<Self> {
        serde_json::from_value(Value::Object(message))
            .map_err(|e| PipelineError::InvalidRequest(format!("not a crawl result: {}", e)))
    }

    /// A response header came back and the transport did not fail.
    pub fn accessible(&self) -> bool {
        let failed = match &self.error {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        };
        self.header.is_some() && !failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub id: i64,
    pub location: String,
    pub found: i64,
    pub accessible: Option<bool>,
    pub last_emit: Option<i64>,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRecord {
    pub id: i64,
    pub domain_id: i64,
    pub url: String,
    pub last_visited: Option<i64>,
    pub last_emit: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub http_code: Option<i64>,
    pub partial: Option<bool>,
    pub rejected: Option<bool>,
    pub http_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledUrl {
    pub domain_id: i64,
    pub url_id: i64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontierCounts {
    pub domains: usize,
    pub accessible_domains: usize,
    pub urls: usize,
    pub visited_urls: usize,
    pub edges: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub links_followed: usize,
    pub links_skipped: usize,
}

/// `host[:port]` of a URL, the natural key of a domain.
pub fn location_of(url: &str) -> Option<String> {
    canonicalize(url).map(|(location, _)| location)
}

/// Location and normalized spelling of `url`, so that `http://a.onion` and
/// `http://A.onion/` are one row.
pub fn canonicalize(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let location = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    };
    Some((location, parsed.to_string()))
}

fn domain_from_row(row: &Row<'_>) -> rusqlite::Result<DomainRecord> {
    Ok(DomainRecord {
        id: row.get(0)?,
        location: row.get(1)?,
        found: row.get(2)?,
        accessible: row.get(3)?,
        last_emit: row.get(4)?,
        last_seen: row.get(5)?,
    })
}

fn url_from_row(row: &Row<'_>) -> rusqlite::Result<UrlRecord> {
    Ok(UrlRecord {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        url: row.get(2)?,
        last_visited: row.get(3)?,
        last_emit: row.get(4)?,
        title: row.get(5)?,
        description: row.get(6)?,
        http_code: row.get(7)?,
        partial: row.get(8)?,
        rejected: row.get(9)?,
        http_server: row.get(10)?,
    })
}

fn upsert_domain(
    tx: &Transaction<'_>,
    location: &str,
    accessible: Option<bool>,
    now: i64,
) -> rusqlite::Result<i64> {
    tx.query_row(
        "INSERT INTO domain (location, found, last_seen, accessible) VALUES (?1, ?2, ?2, ?3)
         ON CONFLICT(location) DO UPDATE SET
             last_seen = excluded.last_seen,
             accessible = COALESCE(excluded.accessible, domain.accessible)
         RETURNING id",
        params![location, now, accessible],
        |row| row.get(0),
    )
}

fn insert_link(tx: &Transaction<'_>, domain_id: i64, url: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO url (domain_id, url) VALUES (?1, ?2) ON CONFLICT(url) DO NOTHING",
        params![domain_id, url],
    )?;
    Ok(())
}

fn upsert_visited(
    tx: &Transaction<'_>,
    domain_id: i64,
    origin: &str,
    report: &CrawlReport,
    now: i64,
) -> rusqlite::Result<()> {
    // No history is kept: a revisit overwrites the previous observation.
    // A visited URL counts as emitted so seeds are not fetched twice.
    tx.execute(
        "INSERT INTO url (
             domain_id, url, last_visited, last_emit, title, description,
             http_code, http_server, rejected, partial
         ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(url) DO UPDATE SET
             domain_id = excluded.domain_id,
             last_visited = excluded.last_visited,
             last_emit = COALESCE(url.last_emit, excluded.last_emit),
             title = COALESCE(excluded.title, url.title),
             description = COALESCE(excluded.description, url.description),
             http_code = excluded.http_code,
             http_server = excluded.http_server,
             rejected = excluded.rejected,
             partial = excluded.partial",
        params![
            domain_id,
            origin,
            now,
            &report.title,
            &report.description,
            report.http_code,
            &report.server,
            report.rejected,
            report.partial,
        ],
    )?;
    Ok(())
}

pub struct Frontier {
    storage: Storage,
    settings: FrontierSettings,
}

impl Frontier {
    pub fn new(mut storage: Storage, settings: FrontierSettings) -> Result<Self> {
        storage.ensure_schema("domain", FRONTIER_SCHEMA)?;
        Ok(Self { storage, settings })
    }

    pub fn settings(&self) -> &FrontierSettings {
        &self.settings
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Whether links to `location` are followed.
    pub fn is_allowed(&self, location: &str) -> bool {
        let host = location.split(':').next().unwrap_or(location);
        host.rsplit('.')
            .next()
            .map(|tld| {
                self.settings
                    .allowed_tlds
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(tld))
            })
            .unwrap_or(false)
    }

    /// Records one crawl result: the origin as visited, every allowed link as
    /// discovered, and an edge from the origin's host to each link's host.
    pub fn ingest(&mut self, report: &CrawlReport, now: i64) -> Result<IngestSummary> {
        let (origin_location, origin) = canonicalize(&report.origin).ok_or_else(|| {
            PipelineError::InvalidRequest(format!("origin has no host: {}", report.origin))
        })?;

        let links: Vec<(String, String)> = report
            .urls
            .iter()
            .filter_map(|url| match canonicalize(url) {
                Some((location, url)) if self.is_allowed(&location) => Some((location, url)),
                Some(_) => None,
                None => {
                    debug!("Skipping unparsable link {}", url);
                    None
                }
            })
            .collect();

        let summary = IngestSummary {
            links_followed: links.len(),
            links_skipped: report.urls.len() - links.len(),
        };
        let accessible = report.accessible();

        self.storage.with_cursor(|tx| {
            let origin_id = upsert_domain(tx, &origin_location, Some(accessible), now)?;
            upsert_visited(tx, origin_id, &origin, report, now)?;

            for (location, url) in &links {
                let domain_id = upsert_domain(tx, location, None, now)?;
                insert_link(tx, domain_id, url)?;
                tx.execute(
                    "INSERT INTO graph (src, dst, found) VALUES (?1, ?2, ?3)",
                    params![&origin_location, location, now],
                )?;
            }
            Ok(())
        })?;

        Ok(summary)
    }

    /// Picks at most `limit` domains (all eligible ones when `None`) that are
    /// outside their politeness window, not known to be inaccessible and
    /// still have an unemitted URL, one URL each, and stamps both as emitted
    /// in the same transaction.
    pub fn schedule(&mut self, now: i64, limit: Option<usize>) -> Result<Vec<ScheduledUrl>> {
        let threshold = now - self.settings.politeness.as_secs() as i64;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        self.storage.with_cursor(|tx| {
            // Bare url columns come from the row holding MIN(url.id)
            let mut stmt = tx.prepare(
                "SELECT domain.id, url.id, url.url, MIN(url.id)
                 FROM domain
                 JOIN url ON url.domain_id = domain.id
                 WHERE (domain.last_emit IS NULL OR domain.last_emit < ?1)
                   AND (domain.accessible IS NULL OR domain.accessible = 1)
                   AND url.last_emit IS NULL
                 GROUP BY domain.id
                 ORDER BY domain.last_emit IS NOT NULL, domain.last_emit, domain.id
                 LIMIT ?2",
            )?;
            let selected = stmt
                .query_map(params![threshold, limit], |row| {
                    Ok(ScheduledUrl {
                        domain_id: row.get(0)?,
                        url_id: row.get(1)?,
                        url: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for scheduled in &selected {
                tx.execute(
                    "UPDATE url SET last_emit = ?1 WHERE id = ?2",
                    params![now, scheduled.url_id],
                )?;
                tx.execute(
                    "UPDATE domain SET last_emit = ?1 WHERE id = ?2",
                    params![now, scheduled.domain_id],
                )?;
            }

            Ok(selected)
        })
    }

    pub fn domain(&mut self, location: &str) -> Result<Option<DomainRecord>> {
        self.storage.with_cursor(|tx| {
            Ok(tx
                .query_row(
                    "SELECT id, location, found, accessible, last_emit, last_seen
                     FROM domain WHERE location = ?1",
                    params![location],
                    domain_from_row,
                )
                .optional()?)
        })
    }

    pub fn url(&mut self, url: &str) -> Result<Option<UrlRecord>> {
        self.storage.with_cursor(|tx| {
            Ok(tx
                .query_row(
                    "SELECT id, domain_id, url, last_visited, last_emit, title, description,
                            http_code, partial, rejected, http_server
                     FROM url WHERE url = ?1",
                    params![url],
                    url_from_row,
                )
                .optional()?)
        })
    }

    pub fn edges(&mut self) -> Result<Vec<(String, String)>> {
        self.storage.with_cursor(|tx| {
            let mut stmt = tx.prepare("SELECT src, dst FROM graph ORDER BY rowid")?;
            let edges = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(edges)
        })
    }

    pub fn counts(&mut self) -> Result<FrontierCounts> {
        self.storage.with_cursor(|tx| {
            let count = |sql: &str| -> rusqlite::Result<usize> {
                tx.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as usize)
            };

            Ok(FrontierCounts {
                domains: count("SELECT COUNT(*) FROM domain")?,
                accessible_domains: count("SELECT COUNT(*) FROM domain WHERE accessible = 1")?,
                urls: count("SELECT COUNT(*) FROM url")?,
                visited_urls: count("SELECT COUNT(*) FROM url WHERE last_visited IS NOT NULL")?,
                edges: count("SELECT COUNT(*) FROM graph")?,
            })
        })
    }
}

impl Stage for Frontier {
    fn name(&self) -> &str {
        "Frontier"
    }

    fn on_message(&mut self, message: Message) -> anyhow::Result<Option<Message>> {
        let report = CrawlReport::from_message(message)?;
        let summary = self.ingest(&report, current_timestamp())?;
        debug!(
            "Ingested {}: {} links followed, {} skipped",
            report.origin, summary.links_followed, summary.links_skipped
        );
        Ok(None)
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.settings.tick_interval)
    }

    fn on_tick(&mut self, emitter: &mut Emitter<'_>) -> anyhow::Result<()> {
        let limit = match emitter.space()? {
            Some(0) => {
                debug!("Fetcher inbox full, nothing scheduled");
                return Ok(());
            }
            space => space,
        };

        let scheduled = self.schedule(current_timestamp(), limit)?;
        for entry in &scheduled {
            let mut message = Message::new();
            message.insert("url".to_string(), json!(entry.url));
            if let Err(e) = emitter.emit(&message, EMIT_PREFIX) {
                warn!("Could not emit {}: {}", entry.url, e);
            }
        }

        if !scheduled.is_empty() {
            info!("Scheduled {} domains", scheduled.len());
        }
        Ok(())
    }

    fn ignores_backpressure(&self) -> bool {
        true
    }
}
