use chrono::Utc;
use indicatif::ProgressBar;
use onionweave::handlers::*;
use onionweave_core::config::{EXTRACTOR, FETCHER, POOLS, PipelineConfig};
use onionweave_core::{CrawlReport, Frontier, FrontierSettings, Mailbox, Message, Storage};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use tempfile::{NamedTempFile, TempDir};

fn create_test_config(dir: &TempDir) -> PipelineConfig {
    PipelineConfig {
        data_dir: dir.path().to_string_lossy().into_owned(),
        ..Default::default()
    }
}

// ============================================================================
// Seed Source Tests
// ============================================================================

#[test]
fn test_seed_url_keeps_or_adds_scheme() {
    assert_eq!(seed_url("https://abc.onion/a"), Some("https://abc.onion/a".to_string()));
    assert_eq!(seed_url("  abc.onion "), Some("http://abc.onion".to_string()));
    // Parses as scheme "abc.onion" with no host until http:// is added
    assert_eq!(seed_url("abc.onion:8080/x"), Some("http://abc.onion:8080/x".to_string()));
    assert_eq!(seed_url("not a valid url!!!"), None);
}

#[test]
fn test_hosts_file_skips_blanks_comments_and_junk() {
    let mut hosts = NamedTempFile::new().unwrap();
    writeln!(hosts, "# mirrors").unwrap();
    writeln!(hosts, "def.onion").unwrap();
    writeln!(hosts).unwrap();
    writeln!(hosts, "not a valid url!!!").unwrap();
    writeln!(hosts, "  https://ghi.onion/index.html  ").unwrap();

    let source = SeedSource::HostsFile(hosts.path().to_path_buf());
    assert_eq!(
        source.urls().unwrap(),
        vec!["http://def.onion".to_string(), "https://ghi.onion/index.html".to_string()]
    );
}

#[test]
fn test_seed_sources_without_urls_fail() {
    let mut hosts = NamedTempFile::new().unwrap();
    writeln!(hosts, "   ").unwrap();
    writeln!(hosts, "# nothing yet").unwrap();
    let error = SeedSource::HostsFile(hosts.path().to_path_buf()).urls().unwrap_err();
    assert!(error.to_string().contains("no URLs"));

    let missing = SeedSource::HostsFile(PathBuf::from("/nonexistent/hosts.txt"));
    assert!(missing.urls().unwrap_err().to_string().contains("cannot read"));

    let junk = SeedSource::Url("not a valid url!!!".to_string());
    assert!(junk.urls().is_err());
}

#[test]
fn test_seed_single_url_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);

    let urls = SeedSource::Url("abc.onion".to_string()).urls().unwrap();
    let seeded = seed_urls(&config, &urls, &ProgressBar::hidden()).unwrap();
    assert_eq!(seeded, 1);

    let inbox = config.inbox(FETCHER).unwrap();
    let claim = inbox.claim().unwrap().unwrap();
    assert_eq!(inbox.read(&claim).unwrap()["url"], json!("http://abc.onion"));
}

// ============================================================================
// Metrics Query Tests
// ============================================================================

#[test]
fn test_query_window_spans_minutes() {
    let to = Utc::now();
    let (from, end) = query_window(60, to).unwrap();
    assert_eq!(end, to);
    assert_eq!(to - from, chrono::Duration::minutes(60));
}

#[test]
fn test_query_window_rejects_huge_spans() {
    let error = query_window(i64::MAX, Utc::now()).unwrap_err();
    assert!(error.to_string().contains("out of range"));

    // Representable as a duration, but not as a date
    assert!(query_window(1_000_000_000_000, Utc::now()).is_err());
}

// ============================================================================
// Workspace Tests
// ============================================================================

#[test]
fn test_prepare_workspace_creates_everything() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);

    prepare_workspace(&config).unwrap();

    for pool in POOLS {
        assert!(config.mailbox_dir(pool).is_dir(), "missing inbox for {}", pool);
    }
    assert!(Storage::exists(&config.database_path()));

    // Running it again over an existing workspace is fine
    prepare_workspace(&config).unwrap();
}

#[test]
fn test_seed_urls_are_prioritized() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    let inbox = config.inbox(FETCHER).unwrap();
    inbox.ensure().unwrap();

    let mut message = Message::new();
    message.insert("url".to_string(), json!("http://late.onion/"));
    inbox.deliver(&message, "5-Frontier_1_1_1").unwrap();

    let urls = vec!["http://abc.onion/".to_string(), "http://def.onion/".to_string()];
    let seeded = seed_urls(&config, &urls, &ProgressBar::hidden()).unwrap();
    assert_eq!(seeded, 2);
    assert_eq!(inbox.len().unwrap(), 3);

    let claim = inbox.claim().unwrap().unwrap();
    assert!(claim.name().starts_with("0-Seed_"));
    let first = inbox.read(&claim).unwrap();
    assert!(first["url"].as_str().unwrap().ends_with(".onion/"));
    assert_ne!(first["url"], json!("http://late.onion/"));
}

#[test]
fn test_reclaim_all_returns_claims() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    prepare_workspace(&config).unwrap();

    let inbox = config.inbox(EXTRACTOR).unwrap();
    let mut message = Message::new();
    message.insert("origin".to_string(), json!("http://abc.onion/"));
    inbox.deliver(&message, "Fetcher_1_1_1").unwrap();
    let _abandoned = inbox.claim().unwrap().unwrap();
    assert!(inbox.is_empty().unwrap());

    let reclaimed = reclaim_all(&config).unwrap();
    assert!(reclaimed.contains(&(EXTRACTOR, 1)));
    assert!(reclaimed.contains(&(FETCHER, 0)));
    assert_eq!(inbox.len().unwrap(), 1);
}

// ============================================================================
// Status and Graph Tests
// ============================================================================

#[test]
fn test_status_before_any_crawl() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);

    let report = collect_status(&config).unwrap();
    assert_eq!(report.mailboxes.len(), POOLS.len());
    assert!(report.mailboxes.iter().all(|(_, census)| census.pending == 0));
    assert!(report.counts.is_none());
}

#[test]
fn test_status_counts_crawl() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    prepare_workspace(&config).unwrap();

    let storage = Storage::new(&config.database_path());
    let mut frontier = Frontier::new(storage, FrontierSettings::default()).unwrap();
    let report = CrawlReport {
        origin: "http://abc.onion/".to_string(),
        urls: vec!["http://def.onion/".to_string()],
        header: Some(json!({"server": "nginx"})),
        ..Default::default()
    };
    frontier.ingest(&report, 1_000).unwrap();
    drop(frontier);

    seed_urls(&config, &["http://ghi.onion/".to_string()], &ProgressBar::hidden()).unwrap();

    let status = collect_status(&config).unwrap();
    let counts = status.counts.unwrap();
    assert_eq!(counts.domains, 2);
    assert_eq!(counts.accessible_domains, 1);
    assert_eq!(counts.urls, 2);
    assert_eq!(counts.visited_urls, 1);
    assert_eq!(counts.edges, 1);

    let (_, fetcher) = status
        .mailboxes
        .iter()
        .find(|(pool, _)| *pool == FETCHER)
        .unwrap();
    assert_eq!(fetcher.pending, 1);
}

#[test]
fn test_export_graph_requires_database() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    assert!(export_graph(&config, false).is_err());

    prepare_workspace(&config).unwrap();
    let graph = export_graph(&config, false).unwrap();
    assert_eq!(graph.edge_count(), 0);
}
