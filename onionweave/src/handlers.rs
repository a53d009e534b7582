use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use onionweave_core::config::{FETCHER, POOLS};
use onionweave_core::frontier::FrontierCounts;
use onionweave_core::mailbox::Census;
use onionweave_core::runtime::install_termination_handler;
use onionweave_core::{
    CommandFactory, Frontier, FrontierSettings, GraphFormat, Mailbox, Message, MetricStore,
    NameGenerator, PipelineConfig, SiteGraph, Storage, Supervisor, graph::save_graph,
    logging::init_logging,
};
use onionweave_stages::analyzer::Analyzer;
use onionweave_stages::build_worker;
use serde_json::json;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{info, warn};
use url::Url;

/// Prefix that puts operator seeds ahead of everything in the fetcher inbox.
pub const SEED_PREFIX: &str = "0-";

/// Where the URLs of a `seed` command come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedSource {
    Url(String),
    HostsFile(PathBuf),
}

impl SeedSource {
    pub fn from_args(args: &ArgMatches) -> Result<Self> {
        if let Some(path) = args.get_one::<PathBuf>("hosts-file") {
            return Ok(Self::HostsFile(path.clone()));
        }
        match args.get_one::<String>("url") {
            Some(url) => Ok(Self::Url(url.clone())),
            None => bail!("nothing to seed: pass --url or --hosts-file"),
        }
    }

    /// Fetchable URLs in source order. Blank lines and `#` comments in a
    /// hosts file are ignored; other lines that are not URLs are reported and
    /// skipped.
    pub fn urls(&self) -> Result<Vec<String>> {
        let urls = match self {
            Self::Url(line) => match seed_url(line) {
                Some(url) => vec![url],
                None => bail!("'{}' is not a URL", line.trim()),
            },
            Self::HostsFile(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("cannot read hosts file {}", path.display()))?;
                let mut urls = Vec::new();
                for line in content.lines().map(str::trim) {
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    match seed_url(line) {
                        Some(url) => urls.push(url),
                        None => eprintln!("{} Skipping '{}': not a URL", "⚠".yellow(), line),
                    }
                }
                urls
            }
        };

        if urls.is_empty() {
            bail!("no URLs to seed");
        }
        Ok(urls)
    }
}

/// A seed line as a URL with a host; `http://` is assumed when the line
/// has no scheme of its own.
pub fn seed_url(line: &str) -> Option<String> {
    let line = line.trim();
    [line.to_string(), format!("http://{}", line)]
        .into_iter()
        .find(|candidate| Url::parse(candidate).is_ok_and(|url| url.has_host()))
}

/// The `-c` argument, or the default location.
pub fn config_path(args: &ArgMatches) -> PathBuf {
    args.get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(PipelineConfig::default_path)
}

pub fn load_config(args: &ArgMatches) -> Result<(PathBuf, PipelineConfig)> {
    let path = config_path(args);
    let config = PipelineConfig::load(&path).with_context(|| {
        format!(
            "no usable configuration at {} (run `onionweave init` first)",
            path.display()
        )
    })?;
    Ok((path, config))
}

fn start_logging(config: &PipelineConfig) -> Result<()> {
    let log_path = config.log_path.as_deref().map(|p| config.resolve(p));
    init_logging(&config.log_level, log_path.as_deref())?;
    Ok(())
}

/// Creates the data directory, every mailbox and every table.
pub fn prepare_workspace(config: &PipelineConfig) -> Result<()> {
    fs::create_dir_all(config.data_dir())?;
    for (_, inbox) in config.inboxes()? {
        inbox.ensure()?;
    }

    let storage = || Storage::new(&config.database_path()).with_busy_timeout(config.busy_timeout());
    Frontier::new(storage(), FrontierSettings::default())?;
    Analyzer::new(storage(), config.analyzer.tf_limit)?;
    if let Some(path) = config.metrics_path() {
        MetricStore::new(Storage::new(&path))?;
    }
    Ok(())
}

/// Returns every claimed message to its inbox. Only safe while no worker
/// is running.
pub fn reclaim_all(config: &PipelineConfig) -> Result<Vec<(&'static str, usize)>> {
    let mut reclaimed = Vec::new();
    for (pool, inbox) in config.inboxes()? {
        reclaimed.push((pool, inbox.reclaim()?));
    }
    Ok(reclaimed)
}

/// Writes one high priority fetch request per URL.
pub fn seed_urls(config: &PipelineConfig, urls: &[String], progress: &ProgressBar) -> Result<usize> {
    let inbox = config.inbox(FETCHER)?;
    inbox.ensure()?;

    let mut names = NameGenerator::new("Seed", process::id());
    for url in urls {
        let mut message = Message::new();
        message.insert("url".to_string(), json!(url));
        inbox.deliver(&message, &names.next(SEED_PREFIX))?;
        progress.inc(1);
    }
    Ok(urls.len())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub mailboxes: Vec<(&'static str, Census)>,
    pub counts: Option<FrontierCounts>,
}

pub fn collect_status(config: &PipelineConfig) -> Result<StatusReport> {
    let mut mailboxes = Vec::new();
    for (pool, inbox) in config.inboxes()? {
        mailboxes.push((pool, inbox.census()?));
    }

    let database = config.database_path();
    let counts = if Storage::exists(&database) {
        let storage = Storage::new(&database).with_busy_timeout(config.busy_timeout());
        Some(Frontier::new(storage, FrontierSettings::default())?.counts()?)
    } else {
        None
    };

    Ok(StatusReport { mailboxes, counts })
}

pub fn export_graph(config: &PipelineConfig, accessible_only: bool) -> Result<SiteGraph> {
    let database = config.database_path();
    if !Storage::exists(&database) {
        bail!("no crawl database at {}", database.display());
    }
    let mut storage = Storage::new(&database).with_busy_timeout(config.busy_timeout());
    let graph = SiteGraph::load(&mut storage, accessible_only)?;
    info!(
        "Loaded site graph: {} nodes, {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    Ok(graph)
}

fn open_metrics(config: &PipelineConfig) -> Result<MetricStore> {
    let Some(path) = config.metrics_path() else {
        bail!("metrics are disabled: set metrics.database in the configuration");
    };
    Ok(MetricStore::new(Storage::new(&path))?)
}

// Presentation

pub fn print_banner() {
    println!(
        "{} {}",
        "onionweave".bright_magenta().bold(),
        env!("CARGO_PKG_VERSION").bright_black()
    );
    println!("{}", "a mailbox-pipelined onion crawler".bright_black());
    println!();
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_prompt(msg: &str) -> Result<String> {
    print!("{} ", msg.bright_cyan().bold());
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    Ok(response.trim().to_lowercase())
}

fn fail(e: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "✗".red().bold(), e);
    process::exit(1);
}

pub fn handle_init(args: &ArgMatches) {
    if let Err(e) = init(args) {
        fail(e);
    }
}

fn init(args: &ArgMatches) -> Result<()> {
    print_divider();
    println!("{}", "  ONIONWEAVE INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let raw_path = args
        .get_one::<String>("PATH")
        .context("missing configuration path")?;
    let config_path = PathBuf::from(shellexpand::tilde(raw_path).as_ref());
    let force = args.get_flag("force");

    let config = if config_path.exists() {
        if !force {
            println!("{}", "⚠ WARNING".yellow().bold());
            println!("A configuration already exists:");
            println!(
                "  {} {}",
                "•".yellow(),
                config_path.display().to_string().bright_white()
            );
            println!();

            let response = print_prompt("Replace it with the defaults? [y/N]:")?;
            println!();
            if response != "y" && response != "yes" {
                println!("{} Keeping the existing configuration", "→".blue());
                PipelineConfig::load(&config_path)?
            } else {
                write_default_config(&config_path)?
            }
        } else {
            write_default_config(&config_path)?
        }
    } else {
        write_default_config(&config_path)?
    };

    println!("{} Preparing data directory...", "→".blue());
    prepare_workspace(&config)?;

    println!();
    print_divider();
    println!("{}", "  INITIALIZATION COMPLETE".green().bold());
    print_divider();
    println!();
    println!(
        "{} Config: {}",
        "✓".green().bold(),
        config_path.display().to_string().bright_white()
    );
    println!(
        "{} Data directory: {}",
        "✓".green().bold(),
        config.data_dir().display().to_string().bright_white()
    );
    println!(
        "{} Database: {}",
        "✓".green().bold(),
        config.database_path().display().to_string().bright_white()
    );
    println!();
    Ok(())
}

fn write_default_config(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::default();
    config.save(path)?;
    println!(
        "{} Default configuration written to {}",
        "✓".green().bold(),
        path.display().to_string().bright_white()
    );
    Ok(config)
}

pub async fn handle_run(args: &ArgMatches) {
    if let Err(e) = run(args).await {
        fail(e);
    }
}

async fn run(args: &ArgMatches) -> Result<()> {
    let (path, config) = load_config(args)?;
    start_logging(&config)?;
    prepare_workspace(&config)?;

    for (pool, count) in reclaim_all(&config)? {
        if count > 0 {
            warn!("Reclaimed {} abandoned messages in {}", count, pool);
        }
    }

    let program = env::current_exe().context("cannot locate the onionweave executable")?;
    let mut supervisor = Supervisor::new(config.death_dir())
        .with_poll_delay(config.poll_delay())
        .with_grace(config.shutdown_grace());

    for pool in POOLS {
        let factory = CommandFactory::new(&program)
            .arg("--quiet")
            .args(["worker", "--pool", pool, "--config"])
            .arg(&path);
        supervisor.add_pool(pool, factory, config.workers(pool)?);
    }

    println!(
        "{} Supervising {} pools, Ctrl+C to stop",
        "→".blue(),
        supervisor.pool_names().len()
    );
    supervisor.supervise().await?;
    println!("{} All workers stopped", "✓".green().bold());
    Ok(())
}

pub fn handle_worker(args: &ArgMatches) {
    if let Err(e) = worker(args) {
        fail(e);
    }
}

fn worker(args: &ArgMatches) -> Result<()> {
    let pool = args.get_one::<String>("pool").context("missing pool")?;
    let (_, config) = load_config(args)?;
    start_logging(&config)?;

    let worker = build_worker(&config, pool)?;
    install_termination_handler(worker.notice().clone())?;
    worker.run()?;
    Ok(())
}

pub fn handle_reclaim(args: &ArgMatches) {
    let result = load_config(args).and_then(|(_, config)| reclaim_all(&config));
    match result {
        Ok(reclaimed) => {
            for (pool, count) in reclaimed {
                println!(
                    "{} {:<10} {} message(s) returned",
                    "✓".green().bold(),
                    pool,
                    count.to_string().cyan()
                );
            }
        }
        Err(e) => fail(e),
    }
}

pub fn handle_seed(args: &ArgMatches) {
    if let Err(e) = seed(args) {
        fail(e);
    }
}

fn seed(args: &ArgMatches) -> Result<()> {
    let (_, config) = load_config(args)?;
    let urls = SeedSource::from_args(args)?.urls()?;

    let progress = ProgressBar::new(urls.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} seeded")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let seeded = seed_urls(&config, &urls, &progress);
    progress.finish_and_clear();

    println!(
        "{} {} URL(s) queued in {}",
        "✓".green().bold(),
        seeded?.to_string().cyan(),
        config.mailbox_dir(FETCHER).display().to_string().bright_white()
    );
    Ok(())
}

pub fn handle_status(args: &ArgMatches) {
    let result = load_config(args).and_then(|(_, config)| collect_status(&config));
    let report = match result {
        Ok(report) => report,
        Err(e) => fail(e),
    };

    println!("{}", "MAILBOXES".bright_blue().bold());
    println!(
        "  {:<10} {:>10} {:>10} {:>8}",
        "pool", "pending", "claimed", "other"
    );
    for (pool, census) in &report.mailboxes {
        let pending = census.pending.to_string();
        println!(
            "  {:<10} {:>10} {:>10} {:>8}",
            pool,
            if census.pending > 0 { pending.yellow() } else { pending.normal() },
            census.claimed,
            census.other
        );
    }
    println!();

    println!("{}", "CRAWL".bright_blue().bold());
    match report.counts {
        Some(counts) => {
            println!(
                "  Domains: {} ({} accessible)",
                counts.domains.to_string().cyan(),
                counts.accessible_domains.to_string().green()
            );
            println!(
                "  URLs: {} ({} visited)",
                counts.urls.to_string().cyan(),
                counts.visited_urls.to_string().green()
            );
            println!("  Links: {}", counts.edges.to_string().cyan());
        }
        None => println!("  {} nothing crawled yet", "ℹ".blue()),
    }
}

pub fn handle_graph(args: &ArgMatches) {
    if let Err(e) = graph(args) {
        fail(e);
    }
}

fn graph(args: &ArgMatches) -> Result<()> {
    let (_, config) = load_config(args)?;
    let format = args
        .get_one::<String>("format")
        .and_then(|f| GraphFormat::from_str(f))
        .unwrap_or(GraphFormat::Csv);
    let accessible_only = args.get_flag("accessible-only");

    let graph = export_graph(&config, accessible_only)?;
    let rendered = graph.render(format);

    match args.get_one::<PathBuf>("output") {
        Some(path) => {
            save_graph(&rendered, path)?;
            println!(
                "{} {} nodes, {} edges written to {}",
                "✓".green().bold(),
                graph.node_count().to_string().cyan(),
                graph.edge_count().to_string().cyan(),
                path.display().to_string().bright_white()
            );
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

pub fn handle_metrics_list(args: &ArgMatches) {
    let result = load_config(args).and_then(|(_, config)| Ok(open_metrics(&config)?.list()?));
    match result {
        Ok(metrics) if metrics.is_empty() => println!("{} No metrics declared", "ℹ".blue()),
        Ok(metrics) => {
            println!("  {:>5}  {:<12} {}", "id", "stage", "metric");
            for metric in metrics {
                println!(
                    "  {:>5}  {:<12} {}",
                    metric.id.to_string().cyan(),
                    metric.stage,
                    metric.metric
                );
            }
        }
        Err(e) => fail(e),
    }
}

/// The `minutes` long window that ends at `to`.
pub fn query_window(minutes: i64, to: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let span = ChronoDuration::try_minutes(minutes)
        .with_context(|| format!("{} minutes is out of range", minutes))?;
    let from = to
        .checked_sub_signed(span)
        .with_context(|| format!("{} minutes is out of range", minutes))?;
    Ok((from, to))
}

pub fn handle_metrics_query(args: &ArgMatches) {
    let metric_id = args.get_one::<i64>("id").copied().unwrap_or_default();
    let minutes = args.get_one::<i64>("minutes").copied().unwrap_or(60);

    let result = load_config(args).and_then(|(_, config)| {
        let (from, to) = query_window(minutes, Utc::now())?;
        Ok(open_metrics(&config)?.query(metric_id, from, to)?)
    });

    match result {
        Ok(points) if points.is_empty() => {
            println!("{} No data for metric {} in the last {} minutes", "ℹ".blue(), metric_id, minutes)
        }
        Ok(points) => {
            for point in points {
                println!(
                    "  {}  {}",
                    point.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string().bright_black(),
                    point.value
                );
            }
        }
        Err(e) => fail(e),
    }
}
