// Stage runtime: the loop every worker process runs

use crate::death::DeathNotice;
use crate::error::Result;
use crate::mailbox::{self, Mailbox, Message, NameGenerator};
use crate::metrics::{MetricSink, NoopMetrics, Sample};
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Key of a message field naming a content file that travels with it.
pub const CONTENT_PATH_KEY: &str = "content_path";

const METRIC_FLUSH_THRESHOLD: usize = 64;
const RUNTIME_METRICS: [&str; 3] = ["inbox_size", "processed", "failed"];

/// What a concrete stage supplies. Everything else is the runtime's job.
pub trait Stage {
    /// Letters only; used in the names of the messages this stage emits.
    fn name(&self) -> &str;

    /// Handles one message. An `Err` is a per-message failure: it is logged
    /// and the message is still consumed.
    fn on_message(&mut self, message: Message) -> anyhow::Result<Option<Message>>;

    /// How often `on_tick` runs, if at all.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    fn on_tick(&mut self, _emitter: &mut Emitter<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Claim even when the outbox is full.
    fn ignores_backpressure(&self) -> bool {
        false
    }
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn on_message(&mut self, message: Message) -> anyhow::Result<Option<Message>> {
        (**self).on_message(message)
    }

    fn tick_interval(&self) -> Option<Duration> {
        (**self).tick_interval()
    }

    fn on_tick(&mut self, emitter: &mut Emitter<'_>) -> anyhow::Result<()> {
        (**self).on_tick(emitter)
    }

    fn ignores_backpressure(&self) -> bool {
        (**self).ignores_backpressure()
    }
}

/// One destination of a stage's output: another stage's inbox, plus the
/// directory that receives content files travelling with the messages.
pub struct Route {
    pub mailbox: Box<dyn Mailbox>,
    pub content_dir: Option<PathBuf>,
}

impl Route {
    pub fn new(mailbox: impl Mailbox + 'static) -> Self {
        Self {
            mailbox: Box::new(mailbox),
            content_dir: None,
        }
    }

    pub fn with_content_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.content_dir = Some(dir.into());
        self
    }
}

/// Every route a stage writes to, and the ceiling that throttles it.
#[derive(Default)]
pub struct Outbox {
    routes: Vec<Route>,
    max_size: Option<usize>,
}

impl Outbox {
    pub fn new(routes: Vec<Route>, max_size: Option<usize>) -> Self {
        Self { routes, max_size }
    }

    /// An outbox that drops everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn mailboxes(&self) -> Vec<&dyn Mailbox> {
        self.routes.iter().map(|r| r.mailbox.as_ref()).collect()
    }

    pub fn ensure(&self) -> Result<()> {
        for route in &self.routes {
            route.mailbox.ensure()?;
            if let Some(dir) = &route.content_dir {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    pub fn has_capacity(&self) -> Result<bool> {
        mailbox::has_capacity(&self.mailboxes(), self.max_size)
    }

    /// Free slots; `None` when unmetered.
    pub fn space(&self) -> Result<Option<usize>> {
        mailbox::space(&self.mailboxes(), self.max_size)
    }

    /// Writes `message` to every route under `name`.
    ///
    /// A content file named by `content_path` is hard linked into each
    /// route's content directory and each copy of the message points at its
    /// own link. The original file is removed once every route has its link.
    /// Routes without a content directory get the message without the path.
    pub fn deliver(&self, message: &Message, name: &str) -> Result<()> {
        let content = message
            .get(CONTENT_PATH_KEY)
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .filter(|path| path.exists());

        let linking = content.is_some() && self.routes.iter().any(|r| r.content_dir.is_some());

        for route in &self.routes {
            match (&content, &route.content_dir) {
                (Some(original), Some(dir)) if linking => {
                    let link = link_content(original, dir)?;
                    let mut copy = message.clone();
                    copy.insert(
                        CONTENT_PATH_KEY.to_string(),
                        Value::String(link.to_string_lossy().into_owned()),
                    );
                    route.mailbox.deliver(&copy, name)?;
                }
                (Some(_), None) if linking => {
                    let mut copy = message.clone();
                    copy.remove(CONTENT_PATH_KEY);
                    route.mailbox.deliver(&copy, name)?;
                }
                _ => route.mailbox.deliver(message, name)?,
            }
        }

        if linking && let Some(original) = content {
            fs::remove_file(original)?;
        }

        Ok(())
    }
}

fn link_content(original: &Path, dir: &Path) -> Result<PathBuf> {
    let file_name = original.file_name().ok_or_else(|| {
        std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("content path has no file name: {}", original.display()),
        )
    })?;
    let link = dir.join(file_name);

    match fs::hard_link(original, &link) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(&link)?;
            fs::hard_link(original, &link)?;
        }
        Err(e) => return Err(e.into()),
    }

    Ok(link)
}

/// What a stage's scheduled callback may do with the outbox.
pub struct Emitter<'a> {
    outbox: &'a Outbox,
    names: &'a mut NameGenerator,
    emitted: usize,
}

impl<'a> Emitter<'a> {
    pub fn new(outbox: &'a Outbox, names: &'a mut NameGenerator) -> Self {
        Self {
            outbox,
            names,
            emitted: 0,
        }
    }

    /// Free downstream slots; `None` when unmetered.
    pub fn space(&self) -> Result<Option<usize>> {
        self.outbox.space()
    }

    /// Writes `message` under a fresh name starting with `prefix`.
    pub fn emit(&mut self, message: &Message, prefix: &str) -> Result<String> {
        let name = self.names.next(prefix);
        self.outbox.deliver(message, &name)?;
        self.emitted += 1;
        Ok(name)
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_iterations: usize,
    /// Upper bound of the idle sleep; each worker draws its own delay once.
    pub max_sleep: Duration,
    pub death_dir: PathBuf,
}

/// Result of one pass of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// A message was handled and removed.
    Processed,
    /// A message could not be decoded or its handler failed; it was
    /// consumed (or dead-lettered).
    Failed,
    /// Nothing claimable.
    Idle,
    /// The outbox is at its ceiling; nothing was claimed.
    Backpressured,
}

impl PassOutcome {
    pub fn should_sleep(&self) -> bool {
        matches!(self, PassOutcome::Idle | PassOutcome::Backpressured)
    }
}

/// A stage instance bound to its mailboxes.
pub struct Worker<S: Stage> {
    stage: S,
    inbox: Box<dyn Mailbox>,
    outbox: Outbox,
    names: NameGenerator,
    notice: DeathNotice,
    max_iterations: usize,
    idle_sleep: Duration,
    next_tick: Option<Instant>,
    metrics: Box<dyn MetricSink>,
    metric_ids: HashMap<String, i64>,
    pending_samples: Vec<Sample>,
}

impl<S: Stage> Worker<S> {
    pub fn new(
        stage: S,
        inbox: impl Mailbox + 'static,
        outbox: Outbox,
        settings: WorkerSettings,
    ) -> Self {
        let pid = std::process::id();
        let max_ms = settings.max_sleep.as_millis() as u64;
        let idle_sleep = Duration::from_millis(rand::rng().random_range(0..=max_ms));
        let names = NameGenerator::new(stage.name(), pid);

        Self {
            stage,
            inbox: Box::new(inbox),
            outbox,
            names,
            notice: DeathNotice::new(&settings.death_dir, pid),
            max_iterations: settings.max_iterations,
            idle_sleep,
            next_tick: None,
            metrics: Box::new(NoopMetrics),
            metric_ids: HashMap::new(),
            pending_samples: Vec::new(),
        }
    }

    /// Reports through `sink`. A sink that cannot declare is replaced by a
    /// no-op one: metrics never stop the pipeline.
    pub fn with_metrics(mut self, mut sink: Box<dyn MetricSink>) -> Self {
        match sink.declare(self.stage.name(), &RUNTIME_METRICS) {
            Ok(ids) => {
                self.metric_ids = ids;
                self.metrics = sink;
            }
            Err(e) => warn!("Could not declare metrics for {}: {}", self.stage.name(), e),
        }
        self
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    pub fn stage_mut(&mut self) -> &mut S {
        &mut self.stage
    }

    pub fn notice(&self) -> &DeathNotice {
        &self.notice
    }

    /// Creates the mailboxes this worker touches.
    pub fn prepare(&self) -> Result<()> {
        self.inbox.ensure()?;
        self.outbox.ensure()
    }

    /// Claims and handles at most one message.
    pub fn pass(&mut self) -> Result<PassOutcome> {
        if !self.stage.ignores_backpressure() && !self.outbox.has_capacity()? {
            return Ok(PassOutcome::Backpressured);
        }

        let inbox_size = self.inbox.len()?;
        self.record("inbox_size", inbox_size as i64);

        let Some(claim) = self.inbox.claim()? else {
            return Ok(PassOutcome::Idle);
        };

        let message = match self.inbox.read(&claim) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable message {}: {}", claim.name(), e);
                self.inbox.fail(claim)?;
                self.record("failed", 1);
                return Ok(PassOutcome::Failed);
            }
        };

        match self.stage.on_message(message) {
            Ok(result) => {
                if let Some(result) = result {
                    self.export(&result);
                }
                self.inbox.complete(claim)?;
                self.record("processed", 1);
                Ok(PassOutcome::Processed)
            }
            Err(e) => {
                error!("{} failed on {}: {:#}", self.stage.name(), claim.name(), e);
                self.inbox.fail(claim)?;
                self.record("failed", 1);
                Ok(PassOutcome::Failed)
            }
        }
    }

    fn export(&mut self, result: &Message) {
        if self.outbox.is_empty() {
            debug!("{} has no outbox, dropping result", self.stage.name());
            return;
        }

        let name = self.names.next("");
        if let Err(e) = self.outbox.deliver(result, &name) {
            error!("Could not write result {}: {}", name, e);
        }
    }

    /// Runs the scheduled callback when its interval has elapsed. Returns
    /// true when it ran.
    pub fn maybe_tick(&mut self) -> bool {
        let Some(interval) = self.stage.tick_interval() else {
            return false;
        };

        let now = Instant::now();
        let due = *self.next_tick.get_or_insert(now + interval);
        if now < due {
            return false;
        }

        self.tick();
        self.next_tick = Some(Instant::now() + interval);
        true
    }

    /// Runs the scheduled callback now.
    pub fn tick(&mut self) {
        let mut emitter = Emitter::new(&self.outbox, &mut self.names);
        match self.stage.on_tick(&mut emitter) {
            Ok(()) => debug!("{} tick emitted {}", self.stage.name(), emitter.emitted()),
            Err(e) => error!("{} tick failed: {:#}", self.stage.name(), e),
        }
    }

    /// Runs up to `max_iterations` passes, then writes the death record.
    pub fn run(mut self) -> Result<()> {
        info!(
            "{} worker {} starting ({} iterations, idle sleep {:?})",
            self.stage.name(),
            self.notice.pid(),
            self.max_iterations,
            self.idle_sleep
        );

        let outcome = self.prepare().and_then(|()| self.event_loop());
        self.flush_metrics();

        match &outcome {
            Ok(()) => self.notice.announce(true, None)?,
            Err(e) => self.notice.announce(false, Some(e.to_string()))?,
        }

        debug!("{} worker {} about to die", self.stage.name(), self.notice.pid());
        outcome
    }

    fn event_loop(&mut self) -> Result<()> {
        if let Some(interval) = self.stage.tick_interval() {
            self.next_tick = Some(Instant::now() + interval);
        }

        for _ in 0..self.max_iterations {
            if self.pass()?.should_sleep() {
                thread::sleep(self.idle_sleep);
            }
            self.maybe_tick();
        }

        Ok(())
    }

    fn record(&mut self, metric: &str, value: i64) {
        let Some(&metric_id) = self.metric_ids.get(metric) else {
            return;
        };

        self.pending_samples.push(Sample {
            metric_id,
            timestamp: Utc::now(),
            value,
        });

        if self.pending_samples.len() >= METRIC_FLUSH_THRESHOLD {
            self.flush_metrics();
        }
    }

    fn flush_metrics(&mut self) {
        if self.pending_samples.is_empty() {
            return;
        }

        if let Err(e) = self.metrics.send(&self.pending_samples) {
            warn!("Dropping {} metric samples: {}", self.pending_samples.len(), e);
        }
        self.pending_samples.clear();
    }
}

/// Writes the death record and exits as soon as SIGTERM or SIGINT arrives,
/// without waiting for the message being handled.
pub fn install_termination_handler(notice: DeathNotice) -> Result<()> {
    let mut signals = Signals::new([SIGTERM, SIGINT])?;

    thread::Builder::new()
        .name("termination".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                let message = format!("terminated by signal {}", signal);
                if let Err(e) = notice.announce(true, Some(message)) {
                    error!("Could not write death record: {}", e);
                }
                std::process::exit(0);
            }
        })?;

    Ok(())
}
