// Process supervisor: keeps N workers alive per pool

use crate::death::DeathRecord;
use crate::error::{PipelineError, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Starts one worker process of a pool.
pub trait WorkerFactory: Send {
    fn spawn(&self) -> io::Result<Child>;
}

/// Spawns workers from a fixed command line.
#[derive(Debug, Clone)]
pub struct CommandFactory {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandFactory {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerFactory for CommandFactory {
    fn spawn(&self) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .spawn()
    }
}

struct Pool {
    factory: Box<dyn WorkerFactory>,
    count: usize,
    workers: HashMap<u32, Child>,
}

/// A worker the supervisor found dead during a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub pool: String,
    pub pid: u32,
    pub record: Option<DeathRecord>,
    /// The process was still running and had to be killed.
    pub forced: bool,
}

pub struct Supervisor {
    poll_delay: Duration,
    death_dir: PathBuf,
    grace: Duration,
    pools: BTreeMap<String, Pool>,
}

impl Supervisor {
    pub fn new(death_dir: impl Into<PathBuf>) -> Self {
        Self {
            poll_delay: DEFAULT_POLL_DELAY,
            death_dir: death_dir.into(),
            grace: DEFAULT_SHUTDOWN_GRACE,
            pools: BTreeMap::new(),
        }
    }

    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn death_dir(&self) -> &Path {
        &self.death_dir
    }

    /// Registers a pool of `count` workers. Empty pools are ignored.
    pub fn add_pool(&mut self, name: &str, factory: impl WorkerFactory + 'static, count: usize) {
        if count == 0 {
            debug!("Pool {} has no workers, skipping", name);
            return;
        }

        self.pools.insert(
            name.to_string(),
            Pool {
                factory: Box::new(factory),
                count,
                workers: HashMap::new(),
            },
        );
    }

    pub fn pool_names(&self) -> Vec<&str> {
        self.pools.keys().map(String::as_str).collect()
    }

    pub fn live_count(&self, pool: &str) -> usize {
        self.pools.get(pool).map(|p| p.workers.len()).unwrap_or(0)
    }

    pub fn pids(&self, pool: &str) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .pools
            .get(pool)
            .map(|p| p.workers.keys().copied().collect())
            .unwrap_or_default();
        pids.sort_unstable();
        pids
    }

    /// Clears the death directory and starts every pool.
    ///
    /// Failure to prepare the death directory is fatal: without it, deaths
    /// cannot be told apart from stale records. A pool that cannot be
    /// started is fatal too, and every worker already running is stopped
    /// before the error is returned.
    pub fn launch(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.death_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.death_dir)?;

        let mut failure = None;
        for (name, pool) in self.pools.iter_mut() {
            if let Err(e) = top_up(name, pool) {
                failure = Some((name.clone(), e));
                break;
            }
            info!("Started pool {} with {} workers", name, pool.workers.len());
        }

        match failure {
            Some((name, e)) => {
                error!("Could not start pool {}: {}", name, e);
                self.shutdown();
                Err(PipelineError::IoError(e))
            }
            None => Ok(()),
        }
    }

    /// Detects dead workers, reaps them and spawns replacements.
    ///
    /// A worker is dead when its process has exited or it left a death
    /// record. Workers that left a record but are still running are killed.
    pub fn poll(&mut self) -> Result<Vec<WorkerDeath>> {
        let mut deaths = Vec::new();

        for (name, pool) in self.pools.iter_mut() {
            let mut dead = Vec::new();
            for (pid, child) in pool.workers.iter_mut() {
                let exited = match child.try_wait() {
                    Ok(status) => status.is_some(),
                    Err(e) => {
                        warn!("Could not query worker {}: {}", pid, e);
                        false
                    }
                };
                if exited || DeathRecord::exists(&self.death_dir, *pid) {
                    dead.push((*pid, exited));
                }
            }

            for (pid, exited) in dead {
                let Some(mut child) = pool.workers.remove(&pid) else {
                    continue;
                };

                let mut forced = false;
                if !exited {
                    forced = true;
                    if let Err(e) = child.kill() {
                        debug!("Worker {} exited before kill: {}", pid, e);
                    }
                }
                if let Err(e) = child.wait() {
                    warn!("Could not reap worker {}: {}", pid, e);
                }

                // A record that cannot be removed still counts as a failed death
                let record = match DeathRecord::consume(&self.death_dir, pid) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Could not remove death record of {}/{}: {}", name, pid, e);
                        Some(DeathRecord::new(
                            false,
                            Some(format!("unremovable death record: {}", e)),
                        ))
                    }
                };
                match &record {
                    Some(r) if r.success => info!(
                        "Worker {}/{} exited: {}",
                        name,
                        pid,
                        r.message.as_deref().unwrap_or("ok")
                    ),
                    Some(r) => error!(
                        "Worker {}/{} failed: {}",
                        name,
                        pid,
                        r.message.as_deref().unwrap_or("no message")
                    ),
                    None => warn!("Worker {}/{} died without a record", name, pid),
                }

                deaths.push(WorkerDeath {
                    pool: name.clone(),
                    pid,
                    record,
                    forced,
                });
            }

            if let Err(e) = top_up(name, pool) {
                error!("Could not respawn worker in pool {}: {}", name, e);
            }
        }

        Ok(deaths)
    }

    /// Asks every worker to stop, then kills whatever outlives the grace
    /// period.
    pub fn shutdown(&mut self) {
        for pool in self.pools.values() {
            for pid in pool.workers.keys() {
                if let Err(e) = kill(Pid::from_raw(*pid as i32), Signal::SIGTERM) {
                    debug!("Could not signal worker {}: {}", pid, e);
                }
            }
        }

        let deadline = Instant::now() + self.grace;
        loop {
            let mut running = 0;
            for pool in self.pools.values_mut() {
                pool.workers
                    .retain(|_, child| !matches!(child.try_wait(), Ok(Some(_)) | Err(_)));
                running += pool.workers.len();
            }

            if running == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        for (name, pool) in self.pools.iter_mut() {
            for (pid, mut child) in pool.workers.drain() {
                warn!("Killing worker {}/{} after grace period", name, pid);
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        // Records of a clean shutdown are not interesting
        if let Err(e) = fs::remove_dir_all(&self.death_dir) {
            debug!("Could not clear death directory: {}", e);
        }
    }

    /// Polls until SIGTERM or Ctrl+C, then shuts every pool down.
    pub async fn supervise(mut self) -> Result<()> {
        self.launch()?;

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                self.shutdown();
                return Err(e.into());
            }
        };
        let mut ticker = tokio::time::interval(self.poll_delay);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll() {
                        error!("Supervisor poll failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping workers");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Terminated, stopping workers");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }
}

fn top_up(name: &str, pool: &mut Pool) -> io::Result<()> {
    while pool.workers.len() < pool.count {
        let child = pool.factory.spawn()?;
        debug!("Spawned worker {}/{}", name, child.id());
        pool.workers.insert(child.id(), child);
    }
    Ok(())
}
