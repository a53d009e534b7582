pub mod config;
pub mod death;
pub mod error;
pub mod frontier;
pub mod graph;
pub mod logging;
pub mod mailbox;
pub mod metrics;
pub mod runtime;
pub mod storage;
pub mod supervisor;

pub use config::PipelineConfig;
pub use death::{DeathNotice, DeathRecord};
pub use error::{PipelineError, Result};
pub use frontier::{CrawlReport, Frontier, FrontierSettings};
pub use graph::{GraphFormat, SiteGraph};
pub use mailbox::{ClaimOrder, DirMailbox, Mailbox, Message, NameGenerator};
pub use metrics::{MetricSink, MetricStore, NoopMetrics};
pub use runtime::{Emitter, Outbox, PassOutcome, Route, Stage, Worker, WorkerSettings};
pub use storage::Storage;
pub use supervisor::{CommandFactory, Supervisor, WorkerDeath, WorkerFactory};
