// Mailbox protocol: claim-by-rename over a directory of message files

use crate::error::{PipelineError, Result};
use crate::storage::current_timestamp;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A unit of work: an unordered mapping of string keys to JSON values.
pub type Message = serde_json::Map<String, Value>;

pub const CLAIMED_SUFFIX: &str = ".claimed";

/// Accepts `<Stage>_<pid>_<timestamp>_<seq>`.
pub const DEFAULT_ACCEPT_PATTERN: &str = r"^[A-Za-z]+_[0-9]+_[0-9]+_[0-9]+$";

/// Accepts `<priority>-<Stage>_<pid>_<timestamp>_<seq>`.
pub const PRIORITY_ACCEPT_PATTERN: &str = r"^[0-9]+-[A-Za-z]+_[0-9]+_[0-9]+_[0-9]+$";

// Files being written are hidden until published
const TEMP_PREFIX: &str = ".";

/// Order in which claim candidates are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimOrder {
    /// Whatever order the directory listing yields.
    #[default]
    Unordered,
    /// Ascending numeric `<priority>-` filename prefix.
    Priority,
}

/// Exclusive ownership of one message, granted by a successful claim.
#[derive(Debug)]
pub struct Claim {
    name: String,
    path: PathBuf,
}

impl Claim {
    /// Name of the message before it was claimed.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// File counts of a mailbox, for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Census {
    pub pending: usize,
    pub claimed: usize,
    pub other: usize,
}

/// The operations every stage relies on. The directory backend is the only
/// one shipped, but nothing above this trait knows about files.
pub trait Mailbox {
    /// Creates the backing store if missing.
    fn ensure(&self) -> Result<()>;

    /// Claims one pending message. A lost race is not an error.
    fn claim(&self) -> Result<Option<Claim>>;

    fn read(&self, claim: &Claim) -> Result<Message>;

    /// Removes a handled message.
    fn complete(&self, claim: Claim) -> Result<()>;

    /// Disposes of a message whose handling failed.
    fn fail(&self, claim: Claim) -> Result<()>;

    /// Publishes `message` under `name`. Readers never see a partial payload.
    fn deliver(&self, message: &Message, name: &str) -> Result<()>;

    /// Number of messages held, claimed or not.
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns abandoned claimed messages to the pending pool.
    fn reclaim(&self) -> Result<usize>;
}

/// A mailbox backed by one directory.
#[derive(Debug, Clone)]
pub struct DirMailbox {
    path: PathBuf,
    accept: Regex,
    order: ClaimOrder,
    dead_letter: Option<PathBuf>,
}

impl DirMailbox {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            accept: full_match(DEFAULT_ACCEPT_PATTERN)?,
            order: ClaimOrder::Unordered,
            dead_letter: None,
        })
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self> {
        self.accept = full_match(pattern)?;
        Ok(self)
    }

    pub fn with_order(mut self, order: ClaimOrder) -> Self {
        self.order = order;
        self
    }

    /// Failed messages are moved to `dir` instead of being deleted.
    pub fn with_dead_letter(mut self, dir: Option<PathBuf>) -> Self {
        self.dead_letter = dir;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn accepts(&self, name: &str) -> bool {
        !name.starts_with(TEMP_PREFIX) && self.accept.is_match(name)
    }

    /// Counts by kind. A mailbox that was never created is empty.
    pub fn census(&self) -> Result<Census> {
        let mut census = Census::default();
        let names = match self.names() {
            Ok(names) => names,
            Err(PipelineError::IoError(e)) if e.kind() == ErrorKind::NotFound => return Ok(census),
            Err(e) => return Err(e),
        };
        for name in names {
            if name.ends_with(CLAIMED_SUFFIX) {
                census.claimed += 1;
            } else if self.accepts(&name) {
                census.pending += 1;
            } else {
                census.other += 1;
            }
        }
        Ok(census)
    }

    /// Visible (non-temporary) file names.
    fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && !name.starts_with(TEMP_PREFIX)
            {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn candidates(&self) -> Result<Vec<String>> {
        let mut candidates: Vec<String> = self
            .names()?
            .into_iter()
            .filter(|name| self.accept.is_match(name))
            .collect();

        if self.order == ClaimOrder::Priority {
            candidates.sort_by_key(|name| priority_of(name));
        }

        Ok(candidates)
    }
}

impl Mailbox for DirMailbox {
    fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        if let Some(dir) = &self.dead_letter {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn claim(&self) -> Result<Option<Claim>> {
        for name in self.candidates()? {
            let from = self.path.join(&name);
            let to = self.path.join(format!("{}{}", name, CLAIMED_SUFFIX));

            match fs::rename(&from, &to) {
                Ok(()) => return Ok(Some(Claim { name, path: to })),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Lost claim race for {}", name);
                }
                Err(e) => {
                    warn!("Could not claim {}: {}", from.display(), e);
                }
            }
        }

        Ok(None)
    }

    fn read(&self, claim: &Claim) -> Result<Message> {
        let contents = fs::read_to_string(&claim.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn complete(&self, claim: Claim) -> Result<()> {
        fs::remove_file(&claim.path)?;
        Ok(())
    }

    fn fail(&self, claim: Claim) -> Result<()> {
        match &self.dead_letter {
            Some(dir) => {
                fs::rename(&claim.path, dir.join(&claim.name))?;
                Ok(())
            }
            None => self.complete(claim),
        }
    }

    fn deliver(&self, message: &Message, name: &str) -> Result<()> {
        if name.starts_with(TEMP_PREFIX) || name.contains('/') {
            return Err(PipelineError::InvalidRequest(format!(
                "invalid message name: {}",
                name
            )));
        }

        let temp = self.path.join(format!("{}{}.tmp", TEMP_PREFIX, name));
        fs::write(&temp, serde_json::to_vec(message)?)?;
        fs::rename(&temp, self.path.join(name))?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.names()?.len())
    }

    fn reclaim(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }

        let mut reclaimed = 0;
        for name in self.names()? {
            if let Some(original) = name.strip_suffix(CLAIMED_SUFFIX) {
                fs::rename(self.path.join(&name), self.path.join(original))?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

/// True when `max` is unset or every mailbox holds fewer than `max` messages.
pub fn has_capacity(mailboxes: &[&dyn Mailbox], max: Option<usize>) -> Result<bool> {
    Ok(match space(mailboxes, max)? {
        Some(free) => free > 0,
        None => true,
    })
}

/// Free slots left before the fullest mailbox reaches `max`; `None` when unmetered.
pub fn space(mailboxes: &[&dyn Mailbox], max: Option<usize>) -> Result<Option<usize>> {
    let Some(max) = max else {
        return Ok(None);
    };

    let mut free = max;
    for mailbox in mailboxes {
        free = free.min(max.saturating_sub(mailbox.len()?));
    }
    Ok(Some(free))
}

/// Builds globally unique message names for one process.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    stage: String,
    pid: u32,
    sequence: u64,
}

impl NameGenerator {
    pub fn new(stage: &str, pid: u32) -> Self {
        let stage: String = stage.chars().filter(|c| c.is_ascii_alphabetic()).collect();
        Self {
            stage: if stage.is_empty() { "Stage".to_string() } else { stage },
            pid,
            sequence: 0,
        }
    }

    pub fn next(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!(
            "{}{}_{}_{}_{}",
            prefix,
            self.stage,
            self.pid,
            current_timestamp(),
            self.sequence
        )
    }
}

fn full_match(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

fn priority_of(name: &str) -> u64 {
    name.split_once('-')
        .and_then(|(prefix, _)| prefix.parse().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_of() {
        assert_eq!(priority_of("0-Seed_0_0_1"), 0);
        assert_eq!(priority_of("12-Frontier_4_5_6"), 12);
        assert_eq!(priority_of("Frontier_4_5_6"), u64::MAX);
    }

    #[test]
    fn test_names_are_unique_and_accepted() {
        let mut names = NameGenerator::new("Link-Extractor2", 42);
        let first = names.next("");
        let second = names.next("");
        assert_ne!(first, second);
        assert!(first.starts_with("LinkExtractor_42_"));

        let accept = full_match(DEFAULT_ACCEPT_PATTERN).unwrap();
        assert!(accept.is_match(&first));
        assert!(!accept.is_match(&format!("{}{}", first, CLAIMED_SUFFIX)));

        let priority = full_match(PRIORITY_ACCEPT_PATTERN).unwrap();
        assert!(priority.is_match(&names.next("0-")));
    }

    #[test]
    fn test_pattern_must_match_whole_name() {
        let accept = full_match("[a-z]+").unwrap();
        assert!(accept.is_match("abc"));
        assert!(!accept.is_match("abc1"));
    }
}
