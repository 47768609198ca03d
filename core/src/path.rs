//! Path and path manager.
//!
//! A `Path` is a plain struct owned exclusively by the dispatcher — no
//! locking needed, since only the dispatcher's single thread ever mutates
//! it; sharing it behind `Arc`/`Mutex` would only add contention no other
//! thread needs to pay for.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::config::{Config, PathConfig, SourceKind};

/// Who currently owns the right to publish on a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publisher {
    /// A local client that ANNOUNCEd.
    Session(u64),
    /// The configured upstream source, once it has announced readiness.
    Source,
}

/// Outcome delivered to a session blocked in `WaitDescription`, once the
/// path becomes ready, fails, or times out.
#[derive(Debug, Clone)]
pub enum DescribeOutcome {
    Ready { sdp: String },
    NotFound,
    Timeout,
}

/// A reader blocked in `WaitDescription`, to be released when the path
/// becomes ready or to be failed on timeout.
pub struct DescribeWaiter {
    pub session_id: u64,
    pub requested_at: Instant,
    pub reply: std::sync::mpsc::Sender<DescribeOutcome>,
}

/// Server-side rendezvous for one publisher and many readers.
pub struct Path {
    pub name: String,
    pub config: PathConfig,
    pub permanent: bool,
    pub publisher: Option<Publisher>,
    pub ready: bool,
    pub sdp: Option<String>,
    pub track_count: u32,
    pub last_describe_requested: Option<Instant>,
    pub last_describe_activated: Option<Instant>,
    pub describe_waiters: Vec<DescribeWaiter>,
    /// Session ids currently reading this path. Mirrors what's tracked in
    /// the dispatcher's readers map; this list is what lifecycle decisions
    /// ("no clients remain") consult.
    pub readers: Vec<u64>,
    /// Whether the configured on-demand source/command is currently running.
    pub on_demand_running: bool,
}

impl Path {
    fn new(name: String, config: PathConfig, permanent: bool) -> Self {
        Self {
            name,
            config,
            permanent,
            publisher: None,
            ready: false,
            sdp: None,
            track_count: 0,
            last_describe_requested: None,
            last_describe_activated: None,
            describe_waiters: Vec::new(),
            readers: Vec::new(),
            on_demand_running: false,
        }
    }

    /// A non-permanent path is destroyed once it has no publisher, no
    /// readers, and no one still waiting on a DESCRIBE for it.
    pub fn should_destroy(&self) -> bool {
        !self.permanent
            && self.publisher.is_none()
            && self.readers.is_empty()
            && self.describe_waiters.is_empty()
    }

    /// On-demand stop rule: idle for `idle_for` with no reader.
    pub fn on_demand_idle(&self, idle_for: Duration) -> bool {
        self.readers.is_empty()
            && self
                .last_describe_requested
                .map(|t| t.elapsed() >= idle_for)
                .unwrap_or(true)
    }

    pub fn requires_on_demand_activation(&self) -> bool {
        self.config.source_on_demand && !self.on_demand_running
    }

    /// Marks the path ready once its publisher has SETUP all declared
    /// tracks and sent RECORD. Releases every describe-waiter with the SDP.
    pub fn mark_ready(&mut self, sdp: String, track_count: u32) {
        self.sdp = Some(sdp.clone());
        self.track_count = track_count;
        self.ready = true;
        for waiter in self.describe_waiters.drain(..) {
            let _ = waiter.reply.send(DescribeOutcome::Ready { sdp: sdp.clone() });
        }
    }

    /// Publisher disconnected or was explicitly terminated. Fails every
    /// still-waiting DESCRIBE.
    pub fn mark_not_ready(&mut self) {
        self.ready = false;
        self.sdp = None;
        self.publisher = None;
        for waiter in self.describe_waiters.drain(..) {
            let _ = waiter.reply.send(DescribeOutcome::NotFound);
        }
    }

    /// Fail waiters that have sat past the describe-wait deadline.
    pub fn fail_expired_waiters(&mut self, timeout: Duration) {
        let (expired, remaining): (Vec<_>, Vec<_>) = self
            .describe_waiters
            .drain(..)
            .partition(|w| w.requested_at.elapsed() >= timeout);
        self.describe_waiters = remaining;
        for waiter in expired {
            let _ = waiter.reply.send(DescribeOutcome::Timeout);
        }
    }

    pub fn push_describe_waiter(&mut self, waiter: DescribeWaiter) {
        self.last_describe_requested = Some(Instant::now());
        self.describe_waiters.push(waiter);
    }
}

/// Registry of paths: permanent (from static config) plus ephemeral
/// (matched from a regex pattern or the `all` alias).
pub struct PathManager {
    paths: HashMap<String, Path>,
    /// Compiled regex path configs, kept in declaration order: when more
    /// than one pattern could match, the first one declared wins.
    regex_configs: Vec<(Regex, PathConfig)>,
}

/// Name-validation rule: no leading/trailing slash, and only
/// `[0-9a-zA-Z_\-/]`.
fn is_valid_path_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'/'))
}

/// Strip a trailing `?query` suffix.
pub fn strip_query(name: &str) -> &str {
    name.split('?').next().unwrap_or(name)
}

impl PathManager {
    pub fn new(config: &Config) -> Self {
        let mut paths = HashMap::new();
        let mut regex_configs = Vec::new();

        for path_config in &config.paths {
            if path_config.is_regex() {
                let pattern = if path_config.name == "all" {
                    "^.*$".to_string()
                } else {
                    path_config.name.trim_start_matches('~').to_string()
                };
                match Regex::new(&pattern) {
                    Ok(re) => regex_configs.push((re, path_config.clone())),
                    Err(e) => tracing::warn!(pattern, error = %e, "invalid path regex, skipping"),
                }
            } else {
                let path = Path::new(path_config.name.clone(), path_config.clone(), true);
                paths.insert(path_config.name.clone(), path);
            }
        }

        Self {
            paths,
            regex_configs,
        }
    }

    /// Name resolution: validate, strip query, literal map first, then
    /// first-matching regex in declaration order. Creates an ephemeral
    /// path on a regex hit if one doesn't already exist.
    pub fn resolve_or_create(&mut self, raw_name: &str) -> Result<&mut Path, String> {
        let name = strip_query(raw_name);
        if !is_valid_path_name(name) {
            return Err(format!("invalid path name: {name}"));
        }

        if self.paths.contains_key(name) {
            return Ok(self.paths.get_mut(name).unwrap());
        }

        for (re, config) in &self.regex_configs {
            if re.is_match(name) {
                let mut concrete = config.clone();
                concrete.name = name.to_string();
                let path = Path::new(name.to_string(), concrete, false);
                self.paths.insert(name.to_string(), path);
                return Ok(self.paths.get_mut(name).unwrap());
            }
        }

        Err(format!("no path config matches: {name}"))
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.paths.get(strip_query(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Path> {
        self.paths.get_mut(strip_query(name))
    }

    pub fn remove_if_destroyable(&mut self, name: &str) -> bool {
        let Some(path) = self.paths.get(name) else {
            return false;
        };
        if path.should_destroy() {
            self.paths.remove(name);
            tracing::info!(path = name, "ephemeral path destroyed");
            true
        } else {
            false
        }
    }

    pub fn sweep_destroyable(&mut self) {
        let dead: Vec<String> = self
            .paths
            .values()
            .filter(|p| p.should_destroy())
            .map(|p| p.name.clone())
            .collect();
        for name in dead {
            self.paths.remove(&name);
            tracing::info!(path = %name, "ephemeral path destroyed");
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Path> {
        self.paths.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.values()
    }
}
