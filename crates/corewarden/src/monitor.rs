//! Chain-proxy detection over the live process tree.
//!
//! A process launched (directly or transitively) by a monitored game is
//! proxied too. The monitor polls the tree, collects such descendants and
//! pushes the full name set to the rule coordinator.

use crate::error::MonitorError;
use crate::rules::ProcessNameSink;
use corewarden_core::{EventBus, ProcessId, ProcessNode, ProcessTreeProvider, StatusEvent};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// File name part of a process name or path, without directories
pub fn bare_name(name: &str) -> &str {
    let trimmed = name.trim();
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .filter(|last| !last.is_empty())
        .unwrap_or(trimmed)
}

/// Case-insensitive set of bare process names that keeps the first casing seen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessNameSet {
    names: BTreeMap<String, String>,
}

impl ProcessNameSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for blank names and names already present
    pub fn insert(&mut self, name: &str) -> bool {
        let name = bare_name(name);
        if name.is_empty() {
            return false;
        }
        let key = name.to_lowercase();
        if self.names.contains_key(&key) {
            return false;
        }
        self.names.insert(key, name.to_string());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(&bare_name(name).to_lowercase())
    }

    /// Names in their original casing, ordered case-insensitively
    pub fn names(&self) -> Vec<String> {
        self.names.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}

impl<S: AsRef<str>> FromIterator<S> for ProcessNameSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for name in iter {
            set.insert(name.as_ref());
        }
        set
    }
}

/// Names of processes that descend from a monitored process but are not
/// monitored themselves, in discovery order and without duplicates.
///
/// A node is proxied when its own name is monitored or its parent is proxied.
/// Pid cycles and dangling parents are tolerated.
pub fn detect_chain_proxy(forest: &[ProcessNode], monitored: &ProcessNameSet) -> Vec<String> {
    let mut children: HashMap<ProcessId, Vec<usize>> = HashMap::new();
    let pids: HashSet<ProcessId> = forest.iter().map(|node| node.pid).collect();
    let mut roots = Vec::new();

    for (index, node) in forest.iter().enumerate() {
        match node.parent_pid {
            Some(parent) if parent != node.pid && pids.contains(&parent) => {
                children.entry(parent).or_default().push(index);
            }
            _ => roots.push(index),
        }
    }

    let mut detected = ProcessNameSet::new();
    let mut found = Vec::new();
    let mut visited = vec![false; forest.len()];
    // Nodes caught in a parent cycle are unreachable from any root
    let starts = roots.into_iter().chain(0..forest.len());

    for start in starts {
        if visited[start] {
            continue;
        }
        let mut stack = vec![(start, false)];
        while let Some((index, parent_proxied)) = stack.pop() {
            if visited[index] {
                continue;
            }
            visited[index] = true;

            let node = &forest[index];
            let is_monitored = monitored.contains(&node.name);
            let proxied = is_monitored || parent_proxied;
            if proxied && !is_monitored && detected.insert(&node.name) {
                found.push(bare_name(&node.name).to_string());
            }

            if let Some(kids) = children.get(&node.pid) {
                stack.extend(
                    kids.iter()
                        .rev()
                        .filter(|&&kid| !visited[kid])
                        .map(|&kid| (kid, proxied)),
                );
            }
        }
    }
    found
}

struct ActiveSession {
    id: String,
    monitored: ProcessNameSet,
    detected: ProcessNameSet,
    cancel: CancellationToken,
}

struct MonitorInner {
    provider: Arc<dyn ProcessTreeProvider>,
    sink: Arc<dyn ProcessNameSink>,
    events: EventBus,
    interval: Duration,
    session: Mutex<Option<ActiveSession>>,
}

/// Polls the process tree for the single active monitoring session
#[derive(Clone)]
pub struct ProcessTreeMonitor {
    inner: Arc<MonitorInner>,
}

impl ProcessTreeMonitor {
    pub fn new(
        provider: Arc<dyn ProcessTreeProvider>,
        sink: Arc<dyn ProcessNameSink>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                provider,
                sink,
                events,
                interval,
                session: Mutex::new(None),
            }),
        }
    }

    /// Replace any running session and start polling from `roots`
    pub fn start_monitoring<I, S>(&self, session_id: &str, roots: I) -> Result<(), MonitorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(MonitorError::EmptySessionId);
        }

        let cancel = CancellationToken::new();
        let monitored: ProcessNameSet = roots.into_iter().collect();
        info!(session = %session_id, roots = ?monitored.names(), "Starting process tree monitoring");
        {
            let mut session = self.inner.lock();
            if let Some(previous) = session.take() {
                previous.cancel.cancel();
            }
            *session = Some(ActiveSession {
                id: session_id.to_string(),
                monitored,
                detected: ProcessNameSet::new(),
                cancel: cancel.clone(),
            });
        }

        let inner = self.inner.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            let first = tokio::time::Instant::now() + inner.interval;
            let mut ticks = tokio::time::interval_at(first, inner.interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = inner.poll(&id).await {
                            warn!(session = %id, error = %e, "Process tree poll failed");
                        }
                    }
                }
            }
            debug!(session = %id, "Process tree monitoring ended");
        });
        Ok(())
    }

    /// Cancel polling and forget the session
    pub fn stop_monitoring(&self) {
        if let Some(session) = self.inner.lock().take() {
            session.cancel.cancel();
            info!(session = %session.id, "Stopped process tree monitoring");
        }
    }

    /// Run one detection pass for the active session, if any
    pub async fn poll_now(&self) -> Result<Vec<String>, MonitorError> {
        let Some(id) = self.session_id() else {
            return Ok(Vec::new());
        };
        self.inner.poll(&id).await
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().as_ref().map(|session| session.id.clone())
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Descendants detected so far in the active session
    pub fn detected(&self) -> Vec<String> {
        self.inner
            .lock()
            .as_ref()
            .map(|session| session.detected.names())
            .unwrap_or_default()
    }
}

impl MonitorInner {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the names newly detected by this pass
    async fn poll(&self, session_id: &str) -> Result<Vec<String>, MonitorError> {
        let monitored = match self.lock().as_ref() {
            Some(session) if session.id == session_id => session.monitored.clone(),
            _ => return Ok(Vec::new()),
        };

        let forest = self
            .provider
            .snapshot()
            .await
            .map_err(|e| MonitorError::Snapshot(e.to_string()))?;
        let found = detect_chain_proxy(&forest, &monitored);

        let (fresh, full_set) = {
            let mut guard = self.lock();
            let Some(session) = guard.as_mut().filter(|session| session.id == session_id) else {
                debug!(session = %session_id, "Dropping stale process tree poll");
                return Ok(Vec::new());
            };
            let fresh: Vec<String> = found
                .into_iter()
                .filter(|name| session.detected.insert(name))
                .collect();
            if fresh.is_empty() {
                return Ok(fresh);
            }
            // detected processes become roots for later passes
            for name in &fresh {
                session.monitored.insert(name);
            }
            (fresh, session.monitored.names())
        };

        info!(session = %session_id, names = ?fresh, "Chain proxy processes detected");
        self.events.emit(StatusEvent::ChainProxyDetected {
            session_id: session_id.to_string(),
            names: fresh.clone(),
        });
        self.sink.submit_process_names(full_set);
        Ok(fresh)
    }
}
