//! Keeps the process-name routing and DNS rules of the persisted core
//! configuration in sync with the names the application wants proxied.

use crate::error::RuleError;
use crate::supervisor::Supervisor;
use corewarden_core::{ProcessManager, Responder, RuleSettings, Ticket, ticket};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PROCESS_NAME: &str = "process_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing left after normalization
    NoNames,
    /// The core is not running, so there is nothing to restart into
    CoreNotRunning,
}

/// What one update did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleUpdateOutcome {
    Skipped(SkipReason),
    /// The managed rules already held the same names
    Unchanged,
    /// The configuration was rewritten; `restarted` tells whether the core came back up
    Updated { restarted: bool },
}

/// Receiver of the full set of names that should be proxied
pub trait ProcessNameSink: Send + Sync {
    fn submit_process_names(&self, names: Vec<String>);
}

struct RuleJob {
    names: Vec<String>,
    reply: Responder<RuleUpdateOutcome, RuleError>,
}

/// Handle to the single worker that applies rule updates in call order
#[derive(Clone)]
pub struct RuleUpdateCoordinator {
    jobs: mpsc::UnboundedSender<RuleJob>,
}

impl RuleUpdateCoordinator {
    pub fn spawn<M: ProcessManager>(
        supervisor: Supervisor<M>,
        config_path: PathBuf,
        settings: RuleSettings,
    ) -> Self {
        let (jobs, queue) = mpsc::unbounded_channel();
        let worker = RuleWorker {
            supervisor,
            config_path,
            settings,
        };
        tokio::spawn(worker.run(queue));
        Self { jobs }
    }

    /// Queue an update of the managed process-name rules
    pub fn update_process_names<I, S>(&self, names: I) -> Ticket<RuleUpdateOutcome, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        let (reply, ticket) = ticket();
        match self.jobs.send(RuleJob { names, reply }) {
            Ok(()) => ticket,
            Err(_) => Ticket::closed(),
        }
    }
}

impl ProcessNameSink for RuleUpdateCoordinator {
    fn submit_process_names(&self, names: Vec<String>) {
        // processed in order even though nobody waits for the outcome
        drop(self.update_process_names(names));
    }
}

struct RuleWorker<M: ProcessManager> {
    supervisor: Supervisor<M>,
    config_path: PathBuf,
    settings: RuleSettings,
}

impl<M: ProcessManager> RuleWorker<M> {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<RuleJob>) {
        while let Some(job) = queue.recv().await {
            let result = self.apply(job.names).await;
            match &result {
                Ok(outcome) => debug!(outcome = ?outcome, "Rule update processed"),
                Err(e) => warn!(error = %e, "Rule update failed"),
            }
            job.reply.send(result);
        }
    }

    async fn apply(&self, names: Vec<String>) -> Result<RuleUpdateOutcome, RuleError> {
        let names = normalize_names(names);
        if names.is_empty() {
            return Ok(RuleUpdateOutcome::Skipped(SkipReason::NoNames));
        }
        if !self.supervisor.is_running() {
            debug!("Core not running, rule update skipped");
            return Ok(RuleUpdateOutcome::Skipped(SkipReason::CoreNotRunning));
        }

        let path = &self.config_path;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RuleError::Read {
                path: path.clone(),
                source,
            })?;
        let mut document: Value = serde_json::from_str(&text)?;

        if !apply_rule_fragment(&mut document, &names, &self.settings)? {
            return Ok(RuleUpdateOutcome::Unchanged);
        }

        let rendered = serde_json::to_string_pretty(&document)?;
        write_atomically(path, rendered.as_bytes()).await?;
        info!(names = names.len(), path = %path.display(), "Process-name rules updated");

        let restarted = match self.supervisor.restart(path.clone()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Restart after rule update failed");
                false
            }
        };
        Ok(RuleUpdateOutcome::Updated { restarted })
    }
}

/// Trim, drop empties, dedupe, and add a lowercase variant after each mixed-case name
pub fn normalize_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut normalized = Vec::new();
    for name in names {
        let name = name.as_ref().trim();
        if name.is_empty() {
            continue;
        }
        for variant in [name.to_string(), name.to_lowercase()] {
            if seen.insert(variant.clone()) {
                normalized.push(variant);
            }
        }
    }
    normalized
}

fn is_managed(rule: &Value, key: &str, tag: &str) -> bool {
    rule.get(PROCESS_NAME).is_some_and(Value::is_array)
        && rule.get(key).and_then(Value::as_str) == Some(tag)
}

fn lowercase_set<'a>(names: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    names.into_iter().map(str::to_lowercase).collect()
}

/// Replace the rule's names when they differ case- and order-insensitively
fn sync_names(rule: &mut Value, names: &[String]) -> bool {
    let current = rule
        .get(PROCESS_NAME)
        .and_then(Value::as_array)
        .map(|list| lowercase_set(list.iter().filter_map(Value::as_str)))
        .unwrap_or_default();
    if current == lowercase_set(names.iter().map(String::as_str)) {
        return false;
    }
    rule[PROCESS_NAME] = json!(names);
    true
}

fn object_field<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
    default: Value,
    shape: &'static str,
) -> Result<&'a mut Value, RuleError> {
    let field = parent.entry(key.to_string()).or_insert(default);
    if field.is_null() {
        return Err(RuleError::Shape(shape));
    }
    Ok(field)
}

/// Point the managed routing rule (and DNS rule, when present) at `names`.
/// Returns whether anything changed.
pub fn apply_rule_fragment(
    document: &mut Value,
    names: &[String],
    settings: &RuleSettings,
) -> Result<bool, RuleError> {
    let root = document.as_object_mut().ok_or(RuleError::Shape("root"))?;
    let mut changed = false;

    {
        let route = object_field(root, "route", json!({}), "route")?
            .as_object_mut()
            .ok_or(RuleError::Shape("route"))?;
        let rules = object_field(route, "rules", json!([]), "route.rules")?
            .as_array_mut()
            .ok_or(RuleError::Shape("route.rules"))?;

        match rules
            .iter_mut()
            .find(|rule| is_managed(rule, "outbound", &settings.proxy_outbound))
        {
            Some(rule) => changed |= sync_names(rule, names),
            None => {
                rules.insert(
                    0,
                    json!({ PROCESS_NAME: names, "outbound": settings.proxy_outbound }),
                );
                changed = true;
            }
        }
    }

    let dns_rule = root
        .get_mut("dns")
        .and_then(|dns| dns.get_mut("rules"))
        .and_then(Value::as_array_mut)
        .and_then(|rules| {
            rules
                .iter_mut()
                .find(|rule| is_managed(rule, "server", &settings.dns_server))
        });
    if let Some(rule) = dns_rule {
        changed |= sync_names(rule, names);
    }

    Ok(changed)
}

/// Write to a sibling temp file, then rename it over `path`
async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), RuleError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config.json".to_string());
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    let write_error = |source| RuleError::Write {
        path: path.to_path_buf(),
        source,
    };

    tokio::fs::write(&temp, contents).await.map_err(write_error)?;
    if let Err(source) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(write_error(source));
    }
    Ok(())
}
