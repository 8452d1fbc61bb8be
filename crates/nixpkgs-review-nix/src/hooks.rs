//! Pre-build filter hooks
//!
//! External executables that may rewrite the evaluated records before the
//! build, e.g. to skip expensive packages when time is short. Each hook runs
//! once per review and gets the records of every system as one JSON array on
//! stdin. An element is an [`Attr`] with an extra `system` field. The hook must
//! print an array of the same schema on stdout. Hooks run in order, each one
//! consuming the previous hook's output.

use crate::attr::{Attr, AttrsPerSystem, System};
use crate::error::NixError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Environment variable holding the colon-separated hook list
pub const PRE_BUILD_FILTER_ENV: &str = "NIXPKGS_REVIEW_PRE_BUILD_FILTER";

/// One element of the hook document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRecord {
    pub system: System,
    #[serde(flatten)]
    pub attr: Attr,
}

/// Ordered list of filter hooks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreBuildFilter {
    hooks: Vec<PathBuf>,
}

impl PreBuildFilter {
    /// Parse a colon-separated list of executables; empty segments are ignored
    pub fn parse(spec: &str) -> Self {
        PreBuildFilter {
            hooks: spec
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect(),
        }
    }

    /// Read [`PRE_BUILD_FILTER_ENV`]
    pub fn from_env() -> Self {
        std::env::var(PRE_BUILD_FILTER_ENV)
            .map(|spec| Self::parse(&spec))
            .unwrap_or_default()
    }

    /// Configured hooks, in run order
    pub fn hooks(&self) -> &[PathBuf] {
        &self.hooks
    }

    /// Whether no hooks are configured
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook over the records of all systems
    pub async fn apply(&self, attrs_per_system: AttrsPerSystem) -> Result<AttrsPerSystem> {
        if self.hooks.is_empty() {
            return Ok(attrs_per_system);
        }

        let systems: Vec<System> = attrs_per_system.keys().cloned().collect();
        let mut records = flatten_records(attrs_per_system);
        for hook in &self.hooks {
            let before = records.len();
            records = run_hook(hook, &records).await?;
            if let Some(record) = records.iter().find(|r| !systems.contains(&r.system)) {
                return Err(NixError::Hook {
                    hook: hook.clone(),
                    reason: format!("returned a record for unknown system '{}'", record.system),
                });
            }
            info!(
                hook = %hook.display(),
                before,
                after = records.len(),
                skipped = records.iter().filter(|r| r.attr.skipped).count(),
                "Applied pre-build filter"
            );
        }
        Ok(group_records(records, &systems))
    }
}

/// Flatten per-system records into the hook document, systems in key order
pub fn flatten_records(attrs_per_system: AttrsPerSystem) -> Vec<HookRecord> {
    attrs_per_system
        .into_iter()
        .flat_map(|(system, attrs)| {
            attrs.into_iter().map(move |attr| HookRecord {
                system: system.clone(),
                attr,
            })
        })
        .collect()
}

/// Regroup hook output by system, keeping the hook's record order. Every
/// system in `systems` is kept, even when the hooks removed all of its records.
pub fn group_records(records: Vec<HookRecord>, systems: &[System]) -> AttrsPerSystem {
    let mut grouped: AttrsPerSystem = systems
        .iter()
        .map(|system| (system.clone(), Vec::new()))
        .collect();
    for record in records {
        grouped.entry(record.system).or_default().push(record.attr);
    }
    grouped
}

async fn run_hook(hook: &Path, records: &[HookRecord]) -> Result<Vec<HookRecord>> {
    let payload = serde_json::to_vec(records)?;
    debug!(hook = %hook.display(), bytes = payload.len(), "Running pre-build filter");

    let mut child = Command::new(hook)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| NixError::from_spawn(hook, e))?;

    // Feed stdin concurrently so a hook that streams its output cannot
    // deadlock against a full pipe.
    let mut stdin = child.stdin.take().ok_or_else(|| NixError::Hook {
        hook: hook.to_path_buf(),
        reason: "stdin was not captured".to_string(),
    })?;
    let writer = tokio::spawn(async move {
        let result = stdin.write_all(&payload).await;
        drop(stdin);
        result
    });

    let output = child.wait_with_output().await?;
    let written = writer.await.map_err(|e| NixError::Hook {
        hook: hook.to_path_buf(),
        reason: format!("writer task failed: {e}"),
    })?;

    if !output.status.success() {
        return Err(NixError::Hook {
            hook: hook.to_path_buf(),
            reason: format!("exited with {}", output.status),
        });
    }
    // A hook may legitimately stop reading early; only report a broken pipe
    // if it also failed to answer.
    if let Err(e) = written {
        if output.stdout.is_empty() {
            return Err(NixError::Hook {
                hook: hook.to_path_buf(),
                reason: format!("could not write records: {e}"),
            });
        }
    }

    serde_json::from_slice(&output.stdout).map_err(|e| NixError::Hook {
        hook: hook.to_path_buf(),
        reason: format!("invalid output: {e}"),
    })
}
