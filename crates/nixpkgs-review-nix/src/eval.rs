//! Attribute evaluation
//!
//! Evaluates attribute names for a system with `nix eval` and turns the raw
//! output into [`Attr`] records. Names are evaluated in chunks to bound the
//! evaluator's memory; chunking does not change the result.

use crate::attr::{Attr, AttrsPerSystem, System};
use crate::error::NixError;
use crate::store::NixContext;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Maximum number of attribute names per `nix eval` invocation
pub const EVAL_CHUNK_SIZE: usize = 4096;

/// Environment variable `evalAttrs.nix` reads the nixpkgs config path from
pub const NIXPKGS_CONFIG_ENV: &str = "NIXPKGS_CONFIG";

/// Nix features a review may opt into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedFeatures {
    /// Allow import-from-derivation
    pub ifd: bool,
    /// Allow URL literals
    pub url_literals: bool,
}

impl AllowedFeatures {
    /// Value for `--extra-experimental-features`
    pub fn experimental_features(&self) -> &'static str {
        if self.url_literals {
            "nix-command"
        } else {
            "nix-command no-url-literals"
        }
    }

    /// The import-from-derivation switch
    pub fn ifd_flag(&self) -> &'static str {
        if self.ifd {
            "--allow-import-from-derivation"
        } else {
            "--no-allow-import-from-derivation"
        }
    }
}

/// Options shared by every evaluation of a review
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Allowed nix features
    pub allow: AllowedFeatures,
    /// Value passed to `--nix-path`
    pub nix_path: String,
    /// Path to the installed `evalAttrs.nix`
    pub eval_script: PathBuf,
    /// Attribute names per evaluator invocation
    pub chunk_size: usize,
    /// If set, the merged raw evaluator output is written to
    /// `<dir>/eval-<system>.json`
    pub raw_output_dir: Option<PathBuf>,
    /// nixpkgs config file handed to the evaluator via `NIXPKGS_CONFIG`.
    /// Without one the evaluator uses an empty config.
    pub nixpkgs_config: Option<PathBuf>,
}

impl EvalOptions {
    /// Options with default chunking and no raw output cache
    pub fn new(nix_path: impl Into<String>, eval_script: impl Into<PathBuf>) -> Self {
        EvalOptions {
            allow: AllowedFeatures::default(),
            nix_path: nix_path.into(),
            eval_script: eval_script.into(),
            chunk_size: EVAL_CHUNK_SIZE,
            raw_output_dir: None,
            nixpkgs_config: None,
        }
    }
}

/// One entry of the evaluator's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalEntry {
    pub exists: bool,
    pub broken: bool,
    #[serde(rename = "drvPath", default)]
    pub drv_path: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

/// Raw evaluator output, merged across chunks
pub type EvalOutput = BTreeMap<String, EvalEntry>;

/// Evaluate `attrs` for `system`
///
/// An empty set returns no records without invoking the evaluator. Fails
/// with [`NixError::Evaluation`] if the evaluator exits non-zero.
pub async fn nix_eval(
    ctx: &NixContext,
    attrs: &BTreeSet<String>,
    system: &str,
    options: &EvalOptions,
) -> Result<Vec<Attr>> {
    if attrs.is_empty() {
        info!(system, "Nothing to evaluate");
        return Ok(Vec::new());
    }

    let names: Vec<&str> = attrs.iter().map(String::as_str).collect();
    let chunk_size = options.chunk_size.max(1);

    let mut raw = EvalOutput::new();
    for (i, chunk) in names.chunks(chunk_size).enumerate() {
        debug!(system, chunk = i, size = chunk.len(), "Evaluating chunk");
        let output = eval_chunk(ctx, chunk, system, options).await?;
        raw.extend(output);
    }

    if let Some(dir) = &options.raw_output_dir {
        write_raw_output(dir, system, &raw)?;
    }

    Ok(eval_filter(raw))
}

async fn eval_chunk(
    ctx: &NixContext,
    names: &[&str],
    system: &str,
    options: &EvalOptions,
) -> Result<EvalOutput> {
    let mut attr_file = tempfile::Builder::new()
        .prefix("nixpkgs-review-attrs-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer(&mut attr_file, names)?;
    attr_file.flush()?;

    let args = eval_args(system, options, attr_file.path());
    let mut command = Command::new(ctx.program());
    command
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    match &options.nixpkgs_config {
        Some(config) => command.env(NIXPKGS_CONFIG_ENV, config),
        None => command.env_remove(NIXPKGS_CONFIG_ENV),
    };
    let output = command
        .output()
        .await
        .map_err(|e| NixError::from_spawn(ctx.program(), e))?;

    if !output.status.success() {
        let command = render_command(ctx.program(), &args);
        let (_, attr_file) = attr_file.keep().map_err(|e| NixError::Io(e.error))?;
        error!(system, %command, "Evaluation failed");
        return Err(NixError::Evaluation { command, attr_file });
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| NixError::InvalidEvalOutput(format!("{system}: {e}")))
}

fn eval_args(system: &str, options: &EvalOptions, attr_file: &Path) -> Vec<String> {
    vec![
        "--extra-experimental-features".to_string(),
        options.allow.experimental_features().to_string(),
        "--system".to_string(),
        system.to_string(),
        "eval".to_string(),
        "--nix-path".to_string(),
        options.nix_path.clone(),
        "--json".to_string(),
        "--impure".to_string(),
        options.allow.ifd_flag().to_string(),
        "--expr".to_string(),
        format!(
            "(import {} {{ attr-json = {}; }})",
            options.eval_script.display(),
            attr_file.display()
        ),
    ]
}

pub(crate) fn render_command(program: &Path, args: &[String]) -> String {
    std::iter::once(program.display().to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_raw_output(dir: &Path, system: &str, raw: &EvalOutput) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("eval-{system}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(raw)?)?;
    debug!(path = %path.display(), "Wrote raw evaluation output");
    Ok(())
}

/// Turn raw evaluator output into records.
///
/// Attributes sharing an output path collapse into one record under the
/// shortest name; the others become its aliases. On equal length the first
/// seen name stays canonical. Entries without an output path are appended
/// afterwards in encounter order.
pub fn eval_filter(raw: EvalOutput) -> Vec<Attr> {
    let mut canonical: Vec<Attr> = Vec::new();
    let mut by_path: HashMap<PathBuf, usize> = HashMap::new();
    let mut without_path = Vec::new();

    for (name, entry) in raw {
        let mut attr = Attr::new(name, entry.exists, entry.broken);
        attr.drv_path = entry.drv_path;
        attr.position = entry.position;
        attr.path = entry.path.map(PathBuf::from);

        let Some(path) = attr.path.clone() else {
            without_path.push(attr);
            continue;
        };

        match by_path.get(&path) {
            None => {
                by_path.insert(path, canonical.len());
                canonical.push(attr);
            }
            Some(&idx) => {
                let other = &mut canonical[idx];
                if other.name.len() > attr.name.len() {
                    let mut previous = std::mem::replace(other, attr);
                    other.aliases.push(previous.name);
                    other.aliases.append(&mut previous.aliases);
                } else {
                    other.aliases.push(attr.name);
                }
            }
        }
    }

    canonical.extend(without_path);
    canonical
}

/// Evaluate several systems concurrently, at most `n_threads` at a time.
///
/// Every system runs to completion; if any of them failed, the first error is
/// returned once all are done.
pub async fn multi_system_eval(
    ctx: &NixContext,
    attr_names_per_system: &BTreeMap<System, BTreeSet<String>>,
    options: &EvalOptions,
    n_threads: usize,
) -> Result<AttrsPerSystem> {
    let permits = Arc::new(Semaphore::new(n_threads.max(1)));
    let mut tasks = JoinSet::new();

    for (system, attrs) in attr_names_per_system {
        let ctx = ctx.clone();
        let options = options.clone();
        let permits = Arc::clone(&permits);
        let system = system.clone();
        let attrs = attrs.clone();

        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            info!(system = %system, attrs = attrs.len(), "Evaluating attributes");
            let result = nix_eval(&ctx, &attrs, &system, &options).await;
            (system, result)
        });
    }

    let mut results = AttrsPerSystem::new();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let (system, result) = joined
            .map_err(|e| NixError::CommandFailed(format!("evaluation task failed: {e}")))?;
        match result {
            Ok(attrs) => {
                results.insert(system, attrs);
            }
            Err(e) => {
                error!(system = %system, error = %e, "Evaluation failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: Option<&str>) -> EvalEntry {
        EvalEntry {
            exists: true,
            broken: path.is_none(),
            drv_path: path.map(|p| format!("{p}.drv")),
            path: path.map(str::to_string),
            position: None,
        }
    }

    #[test]
    fn test_alias_keeps_shortest_name() {
        let mut raw = EvalOutput::new();
        raw.insert("a".to_string(), entry(Some("/nix/store/p")));
        raw.insert("ab".to_string(), entry(Some("/nix/store/p")));

        let attrs = eval_filter(raw);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].name, "a");
        assert_eq!(attrs[0].aliases, vec!["ab".to_string()]);
    }

    #[test]
    fn test_alias_shorter_challenger_takes_over() {
        // the longer name sorts first, so the shorter one arrives as challenger
        let mut raw = EvalOutput::new();
        raw.insert("aaaa".to_string(), entry(Some("/nix/store/p")));
        raw.insert("b".to_string(), entry(Some("/nix/store/p")));
        raw.insert("cc".to_string(), entry(Some("/nix/store/p")));

        let attrs = eval_filter(raw);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].name, "b");
        assert_eq!(attrs[0].aliases, vec!["aaaa".to_string(), "cc".to_string()]);
    }

    #[test]
    fn test_alias_tie_keeps_first_seen() {
        let mut raw = EvalOutput::new();
        raw.insert("xa".to_string(), entry(Some("/nix/store/p")));
        raw.insert("xb".to_string(), entry(Some("/nix/store/p")));

        let attrs = eval_filter(raw);
        assert_eq!(attrs[0].name, "xa");
        assert_eq!(attrs[0].aliases, vec!["xb".to_string()]);
    }

    #[test]
    fn test_pathless_entries_come_last() {
        let mut raw = EvalOutput::new();
        raw.insert("a-broken".to_string(), entry(None));
        raw.insert("b".to_string(), entry(Some("/nix/store/b")));
        raw.insert("c-broken".to_string(), entry(None));

        let names: Vec<String> = eval_filter(raw).into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["b", "a-broken", "c-broken"]);
    }

    #[test]
    fn test_filter_marks_blacklisted() {
        let mut raw = EvalOutput::new();
        raw.insert("tests.trivial".to_string(), entry(Some("/nix/store/t")));
        let attrs = eval_filter(raw);
        assert!(attrs[0].blacklisted);
    }

    #[test]
    fn test_entry_parses_evaluator_json() {
        let json = r#"{
            "hello": {"exists": true, "broken": false, "drvPath": "/nix/store/x-hello.drv",
                      "path": "/nix/store/y-hello", "position": "pkgs/hello/default.nix:10"},
            "gone": {"exists": false, "broken": true, "drvPath": null, "path": null}
        }"#;
        let raw: EvalOutput = serde_json::from_str(json).unwrap();
        let attrs = eval_filter(raw);

        assert_eq!(attrs[0].name, "hello");
        assert_eq!(attrs[0].drv_path.as_deref(), Some("/nix/store/x-hello.drv"));
        assert_eq!(attrs[0].position.as_deref(), Some("pkgs/hello/default.nix:10"));
        assert_eq!(attrs[1].name, "gone");
        assert!(!attrs[1].exists);
    }

    #[test]
    fn test_allowed_features_flags() {
        let none = AllowedFeatures::default();
        assert_eq!(none.experimental_features(), "nix-command no-url-literals");
        assert_eq!(none.ifd_flag(), "--no-allow-import-from-derivation");

        let all = AllowedFeatures {
            ifd: true,
            url_literals: true,
        };
        assert_eq!(all.experimental_features(), "nix-command");
        assert_eq!(all.ifd_flag(), "--allow-import-from-derivation");
    }

    #[test]
    fn test_eval_args_reference_attr_file() {
        let options = EvalOptions::new("nixpkgs=/src", "/share/evalAttrs.nix");
        let args = eval_args("aarch64-linux", &options, Path::new("/tmp/attrs.json"));

        assert_eq!(args[3], "aarch64-linux");
        assert!(args.contains(&"--impure".to_string()));
        assert_eq!(
            args.last().unwrap(),
            "(import /share/evalAttrs.nix { attr-json = /tmp/attrs.json; })"
        );
    }
}
