//! Result links and error logs on disk
//!
//! Output directories are created on first use, so a run without failures
//! leaves no empty `failed_results/` or `logs/` behind.

use crate::classify::SystemReport;
use crate::error::ReportError;
use crate::Result;
use nixpkgs_review_nix::{AttrsPerSystem, BuildLogSource, LogOptions, System};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A directory that is created the first time it is needed
#[derive(Debug)]
struct LazyDirectory {
    path: PathBuf,
    created: bool,
}

impl LazyDirectory {
    fn new(path: PathBuf) -> Self {
        LazyDirectory {
            path,
            created: false,
        }
    }

    fn ensure(&mut self) -> Result<&Path> {
        if !self.created {
            std::fs::create_dir_all(&self.path).map_err(ReportError::write(&self.path))?;
            self.created = true;
        }
        Ok(&self.path)
    }
}

/// Link every evaluated, non-blacklisted output into `results/` when it was
/// verified and into `failed_results/` otherwise. Links are named
/// `<attr>-<system>` and replace existing entries of the same name.
pub fn write_result_links(attrs_per_system: &AttrsPerSystem, directory: &Path) -> Result<()> {
    let mut results = LazyDirectory::new(directory.join("results"));
    let mut failed_results = LazyDirectory::new(directory.join("failed_results"));

    for (system, attrs) in attrs_per_system {
        for attr in attrs {
            // broken attributes have no derivation
            if attr.blacklisted || attr.drv_path.is_none() {
                continue;
            }
            let Some(path) = attr.path.as_deref().filter(|p| p.exists()) else {
                continue;
            };

            let parent = if attr.was_built() {
                results.ensure()?
            } else {
                failed_results.ensure()?
            };
            let link = parent.join(format!("{}-{system}", attr.name));
            if std::fs::symlink_metadata(&link).is_ok() {
                std::fs::remove_file(&link).map_err(ReportError::write(&link))?;
            }
            std::os::unix::fs::symlink(path, &link).map_err(ReportError::write(&link))?;
            debug!(link = %link.display(), target = %path.display(), "Linked result");
        }
    }
    Ok(())
}

/// Write the build log of every failed record to `logs/<attr>-<system>.log`
pub async fn write_error_logs(
    system_reports: &[(System, SystemReport)],
    directory: &Path,
    source: &dyn BuildLogSource,
    options: LogOptions,
) -> Result<()> {
    let mut logs = LazyDirectory::new(directory.join("logs"));

    for (system, report) in system_reports {
        for attr in &report.failed {
            let file = logs.ensure()?.join(format!("{}-{system}.log", attr.name));
            let content = attr.log(source, options).await.unwrap_or_default();
            tokio::fs::write(&file, content)
                .await
                .map_err(ReportError::write(&file))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixpkgs_review_nix::Attr;

    fn attr_at(name: &str, path: &Path, verified: bool) -> Attr {
        let mut attr =
            Attr::new(name, true, false).with_paths(path, format!("/nix/store/{name}.drv"));
        attr.path_verified = Some(verified);
        attr
    }

    #[test]
    fn test_links_split_by_verification() {
        let out = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let good = store.path().join("good");
        let bad = store.path().join("bad");
        std::fs::create_dir(&good).unwrap();
        std::fs::create_dir(&bad).unwrap();

        let mut attrs = AttrsPerSystem::new();
        attrs.insert(
            "x86_64-linux".to_string(),
            vec![
                attr_at("good", &good, true),
                attr_at("bad", &bad, false),
                attr_at("missing", &store.path().join("missing"), true),
                attr_at("tests.trivial", &good, true),
            ],
        );

        write_result_links(&attrs, out.path()).unwrap();
        // a second run replaces the links
        write_result_links(&attrs, out.path()).unwrap();

        let good_link = out.path().join("results/good-x86_64-linux");
        assert_eq!(std::fs::read_link(&good_link).unwrap(), good);
        let bad_link = out.path().join("failed_results/bad-x86_64-linux");
        assert_eq!(std::fs::read_link(&bad_link).unwrap(), bad);
        assert!(!out.path().join("results/missing-x86_64-linux").exists());
        let blacklisted = out.path().join("results/tests.trivial-x86_64-linux");
        assert!(std::fs::symlink_metadata(blacklisted).is_err());
    }

    #[test]
    fn test_no_directories_without_entries() {
        let out = tempfile::tempdir().unwrap();
        let mut attrs = AttrsPerSystem::new();
        attrs.insert("x86_64-linux".to_string(), vec![Attr::new("broken", true, true)]);

        write_result_links(&attrs, out.path()).unwrap();
        assert!(!out.path().join("results").exists());
        assert!(!out.path().join("failed_results").exists());
    }
}
