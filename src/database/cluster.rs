//! Engine cluster metadata and persistent data directory linking

use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Present in every initialized data directory.
pub const VERSION_MARKER: &str = "PG_VERSION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub version: String,
    pub name: String,
    pub owner: String,
    pub data_dir: PathBuf,
}

impl ClusterInfo {
    /// Parses the first cluster from `pg_lsclusters --no-header` output:
    /// `<version> <cluster> <port> <status> <owner> <data dir> <log file>`.
    pub fn parse_lsclusters(output: &str) -> PipelineResult<Self> {
        let line = output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| {
                PipelineError::precondition("No database engine cluster found (pg_lsclusters printed nothing)")
            })?;

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(PipelineError::precondition(format!(
                "Cannot determine database engine data directory from: '{}'",
                line
            )));
        }

        Ok(Self {
            version: fields[0].to_string(),
            name: fields[1].to_string(),
            owner: fields[4].to_string(),
            data_dir: PathBuf::from(fields[5]),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkOutcome {
    /// The persistent directory was seeded from the engine's default location.
    pub seeded: bool,
    /// The default location was replaced with a link to the persistent one.
    pub linked: bool,
}

/// Makes `default_dir` resolve to `persistent_dir`.
///
/// The persistent directory is seeded with a copy of the default one only when
/// it has no [`VERSION_MARKER`] yet, so an existing database is never
/// overwritten. The default location is replaced with a symlink only when it
/// does not already resolve to the persistent directory.
pub fn link_data_dir(default_dir: &Path, persistent_dir: &Path) -> PipelineResult<LinkOutcome> {
    let mut outcome = LinkOutcome::default();

    if default_dir == persistent_dir {
        debug!("Data directory already at persistent location");
        return Ok(outcome);
    }

    fs::create_dir_all(persistent_dir)
        .with_context(|| format!("Failed to create {}", persistent_dir.display()))?;

    if !persistent_dir.join(VERSION_MARKER).exists() {
        if !default_dir.join(VERSION_MARKER).exists() {
            return Err(PipelineError::precondition(format!(
                "Neither {} nor {} holds an initialized data directory ({} missing)",
                default_dir.display(),
                persistent_dir.display(),
                VERSION_MARKER
            )));
        }
        info!(
            from = %default_dir.display(),
            to = %persistent_dir.display(),
            "Seeding persistent data directory"
        );
        copy_tree(default_dir, persistent_dir)?;
        outcome.seeded = true;
    }

    if resolves_to(default_dir, persistent_dir) {
        debug!(path = %default_dir.display(), "Default data directory already linked");
        return Ok(outcome);
    }

    remove_path(default_dir)?;
    if let Some(parent) = default_dir.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    symlink(persistent_dir, default_dir).with_context(|| {
        format!(
            "Failed to link {} -> {}",
            default_dir.display(),
            persistent_dir.display()
        )
    })?;
    info!(
        link = %default_dir.display(),
        target = %persistent_dir.display(),
        "Linked default data directory to persistent location"
    );
    outcome.linked = true;

    Ok(outcome)
}

fn resolves_to(link: &Path, target: &Path) -> bool {
    match (link.canonicalize(), target.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
    }
}

/// Recursive copy that keeps file modes and recreates symlinks as symlinks.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", from.display()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .context("Walked outside of source tree")?;
        let dest = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
            symlink(&target, &dest)
                .with_context(|| format!("Failed to create link {}", dest.display()))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
            let perms = entry.metadata()?.permissions();
            fs::set_permissions(&dest, perms)?;
        } else {
            fs::copy(entry.path(), &dest).with_context(|| {
                format!(
                    "Failed to copy {} -> {}",
                    entry.path().display(),
                    dest.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_cluster(dir: &Path) {
        fs::create_dir_all(dir.join("base")).unwrap();
        fs::write(dir.join(VERSION_MARKER), "16\n").unwrap();
        fs::write(dir.join("base").join("1"), "data").unwrap();
    }

    #[test]
    fn test_parse_lsclusters() {
        let out = "16  main    5432 down   postgres /var/lib/postgresql/16/main /var/log/postgresql/postgresql-16-main.log\n";
        let info = ClusterInfo::parse_lsclusters(out).unwrap();
        assert_eq!(info.version, "16");
        assert_eq!(info.name, "main");
        assert_eq!(info.owner, "postgres");
        assert_eq!(info.data_dir, PathBuf::from("/var/lib/postgresql/16/main"));
    }

    #[test]
    fn test_parse_lsclusters_empty_is_precondition() {
        let err = ClusterInfo::parse_lsclusters("\n").unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
        assert!(ClusterInfo::parse_lsclusters("16 main").is_err());
    }

    #[test]
    fn test_first_run_seeds_and_links() {
        let tmp = TempDir::new().unwrap();
        let default_dir = tmp.path().join("lib/16/main");
        let persistent = tmp.path().join("persistent");
        init_cluster(&default_dir);

        let outcome = link_data_dir(&default_dir, &persistent).unwrap();
        assert_eq!(outcome, LinkOutcome { seeded: true, linked: true });
        assert!(persistent.join(VERSION_MARKER).exists());
        assert_eq!(fs::read_to_string(persistent.join("base/1")).unwrap(), "data");
        assert!(fs::symlink_metadata(&default_dir).unwrap().file_type().is_symlink());
        assert_eq!(
            default_dir.canonicalize().unwrap(),
            persistent.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_second_run_is_noop() {
        let tmp = TempDir::new().unwrap();
        let default_dir = tmp.path().join("main");
        let persistent = tmp.path().join("persistent");
        init_cluster(&default_dir);

        link_data_dir(&default_dir, &persistent).unwrap();
        let again = link_data_dir(&default_dir, &persistent).unwrap();
        assert_eq!(again, LinkOutcome::default());
    }

    #[test]
    fn test_existing_persistent_data_is_not_overwritten() {
        let tmp = TempDir::new().unwrap();
        let default_dir = tmp.path().join("main");
        let persistent = tmp.path().join("persistent");
        init_cluster(&default_dir);
        init_cluster(&persistent);
        fs::write(persistent.join("base/1"), "precious").unwrap();

        let outcome = link_data_dir(&default_dir, &persistent).unwrap();
        assert!(!outcome.seeded);
        assert!(outcome.linked);
        assert_eq!(
            fs::read_to_string(default_dir.join("base/1")).unwrap(),
            "precious"
        );
    }

    #[test]
    fn test_nothing_to_seed_from() {
        let tmp = TempDir::new().unwrap();
        let err = link_data_dir(&tmp.path().join("main"), &tmp.path().join("persistent"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
    }

    #[test]
    fn test_same_location_untouched() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("main");
        init_cluster(&dir);
        assert_eq!(link_data_dir(&dir, &dir).unwrap(), LinkOutcome::default());
        assert!(dir.is_dir());
    }
}
