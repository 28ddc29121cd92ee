//! Deterministic stage tokens
//!
//! A token is the hex SHA-256 of the canonical string
//! `"<namespace>-v<version>|<part1>|<part2>|..."`. Tokens carry no meaning
//! beyond equality: identical inputs give identical tokens, and changing any
//! part changes the token.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Bumped whenever the import stage's observable output changes shape.
pub const IMPORT_SCHEMA_VERSION: u32 = 1;
/// Bumped whenever the render stage's observable output changes shape.
pub const RENDER_SCHEMA_VERSION: u32 = 1;
/// Statistics refresh has no parameters of its own; it chains off import.
pub const ANALYZE_SCHEMA_VERSION: u32 = 1;

/// Placeholder for absent optional parameters, so `None` and `Some("")`
/// fingerprint differently.
const ABSENT: &str = "<none>";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageToken(String);

impl StageToken {
    pub fn from_recorded(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for StageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn compute_token<I, S>(namespace: &str, version: u32, parts: I) -> StageToken
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut canonical = format!("{}-v{}", namespace, version);
    for part in parts {
        canonical.push('|');
        canonical.push_str(part.as_ref());
    }

    let digest = Sha256::digest(canonical.as_bytes());
    StageToken(hex::encode(digest))
}

/// Identity of an input file: where it is, how big it is and when it last changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    pub path: PathBuf,
    pub size: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
}

impl SourceIdentity {
    pub fn of(path: &Path) -> Result<Self> {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve source path {}", path.display()))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("Failed to stat source file {}", canonical.display()))?;
        let modified = meta
            .modified()
            .with_context(|| format!("No modification time for {}", canonical.display()))?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Ok(Self {
            path: canonical,
            size: meta.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }

    fn canonical_parts(&self) -> [String; 3] {
        [
            self.path.display().to_string(),
            self.size.to_string(),
            format!("{}.{:09}", self.modified_secs, self.modified_nanos),
        ]
    }
}

/// Everything that changes what the loader writes into the database.
#[derive(Debug, Clone)]
pub struct ImportFingerprint<'a> {
    pub source: &'a SourceIdentity,
    pub cache_mb: u32,
    pub processes: u32,
    pub flat_nodes: Option<&'a Path>,
    pub extra_args: &'a [String],
}

impl ImportFingerprint<'_> {
    pub fn token(&self) -> StageToken {
        let mut parts: Vec<String> = self.source.canonical_parts().to_vec();
        parts.push(format!("cache={}", self.cache_mb));
        parts.push(format!("procs={}", self.processes));
        parts.push(format!(
            "flat_nodes={}",
            self.flat_nodes
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ABSENT.to_string())
        ));
        // Length prefix keeps ["a b"] and ["a", "b"] apart.
        parts.push(format!(
            "extra[{}]={}",
            self.extra_args.len(),
            self.extra_args.join("\u{1f}")
        ));
        compute_token("import", IMPORT_SCHEMA_VERSION, parts)
    }
}

pub fn analyze_token(import_token: &StageToken) -> StageToken {
    compute_token("analyze", ANALYZE_SCHEMA_VERSION, [import_token.as_str()])
}

/// Everything that changes which tiles land in the output directory.
#[derive(Debug, Clone)]
pub struct RenderFingerprint<'a> {
    pub import_token: &'a StageToken,
    pub style_version: u32,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub threads: u32,
    pub style_identity: &'a str,
}

impl RenderFingerprint<'_> {
    pub fn token(&self) -> StageToken {
        compute_token(
            "render",
            RENDER_SCHEMA_VERSION,
            [
                self.import_token.as_str().to_string(),
                format!("style_v={}", self.style_version),
                format!("zoom={}-{}", self.min_zoom, self.max_zoom),
                format!("threads={}", self.threads),
                format!("style={}", self.style_identity),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::io::Write;
    use tempfile::TempDir;

    fn source() -> SourceIdentity {
        SourceIdentity {
            path: PathBuf::from("/data/region.osm.pbf"),
            size: 1024,
            modified_secs: 1_700_000_000,
            modified_nanos: 0,
        }
    }

    #[test]
    fn test_compute_token_deterministic() {
        let a = compute_token("ns", 1, ["x", "y"]);
        let b = compute_token("ns", 1, ["x", "y"]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_compute_token_sensitive_to_every_component() {
        let base = compute_token("ns", 1, ["x", "y"]);
        assert_ne!(base, compute_token("other", 1, ["x", "y"]));
        assert_ne!(base, compute_token("ns", 2, ["x", "y"]));
        assert_ne!(base, compute_token("ns", 1, ["x", "z"]));
        assert_ne!(base, compute_token("ns", 1, ["y", "x"]));
        assert_ne!(base, compute_token("ns", 1, ["x"]));
    }

    #[test]
    fn test_import_token_varies_per_parameter() {
        let src = source();
        let extra = vec!["--style".to_string(), "x.style".to_string()];
        let flat = PathBuf::from("/nodes/flat.bin");
        let base = ImportFingerprint {
            source: &src,
            cache_mb: 2000,
            processes: 4,
            flat_nodes: None,
            extra_args: &[],
        };
        let token = base.token();
        assert_eq!(token, base.clone().token());

        let mut bigger_file = src.clone();
        bigger_file.size += 1;
        let mut touched = src.clone();
        touched.modified_secs += 1;
        let mut moved = src.clone();
        moved.path = PathBuf::from("/data/other.osm.pbf");

        let variants = [
            ImportFingerprint { source: &bigger_file, ..base.clone() },
            ImportFingerprint { source: &touched, ..base.clone() },
            ImportFingerprint { source: &moved, ..base.clone() },
            ImportFingerprint { cache_mb: 4000, ..base.clone() },
            ImportFingerprint { processes: 8, ..base.clone() },
            ImportFingerprint { flat_nodes: Some(&flat), ..base.clone() },
            ImportFingerprint { extra_args: &extra, ..base.clone() },
        ];
        for variant in variants {
            assert_ne!(variant.token(), token, "{:?}", variant);
        }
    }

    #[test]
    fn test_extra_args_boundaries_matter() {
        let src = source();
        let joined = vec!["a b".to_string()];
        let split = vec!["a".to_string(), "b".to_string()];
        let one = ImportFingerprint {
            source: &src,
            cache_mb: 1,
            processes: 1,
            flat_nodes: None,
            extra_args: &joined,
        };
        let two = ImportFingerprint {
            extra_args: &split,
            ..one.clone()
        };
        assert_ne!(one.token(), two.token());
    }

    #[test]
    fn test_render_token_varies_per_parameter() {
        let import = compute_token("import", 1, ["a"]);
        let other_import = compute_token("import", 1, ["b"]);
        let base = RenderFingerprint {
            import_token: &import,
            style_version: 1,
            min_zoom: 0,
            max_zoom: 10,
            threads: 4,
            style_identity: "abc",
        };
        let token = base.token();
        assert_eq!(token, base.clone().token());

        let variants = [
            RenderFingerprint { import_token: &other_import, ..base.clone() },
            RenderFingerprint { style_version: 2, ..base.clone() },
            RenderFingerprint { min_zoom: 1, ..base.clone() },
            RenderFingerprint { max_zoom: 11, ..base.clone() },
            RenderFingerprint { threads: 8, ..base.clone() },
            RenderFingerprint { style_identity: "abd", ..base.clone() },
        ];
        for variant in variants {
            assert_ne!(variant.token(), token, "{:?}", variant);
        }
    }

    #[test]
    fn test_analyze_token_chains_import() {
        let a = compute_token("import", 1, ["a"]);
        let b = compute_token("import", 1, ["b"]);
        assert_eq!(analyze_token(&a), analyze_token(&a));
        assert_ne!(analyze_token(&a), analyze_token(&b));
    }

    #[test]
    fn test_source_identity_tracks_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extract.osm.pbf");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"pbf").unwrap();
        drop(file);

        set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
        let first = SourceIdentity::of(&path).unwrap();
        assert_eq!(first.size, 3);
        assert_eq!(first.modified_secs, 1_600_000_000);
        assert_eq!(first, SourceIdentity::of(&path).unwrap());

        set_file_mtime(&path, FileTime::from_unix_time(1_600_000_100, 0)).unwrap();
        let second = SourceIdentity::of(&path).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_source_identity_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(SourceIdentity::of(&dir.path().join("missing.pbf")).is_err());
    }
}
