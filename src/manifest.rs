use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ManifestError, ResolutionError};
use crate::registry;

pub const MANIFEST_FILE: &str = "modkit.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub require: Vec<Require>,
    #[serde(default)]
    pub replace: Vec<Replace>,
    #[serde(default)]
    pub source: Vec<Source>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Require {
    pub module: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Replace {
    pub module: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub module: String,
    pub url: String,
}

impl Manifest {
    pub fn parse(toml_text: &str, path: &Path) -> Result<Self, ManifestError> {
        let mf: Manifest =
            toml::from_str(toml_text).map_err(|source| ManifestError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        if mf.module.trim().is_empty() {
            return Err(ManifestError::MissingIdentity {
                path: path.to_path_buf(),
            });
        }
        Ok(mf)
    }

    pub fn load(path: &Path) -> Result<(Self, String), ManifestError> {
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mf = Self::parse(&text, path)?;
        Ok((mf, text))
    }

    /// Walk upward from `start` to the nearest directory containing a manifest.
    pub fn find_root(start: &Path) -> Result<PathBuf, ManifestError> {
        let mut p = start.to_path_buf();
        loop {
            if p.join(MANIFEST_FILE).exists() {
                return Ok(p);
            }
            if !p.pop() {
                break;
            }
        }
        Err(ManifestError::NotFound {
            start: start.to_path_buf(),
        })
    }

    /// Explicit `[[source]]` entry for `module`, if any.
    pub fn explicit_source_for(&self, module: &str) -> Option<String> {
        self.source
            .iter()
            .find(|s| s.module == module)
            .map(|s| s.url.clone())
    }

    /// Registry base URL for `module`: explicit `[[source]]` entry, or the
    /// default derived from the module identity.
    pub fn source_url_for(&self, module: &str) -> String {
        self.explicit_source_for(module)
            .unwrap_or_else(|| registry::default_source_url(module))
    }

    /// Override map for the resolver. Two overrides naming the same module
    /// with different paths are ambiguous; identical duplicates collapse.
    pub fn replace_map(&self) -> Result<BTreeMap<String, PathBuf>, ResolutionError> {
        let mut out = BTreeMap::new();
        for r in &self.replace {
            let path = PathBuf::from(&r.path);
            if let Some(prev) = out.insert(r.module.clone(), path.clone())
                && prev != path
            {
                return Err(ResolutionError::AmbiguousOverride {
                    module: r.module.clone(),
                    first: prev,
                    second: path,
                });
            }
        }
        Ok(out)
    }

    pub fn to_pretty_toml(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("module = {:?}\n", self.module));

        if !self.require.is_empty() {
            out.push('\n');
            for r in &self.require {
                out.push_str("[[require]]\n");
                out.push_str(&format!("module = {:?}\n", r.module));
                out.push_str(&format!("version = {:?}\n\n", r.version));
            }
        }

        if !self.replace.is_empty() {
            out.push('\n');
            for r in &self.replace {
                out.push_str("[[replace]]\n");
                out.push_str(&format!("module = {:?}\n", r.module));
                out.push_str(&format!("path = {:?}\n\n", r.path));
            }
        }

        if !self.source.is_empty() {
            out.push('\n');
            for s in &self.source {
                out.push_str("[[source]]\n");
                out.push_str(&format!("module = {:?}\n", s.module));
                out.push_str(&format!("url = {:?}\n\n", s.url));
            }
        }

        if !out.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    pub fn sort_deterministic(&mut self) {
        self.require.sort_by(|a, b| a.module.cmp(&b.module));
        self.replace.sort_by(|a, b| a.module.cmp(&b.module));
        self.source.sort_by(|a, b| a.module.cmp(&b.module));
    }
}

/// Checksum of the manifest bytes, recorded in the lock file so stale locks
/// are detected without re-running resolution.
pub fn manifest_checksum(text: &str) -> String {
    let mut h = Sha256::new();
    h.update(text.as_bytes());
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_requires_replaces_and_sources() {
        let text = r#"
module = "example.com/acme/app"

[[require]]
module = "example.com/acme/greeter"
version = "^1.0.0"

[[replace]]
module = "example.com/acme/greeter"
path = "../greeter"

[[source]]
module = "example.com/acme/greeter"
url = "file:///srv/registry"
"#;
        let mf = Manifest::parse(text, Path::new(MANIFEST_FILE)).expect("parse");
        assert_eq!(mf.module, "example.com/acme/app");
        assert_eq!(mf.require.len(), 1);
        assert_eq!(mf.require[0].version, "^1.0.0");
        assert_eq!(
            mf.source_url_for("example.com/acme/greeter"),
            "file:///srv/registry"
        );
        assert_eq!(
            mf.source_url_for("example.com/other/lib"),
            "https://example.com"
        );
    }

    #[test]
    fn missing_identity_is_its_own_error() {
        let err = Manifest::parse("require = []\n", Path::new(MANIFEST_FILE))
            .expect_err("missing module");
        assert!(matches!(err, ManifestError::MissingIdentity { .. }));
    }

    #[test]
    fn malformed_toml_is_reported_with_path() {
        let err =
            Manifest::parse("module = [broken", Path::new(MANIFEST_FILE)).expect_err("malformed");
        assert!(matches!(err, ManifestError::Malformed { .. }));
        assert!(err.to_string().contains(MANIFEST_FILE));
    }

    #[test]
    fn pretty_toml_round_trips() {
        let text = "module = \"example.com/acme/app\"\n\n[[require]]\nmodule = \"example.com/acme/greeter\"\nversion = \"^1.0.0\"\n";
        let mf = Manifest::parse(text, Path::new(MANIFEST_FILE)).expect("parse");
        let again =
            Manifest::parse(&mf.to_pretty_toml(), Path::new(MANIFEST_FILE)).expect("reparse");
        assert_eq!(again.module, mf.module);
        assert_eq!(again.require.len(), 1);
        assert_eq!(again.require[0].module, "example.com/acme/greeter");
    }

    #[test]
    fn conflicting_overrides_are_ambiguous() {
        let text = r#"
module = "example.com/acme/app"

[[replace]]
module = "example.com/acme/greeter"
path = "../greeter"

[[replace]]
module = "example.com/acme/greeter"
path = "../other"
"#;
        let mf = Manifest::parse(text, Path::new(MANIFEST_FILE)).expect("parse");
        let err = mf.replace_map().expect_err("ambiguous");
        assert!(matches!(err, ResolutionError::AmbiguousOverride { .. }));
    }

    #[test]
    fn duplicate_identical_overrides_collapse() {
        let text = r#"
module = "example.com/acme/app"

[[replace]]
module = "example.com/acme/greeter"
path = "../greeter"

[[replace]]
module = "example.com/acme/greeter"
path = "../greeter"
"#;
        let mf = Manifest::parse(text, Path::new(MANIFEST_FILE)).expect("parse");
        let map = mf.replace_map().expect("collapse");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn manifest_checksum_tracks_content() {
        let a = manifest_checksum("module = \"a\"\n");
        let b = manifest_checksum("module = \"a\"\n");
        let c = manifest_checksum("module = \"c\"\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
