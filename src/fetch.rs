// Purpose: Materialize resolved (identity, version) keys into the shared module cache.
// Inputs/Outputs: Registry archives in, verified cache directories out.
// Invariants: At most one in-flight fetch per key; a cache hit touches no registry.
// Gotchas: Identity verification happens before the tmp dir is renamed into place.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cache::{ensure_dir, module_dir};
use crate::config::Config;
use crate::error::{Error, FetchError, IntegrityError, Result};
use crate::manifest::{MANIFEST_FILE, Manifest};
use crate::registry::{self, Source};

pub struct Fetcher<'a> {
    config: &'a Config,
    inflight: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl<'a> Fetcher<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, module: &str, version: &str) -> Arc<Mutex<()>> {
        let mut map = self.inflight.lock().expect("inflight table poisoned");
        map.entry((module.to_string(), version.to_string()))
            .or_default()
            .clone()
    }

    /// List version labels for `module`, retrying transient failures.
    pub fn list_versions(&self, module: &str, source_url: &str) -> Result<Vec<String>> {
        let source = registry::parse_source(source_url);
        if self.config.offline && matches!(source, Source::Http(_)) {
            return Err(FetchError::Offline {
                module: module.to_string(),
                version: "(unresolved)".to_string(),
            }
            .into());
        }
        self.with_retry(module, || registry::list_versions(&source, module))
    }

    /// Return the cache directory for (module, version), fetching and
    /// verifying it first if absent. Concurrent callers for the same key
    /// wait for the winner instead of fetching twice.
    pub fn ensure(&self, module: &str, source_url: &str, version: &str) -> Result<PathBuf> {
        let dst = module_dir(&self.config.cache_root, module, version);
        if dst.exists() {
            return Ok(dst);
        }

        let key = self.key_lock(module, version);
        let _guard = key.lock().expect("fetch key lock poisoned");
        if dst.exists() {
            // Another requester won the race and populated the key.
            return Ok(dst);
        }

        let source = registry::parse_source(source_url);
        if self.config.offline && matches!(source, Source::Http(_)) {
            return Err(FetchError::Offline {
                module: module.to_string(),
                version: version.to_string(),
            }
            .into());
        }

        let bytes = self.with_retry(module, || registry::download(&source, module, version))?;

        // Append rather than with_extension: version labels contain dots and
        // the tmp path must stay unique per (module, version).
        let tmp = match dst.file_name().and_then(|n| n.to_str()) {
            Some(name) => dst.with_file_name(format!("{}.tmp", name)),
            None => dst.with_extension("tmp"),
        };
        if tmp.exists() {
            fs::remove_dir_all(&tmp).ok();
        }
        ensure_dir(&tmp)?;
        if let Err(e) = registry::unpack(&bytes, &tmp, module, version) {
            fs::remove_dir_all(&tmp).ok();
            return Err(e);
        }
        if let Err(e) = verify_identity(&tmp, module) {
            fs::remove_dir_all(&tmp).ok();
            return Err(e);
        }

        finalize(&tmp, &dst)?;
        Ok(dst)
    }

    fn with_retry<T>(
        &self,
        module: &str,
        mut op: impl FnMut() -> std::result::Result<T, FetchError>,
    ) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.config.fetch_retries => {
                    attempt += 1;
                    eprintln!(
                        "fetch {}: {} (retry {}/{})",
                        module, e, attempt, self.config.fetch_retries
                    );
                    std::thread::sleep(self.config.retry_backoff * attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The fetched content must declare the identity it was requested under.
/// A mismatch may indicate tampering and is never retried.
fn verify_identity(root: &Path, requested: &str) -> Result<()> {
    let mf_path = root.join(MANIFEST_FILE);
    let declared = if mf_path.exists() {
        let (mf, _) = Manifest::load(&mf_path)?;
        mf.module
    } else {
        "(no manifest)".to_string()
    };
    if declared != requested {
        return Err(IntegrityError::IdentityMismatch {
            requested: requested.to_string(),
            declared,
        }
        .into());
    }
    Ok(())
}

fn finalize(tmp: &Path, dst: &Path) -> Result<()> {
    fs::rename(tmp, dst)
        .or_else(|_| {
            if dst.exists() {
                fs::remove_dir_all(dst).ok();
            }
            fs::rename(tmp, dst)
        })
        .map_err(|e| Error::io(format!("finalize {}", dst.display()), e))
}
