use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::manifest::manifest_checksum;

pub const LOCK_FILE: &str = "modkit.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub schema: u32,
    pub main: LockMain,
    pub modules: Vec<LockedModule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMain {
    pub module: String,
    #[serde(default)]
    pub manifest_checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedModule {
    pub module: String,
    pub source: String,
    pub requested: String,
    pub version: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub local: Option<String>,
}

impl LockFile {
    pub fn empty(main_module: &str) -> Self {
        Self {
            schema: 1,
            main: LockMain {
                module: main_module.to_string(),
                manifest_checksum: None,
            },
            modules: vec![],
        }
    }

    pub fn get(&self, module: &str) -> Option<&LockedModule> {
        self.modules.iter().find(|m| m.module == module)
    }

    pub fn upsert(&mut self, m: LockedModule) {
        if let Some(pos) = self.modules.iter().position(|x| x.module == m.module) {
            self.modules[pos] = m;
        } else {
            self.modules.push(m);
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
        let lf: LockFile = serde_json::from_str(&text)
            .map_err(|e| Error::io(format!("parse {}", path.display()), e.into()))?;
        Ok(lf)
    }

    /// The lock serves resolution only while the manifest it was written
    /// from is byte-identical.
    pub fn is_fresh_for(&self, manifest_text: &str) -> bool {
        self.main.manifest_checksum.as_deref() == Some(manifest_checksum(manifest_text).as_str())
    }

    /// Write sorted entries via tmp + rename so concurrent readers never see
    /// a half-written record.
    pub fn store_atomic(&mut self, path: &Path) -> Result<()> {
        self.modules.sort_by(|a, b| a.module.cmp(&b.module));
        let mut text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::io(LOCK_FILE.to_string(), e.into()))?;
        text.push('\n');
        let tmp = path.with_extension("lock.tmp");
        fs::write(&tmp, &text).map_err(|e| Error::io(format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| Error::io(format!("rename {} -> {}", tmp.display(), path.display()), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("modkit-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    fn entry(module: &str, version: &str) -> LockedModule {
        LockedModule {
            module: module.to_string(),
            source: format!("https://{}", module),
            requested: "^1.0".to_string(),
            version: version.to_string(),
            checksum: None,
            local: None,
        }
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut lf = LockFile::empty("example.com/acme/app");
        lf.upsert(entry("example.com/acme/greeter", "v1.0.0"));
        lf.upsert(entry("example.com/acme/greeter", "v1.2.0"));
        assert_eq!(lf.modules.len(), 1);
        assert_eq!(
            lf.get("example.com/acme/greeter").expect("entry").version,
            "v1.2.0"
        );
    }

    #[test]
    fn store_is_sorted_and_deterministic() {
        let root = temp_dir("lock-determinism");
        fs::create_dir_all(&root).expect("mkdir");
        let path = root.join(LOCK_FILE);

        let mut a = LockFile::empty("example.com/acme/app");
        a.upsert(entry("example.com/b", "v1.0.0"));
        a.upsert(entry("example.com/a", "v1.0.0"));
        a.store_atomic(&path).expect("store #1");
        let first = fs::read(&path).expect("read #1");

        let mut b = LockFile::empty("example.com/acme/app");
        b.upsert(entry("example.com/a", "v1.0.0"));
        b.upsert(entry("example.com/b", "v1.0.0"));
        b.store_atomic(&path).expect("store #2");
        let second = fs::read(&path).expect("read #2");

        assert_eq!(first, second, "insertion order must not leak into bytes");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn freshness_follows_manifest_bytes() {
        let mut lf = LockFile::empty("example.com/acme/app");
        let text = "module = \"example.com/acme/app\"\n";
        assert!(!lf.is_fresh_for(text), "no checksum recorded yet");
        lf.main.manifest_checksum = Some(manifest_checksum(text));
        assert!(lf.is_fresh_for(text));
        assert!(!lf.is_fresh_for("module = \"example.com/acme/other\"\n"));
    }

    #[test]
    fn load_round_trips_store() {
        let root = temp_dir("lock-roundtrip");
        fs::create_dir_all(&root).expect("mkdir");
        let path = root.join(LOCK_FILE);

        let mut lf = LockFile::empty("example.com/acme/app");
        lf.upsert(entry("example.com/acme/greeter", "v1.2.0"));
        lf.store_atomic(&path).expect("store");

        let loaded = LockFile::load(&path).expect("load");
        assert_eq!(loaded.main.module, "example.com/acme/app");
        assert_eq!(loaded.modules.len(), 1);

        let _ = fs::remove_dir_all(root);
    }
}
