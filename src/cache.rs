// Purpose: Module cache layout, content checksums, and the cross-process cache lock.
// Inputs/Outputs: Maps (identity, version) keys to cache directories; hashes file trees.
// Invariants: Checksums are order-independent of directory traversal; `.git` is excluded.
// Gotchas: Lock file must be opened without truncation or a waiting process corrupts it.

use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p).map_err(|e| Error::io(format!("create {}", p.display()), e))
}

pub fn escape_module(m: &str) -> String {
    m.replace(['/', '\\'], "!")
}

pub fn escape_version(v: &str) -> String {
    v.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '!'
            }
        })
        .collect()
}

/// Cache directory for one (identity, version) key.
pub fn module_dir(cache_root: &Path, module: &str, version: &str) -> PathBuf {
    cache_root
        .join("mod")
        .join(format!("{}@{}", escape_module(module), escape_version(version)))
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).map_err(|e| Error::io(format!("read_dir {}", dir.display()), e))?;
    for ent in entries {
        let ent = ent.map_err(|e| Error::io(format!("read_dir {}", dir.display()), e))?;
        let p = ent.path();
        if p.is_dir() {
            if p.file_name().and_then(|s| s.to_str()) == Some(".git") {
                continue;
            }
            collect_files(base, &p, out)?;
            continue;
        }
        if p.is_file() {
            let rel = p
                .strip_prefix(base)
                .map_err(|_| {
                    Error::io(
                        format!("strip_prefix {}", p.display()),
                        std::io::Error::other("path outside base"),
                    )
                })?
                .to_path_buf();
            out.push(rel);
        }
    }
    Ok(())
}

pub fn dir_checksum_sha256(dir: &Path) -> Result<String> {
    let mut files = Vec::<PathBuf>::new();
    collect_files(dir, dir, &mut files)?;
    files.sort_by_key(|p| p.to_string_lossy().replace('\\', "/"));

    let mut hasher = Sha256::new();
    for rel in files {
        let rel_norm = rel.to_string_lossy().replace('\\', "/");
        hasher.update(b"F\0");
        hasher.update(rel_norm.as_bytes());
        hasher.update(b"\0");

        let path = dir.join(&rel);
        let mut f =
            File::open(&path).map_err(|e| Error::io(format!("open {}", path.display()), e))?;
        let mut buf = [0u8; 8192];
        loop {
            let n = f
                .read(&mut buf)
                .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Advisory lock guarding the whole cache against concurrent mutation by
/// other modkit processes. In-process concurrency is handled per key by the
/// fetcher's single-flight table.
pub struct CacheLock {
    _file: File,
}

impl CacheLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        ensure_dir(root)?;
        let lock_path = root.join("cache.lock");
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::io(format!("open {}", lock_path.display()), e))?;
        f.lock_exclusive()
            .map_err(|e| Error::io(format!("lock {}", lock_path.display()), e))?;
        Ok(Self { _file: f })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("modkit-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    #[test]
    fn dir_checksum_is_stable_and_detects_content_change() {
        let root = temp_dir("checksum-stable");
        fs::create_dir_all(root.join("sub")).expect("mkdir");
        fs::write(root.join("a.txt"), "hello").expect("write a");
        fs::write(root.join("sub").join("b.txt"), "world").expect("write b");

        let c1 = dir_checksum_sha256(&root).expect("checksum #1");
        let c2 = dir_checksum_sha256(&root).expect("checksum #2");
        assert_eq!(c1, c2, "checksum should be deterministic for same content");

        fs::write(root.join("sub").join("b.txt"), "WORLD").expect("rewrite b");
        let c3 = dir_checksum_sha256(&root).expect("checksum #3");
        assert_ne!(c1, c3, "checksum must change when file content changes");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dir_checksum_ignores_git_directory() {
        let root = temp_dir("checksum-git-ignore");
        fs::create_dir_all(root.join(".git")).expect("mkdir .git");
        fs::write(root.join("lib.mx"), "package lib\n").expect("write source");
        fs::write(root.join(".git").join("config"), "first").expect("write config #1");

        let c1 = dir_checksum_sha256(&root).expect("checksum #1");
        fs::write(root.join(".git").join("config"), "second").expect("write config #2");
        let c2 = dir_checksum_sha256(&root).expect("checksum #2");
        assert_eq!(c1, c2, ".git content should not affect module checksum");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn module_dir_escapes_identity_and_version() {
        let d = module_dir(
            Path::new("/cache"),
            "example.com/acme/greeter",
            "v1.2.0",
        );
        assert_eq!(
            d,
            Path::new("/cache/mod/example.com!acme!greeter@v1.2.0")
        );
    }
}
