use anyhow::{Context, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache;
use crate::config::Config;
use crate::error::Error;
use crate::graph;
use crate::import_scan::{self, SOURCE_EXT};
use crate::lockfile::{LOCK_FILE, LockFile};
use crate::manifest::{MANIFEST_FILE, Manifest, Require};
use crate::resolve::{self, VENDOR_DIR};

fn read_text(p: &Path) -> anyhow::Result<String> {
    fs::read_to_string(p).with_context(|| format!("read {}", p.display()))
}

fn write_text(p: &Path, s: &str) -> anyhow::Result<()> {
    fs::write(p, s).with_context(|| format!("write {}", p.display()))?;
    Ok(())
}

/// `modkit resolve`: manifest + graph + resolver, then write the lock.
pub fn cmd_resolve(cwd: PathBuf, config: &Config) -> anyhow::Result<()> {
    let root = Manifest::find_root(&cwd).map_err(Error::from)?;
    let (manifest, text) = Manifest::load(&root.join(MANIFEST_FILE)).map_err(Error::from)?;
    let _ = graph::build(&root, &manifest)?;
    let ctx = resolve::resolve(&root, &manifest, &text, config)?;
    eprintln!(
        "resolved {} module(s); wrote {}",
        ctx.modules.len(),
        root.join(LOCK_FILE).display()
    );
    Ok(())
}

pub fn cmd_init(cwd: PathBuf, module_opt: Option<String>) -> anyhow::Result<()> {
    let root = Manifest::find_root(&cwd).unwrap_or(cwd);
    let mod_path = root.join(MANIFEST_FILE);
    if mod_path.exists() {
        bail!("{} already exists at {}", MANIFEST_FILE, mod_path.display());
    }

    let module = module_opt.unwrap_or_else(|| "example.com/you/project".to_string());

    let mut mf = Manifest {
        module,
        require: vec![],
        replace: vec![],
        source: vec![],
    };
    mf.sort_deterministic();
    write_text(&mod_path, &mf.to_pretty_toml())?;

    let lock_path = root.join(LOCK_FILE);
    if !lock_path.exists() {
        LockFile::empty(&mf.module).store_atomic(&lock_path)?;
    }

    eprintln!("initialized {}", mod_path.display());
    Ok(())
}

fn collect_source_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    fn is_skip_dir(name: &str) -> bool {
        matches!(
            name,
            "vendor" | ".git" | "target" | "node_modules" | ".modkit" | ".idea" | ".vscode"
        )
    }

    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
        for ent in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
            let ent = ent?;
            let p = ent.path();
            if p.is_dir() {
                if let Some(name) = p.file_name().and_then(|s| s.to_str())
                    && is_skip_dir(name)
                {
                    continue;
                }
                walk(&p, out)?;
            } else if p.extension().and_then(|s| s.to_str()) == Some(SOURCE_EXT) {
                out.push(p);
            }
        }
        Ok(())
    }

    let mut out = vec![];
    walk(root, &mut out)?;
    out.sort();
    Ok(out)
}

/// Guess the module identity an import belongs to: host-qualified paths use
/// their first three segments, everything else is not an external module.
fn infer_module_root(import: &str) -> Option<String> {
    if import.starts_with("./") || import.starts_with("../") {
        return None;
    }
    if import.contains(':') {
        return None;
    }
    let seg: Vec<&str> = import.split('/').filter(|x| !x.is_empty()).collect();
    if seg.len() >= 3 && seg[0].contains('.') {
        return Some(format!("{}/{}/{}", seg[0], seg[1], seg[2]));
    }
    None
}

fn compute_used_modules(root: &Path, mf: &Manifest) -> anyhow::Result<BTreeSet<String>> {
    let files = collect_source_files(root)?;

    let mut used: BTreeSet<String> = BTreeSet::new();
    for f in &files {
        let (_, imports) = import_scan::scan_file(f)?;
        for im in imports {
            if im == mf.module || im.starts_with(&format!("{}/", mf.module)) {
                continue;
            }
            if let Some(r) = infer_module_root(&im) {
                used.insert(r);
            }
        }
    }
    Ok(used)
}

fn verify_lock(mf: &Manifest, lock: Option<&LockFile>) -> anyhow::Result<()> {
    let lock = lock.with_context(|| format!("{} missing (run `modkit resolve`)", LOCK_FILE))?;
    if lock.main.module != mf.module {
        bail!(
            "{} main mismatch: manifest has {}, lock has {}",
            LOCK_FILE,
            mf.module,
            lock.main.module
        );
    }
    for r in &mf.require {
        let lm = lock
            .get(&r.module)
            .with_context(|| format!("missing {} in {}", r.module, LOCK_FILE))?;
        if lm.requested != r.version {
            bail!(
                "{} mismatch for {}: manifest requires {}, lock has {}",
                LOCK_FILE,
                r.module,
                r.version,
                lm.requested
            );
        }
    }
    Ok(())
}

/// `modkit tidy`: sync `[[require]]` with the imports the sources actually
/// use. `check` verifies without writing.
pub fn cmd_tidy(cwd: PathBuf, config: &Config, check: bool) -> anyhow::Result<()> {
    let root = Manifest::find_root(&cwd).map_err(Error::from)?;
    let mod_path = root.join(MANIFEST_FILE);
    let lock_path = root.join(LOCK_FILE);

    let (mut mf, _) = Manifest::load(&mod_path).map_err(Error::from)?;
    let lock: Option<LockFile> = if lock_path.exists() {
        Some(LockFile::load(&lock_path)?)
    } else {
        None
    };

    let used = compute_used_modules(&root, &mf)?;

    let mut req_map: BTreeMap<String, String> = BTreeMap::new();
    for r in &mf.require {
        req_map.insert(r.module.clone(), r.version.clone());
    }

    for m in &used {
        if req_map.contains_key(m) {
            continue;
        }
        if check {
            bail!("missing require for module {}", m);
        }
        let ver = lock
            .as_ref()
            .and_then(|l| l.get(m).map(|x| x.requested.clone()))
            .unwrap_or_else(|| "main".to_string());
        req_map.insert(m.clone(), ver);
    }

    let replaced: BTreeSet<String> = mf.replace.iter().map(|r| r.module.clone()).collect();
    if check {
        for m in req_map.keys() {
            if !used.contains(m) && !replaced.contains(m) {
                eprintln!("warning: unused require {}", m);
            }
        }
        verify_lock(&mf, lock.as_ref())?;
        eprintln!("tidy check OK");
        return Ok(());
    }
    req_map.retain(|m, _| used.contains(m) || replaced.contains(m));

    mf.require = req_map
        .into_iter()
        .map(|(module, version)| Require { module, version })
        .collect();
    mf.sort_deterministic();
    write_text(&mod_path, &mf.to_pretty_toml())?;
    eprintln!("tidy wrote {}", mod_path.display());

    let (mf, text) = Manifest::load(&mod_path).map_err(Error::from)?;
    let _ = resolve::resolve(&root, &mf, &text, config)?;
    eprintln!("updated {}", LOCK_FILE);
    Ok(())
}

fn describe_entry(lock_entry: &crate::lockfile::LockedModule, config: &Config) -> String {
    let mut line = format!(
        "  {} @ {} -> {}",
        lock_entry.module, lock_entry.requested, lock_entry.version
    );
    if let Some(local) = &lock_entry.local {
        line.push_str(&format!(" (local:{})", local));
    } else {
        line.push_str(&format!(" ({})", lock_entry.source));
        let cached = cache::module_dir(&config.cache_root, &lock_entry.module, &lock_entry.version)
            .exists();
        line.push_str(&format!(" [cached: {}]", if cached { "yes" } else { "no" }));
    }
    line
}

/// `modkit graph`: direct and transitive dependencies with lock status.
pub fn cmd_graph(cwd: PathBuf, config: &Config) -> anyhow::Result<()> {
    let root = Manifest::find_root(&cwd).map_err(Error::from)?;
    let (mf, _) = Manifest::load(&root.join(MANIFEST_FILE)).map_err(Error::from)?;
    let lock_path = root.join(LOCK_FILE);
    let lock: Option<LockFile> = if lock_path.exists() {
        Some(LockFile::load(&lock_path)?)
    } else {
        None
    };

    let direct: BTreeSet<String> = mf.require.iter().map(|r| r.module.clone()).collect();

    eprintln!("main: {}", mf.module);
    eprintln!("direct:");
    if mf.require.is_empty() {
        eprintln!("  (none)");
    }
    for r in &mf.require {
        match lock.as_ref().and_then(|l| l.get(&r.module)) {
            Some(lm) => eprintln!("{}", describe_entry(lm, config)),
            None => eprintln!("  {} @ {} (missing in {})", r.module, r.version, LOCK_FILE),
        }
    }

    if let Some(lock) = lock.as_ref() {
        eprintln!("transitive:");
        let mut any = false;
        for lm in &lock.modules {
            if direct.contains(&lm.module) {
                continue;
            }
            any = true;
            eprintln!("{}", describe_entry(lm, config));
        }
        if !any {
            eprintln!("  (none)");
        }
    }

    if root.join(VENDOR_DIR).is_dir() {
        eprintln!("vendor: present");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("modkit-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    #[test]
    fn init_writes_manifest_and_empty_lock() {
        let root = temp_dir("cmd-init");
        fs::create_dir_all(&root).expect("mkdir");

        cmd_init(root.clone(), Some("example.com/acme/app".to_string())).expect("init");
        assert!(root.join(MANIFEST_FILE).exists());
        assert!(root.join(LOCK_FILE).exists());

        let err = cmd_init(root.clone(), None).expect_err("second init");
        assert!(err.to_string().contains("already exists"));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn infer_module_root_wants_host_qualified_paths() {
        assert_eq!(
            infer_module_root("example.com/acme/greeter/en").as_deref(),
            Some("example.com/acme/greeter")
        );
        assert_eq!(infer_module_root("./relative"), None);
        assert_eq!(infer_module_root("shortname"), None);
        assert_eq!(infer_module_root("no/dot/host"), None);
    }

    #[test]
    fn tidy_adds_missing_requires_from_imports() {
        let cache = temp_dir("cmd-tidy-cache");
        let root = temp_dir("cmd-tidy");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(
            root.join(MANIFEST_FILE),
            "module = \"example.com/acme/app\"\n\n[[replace]]\nmodule = \"example.com/acme/greeter\"\npath = \"./local-greeter\"\n",
        )
        .expect("write manifest");
        fs::write(
            root.join("main.mx"),
            "package app\nimport \"example.com/acme/greeter\"\n",
        )
        .expect("write main");
        let local = root.join("local-greeter");
        fs::create_dir_all(&local).expect("mkdir local");
        fs::write(
            local.join(MANIFEST_FILE),
            "module = \"example.com/acme/greeter\"\n",
        )
        .expect("write local manifest");
        fs::write(local.join("lib.mx"), "package greeter\n").expect("write local source");

        let config = test_config(cache.clone());
        cmd_tidy(root.clone(), &config, false).expect("tidy");

        let (mf, _) = Manifest::load(&root.join(MANIFEST_FILE)).expect("reload");
        assert_eq!(mf.require.len(), 1);
        assert_eq!(mf.require[0].module, "example.com/acme/greeter");
        assert_eq!(mf.require[0].version, "main");

        cmd_tidy(root.clone(), &config, true).expect("tidy check after write");

        let _ = fs::remove_dir_all(root);
        let _ = fs::remove_dir_all(cache);
    }

    #[test]
    fn tidy_check_fails_on_missing_require() {
        let cache = temp_dir("cmd-tidy-check-cache");
        let root = temp_dir("cmd-tidy-check");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join(MANIFEST_FILE), "module = \"example.com/acme/app\"\n")
            .expect("write manifest");
        fs::write(
            root.join("main.mx"),
            "package app\nimport \"example.com/acme/greeter\"\n",
        )
        .expect("write main");

        let config = test_config(cache.clone());
        let err = cmd_tidy(root.clone(), &config, true).expect_err("drift");
        assert!(err.to_string().contains("missing require"));

        let _ = fs::remove_dir_all(root);
        let _ = fs::remove_dir_all(cache);
    }
}
