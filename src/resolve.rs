// Purpose: Resolve declared dependencies to concrete versions, overrides, or vendored copies.
// Inputs/Outputs: Manifest + lock in, resolved module roots and a rewritten lock out.
// Invariants: Override > vendor > registry precedence; output is deterministic for a given input.
// Gotchas: A fresh lock serves version choices, but cached content is still checksum-verified.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::thread;

use crate::cache::{CacheLock, dir_checksum_sha256, ensure_dir};
use crate::config::Config;
use crate::error::{GraphError, IntegrityError, ResolutionError, Result};
use crate::fetch::Fetcher;
use crate::lockfile::{LOCK_FILE, LockFile, LockedModule};
use crate::manifest::{MANIFEST_FILE, Manifest, Require, manifest_checksum};
use crate::version;

pub const VENDOR_DIR: &str = "vendor";

#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub module: String,
    pub root: PathBuf,
    pub source: String,
    pub requested: String,
    pub version: String,
    pub is_local: bool,
}

#[derive(Debug)]
pub struct ResolveCtx {
    pub main_root: PathBuf,
    pub main_module: String,
    pub modules: HashMap<String, ResolvedModule>,
    pub lock: LockFile,
}

#[derive(Debug)]
struct JobResult {
    resolved: ResolvedModule,
    lock_entry: LockedModule,
    sub_requires: Vec<(Require, String)>,
}

/// Transitive requires come from the resolved module's own manifest, and so
/// do their registry bases. An explicit `[[source]]` entry in the main
/// manifest still wins so the whole resolution stays pinnable from the root.
fn read_sub_requires(module_root: &Path, main: &Manifest) -> Result<Vec<(Require, String)>> {
    let sub = module_root.join(MANIFEST_FILE);
    if !sub.exists() {
        return Ok(vec![]);
    }
    let (mf, _) = Manifest::load(&sub)?;
    Ok(mf
        .require
        .iter()
        .cloned()
        .map(|r| {
            let url = main
                .explicit_source_for(&r.module)
                .unwrap_or_else(|| mf.source_url_for(&r.module));
            (r, url)
        })
        .collect())
}

fn job_count(task_count: usize) -> usize {
    if task_count == 0 {
        return 1;
    }
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, task_count)
}

struct ResolveState<'a> {
    manifest: &'a Manifest,
    main_root: &'a Path,
    config: &'a Config,
    fetcher: &'a Fetcher<'a>,
    replaces: &'a BTreeMap<String, PathBuf>,
    old_lock: Option<&'a LockFile>,
    lock_fresh: bool,
}

fn resolve_one(state: &ResolveState<'_>, req: Require, source_url: String) -> Result<JobResult> {
    if let Some(raw_path) = state.replaces.get(&req.module) {
        let joined = if raw_path.is_absolute() {
            raw_path.clone()
        } else {
            state.main_root.join(raw_path)
        };
        let root = joined
            .canonicalize()
            .map_err(|e| ResolutionError::OverridePath {
                module: req.module.clone(),
                path: joined.clone(),
                source: e,
            })?;
        let sub_requires = read_sub_requires(&root, state.manifest)?;
        return Ok(JobResult {
            resolved: ResolvedModule {
                module: req.module.clone(),
                root,
                source: "local".to_string(),
                requested: req.version.clone(),
                version: "local".to_string(),
                is_local: true,
            },
            lock_entry: LockedModule {
                module: req.module,
                source: "local".to_string(),
                requested: req.version,
                version: "local".to_string(),
                checksum: None,
                local: Some(raw_path.to_string_lossy().into_owned()),
            },
            sub_requires,
        });
    }

    let vendored = state.main_root.join(VENDOR_DIR).join(&req.module);
    if vendored.is_dir() {
        // Pre-resolved local content: not rescanned for further requires.
        return Ok(JobResult {
            resolved: ResolvedModule {
                module: req.module.clone(),
                root: vendored,
                source: "vendor".to_string(),
                requested: req.version.clone(),
                version: "vendor".to_string(),
                is_local: true,
            },
            lock_entry: LockedModule {
                module: req.module.clone(),
                source: "vendor".to_string(),
                requested: req.version,
                version: "vendor".to_string(),
                checksum: None,
                local: Some(format!("{}/{}", VENDOR_DIR, req.module)),
            },
            sub_requires: vec![],
        });
    }

    let locked = if state.lock_fresh {
        state
            .old_lock
            .and_then(|l| l.get(&req.module))
            .filter(|lm| lm.requested == req.version && lm.local.is_none())
    } else {
        None
    };

    let version = match locked {
        Some(lm) => lm.version.clone(),
        None => {
            if version::parse_constraint(&req.version).is_none() {
                // Not a constraint: treat as a literal label (tag or branch).
                req.version.clone()
            } else {
                let labels = state.fetcher.list_versions(&req.module, &source_url)?;
                version::select_version(
                    state.config.policy,
                    &req.module,
                    &req.version,
                    &labels,
                )?
            }
        }
    };

    let root = state.fetcher.ensure(&req.module, &source_url, &version)?;
    let checksum = dir_checksum_sha256(&root)?;
    if let Some(lm) = locked
        && let Some(expected) = lm.checksum.as_ref()
        && expected != &checksum
    {
        return Err(IntegrityError::ChecksumMismatch {
            module: req.module.clone(),
            version: version.clone(),
            expected: expected.clone(),
            computed: checksum,
        }
        .into());
    }

    let sub_requires = read_sub_requires(&root, state.manifest)?;
    Ok(JobResult {
        resolved: ResolvedModule {
            module: req.module.clone(),
            root,
            source: source_url.clone(),
            requested: req.version.clone(),
            version: version.clone(),
            is_local: false,
        },
        lock_entry: LockedModule {
            module: req.module,
            source: source_url,
            requested: req.version,
            version,
            checksum: Some(checksum),
            local: None,
        },
        sub_requires,
    })
}

fn detect_cycle(
    node: &str,
    edges: &HashMap<String, BTreeSet<String>>,
    path: &mut Vec<String>,
    done: &mut BTreeSet<String>,
) -> Option<String> {
    if let Some(pos) = path.iter().position(|p| p == node) {
        let mut chain: Vec<&str> = path[pos..].iter().map(String::as_str).collect();
        chain.push(node);
        return Some(chain.join(" -> "));
    }
    if done.contains(node) {
        return None;
    }
    path.push(node.to_string());
    if let Some(children) = edges.get(node) {
        for child in children {
            if let Some(chain) = detect_cycle(child, edges, path, done) {
                return Some(chain);
            }
        }
    }
    path.pop();
    done.insert(node.to_string());
    None
}

/// Resolve every declared and transitive requirement, write the Resolution
/// Record, and hand back the materialized module roots.
pub fn resolve(
    main_root: &Path,
    manifest: &Manifest,
    manifest_text: &str,
    config: &Config,
) -> Result<ResolveCtx> {
    let lock_path = main_root.join(LOCK_FILE);
    let old_lock = if lock_path.exists() {
        Some(LockFile::load(&lock_path)?)
    } else {
        None
    };
    let lock_fresh = old_lock
        .as_ref()
        .map(|l| l.is_fresh_for(manifest_text))
        .unwrap_or(false);

    let replaces = manifest.replace_map()?;

    ensure_dir(&config.cache_root)?;
    let _cache_guard = CacheLock::acquire(&config.cache_root)?;
    let fetcher = Fetcher::new(config);

    let state = ResolveState {
        manifest,
        main_root,
        config,
        fetcher: &fetcher,
        replaces: &replaces,
        old_lock: old_lock.as_ref(),
        lock_fresh,
    };

    let mut q: VecDeque<(String, Require, String)> = manifest
        .require
        .iter()
        .cloned()
        .map(|r| {
            let url = manifest.source_url_for(&r.module);
            (manifest.module.clone(), r, url)
        })
        .collect();

    let mut selected: HashMap<String, String> = HashMap::new();
    let mut resolved: HashMap<String, ResolvedModule> = HashMap::new();
    let mut lock_entries: BTreeMap<String, LockedModule> = BTreeMap::new();
    let mut dep_edges: HashMap<String, BTreeSet<String>> = HashMap::new();

    while !q.is_empty() {
        let mut drained = Vec::new();
        while let Some(item) = q.pop_front() {
            drained.push(item);
        }

        let mut batch_by_module: BTreeMap<String, (Require, String)> = BTreeMap::new();
        for (parent, mut req, url) in drained {
            dep_edges
                .entry(parent)
                .or_default()
                .insert(req.module.clone());
            if req.module == manifest.module {
                // Caught again by detect_cycle, but fail fast before fetching.
                return Err(GraphError::ModuleCycle {
                    chain: format!("{} -> {}", manifest.module, req.module),
                }
                .into());
            }

            if let Some(cur) = selected.get(&req.module).cloned() {
                let merged = version::merge_constraints(&cur, &req.version);
                if merged != cur {
                    selected.insert(req.module.clone(), merged.clone());
                    resolved.remove(&req.module);
                }
                req.version = merged;
            } else {
                selected.insert(req.module.clone(), req.version.clone());
            }

            if resolved.contains_key(&req.module) {
                continue;
            }
            batch_by_module.insert(req.module.clone(), (req, url));
        }

        let batch: Vec<(Require, String)> = batch_by_module.into_values().collect();
        if batch.is_empty() {
            continue;
        }

        let mut results = Vec::<JobResult>::with_capacity(batch.len());
        let state_ref = &state;
        let jobs = job_count(batch.len());
        for chunk in batch.chunks(jobs) {
            thread::scope(|scope| -> Result<()> {
                let mut handles = Vec::with_capacity(chunk.len());
                for (req, url) in chunk.iter().cloned() {
                    let module = req.module.clone();
                    handles.push((module, scope.spawn(move || resolve_one(state_ref, req, url))));
                }
                for (module, h) in handles {
                    let joined = h.join().map_err(|_| {
                        crate::error::Error::io(
                            format!("resolver worker for {}", module),
                            std::io::Error::other("worker panicked"),
                        )
                    })?;
                    results.push(joined?);
                }
                Ok(())
            })?;
        }

        for item in results {
            let parent = item.resolved.module.clone();
            lock_entries.insert(parent.clone(), item.lock_entry);
            resolved.insert(parent.clone(), item.resolved);
            for (r, url) in item.sub_requires {
                q.push_back((parent.clone(), r, url));
            }
        }
    }

    if let Some(chain) = detect_cycle(
        &manifest.module,
        &dep_edges,
        &mut Vec::new(),
        &mut BTreeSet::new(),
    ) {
        return Err(GraphError::ModuleCycle { chain }.into());
    }

    let mut lock = LockFile::empty(&manifest.module);
    lock.main.manifest_checksum = Some(manifest_checksum(manifest_text));
    for entry in lock_entries.into_values() {
        lock.upsert(entry);
    }
    lock.store_atomic(&lock_path)?;

    Ok(ResolveCtx {
        main_root: main_root.to_path_buf(),
        main_module: manifest.module.clone(),
        modules: resolved,
        lock,
    })
}
