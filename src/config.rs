// Purpose: Hold all injected configuration: cache root, install dir, compiler, policies.
// Inputs/Outputs: Built once from env/defaults at startup, passed by reference everywhere.
// Invariants: No component reads ambient global state; tests point cache_root at temp dirs.
// Gotchas: Env vars are consulted only here, never deeper in the pipeline.

use anyhow::Context;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

use crate::version::SelectionPolicy;

#[derive(Debug, Clone)]
pub struct CompilerSpec {
    pub program: String,
    pub base_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_root: PathBuf,
    pub install_dir: PathBuf,
    pub compiler: CompilerSpec,
    pub policy: SelectionPolicy,
    pub offline: bool,
    pub fetch_retries: u32,
    pub retry_backoff: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let cache_root = match std::env::var("MODKIT_CACHE_DIR") {
            Ok(p) => PathBuf::from(p),
            Err(_) => project_dirs()?.cache_dir().to_path_buf(),
        };
        let install_dir = match std::env::var("MODKIT_INSTALL_DIR") {
            Ok(p) => PathBuf::from(p),
            Err(_) => project_dirs()?.data_dir().join("bin"),
        };
        let compiler = compiler_from_env();
        let policy = match std::env::var("MODKIT_VERSION_POLICY").as_deref() {
            Ok("lowest") => SelectionPolicy::Lowest,
            _ => SelectionPolicy::Highest,
        };
        Ok(Self {
            cache_root,
            install_dir,
            compiler,
            policy,
            offline: false,
            fetch_retries: 2,
            retry_backoff: Duration::from_millis(250),
        })
    }
}

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from("dev", "modkit", "modkit").context("cannot determine OS cache directory")
}

fn compiler_from_env() -> CompilerSpec {
    let raw = std::env::var("MODKIT_COMPILER").unwrap_or_else(|_| "cc".to_string());
    let mut parts = raw.split_whitespace().map(str::to_string);
    let program = parts.next().unwrap_or_else(|| "cc".to_string());
    CompilerSpec {
        program,
        base_args: parts.collect(),
    }
}

/// Isolated configuration for test cases: cache under `cache_root`, no
/// retries, install dir alongside the cache.
#[cfg(test)]
pub fn test_config(cache_root: PathBuf) -> Config {
    let install_dir = cache_root.join("bin");
    Config {
        cache_root,
        install_dir,
        compiler: CompilerSpec {
            program: "cc".to_string(),
            base_args: vec![],
        },
        policy: SelectionPolicy::Highest,
        offline: false,
        fetch_retries: 0,
        retry_backoff: Duration::from_millis(0),
    }
}
