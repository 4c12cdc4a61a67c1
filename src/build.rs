// Purpose: Drive compilation in dependency order and dispose of the produced artifact.
// Inputs/Outputs: Project root + resolved graph in, object files and a linked binary out.
// Invariants: Stages never skip: Unresolved -> GraphBuilt -> Resolved -> Compiled -> terminal.
// Gotchas: Waves compile in parallel; the first failing package wins deterministically.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

use crate::cache::ensure_dir;
use crate::config::Config;
use crate::error::{CompileError, Error, Result};
use crate::graph::{self, Package, PackageGraph};
use crate::manifest::{MANIFEST_FILE, Manifest};
use crate::resolve::{self, ResolveCtx};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    Unresolved,
    GraphBuilt,
    Resolved,
    Compiled,
    Succeeded,
    Failed,
}

impl BuildState {
    pub fn can_advance_to(self, next: BuildState) -> bool {
        use BuildState::*;
        matches!(
            (self, next),
            (Unresolved, GraphBuilt)
                | (GraphBuilt, Resolved)
                | (Resolved, Compiled)
                | (Compiled, Succeeded)
                | (GraphBuilt, Failed)
                | (Resolved, Failed)
                | (Compiled, Failed)
        )
    }
}

fn advance(state: &mut BuildState, next: BuildState) {
    debug_assert!(
        state.can_advance_to(next),
        "illegal build transition {:?} -> {:?}",
        state,
        next
    );
    *state = next;
}

/// What happens to the binary after a successful compile+link.
#[derive(Debug, Clone)]
pub enum Disposition {
    /// Execute and discard; the child's exit code is propagated.
    Run,
    /// Keep the binary, optionally at an explicit path.
    Build { output: Option<PathBuf> },
    /// Copy the binary into the configured install directory.
    Install,
}

/// Seam between the driver and whatever actually compiles packages.
pub trait Compiler: Sync {
    fn compile_package(
        &self,
        pkg: &Package,
        dep_modules: &[(String, PathBuf)],
        out: &Path,
    ) -> std::result::Result<(), CompileError>;

    fn link(&self, objects: &[PathBuf], out: &Path) -> std::result::Result<(), CompileError>;
}

/// Shells out to an external compiler with a `cc`-style interface.
pub struct ExternalCompiler {
    pub program: String,
    pub base_args: Vec<String>,
}

impl ExternalCompiler {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.compiler.program.clone(),
            base_args: config.compiler.base_args.clone(),
        }
    }

    fn run(&self, args: Vec<String>) -> std::result::Result<(), (String, Option<std::io::Error>)> {
        let out = match Command::new(&self.program).args(&args).output() {
            Ok(out) => out,
            Err(e) => return Err((String::new(), Some(e))),
        };
        if out.status.success() {
            Ok(())
        } else {
            Err((String::from_utf8_lossy(&out.stderr).trim().to_string(), None))
        }
    }
}

impl Compiler for ExternalCompiler {
    fn compile_package(
        &self,
        pkg: &Package,
        dep_modules: &[(String, PathBuf)],
        out: &Path,
    ) -> std::result::Result<(), CompileError> {
        let mut args = self.base_args.clone();
        args.push("-c".to_string());
        for (module, root) in dep_modules {
            args.push("-M".to_string());
            args.push(format!("{}={}", module, root.display()));
        }
        for f in &pkg.files {
            args.push(f.display().to_string());
        }
        args.push("-o".to_string());
        args.push(out.display().to_string());

        self.run(args).map_err(|(stderr, spawn)| match spawn {
            Some(source) => CompileError::Spawn {
                program: self.program.clone(),
                source,
            },
            None => CompileError::Package {
                package: pkg.name.clone(),
                file: pkg
                    .files
                    .first()
                    .map(|f| f.display().to_string())
                    .unwrap_or_else(|| pkg.dir.display().to_string()),
                detail: stderr,
            },
        })
    }

    fn link(&self, objects: &[PathBuf], out: &Path) -> std::result::Result<(), CompileError> {
        let mut args = self.base_args.clone();
        for o in objects {
            args.push(o.display().to_string());
        }
        args.push("-o".to_string());
        args.push(out.display().to_string());

        self.run(args).map_err(|(stderr, spawn)| match spawn {
            Some(source) => CompileError::Spawn {
                program: self.program.clone(),
                source,
            },
            None => CompileError::Link { detail: stderr },
        })
    }
}

fn object_path(target_dir: &Path, pkg: &Package) -> PathBuf {
    let mangled = pkg.import_path.replace(['/', '\\'], "_");
    target_dir.join(format!("{}.o", mangled))
}

fn binary_name(module: &str) -> String {
    module
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("a.out")
        .to_string()
}

fn compile_waves(
    graph: &PackageGraph,
    ctx: &ResolveCtx,
    compiler: &dyn Compiler,
    target_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let waves = graph.waves()?;

    let mut dep_modules: Vec<(String, PathBuf)> = ctx
        .modules
        .values()
        .map(|m| (m.module.clone(), m.root.clone()))
        .collect();
    dep_modules.sort();

    let mut objects = Vec::new();
    for wave in waves {
        let mut results: Vec<(usize, std::result::Result<(), CompileError>)> =
            Vec::with_capacity(wave.len());
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(wave.len());
            for &i in &wave {
                let pkg = &graph.packages[i];
                let out = object_path(target_dir, pkg);
                let deps = &dep_modules;
                handles.push((i, scope.spawn(move || compiler.compile_package(pkg, deps, &out))));
            }
            for (i, h) in handles {
                let joined = h.join().unwrap_or_else(|_| {
                    Err(CompileError::Package {
                        package: graph.packages[i].name.clone(),
                        file: graph.packages[i].dir.display().to_string(),
                        detail: "compiler worker panicked".to_string(),
                    })
                });
                results.push((i, joined));
            }
        });
        // Lowest package index wins so the reported failure is deterministic.
        results.sort_by_key(|(i, _)| *i);
        for (i, r) in results {
            r?;
            objects.push(object_path(target_dir, &graph.packages[i]));
        }
    }
    Ok(objects)
}

/// Full pipeline for `run` / `build` / `install`. Returns the process exit
/// code to propagate (always 0 except for `run`).
pub fn execute(
    cwd: &Path,
    config: &Config,
    disposition: Disposition,
    compiler: &dyn Compiler,
) -> Result<i32> {
    let mut state = BuildState::Unresolved;

    let root = Manifest::find_root(cwd)?;
    let (manifest, manifest_text) = Manifest::load(&root.join(MANIFEST_FILE))?;

    let graph = graph::build(&root, &manifest)?;
    advance(&mut state, BuildState::GraphBuilt);

    let ctx = resolve::resolve(&root, &manifest, &manifest_text, config)?;
    advance(&mut state, BuildState::Resolved);

    let target_dir = root.join("target");
    ensure_dir(&target_dir)?;

    let objects = match compile_waves(&graph, &ctx, compiler, &target_dir) {
        Ok(objects) => objects,
        Err(e) => {
            advance(&mut state, BuildState::Failed);
            return Err(e);
        }
    };

    let binary = target_dir.join(binary_name(&manifest.module));
    if let Err(e) = compiler.link(&objects, &binary) {
        advance(&mut state, BuildState::Failed);
        return Err(e.into());
    }
    advance(&mut state, BuildState::Compiled);

    let code = match disposition {
        Disposition::Run => {
            let status = Command::new(&binary)
                .status()
                .map_err(|e| Error::io(format!("run {}", binary.display()), e))?;
            let code = status.code().unwrap_or(1);
            fs::remove_file(&binary).ok();
            code
        }
        Disposition::Build { output } => {
            if let Some(out) = output {
                fs::rename(&binary, &out)
                    .or_else(|_| fs::copy(&binary, &out).map(|_| ()))
                    .map_err(|e| Error::io(format!("write {}", out.display()), e))?;
                eprintln!("wrote {}", out.display());
            } else {
                eprintln!("wrote {}", binary.display());
            }
            0
        }
        Disposition::Install => {
            if !manifest.replace.is_empty() {
                eprintln!(
                    "warning: installing with {} active replace directive(s)",
                    manifest.replace.len()
                );
            }
            ensure_dir(&config.install_dir)?;
            let dst = config.install_dir.join(binary_name(&manifest.module));
            fs::copy(&binary, &dst)
                .map_err(|e| Error::io(format!("install {}", dst.display()), e))?;
            eprintln!("installed {}", dst.display());
            0
        }
    };

    advance(&mut state, BuildState::Succeeded);
    let _ = state;
    Ok(code)
}
