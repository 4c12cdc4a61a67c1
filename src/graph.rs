// Purpose: Build the package graph: walk the tree, group files, wire import edges.
// Inputs/Outputs: Project root + manifest in, packages with a compile order out.
// Invariants: One directory yields one package; all its files agree on the name.
// Gotchas: vendor/ is pre-resolved content and must never be rescanned here.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use strsim::jaro_winkler;

use crate::error::{Error, GraphError, Result};
use crate::import_scan::{self, SOURCE_EXT};
use crate::manifest::Manifest;

#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    /// Full module-path form under which this package is imported.
    pub import_path: String,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub imports: BTreeSet<String>,
}

#[derive(Debug)]
pub struct PackageGraph {
    pub main_module: String,
    pub packages: Vec<Package>,
    /// (importer, imported) index pairs between local packages.
    pub edges: Vec<(usize, usize)>,
    /// External module identities the project imports.
    pub externals: BTreeSet<String>,
}

fn is_skip_dir(name: &str) -> bool {
    matches!(
        name,
        "vendor" | ".git" | "target" | "node_modules" | ".modkit" | ".idea" | ".vscode"
    )
}

fn walk_source_dirs(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut has_sources = false;
    let entries =
        fs::read_dir(dir).map_err(|e| Error::io(format!("read_dir {}", dir.display()), e))?;
    for ent in entries {
        let ent = ent.map_err(|e| Error::io(format!("read_dir {}", dir.display()), e))?;
        let p = ent.path();
        if p.is_dir() {
            if let Some(name) = p.file_name().and_then(|s| s.to_str())
                && is_skip_dir(name)
            {
                continue;
            }
            walk_source_dirs(root, &p, out)?;
        } else if p.extension().and_then(|s| s.to_str()) == Some(SOURCE_EXT) {
            has_sources = true;
        }
    }
    if has_sources {
        out.push(dir.to_path_buf());
    }
    Ok(())
}

fn source_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir).map_err(|e| Error::io(format!("read_dir {}", dir.display()), e))?;
    for ent in entries {
        let ent = ent.map_err(|e| Error::io(format!("read_dir {}", dir.display()), e))?;
        let p = ent.path();
        if p.is_file() && p.extension().and_then(|s| s.to_str()) == Some(SOURCE_EXT) {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

fn import_path_for(main_module: &str, root: &Path, dir: &Path) -> String {
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.is_empty() {
        main_module.to_string()
    } else {
        format!("{}/{}", main_module, rel)
    }
}

fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn best_name_match<'a>(needle: &str, candidates: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<(String, f64)> = None;
    for c in candidates {
        let score = jaro_winkler(leaf(needle), leaf(c));
        if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
            best = Some((c.to_string(), score));
        }
    }
    match best {
        Some((name, score)) if score >= 0.84 => Some(name),
        _ => None,
    }
}

fn suggestion_text(suggestion: Option<String>) -> String {
    match suggestion {
        Some(s) => format!("\nhelp: did you mean \"{}\"?", s),
        None => String::new(),
    }
}

pub fn build(root: &Path, manifest: &Manifest) -> Result<PackageGraph> {
    let main_module = manifest.module.clone();

    let mut dirs = Vec::new();
    walk_source_dirs(root, root, &mut dirs)?;
    dirs.sort();

    let mut packages = Vec::<Package>::new();
    for dir in dirs {
        let files = source_files_in(&dir)?;
        let mut name: Option<(String, PathBuf)> = None;
        let mut imports = BTreeSet::new();
        for f in &files {
            let (pkg_name, file_imports) = import_scan::scan_file(f)?;
            let pkg_name = pkg_name.ok_or_else(|| GraphError::MissingPackageDecl {
                file: f.clone(),
            })?;
            match &name {
                None => name = Some((pkg_name, f.clone())),
                Some((first_name, first_file)) => {
                    if *first_name != pkg_name {
                        return Err(GraphError::PackageNameConflict {
                            dir: dir.clone(),
                            first_file: first_file.clone(),
                            first_name: first_name.clone(),
                            second_file: f.clone(),
                            second_name: pkg_name,
                        }
                        .into());
                    }
                }
            }
            imports.extend(file_imports);
        }
        let (name, _) = name.expect("dir listed without sources");
        let import_path = import_path_for(&main_module, root, &dir);
        packages.push(Package {
            name,
            import_path,
            dir,
            files,
            imports,
        });
    }

    let index: BTreeMap<String, usize> = packages
        .iter()
        .enumerate()
        .map(|(i, p)| (p.import_path.clone(), i))
        .collect();

    let mut declared: BTreeSet<String> = manifest.require.iter().map(|r| r.module.clone()).collect();
    declared.extend(manifest.replace.iter().map(|r| r.module.clone()));

    let mut edges = Vec::new();
    let mut externals = BTreeSet::new();
    for (i, pkg) in packages.iter().enumerate() {
        for import in &pkg.imports {
            if import == &pkg.import_path {
                continue;
            }
            let is_local =
                *import == main_module || import.starts_with(&format!("{}/", main_module));
            if is_local {
                match index.get(import) {
                    Some(&j) => edges.push((i, j)),
                    None => {
                        let suggestion =
                            best_name_match(import, index.keys().map(String::as_str));
                        return Err(GraphError::UnresolvedImport {
                            file: pkg.files.first().cloned().unwrap_or_else(|| pkg.dir.clone()),
                            import: import.clone(),
                            suggestion: suggestion_text(suggestion),
                        }
                        .into());
                    }
                }
                continue;
            }
            // Longest declared module prefix wins, mirroring nested module paths.
            let mut best: Option<&str> = None;
            for m in &declared {
                if (import == m || import.starts_with(&format!("{}/", m)))
                    && best.map(|b| b.len() < m.len()).unwrap_or(true)
                {
                    best = Some(m.as_str());
                }
            }
            match best {
                Some(m) => {
                    externals.insert(m.to_string());
                }
                None => {
                    let suggestion = best_name_match(import, declared.iter().map(String::as_str));
                    return Err(GraphError::UnresolvedImport {
                        file: pkg.files.first().cloned().unwrap_or_else(|| pkg.dir.clone()),
                        import: import.clone(),
                        suggestion: suggestion_text(suggestion),
                    }
                    .into());
                }
            }
        }
    }

    Ok(PackageGraph {
        main_module,
        packages,
        edges,
        externals,
    })
}

impl PackageGraph {
    /// Compile order as waves: every package in a wave depends only on
    /// earlier waves, so a wave may compile in parallel. Leaves come first.
    pub fn waves(&self) -> Result<Vec<Vec<usize>>> {
        let n = self.packages.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(importer, imported) in &self.edges {
            indegree[importer] += 1;
            dependents[imported].push(importer);
        }

        let mut waves = Vec::new();
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut done = 0usize;
        while !ready.is_empty() {
            ready.sort();
            done += ready.len();
            let mut next = Vec::new();
            for &i in &ready {
                for &dep in &dependents[i] {
                    indegree[dep] -= 1;
                    if indegree[dep] == 0 {
                        next.push(dep);
                    }
                }
            }
            waves.push(std::mem::take(&mut ready));
            ready = next;
        }

        if done != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.packages[i].import_path.as_str())
                .collect();
            return Err(GraphError::ImportCycle {
                chain: stuck.join(" -> "),
            }
            .into());
        }
        Ok(waves)
    }
}
