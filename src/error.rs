// Purpose: Define the machine-distinguishable error taxonomy for every pipeline stage.
// Inputs/Outputs: Typed errors produced by manifest/graph/resolve/fetch/build, consumed by CLI.
// Invariants: Every error carries a stable kind string and a human-readable message.
// Gotchas: FetchError is the only retryable family; IntegrityError must never be retried.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable identifier printed as `error[<kind>]` so callers can dispatch
    /// on the failure family without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Manifest(_) => "manifest",
            Error::Graph(_) => "graph",
            Error::Resolution(_) => "resolution",
            Error::Fetch(_) => "fetch",
            Error::Integrity(_) => "integrity",
            Error::Compile(_) => "compile",
            Error::Io { .. } => "io",
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("{}: malformed manifest: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{}: module identity missing (set `module = \"...\"`)", path.display())]
    MissingIdentity { path: PathBuf },
    #[error("modkit.toml not found in {} or any parent", start.display())]
    NotFound { start: PathBuf },
    #[error("{}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(
        "{}: package name conflict: {} declares package {first_name}, {} declares package {second_name}",
        dir.display(),
        first_file.display(),
        second_file.display()
    )]
    PackageNameConflict {
        dir: PathBuf,
        first_file: PathBuf,
        first_name: String,
        second_file: PathBuf,
        second_name: String,
    },
    #[error(
        "{}: import \"{import}\" matches no local package or declared dependency{suggestion}",
        file.display()
    )]
    UnresolvedImport {
        file: PathBuf,
        import: String,
        suggestion: String,
    },
    #[error("{}: missing package declaration", file.display())]
    MissingPackageDecl { file: PathBuf },
    #[error("import cycle between packages: {chain}")]
    ImportCycle { chain: String },
    #[error("module dependency cycle: {chain}")]
    ModuleCycle { chain: String },
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(
        "no version of {module} matches `{constraint}` (available: {available})"
    )]
    NoMatchingVersion {
        module: String,
        constraint: String,
        available: String,
    },
    #[error(
        "ambiguous override for {module}: both {} and {}",
        first.display(),
        second.display()
    )]
    AmbiguousOverride {
        module: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("invalid version constraint `{constraint}` for {module}")]
    InvalidConstraint { module: String, constraint: String },
    #[error("override path for {module} ({}): {source}", path.display())]
    OverridePath {
        module: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GET {url} failed: {message}")]
    Http { url: String, message: String },
    #[error("{}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry lists no versions for {module}")]
    NoVersions { module: String },
    #[error("bad archive for {module}@{version}: {message}")]
    BadArchive {
        module: String,
        version: String,
        message: String,
    },
    #[error("{module}@{version} is not cached and fetching is disabled (offline)")]
    Offline { module: String, version: String },
}

impl FetchError {
    /// Only transport failures are worth retrying; everything else is
    /// deterministic and will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Http { .. })
    }
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("fetched module declares identity {declared}, requested {requested}")]
    IdentityMismatch { requested: String, declared: String },
    #[error("checksum mismatch for {module}@{version}: lock {expected}, computed {computed}")]
    ChecksumMismatch {
        module: String,
        version: String,
        expected: String,
        computed: String,
    },
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("package {package} ({file}): {detail}")]
    Package {
        package: String,
        file: String,
        detail: String,
    },
    #[error("failed to spawn compiler {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("link failed: {detail}")]
    Link { detail: String },
}
