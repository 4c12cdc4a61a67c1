// Purpose: Define the crate-level module surface for the modkit tool.
// Inputs/Outputs: Re-exports internal modules for the binary and integration callers.
// Invariants: Public module boundaries should remain stable for internal callers.
// Gotchas: Keep module wiring consistent with the src/main.rs entry path.

pub mod build;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod import_scan;
pub mod lockfile;
pub mod manifest;
pub mod registry;
pub mod resolve;
pub mod version;
