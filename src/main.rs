// Purpose: Provide the binary entry for the modkit CLI.
// Inputs/Outputs: Reads process args and exits with the code from the CLI dispatcher.
// Invariants: Main must not bypass centralized CLI argument/diagnostic handling.
// Gotchas: Any flag or command change belongs in cli/mod.rs, not this shim.

fn main() {
    let code = modkit::cli::run_cli(std::env::args().skip(1));
    std::process::exit(code);
}
