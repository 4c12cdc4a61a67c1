// Purpose: Argv dispatch for the modkit binary.
// Inputs/Outputs: Process args in, exit code out; diagnostics go to stderr.
// Invariants: Every failure prints `error[<kind>]: ...` with a machine kind.
// Gotchas: `run` propagates the child's exit code, not modkit's own.

use std::path::PathBuf;

use crate::build::{Disposition, ExternalCompiler, execute};
use crate::commands;
use crate::config::Config;
use crate::error::Error;

pub fn run_cli<I>(args: I) -> i32
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let cmd = match args.next() {
        Some(arg) => arg,
        None => {
            print_usage();
            return 2;
        }
    };
    if cmd == "help" || cmd == "--help" {
        print_usage();
        return 0;
    }

    let mut offline = false;
    let mut check = false;
    let mut output: Option<PathBuf> = None;
    let mut positional: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--offline" if flag_allowed(&cmd, "--offline") => offline = true,
            "--check" if flag_allowed(&cmd, "--check") => check = true,
            "-o" if flag_allowed(&cmd, "-o") => match args.next() {
                Some(path) => output = Some(PathBuf::from(path)),
                None => {
                    eprintln!("expected output path after -o");
                    return 2;
                }
            },
            "--offline" | "--check" | "-o" => {
                eprintln!("flag {} is not valid for `{}`", arg, cmd);
                return 2;
            }
            _ if arg.starts_with('-') => {
                eprintln!("unknown flag: {}", arg);
                return 2;
            }
            _ if positional.is_none() => positional = Some(arg),
            _ => {
                eprintln!("unexpected argument: {}", arg);
                return 2;
            }
        }
    }

    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(err) => return report(&err),
    };
    config.offline = offline;

    let cwd = match std::env::current_dir() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("error[io]: current_dir: {}", e);
            return 1;
        }
    };

    let result: anyhow::Result<i32> = match cmd.as_str() {
        "resolve" => commands::cmd_resolve(cwd, &config).map(|_| 0),
        "build" => {
            let compiler = ExternalCompiler::from_config(&config);
            execute(&cwd, &config, Disposition::Build { output }, &compiler)
                .map_err(anyhow::Error::from)
        }
        "run" => {
            let compiler = ExternalCompiler::from_config(&config);
            execute(&cwd, &config, Disposition::Run, &compiler).map_err(anyhow::Error::from)
        }
        "install" => {
            let compiler = ExternalCompiler::from_config(&config);
            execute(&cwd, &config, Disposition::Install, &compiler).map_err(anyhow::Error::from)
        }
        "init" => commands::cmd_init(cwd, positional).map(|_| 0),
        "tidy" => commands::cmd_tidy(cwd, &config, check).map(|_| 0),
        "graph" => commands::cmd_graph(cwd, &config).map(|_| 0),
        _ => {
            eprintln!("unknown command: {}", cmd);
            print_usage();
            return 2;
        }
    };

    match result {
        Ok(code) => code,
        Err(err) => report(&err),
    }
}

fn flag_allowed(cmd: &str, flag: &str) -> bool {
    match flag {
        "--offline" => matches!(cmd, "resolve" | "build" | "run" | "install" | "tidy"),
        "--check" => cmd == "tidy",
        "-o" => cmd == "build",
        _ => false,
    }
}

fn report(err: &anyhow::Error) -> i32 {
    let kind = err
        .downcast_ref::<Error>()
        .map(Error::kind)
        .unwrap_or("io");
    eprintln!("error[{}]: {:#}", kind, err);
    1
}

fn print_usage() {
    eprintln!("usage: modkit <command> [flags]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  resolve            resolve dependencies and write modkit.lock");
    eprintln!("  build [-o PATH]    compile and keep the binary");
    eprintln!("  run                compile, execute, discard the binary");
    eprintln!("  install            compile and copy into the install directory");
    eprintln!("  init [MODULE]      create a fresh modkit.toml");
    eprintln!("  tidy [--check]     sync [[require]] with imports in use");
    eprintln!("  graph              print resolved dependencies");
    eprintln!();
    eprintln!("flags:");
    eprintln!("  --offline          never touch the network");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_command_prints_usage_and_fails() {
        assert_eq!(run_cli(args(&[])), 2);
    }

    #[test]
    fn unknown_command_fails() {
        assert_eq!(run_cli(args(&["frobnicate"])), 2);
    }

    #[test]
    fn unknown_flag_fails() {
        assert_eq!(run_cli(args(&["build", "--what"])), 2);
    }

    #[test]
    fn help_succeeds() {
        assert_eq!(run_cli(args(&["help"])), 0);
    }

    #[test]
    fn flags_are_rejected_for_the_wrong_command() {
        assert_eq!(run_cli(args(&["resolve", "-o", "x"])), 2);
        assert_eq!(run_cli(args(&["resolve", "--check"])), 2);
        assert_eq!(run_cli(args(&["init", "--offline"])), 2);
        assert_eq!(run_cli(args(&["graph", "--offline"])), 2);
    }
}
