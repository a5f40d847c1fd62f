// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command line entry point for the `homcc` wrapper: recognizes informational
//! flags, detects recursive self-invocation, and otherwise hands the
//! compiler invocation off to [`crate::client::dispatcher::dispatch`].

use std::path::PathBuf;

use tracing::debug;

use crate::arguments::Arguments;
use crate::client::dispatcher;
use crate::config::{self, ClientConfig};
use crate::consts::{EX_USAGE, RECURSION_SENTINEL_VAR};
use crate::host::Host;
use crate::hosts;

const DEFAULT_COMPILER: &str = "cc";

pub struct CliOutcome {
    pub exit_code: i32,
}

/// Runs the client wrapper. `argv` is the full `std::env::args()` vector,
/// including `argv[0]`.
pub fn run(argv: Vec<String>) -> CliOutcome {
    if std::env::var(RECURSION_SENTINEL_VAR).is_ok() {
        eprintln!("homcc: refusing to recurse into itself; check that your PATH does not point a compiler name back at homcc");
        return CliOutcome { exit_code: EX_USAGE };
    }

    let (flags, remaining) = split_flags(&argv[1..]);

    if flags.help {
        print_help();
        return CliOutcome { exit_code: 0 };
    }
    if flags.version {
        println!("homcc {}", env!("CARGO_PKG_VERSION"));
        return CliOutcome { exit_code: 0 };
    }

    init_logging(flags.debug || std::env::var("HOMCC_VERBOSE").is_ok());

    let config_file = flags.config_file.clone();
    let mut config = match config::read_client_config(&config_file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("homcc: failed to read client config: {err}");
            return CliOutcome { exit_code: EX_USAGE };
        }
    };
    if let Some(timeout) = flags.timeout {
        config.compilation_request_timeout = timeout;
    }

    let hosts = match resolve_hosts(&flags) {
        Ok(hosts) => hosts,
        Err(err) => {
            eprintln!("homcc: {err}");
            return CliOutcome { exit_code: EX_USAGE };
        }
    };

    if flags.show_hosts {
        for host in &hosts {
            println!("{host}");
        }
        return CliOutcome { exit_code: 0 };
    }
    if flags.concurrency_level {
        println!("{}", hosts.iter().map(|h| h.limit).sum::<usize>());
        return CliOutcome { exit_code: 0 };
    }

    let compiler = compiler_from_argv0(&argv[0]).unwrap_or_else(|| DEFAULT_COMPILER.to_string());
    let arguments = Arguments::new(compiler, remaining);

    if flags.scan_includes {
        let dependencies = dispatcher::list_dependencies(&arguments);
        for dependency in dependencies {
            println!("{dependency}");
        }
        return CliOutcome { exit_code: 0 };
    }

    // prevents a misconfigured PATH from making the local-compilation
    // fallback recurse back into homcc
    std::env::set_var(RECURSION_SENTINEL_VAR, "1");

    let localhost = Host::default_compilation_localhost();
    let exit_code = match dispatcher::dispatch(&arguments, &hosts, &localhost, &config) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("homcc: {err}");
            EX_USAGE
        }
    };

    CliOutcome { exit_code }
}

#[derive(Default)]
struct Flags {
    help: bool,
    version: bool,
    show_hosts: bool,
    concurrency_level: bool,
    scan_includes: bool,
    debug: bool,
    host: Option<String>,
    timeout: Option<f64>,
    config_file: Option<String>,
}

/// Separates homcc's own flags from everything meant for the compiler. Since
/// compiler argument grammars vary wildly, this only recognizes a fixed set
/// of homcc-prefixed long flags and otherwise passes arguments through
/// untouched, mirroring `argparse`'s `parse_known_args` split.
fn split_flags(args: &[String]) -> (Flags, Vec<String>) {
    let mut flags = Flags::default();
    let mut remaining = Vec::with_capacity(args.len());
    let mut it = args.iter().peekable();

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--help" | "-h" => flags.help = true,
            "--version" | "-v" => flags.version = true,
            "--show-hosts" | "--hosts" => flags.show_hosts = true,
            "-j" => flags.concurrency_level = true,
            "--scan-includes" | "--dependencies" => flags.scan_includes = true,
            "--DEBUG" => flags.debug = true,
            "--host" => flags.host = it.next().cloned(),
            "--timeout" => flags.timeout = it.next().and_then(|v| v.parse().ok()),
            "--config-file" => flags.config_file = it.next().cloned(),
            _ => remaining.push(arg.clone()),
        }
    }

    (flags, remaining)
}

fn init_logging(debug: bool) {
    let level = if debug { tracing::Level::DEBUG } else { tracing::Level::WARN };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_hosts(flags: &Flags) -> Result<Vec<Host>, String> {
    if let Some(host) = &flags.host {
        return Host::parse(host).map(|h| vec![h]).map_err(|err| err.to_string());
    }
    hosts::load_hosts(None).map_err(|err| err.to_string())
}

/// `argv[0]` may be a symlink named after a compiler (`gcc`, `clang++`,
/// `x86_64-linux-gnu-g++`), the convention by which users drop homcc into
/// their PATH ahead of the real compiler. If it's just "homcc" itself, no
/// compiler can be inferred from it.
fn compiler_from_argv0(argv0: &str) -> Option<String> {
    let name = PathBuf::from(argv0).file_name()?.to_string_lossy().into_owned();
    if name == "homcc" {
        debug!("argv[0] is homcc itself, falling back to the default compiler");
        return None;
    }
    Some(name)
}

fn print_help() {
    println!("homcc - Home-Office friendly distcc replacement");
    println!();
    println!("USAGE: homcc [FLAGS] [COMPILER] ARGUMENTS...");
    println!();
    println!("FLAGS:");
    println!("    --help                 show this help message and exit");
    println!("    --version              show version and exit");
    println!("    --show-hosts           show the configured host list and exit");
    println!("    -j                     show the total concurrency level and exit");
    println!("    --scan-includes        show the dependencies that would be sent to the server and exit");
    println!("    --DEBUG                enable verbose logging");
    println!("    --host HOST            override the configured host list with a single host");
    println!("    --timeout SECONDS      override the compilation request timeout");
    println!("    --config-file PATH     use an explicit config file instead of the default location");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_homcc_flags_from_compiler_args() {
        let argv = vec!["--DEBUG".to_string(), "-c".to_string(), "main.c".to_string(), "--host".to_string(), "buildhost".to_string()];
        let (flags, remaining) = split_flags(&argv);
        assert!(flags.debug);
        assert_eq!(flags.host.as_deref(), Some("buildhost"));
        assert_eq!(remaining, vec!["-c".to_string(), "main.c".to_string()]);
    }

    #[test]
    fn compiler_from_argv0_detects_symlink_name() {
        assert_eq!(compiler_from_argv0("/usr/local/bin/g++").as_deref(), Some("g++"));
        assert_eq!(compiler_from_argv0("/usr/bin/homcc"), None);
    }
}
