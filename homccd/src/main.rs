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
//! homccd accepts connections from homcc clients and compiles on their
//! behalf. See [the homcc project](https://github.com/homcc-rs/homcc) for
//! more info.

use clap::Parser;
use libhomcc::config;
use libhomcc::server::{self, signals, Server};

#[derive(Parser, Debug)]
#[clap(author, about, version)]
struct Args {
    #[clap(short, long, help = "address to listen on, overriding the config file")]
    address: Option<String>,

    #[clap(short, long, help = "port to listen on, overriding the config file")]
    port: Option<u16>,

    #[clap(short, long, help = "maximum number of concurrent compile jobs, overriding the config file")]
    limit: Option<usize>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    config_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "show more in logs, may be provided multiple times")]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::read_server_config(&args.config_file)?;
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(limit) = args.limit {
        config.limit = limit;
    }

    let level = if args.verbose == 0 && !config.verbose {
        tracing::Level::INFO
    } else if args.verbose <= 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).with_writer(std::io::stderr).init();

    signals::spawn_handler()?;

    let server = Server::new(&config)?;
    server::Server::serve(server, &config)
}
