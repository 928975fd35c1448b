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

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod audit;
pub mod config;
pub mod consts;
pub mod daemon;
pub mod error;
pub mod schema;
pub mod store;
pub mod tree;
pub mod user;
pub mod xml;
pub mod xpath;

const DEFAULT_SOCKET: &str = "/run/netconfd/netconfd.socket";

/// The command line arguments that netconfd expects. These can be
/// directly parsed with clap or manually constructed in order to present
/// some other user interface.
#[derive(Parser, Debug)]
#[clap(author, about, version)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        long_help = "The path for the unix socket to listen on

The transport front-end (the SSH subsystem bridge) connects here and
hands over one stream per NETCONF session. Defaults to
/run/netconfd/netconfd.socket."
    )]
    pub socket: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(long, action, help = "override the schema model directory from the config")]
    pub schema_dir: Option<String>,
}

/// Run the netconfd daemon with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let mut config = config::read_config(&args.config_file).context("reading config")?;
    if args.schema_dir.is_some() {
        config.schema_dir = args.schema_dir.clone();
    }

    let socket = args
        .socket
        .clone()
        .or_else(|| config.socket.clone())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));

    let res = daemon::run(config, socket);
    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
