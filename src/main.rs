// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! spacey-agent CLI - inspect and exercise the keep-alive connection pool
//!
//! ## Commands
//!
//! - `repl`: interactive pool simulator (the default)
//! - `bench`: push requests through a real agent against a TCP server
//! - `config`: print the effective agent options

mod repl;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use owo_colors::OwoColorize;
use spacey_agent::{Agent, AgentOptions, ConnectOptions, TcpTransport};

#[derive(Parser)]
#[command(
    name = "spacey-agent",
    about = "Keep-alive connection pool inspector for Spacey",
    version,
    author = "Pegasus Heavy Industries"
)]
struct Cli {
    /// JSON file with agent options (Node.js option names)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override an option, e.g. `--set max-sockets=2`
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    /// Enable keep-alive
    #[arg(long, global = true)]
    keep_alive: bool,

    /// Maximum sockets per endpoint
    #[arg(long, global = true)]
    max_sockets: Option<usize>,

    /// Maximum idle sockets per endpoint
    #[arg(long, global = true)]
    max_free_sockets: Option<usize>,

    /// Maximum sockets across all endpoints
    #[arg(long, global = true)]
    max_total_sockets: Option<usize>,

    /// Idle socket selection: lifo or fifo
    #[arg(long, global = true)]
    scheduling: Option<String>,

    /// Idle socket timeout in milliseconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a simulated pool interactively
    Repl,
    /// Send requests through an agent to a TCP server
    Bench {
        /// Server host
        #[arg(long, default_value = "localhost")]
        host: String,
        /// Server port
        #[arg(long, short)]
        port: u16,
        /// Number of requests
        #[arg(short = 'n', long, default_value_t = 10)]
        requests: usize,
        /// Requests in flight at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Print the effective options as JSON
    Config,
}

impl Cli {
    /// Config file, then `SPACEY_AGENT_*`, then flags
    fn agent_options(&self) -> anyhow::Result<AgentOptions> {
        let mut options = AgentOptions::load(self.config.as_deref())
            .context("failed to load agent options")?;

        if self.keep_alive {
            options.keep_alive = true;
        }
        if let Some(max) = self.max_sockets {
            options.max_sockets = Some(max);
        }
        if let Some(max) = self.max_free_sockets {
            options.max_free_sockets = max;
        }
        if let Some(max) = self.max_total_sockets {
            options.max_total_sockets = Some(max);
        }
        if let Some(scheduling) = &self.scheduling {
            options.scheduling = scheduling.parse()?;
        }
        if let Some(timeout) = self.timeout {
            options.timeout = Some(timeout);
        }
        for entry in &self.overrides {
            let (key, value) = entry
                .split_once('=')
                .with_context(|| format!("expected KEY=VALUE, got '{}'", entry))?;
            options.set(key.trim(), value)?;
        }

        Ok(options.validate()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("spacey_agent=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("spacey_agent=warn")
            .init();
    }

    let options = cli.agent_options()?;

    match cli.command {
        None | Some(Command::Repl) => {
            let mut repl = repl::Repl::new(options)?;
            repl.run()?;
        }
        Some(Command::Bench {
            host,
            port,
            requests,
            concurrency,
        }) => bench(options, host, port, requests, concurrency).await?,
        Some(Command::Config) => {
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
    }

    Ok(())
}

/// Issue `requests` requests in waves of `concurrency` and report reuse
async fn bench(
    options: AgentOptions,
    host: String,
    port: u16,
    requests: usize,
    concurrency: usize,
) -> anyhow::Result<()> {
    tracing::info!(?options, requests, concurrency, "starting bench");
    let agent = Agent::spawn(options, TcpTransport::new())?;
    let target = ConnectOptions::new(host, port);
    println!(
        "{} {} ({} requests, {} at a time)",
        "benching".cyan().bold(),
        agent.get_name(&target).yellow(),
        requests,
        concurrency
    );

    let started = Instant::now();
    let mut reused = 0;
    let mut failed = 0;
    let mut remaining = requests;
    while remaining > 0 {
        let wave = remaining.min(concurrency.max(1));
        remaining -= wave;

        tracing::debug!(wave, remaining, "sending wave");
        let leases = join_all((0..wave).map(|_| agent.request(target.clone()))).await;
        for lease in leases {
            match lease {
                Ok(lease) => {
                    if lease.reused() {
                        reused += 1;
                    }
                    lease.release();
                }
                Err(err) => {
                    failed += 1;
                    eprintln!("{}: {}", "Error".red().bold(), err);
                }
            }
        }
    }

    let stats = agent.stats().await?;
    println!(
        "{} {} reused, {} failed in {:?}",
        "done".green().bold(),
        reused.to_string().yellow(),
        failed.to_string().red(),
        started.elapsed()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    agent.destroy().await?;
    Ok(())
}
