// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use log::{info, warn};
use ordersim::controller::{Report, format_labels};
use ordersim::scheduler::TokioScheduler;
use ordersim::{Session, SessionEvent, SimulationConfig, SimulationController, logging};

/// Headless runner for the ordering simulation.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML config file, overrides all other setup flags.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of servers.
    #[arg(long, default_value_t = 1)]
    servers: usize,
    /// Messages per client, one entry per client (e.g. `2,1,3`).
    #[arg(long, value_delimiter = ',', default_values_t = [1])]
    messages: Vec<usize>,
    /// Seed for all random choices.
    #[arg(long)]
    seed: Option<u64>,
    /// Milliseconds between two reply steps.
    #[arg(long, default_value_t = 1000)]
    step_delay_ms: u64,
    /// Re-permute arrived lists right before agreement.
    #[arg(long)]
    reshuffle_proposals: bool,
    /// Print the final report as JSON to stdout.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn simulation_config(&self) -> Result<SimulationConfig> {
        if let Some(path) = &self.config {
            return SimulationConfig::from_file(path)
                .wrap_err_with(|| format!("cannot load config from {}", path.display()));
        }
        Ok(SimulationConfig {
            seed: self.seed,
            step_delay_ms: self.step_delay_ms,
            reshuffle_proposals: self.reshuffle_proposals,
            ..SimulationConfig::new(self.servers, self.messages.clone())
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // enable fancy `color_eyre` error messages
    color_eyre::install()?;

    logging::enable_logforth();

    let args = Args::parse();
    let config = args.simulation_config()?;
    config.validate().wrap_err("invalid simulation parameters")?;

    let controller = SimulationController::new(&config);
    let scheduler = Arc::new(TokioScheduler::current());
    let (session, mut events) = Session::new(controller, scheduler, config.step_delay());

    session.broadcast();
    session.inspect(|c| {
        for server in 0..c.num_servers() {
            if let Ok(arrived) = c.list_arrived(server) {
                info!("server {} received: {}", server + 1, format_labels(arrived));
            }
        }
    });

    let agreed = session.agree_order()?;
    session.inspect(|c| {
        for (server, proposal) in c.list_proposals() {
            info!("server {} proposes: {}", server + 1, format_labels(proposal));
        }
    });
    info!(
        "agreed order (server {}): {}",
        agreed.proposer + 1,
        format_labels(agreed.keys)
    );

    session.start_reply_sequence()?;
    let report = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Step(step)) => info!(
                    "reply {} sent by {} server(s), progress {:.0}%",
                    step.message,
                    step.replied_by.len(),
                    step.progress_percent
                ),
                Some(SessionEvent::Complete(report)) => break *report,
                Some(SessionEvent::Cancelled) | None => {
                    return Err(eyre!("reply sequence stopped before completion"));
                }
            },
            res = tokio::signal::ctrl_c() => {
                res?;
                warn!("interrupted, cancelling reply sequence");
                session.cancel();
                return Err(eyre!("interrupted before the reply sequence completed"));
            }
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &Report) {
    for client in &report.clients {
        for (local, status) in &client.statuses {
            println!("client {} message {}: {status}", client.id + 1, local + 1);
        }
    }
    for (server, replies) in &report.replies_sent {
        println!("server {} replies: {}", server + 1, replies.join(", "));
    }
    println!("progress: {:.0}%", report.progress_percent);
}
