// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::env;
use std::process::ExitCode;
use std::time::Instant;

use parstep::commands::{command_step, CommandRecord};
use parstep::config::{load_and_validate_config, RunnerConfig};
use parstep::engine::{Coordinator, ResultsRegistry};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 || args[1] == "-h" || args[1] == "--help" {
        eprintln!("Usage: {} <config.yaml|config.toml>", args[0]);
        eprintln!("Example: {} ci-steps.yaml", args[0]);
        eprintln!("Set RUST_LOG=info to see worker lifecycle logs.");
        return ExitCode::from(2);
    }

    init_tracing();

    let cfg = match load_and_validate_config(&args[1]) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args[1], e);
            return ExitCode::from(2);
        }
    };

    run(&cfg).await
}

async fn run(cfg: &RunnerConfig) -> ExitCode {
    println!(
        "Running {} steps (max parallel: {})",
        cfg.steps.len(),
        cfg.max_parallel
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unbounded".to_string())
    );

    let steps = cfg.steps.iter().map(command_step).collect();
    let started = Instant::now();
    let mut registry = ResultsRegistry::new();
    let result = Coordinator::new(cfg.coordinator_options())
        .run(steps, &mut registry)
        .await;

    print_summary(cfg, registry.records(), started);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("\n{} step(s) failed:\n", failure.len());
            eprint!("{}", failure);
            ExitCode::FAILURE
        }
    }
}

fn print_summary(cfg: &RunnerConfig, records: &[CommandRecord], started: Instant) {
    println!("\nSummary");
    println!("{}", "-".repeat(40));
    for step in &cfg.steps {
        match records.iter().find(|r| r.name == step.name) {
            Some(record) => println!(
                "  ok    {:<24} {:>6} ms",
                record.name, record.duration_ms
            ),
            None => println!("  FAIL  {}", step.name),
        }
    }
    println!(
        "{} of {} steps passed in {:.2?}",
        records.len(),
        cfg.steps.len(),
        started.elapsed()
    );
}
