#![forbid(unsafe_code)]

//! Workbench binary: runs the container scenarios and reports the outcome.

mod cli;
mod scenarios;

use std::process::ExitCode;

use mcs_storage::StorageConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scenarios::{SCENARIOS, Scenario};

fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let opts = cli::Opts::parse();
    init_tracing(&opts.log);

    if opts.list {
        for scenario in SCENARIOS {
            let marker = if scenario.crashes { " (crashes)" } else { "" };
            println!("{:<20} {}{marker}", scenario.name, scenario.summary);
        }
        return ExitCode::SUCCESS;
    }

    let selection: Vec<&Scenario> = match opts.scenario.as_deref() {
        Some(name) => match scenarios::find(name) {
            Some(scenario) => vec![scenario],
            None => {
                eprintln!("Unknown scenario: {name}");
                eprintln!("Run with --list to see the available scenarios.");
                return ExitCode::FAILURE;
            }
        },
        None => SCENARIOS.iter().filter(|s| !s.crashes).collect(),
    };

    let mut config = StorageConfig::from_env().with_label("workbench");
    if opts.trace_notify {
        config = config.with_trace_notifications(true);
    }

    let mut failures = 0usize;
    for round in 1..=opts.repeat.max(1) {
        for scenario in &selection {
            let _span = tracing::info_span!("scenario", name = scenario.name, round).entered();
            match scenario.run(&config) {
                Ok(()) => info!("ok"),
                Err(err) => {
                    error!(%err, "failed");
                    failures += 1;
                }
            }
        }
    }

    let total = selection.len() * opts.repeat.max(1) as usize;
    println!("{} of {total} scenario run(s) passed", total - failures);
    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
