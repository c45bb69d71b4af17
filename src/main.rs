use std::process;

use render_cache::{
    cache::CacheConfig,
    config::{self, Command, ReplayArgs},
    infra::{error::InfraError, telemetry},
    replay::{self, ReplayError, Scenario},
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("failed to encode report: {0}")]
    Report(#[from] serde_json::Error),
}

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;
    let cache_config = CacheConfig::from(&settings.cache);

    match cli_args.command {
        Command::Replay(args) => run_replay(&cache_config, &args),
    }
}

fn run_replay(config: &CacheConfig, args: &ReplayArgs) -> Result<(), AppError> {
    info!(
        target = "render_cache::replay",
        path = %args.scenario.display(),
        enabled = config.enabled,
        max_redirect_hops = config.max_redirect_hops,
        "Starting replay"
    );

    let scenario = Scenario::load(&args.scenario)?;
    let report = replay::run(&scenario, config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}
