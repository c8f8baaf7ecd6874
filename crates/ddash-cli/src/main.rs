//! ddash CLI - interactive network permissions for sandboxed commands
//!
//! Runs the ddash-proxy server on loopback, seeded from the project's
//! `.ddash.json`, and writes persistent answers back when it stops.

mod cli;
mod error;
mod output;
mod project;

use clap::Parser;
use cli::{Cli, Commands, DomainsArgs, ProxyArgs};
use ddash_proxy::ProxyConfig;
use error::{CliError, Result};
use project::ProjectConfig;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("ddash: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Proxy(args) => run_proxy(args, cli.silent),
        Commands::Domains(args) => run_domains(args),
    }
}

fn run_proxy(args: ProxyArgs, silent: bool) -> Result<()> {
    let project = ProjectConfig::load(&args.config)?;

    let config = ProxyConfig {
        bind_addr: args.bind,
        bind_port: args.port,
        command_name: args.name,
        domains: project
            .as_ref()
            .map(ProjectConfig::domain_tokens)
            .unwrap_or_default(),
        ..Default::default()
    };

    // Multi-thread so the accept loop keeps running while this thread waits
    // on Ctrl-C.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    let outcome = rt.block_on(async {
        let handle = ddash_proxy::start(config).await?;
        info!("ddash proxy listening on {}", handle.addr());
        output::print_env(&handle.env_vars());

        let waited = tokio::signal::ctrl_c().await;
        handle.shutdown();
        waited.map_err(CliError::Signal)?;

        Ok::<_, CliError>((handle.decisions(), handle.persistent_decisions()))
    });

    // A prompt may still be blocked reading the control channel.
    rt.shutdown_timeout(Duration::from_millis(200));
    let (decisions, persistent) = outcome?;

    let mut saved = 0;
    if !args.no_save && !persistent.is_empty() {
        let mut project =
            project.unwrap_or_else(|| ProjectConfig::new(project::project_name(&args.config)));
        saved = project.merge_persistent(&persistent);
        if saved > 0 {
            project.save(&args.config)?;
            info!("Saved {} decision(s) to {}", saved, args.config.display());
        }
    }

    output::print_summary(&decisions, saved, silent);
    Ok(())
}

fn run_domains(args: DomainsArgs) -> Result<()> {
    let project = ProjectConfig::load(&args.config)?.unwrap_or_default();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&project.domains)?);
    } else {
        output::print_domains(&args.config, &project.domains);
    }
    Ok(())
}
