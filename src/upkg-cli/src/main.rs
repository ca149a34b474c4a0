//! upkg - Unreal package inspector

mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands};

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "upkg=info",
        1 => "upkg=debug",
        _ => "upkg=trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = config::resolve(&cli)?;

    match cli.command {
        Commands::Info { packages, json } => commands::inspect::info(config, &packages, json),
        Commands::Names { package } => commands::inspect::names(config, &package),
        Commands::Imports { package } => commands::inspect::imports(config, &package),
        Commands::Exports { package } => commands::inspect::exports(config, &package),
        Commands::List { paths } => commands::list::handle(config, &paths),
        Commands::Dump { package, object } => {
            commands::dump::handle(config, &package, object.as_deref())
        }
        Commands::Unpack { package, output } => commands::unpack::handle(config, &package, &output),
    }
}
