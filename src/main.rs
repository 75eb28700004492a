mod aggregator;
mod cli;
mod db;
mod document;
mod error;
mod fmt;
mod importer;
mod models;
mod reconciler;
mod reports;
mod settings;
mod writer;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, DashboardCommands};

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Columns { target } => cli::columns::run(&target),
        Commands::Process {
            source,
            target,
            column,
            mode,
            output,
            dry_run,
            no_cache,
        } => cli::process::run(cli::process::ProcessArgs {
            source,
            target,
            column,
            mode,
            output,
            dry_run,
            no_cache,
        }),
        Commands::Dashboard { file, command } => match command {
            DashboardCommands::Summary => cli::dashboard::summary(file.as_deref()),
            DashboardCommands::Rank { column, top } => {
                cli::dashboard::rank(file.as_deref(), &column, top)
            }
            DashboardCommands::Compare { entities, columns } => {
                cli::dashboard::compare(file.as_deref(), &columns, &entities)
            }
            DashboardCommands::Profile { entity } => {
                cli::dashboard::profile(file.as_deref(), &entity)
            }
        },
        Commands::History { limit } => cli::history::run(limit),
        Commands::Status => cli::status::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        if e.is_parse() {
            eprintln!("The input could not be read in the expected format.");
        }
        std::process::exit(1);
    }
}
