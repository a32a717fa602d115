use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Run { config, db, listen, mock } => {
            yield_rails::run::run(&yield_rails::run::RunOptions { config, db, listen, mock })
        }
        cli::Command::Demo => yield_rails::demo::run(),
        cli::Command::Ledger { payment_id, db } => yield_rails::inspect::run(&db, &payment_id),
        cli::Command::ExampleConfig => {
            let config = yield_rails::config::EngineConfig::default();
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        cli::Command::Schema => yield_rails::schema::run(),
    }
}
