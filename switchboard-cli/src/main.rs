use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::Verbosity;

mod admin;
mod command;

#[derive(Debug, clap::Parser)]
#[command(name = "switchboard", version)]
#[command(about = "Redirect one local port to a switchable backend environment.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    /// Directory holding the persisted environment state
    #[arg(long, default_value = ".proxy-data", env = "SWITCHBOARD_DATA_DIR", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: command::Command,
}

fn init_logger_env(verbosity: &Verbosity) {
    use tracing::level_filters::LevelFilter;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .with_env_var("SWITCHBOARD_LOG")
        .from_env_lossy();

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(match (verbosity.is_present(), verbosity.is_silent()) {
            (false, _) => env_filter,
            (true, true) => env_filter.add_directive(LevelFilter::OFF.into()),
            (true, false) => {
                let level_filter = match verbosity.log_level_filter() {
                    clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
                    clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
                    clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
                    clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
                    clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
                    clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
                };
                env_filter.add_directive(level_filter.into())
            }
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger_env(&cli.verbose);

    match &cli.command {
        command::Command::Serve(args) => {
            command::serve::execute(args, &cli.data_dir).await?;
        }
        command::Command::Status(args) => {
            command::status::execute(args, &cli.data_dir).await?;
        }
        command::Command::List(args) => {
            command::list::execute(args, &cli.data_dir).await?;
        }
        command::Command::Add(args) => {
            command::add::execute(args, &cli.data_dir).await?;
        }
        command::Command::Remove(args) => {
            command::remove::execute(args, &cli.data_dir).await?;
        }
        command::Command::Switch(args) => {
            command::switch::execute(args, &cli.data_dir).await?;
        }
    }

    Ok(())
}
