use clap::{Parser, Subcommand};
use taberna_server::maintenance::schedule::TaskKind;

const HELP_EPILOG: &str = r#"Server options can also be provided via environment variables:
  CONFIG_PATH (default: ./config.yaml)
  DB_PATH     (default: data/app.db)
  PORT        (default: 5151 or config.listen_port)
  RUST_LOG    (default: info)

Without a subcommand the scheduler runs every minute alongside the health
endpoints. `run` executes one task right away, e.g. from an external cron.
"#;

#[derive(Debug, Parser)]
#[command(
    name = "taberna-server",
    version,
    about = "La Taberna maintenance daemon",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Optional subcommand. Without one, runs the daemon.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single maintenance task once, honoring its lock
    Run {
        #[arg(value_enum)]
        task: TaskKind,
    },
    /// Print the last scheduler heartbeat; exits non-zero when it is stale
    Heartbeat,
}
