use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process};
use tracing::{error, info};
use vulhub_flexibility::{
    apps::App,
    config::{ConfigManager, EnvConfigManager},
    logger::{LogLevel, init_tracing},
    plugin::builtin_plugins,
    schema::write_schema,
};

#[derive(Parser, Debug)]
#[command(
    name = "vulhub-flex",
    about = "Feature flags, service discovery and plugin hooks for VulHub Leaderboard",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the /flexibility API
    Run(RunArgs),

    /// Emit JSON-Schema for flags and service records
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Log level (error, warn, info, debug, trace). RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Directory for rolling log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// OpenTelemetry OTLP/HTTP endpoint (e.g. http://localhost:4318)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otel_endpoint: Option<String>,

    /// Optional .env file loaded before reading configuration
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: PathBuf::from("logs"),
            otel_endpoint: None,
            env_file: None,
        }
    }
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => {
            let written = write_schema(&args.out)?;
            for file in written {
                println!("{}", args.out.join(file).display());
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let telemetry = init_tracing(&args.log_dir, args.log_level, args.otel_endpoint)?;

    info!("VulHub flexibility layer starting up…");
    let config = ConfigManager(EnvConfigManager::new(args.env_file));

    let app = match App::bootstrap(config, builtin_plugins()).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to bootstrap flexibility layer: {e:#}");
            telemetry.shutdown();
            process::exit(1);
        }
    };

    info!("Press Ctrl-C to exit");
    let served = app
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("could not listen for Ctrl-C: {e}");
            }
        })
        .await;

    info!("Shutting down…");
    app.shutdown().await;
    telemetry.shutdown();
    served.map(|_| ())
}
