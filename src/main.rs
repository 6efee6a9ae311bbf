//! Binary entrypoint for the meshai CLI.
//!
//! Commands:
//! - `start [--port <path>]` - connect, arm the AI service and answer prefixed messages
//! - `init` - write a starter `config.toml`
//! - `probe` - check the completion service credential and print the result
//! - `send-test --port <path>` - broadcast a timestamped test message
//!
//! See the library crate docs for module-level details: `meshai::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use meshai::bot::completion::{CompletionAdapter, OpenAiBackend};
use meshai::bot::BotServer;
use meshai::config::Config;

#[derive(Parser)]
#[command(name = "meshai")]
#[command(about = "Answers prefixed Meshtastic messages with an AI completion service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the device and run the bot
    Start {
        /// Meshtastic device port (e.g., /dev/ttyUSB0); overrides the config
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Validate the completion service credential
    Probe,
    /// Broadcast a test message and exit
    SendTest {
        /// Device serial port
        #[arg(short, long)]
        port: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { port } => {
            let config = match pre_config {
                Some(cfg) => cfg,
                None => Config::load(&cli.config).await?,
            };
            info!("Starting meshai v{}", env!("CARGO_PKG_VERSION"));
            let auto_start = config.bot.auto_start;
            let mut server = BotServer::new(config);

            // Neither failure is fatal: the operator can fix the device or key and restart
            if let Err(e) = server.connect_device(port.as_deref()).await {
                warn!("{} (bot continuing without device)", e);
            }
            if let Err(e) = server.enable_service().await {
                warn!("AI service not enabled: {}", e);
            }
            if auto_start {
                match server.start() {
                    Ok(()) => info!("Bot active; answering prefixed messages"),
                    Err(e) => warn!("Cannot start bot: {}", e),
                }
            }
            server.run().await?;
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Probe => {
            let config = match pre_config {
                Some(cfg) => cfg,
                None => Config::load(&cli.config).await?,
            };
            let api_key = config.llm.resolve_api_key()?;
            let backend = OpenAiBackend::new(&config.llm, api_key)?;
            let endpoint = backend.endpoint().to_string();
            let adapter = CompletionAdapter::from_config(std::sync::Arc::new(backend), &config.llm);
            let result = adapter.probe().await;
            let payload = serde_json::json!({
                "status": if result.is_ok() { "ok" } else { "error" },
                "endpoint": endpoint,
                "model": config.llm.model,
                "error": result.as_ref().err().map(|e| e.to_string()),
            });
            println!("{}", payload);
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
        Commands::SendTest { port } => {
            let config = pre_config.unwrap_or_default();
            let mut server = BotServer::new(config);
            server.connect_device(Some(&port)).await?;
            let outcome = server.send_test_message().await;
            server.disconnect().await;
            if let Err(e) = outcome {
                error!("Test message failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let file = std::sync::Mutex::new(f);
        // Foreground runs also echo to the console
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
