//! Dev Proxy Core - CLI Entry Point

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use dev_proxy_core::config::{resolve_config_file, ConfigSnapshot, LogLevel};
use dev_proxy_core::render::RenderedStdio;
use dev_proxy_core::validate::EXIT_INVALID;
use dev_proxy_core::{
    validate_config, ConfigWatcher, HttpRequest, HttpResponse, LiveProxy, OccurrenceTable,
    PluginRegistry, StdioMocker,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "devproxy-core",
    about = "Configuration and traffic matching core for Dev Proxy - mocks, faults and plugin dispatch",
    version
)]
struct Args {
    /// Path to configuration file (default: devproxyrc.* lookup)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, information, warning, error)
    #[arg(short = 'L', long, global = true, default_value = "information")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration and exit
    Validate {
        /// Report format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Run JSON requests from stdin (one per line) through the plugin pipeline,
    /// reloading on config changes
    Replay,

    /// Answer stdin lines with the configured stdio mocks
    Stdio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Stands in for the upstream server; this core never opens a socket.
async fn passthrough(_request: HttpRequest) -> HttpResponse {
    HttpResponse::new(200)
}

/// Write one mock's output, one line per stream.
async fn write_stdio(
    stdout: &mut tokio::io::Stdout,
    stderr: &mut tokio::io::Stderr,
    output: RenderedStdio,
) -> std::io::Result<()> {
    if let Some(mut out) = output.stdout {
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }
    if let Some(mut err) = output.stderr {
        err.push(b'\n');
        stderr.write_all(&err).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries command output
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level.to_tracing())
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let registry = PluginRegistry::with_builtins();

    match args.command {
        Command::Validate { output } => {
            let report = validate_config(args.config.as_deref(), &registry).await;
            match output {
                OutputFormat::Json => println!("{}", report.to_json()?),
                OutputFormat::Text => print!("{}", report.render_text()),
            }
            if !report.valid {
                std::process::exit(EXIT_INVALID);
            }
        }

        Command::Replay => {
            let path = resolve_config_file(args.config.as_deref())?;
            let proxy = Arc::new(LiveProxy::start(path, registry).await?);
            let watcher = ConfigWatcher::spawn(Arc::clone(&proxy))?;

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut stdout = tokio::io::stdout();

            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line?,
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal");
                        None
                    }
                };
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }

                let request: HttpRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed request line");
                        continue;
                    }
                };
                let outcome = proxy.handle(request, passthrough).await;
                let mut encoded = serde_json::to_vec(&outcome)?;
                encoded.push(b'\n');
                stdout.write_all(&encoded).await?;
                stdout.flush().await?;
            }

            watcher.stop();
        }

        Command::Stdio => {
            let path = resolve_config_file(args.config.as_deref())?;
            let snapshot = ConfigSnapshot::load(&path).await?;
            let occurrences = OccurrenceTable::new();
            let mocker = StdioMocker::load(&snapshot, &occurrences).await;
            info!(path = %path.display(), "Stdio mocks loaded");

            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();

            match mocker.startup().await {
                Ok(Some(output)) => write_stdio(&mut stdout, &mut stderr, output).await?,
                Ok(None) => {}
                Err(e) => error!(error = %e, "Failed to render startup stdio mock"),
            }

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                match mocker.handle_chunk(&line).await {
                    Ok(Some(output)) => write_stdio(&mut stdout, &mut stderr, output).await?,
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Failed to render stdio mock"),
                }
            }
        }
    }

    Ok(())
}
