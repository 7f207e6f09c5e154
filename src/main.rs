//! studio-host — runs the Studio server under supervision.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use studio_host::config::{self, StudioConfig};
use studio_host::router::MessageRouter;
use studio_host::supervisor::health::{HealthProbe, HttpProbe};
use studio_host::supervisor::{SessionEvent, StudioSupervisor, base_url};
use studio_host::SessionState;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "studio-host", about = "Studio server supervisor")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Port for the Studio server (overrides the config file)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Path to the Studio server binary (overrides the config file)
    #[arg(long, global = true)]
    binary: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start the server and keep it running until Ctrl-C (default)
    Run,
    /// Probe the server's health endpoint once
    Probe,
    /// Print the effective configuration as JSON
    Config {
        /// Persist the effective configuration
        #[arg(long)]
        save: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("STUDIO_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    log_format(filter).init();
}

/// Targets stay visible so `studio::server` output stands apart from host logs.
fn log_format(
    filter: EnvFilter,
) -> fmt::SubscriberBuilder<fmt::format::DefaultFields, fmt::format::Format, EnvFilter> {
    fmt().with_env_filter(filter).with_target(true)
}

fn effective_config(cli: &Cli) -> StudioConfig {
    let mut config = config::load_config();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(binary) = &cli.binary {
        config.binary = Some(binary.clone());
    }
    config
}

async fn run(config: StudioConfig) -> ExitCode {
    let supervisor = StudioSupervisor::new(config, MessageRouter::new());

    let (stopped_tx, mut stopped_rx) = watch::channel(false);
    supervisor.subscribe(move |event| {
        match event {
            SessionEvent::StateChanged {
                to: SessionState::Stopped,
                ..
            } => {
                let _ = stopped_tx.send(true);
            }
            SessionEvent::Crashed { port, code, .. } => {
                warn!(port, code = ?code, "studio server exited");
            }
            _ => {}
        }
        Ok(())
    });

    let status = match supervisor.start().await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string(&status) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("failed to encode status: {}", e),
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("failed to listen for Ctrl-C: {}", e);
            }
            info!("shutting down");
        }
        _ = stopped_rx.wait_for(|stopped| *stopped) => {
            supervisor.shutdown().await;
            return ExitCode::FAILURE;
        }
    }

    supervisor.shutdown().await;
    ExitCode::SUCCESS
}

async fn probe(port: u16) -> ExitCode {
    let url = base_url(port);
    if HttpProbe::new().probe(&url).await {
        println!("{url} is healthy");
        ExitCode::SUCCESS
    } else {
        println!("{url} is not responding");
        ExitCode::FAILURE
    }
}

fn show_config(config: &StudioConfig, save: bool) -> ExitCode {
    if save && let Err(e) = config::save_config(config) {
        eprintln!("failed to save config: {e}");
        return ExitCode::FAILURE;
    }
    match serde_json::to_string_pretty(config) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to encode config: {e}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = effective_config(&cli);
    if let Some(Command::Config { save }) = &cli.command {
        return show_config(&config, *save);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        match cli.command {
            Some(Command::Probe) => probe(config.port).await,
            _ => run(config).await,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_no_subcommand() {
        let cli = Cli::try_parse_from(["studio-host"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
        assert!(cli.port.is_none());
    }

    #[test]
    fn cli_verbose_three() {
        let cli = Cli::try_parse_from(["studio-host", "-vvv"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn cli_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "studio-host",
            "run",
            "--port",
            "5111",
            "--binary",
            "/opt/studio/server",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Run)));
        assert_eq!(cli.port, Some(5111));
        assert_eq!(cli.binary, Some(PathBuf::from("/opt/studio/server")));
    }

    #[test]
    fn cli_probe() {
        let cli = Cli::try_parse_from(["studio-host", "probe", "--port", "4000"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Probe)));
        assert_eq!(cli.port, Some(4000));
    }

    #[test]
    fn cli_config_save() {
        let cli = Cli::try_parse_from(["studio-host", "config", "--save"]).unwrap();
        match cli.command {
            Some(Command::Config { save }) => assert!(save),
            _ => panic!("expected Config command"),
        }
    }

    #[test]
    fn overrides_apply_on_top_of_loaded_config() {
        let cli = Cli::try_parse_from(["studio-host", "--port", "6001"]).unwrap();
        let config = effective_config(&cli);
        assert_eq!(config.port, 6001);
    }

    #[derive(Clone, Default)]
    struct Capture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn server_output_keeps_its_target() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = log_format(EnvFilter::new("info"))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            info!(target: "studio::server", "listening on 4983");
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("studio::server"), "{output}");
        assert!(output.contains("listening on 4983"), "{output}");
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(Cli::try_parse_from(["studio-host", "--port", "70000"]).is_err());
    }
}
