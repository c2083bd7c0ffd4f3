//! tdsweb - WebSocket gateway to SQL Server sessions.

mod session_server;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use tdsweb_config::{ConfigError, Settings};
use tdsweb_tds::{MssqlConnector, MssqlOptions};

use crate::session_server::{GatewayConfig, GatewayServer, SessionSettings};

/// How long open connections get to tear down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "tdsweb")]
#[command(about = "WebSocket gateway to SQL Server sessions")]
#[command(version)]
struct Cli {
    /// Settings file (default: <config dir>/tdsweb/config.toml if present)
    #[arg(long, short = 'c', env = "TDSWEB_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "TDSWEB_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Port to listen on
    #[arg(long, short = 'p', env = "TDSWEB_PORT")]
    port: Option<u16>,

    /// SQL Server host
    #[arg(long, env = "TDSWEB_DB_SERVER")]
    db_server: Option<String>,

    /// SQL Server port
    #[arg(long, env = "TDSWEB_DB_PORT")]
    db_port: Option<u16>,

    /// Application name reported to the server
    #[arg(long, env = "TDSWEB_APP_NAME")]
    app_name: Option<String>,

    /// Maximum simultaneous client connections
    #[arg(long, env = "TDSWEB_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Log filter, e.g. "debug" or "tdsweb=trace" (overrides RUST_LOG)
    #[arg(long, env = "TDSWEB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print the effective settings as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Command-line and environment values win over the settings file.
    fn apply(&self, settings: &mut Settings) {
        if let Some(addr) = &self.listen_addr {
            settings.listen_addr = addr.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(server) = &self.db_server {
            settings.db_server = server.clone();
        }
        if let Some(port) = self.db_port {
            settings.db_port = port;
        }
        if let Some(name) = &self.app_name {
            settings.app_name = name.clone();
        }
        if let Some(max) = self.max_connections {
            settings.max_connections = max;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli.print_config {
        return match settings.to_toml_string() {
            Ok(text) => {
                print!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("Cannot render settings: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    match run(&settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(filter: Option<&str>) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.init();
}

fn load_settings(cli: &Cli) -> Result<Settings, ConfigError> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn gateway_config(settings: &Settings) -> GatewayConfig {
    GatewayConfig {
        bind_addr: settings.bind_addr(),
        max_connections: settings.max_connections,
        max_message_size: settings.max_message_size,
        session: SessionSettings {
            app_name: settings.app_name.clone(),
            export_filename: settings.export_filename.clone(),
            export_sheet_name: settings.export_sheet_name.clone(),
        },
    }
}

/// Serve until SIGINT or SIGTERM.
fn run(settings: &Settings) -> io::Result<()> {
    let connector = MssqlConnector::new(MssqlOptions {
        host: settings.db_server.clone(),
        port: settings.db_port,
    });
    log::info!("Database server {}:{}", settings.db_server, settings.db_port);

    let mut server = GatewayServer::new();
    server.start(gateway_config(settings), Arc::new(connector))?;

    let shutdown = server.shutdown_handle();
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            log::info!("Received signal {}, shutting down", sig);
            shutdown.shutdown();
        }
    });

    server.wait();
    if !server.drain(SHUTDOWN_GRACE) {
        log::warn!("{} connection(s) still open at exit", server.connection_count());
    }
    log::info!("Gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_settings() {
        let cli = Cli::try_parse_from([
            "tdsweb",
            "--port",
            "9000",
            "--db-server",
            "luthien",
            "--max-connections",
            "3",
        ])
        .unwrap();
        let mut settings = Settings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.db_server, "luthien");
        assert_eq!(settings.max_connections, 3);
        assert_eq!(settings.app_name, "tdsweb");
    }

    #[test]
    fn test_gateway_config_from_settings() {
        let mut settings = Settings::default();
        settings.listen_addr = "0.0.0.0".into();
        settings.export_filename = "out.xlsx".into();
        let config = gateway_config(&settings);
        assert_eq!(config.bind_addr, "0.0.0.0:52441");
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.session.export_filename, "out.xlsx");
        assert_eq!(config.session.export_sheet_name, "Results");
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
