use anyhow::Context;
use clap::Parser;
use gatekeep::config::{LogFormat, LogLevel, LoggingConfig, ProxyConfig, Settings};
use gatekeep::logging::ProxyLogger;
use gatekeep::{ConfigError, ProxyServer};
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;

const EXIT_RUNTIME_FAILURE: u8 = 3;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward proxy with CONNECT tunnelling and optional Basic authentication"
)]
struct Args {
    #[clap(short, long, env = "proxyPort", value_name = "PORT", help = "Port to listen on")]
    port: Option<String>,

    #[clap(short, long, env = "proxyTarget", value_name = "URL", help = "Upstream target for plain HTTP requests (e.g., http://backend:3000)")]
    target: Option<String>,

    #[clap(short, long, env = "proxyUser", value_name = "USERNAME", help = "Username for proxy authentication (Basic Auth)")]
    user: Option<String>,

    #[clap(long, env = "proxyPassword", hide_env_values = true, value_name = "PASSWORD", help = "Password for proxy authentication (Basic Auth)")]
    password: Option<String>,

    #[clap(long, env = "proxyHost", value_name = "ADDR", help = "Address to bind (default: 0.0.0.0)")]
    host: Option<String>,

    #[clap(long, env = "proxyConnectTimeout", value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, env = "proxyUpstreamTimeout", value_name = "SECONDS", help = "Time to wait for an upstream response head in seconds")]
    upstream_timeout: Option<u64>,

    #[clap(long, env = "proxyHalfCloseGrace", value_name = "SECONDS", help = "Time a tunnel may drain after one side closed, in seconds")]
    half_close_grace: Option<u64>,

    #[clap(long, env = "proxyHeaderReadTimeout", value_name = "SECONDS", help = "Time a client may take to send a complete request head, in seconds")]
    header_read_timeout: Option<u64>,

    #[clap(long, env = "proxyMaxHeaderSize", value_name = "BYTES", help = "Maximum request head size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, env = "proxyLogLevel", value_name = "LEVEL", help = "Log level: trace, debug, info, warn or error")]
    log_level: Option<LogLevel>,

    #[clap(long, env = "proxyLogFormat", value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<LogFormat>,

    #[clap(long, env = "proxyLogFile", value_name = "FILE", help = "Also write logs to this file (truncated at startup)")]
    log_file: Option<PathBuf>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<PathBuf>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<PathBuf>,
}

impl Args {
    fn to_settings(&self) -> Settings {
        let logging = if self.log_level.is_some() || self.log_format.is_some() || self.log_file.is_some() {
            Some(LoggingConfig {
                level: self.log_level,
                format: self.log_format,
                file: self.log_file.clone(),
            })
        } else {
            None
        };

        Settings {
            proxy_port: self.port.clone(),
            proxy_target: self.target.clone(),
            proxy_user: self.user.clone(),
            proxy_password: self.password.clone(),
            listen_host: self.host.clone(),
            connect_timeout_secs: self.connect_timeout,
            upstream_timeout_secs: self.upstream_timeout,
            half_close_grace_secs: self.half_close_grace,
            header_read_timeout_secs: self.header_read_timeout,
            max_header_size: self.max_header_size,
            logging,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Variables already set in the environment win over .env.
    dotenvy::dotenv().ok();

    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        return match Settings::sample().to_file(path) {
            Ok(()) => {
                println!("Sample configuration file generated: {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => config_failure(&e),
        };
    }

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => return config_failure(&e),
    };

    // Installed before validation so configuration warnings are not lost.
    let logging = settings.logging.clone().unwrap_or_default();
    if let Err(e) = ProxyLogger::init(&logging) {
        eprintln!("❌ Failed to initialise logging: {}", e);
        return ExitCode::from(2);
    }

    let config = match ProxyConfig::from_settings(settings) {
        Ok(config) => config,
        Err(e) => return config_failure(&e),
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("❌ {:#}", e);
            ExitCode::from(EXIT_RUNTIME_FAILURE)
        }
    }
}

fn load_settings(args: &Args) -> Result<Settings, ConfigError> {
    let file = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    Ok(file.merge(args.to_settings()))
}

fn config_failure(e: &ConfigError) -> ExitCode {
    eprintln!("❌ {}", e);
    ExitCode::from(e.exit_code() as u8)
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let server = ProxyServer::new(config).context("Failed to initialise proxy")?;
    let listener = server.bind().await?;

    let shutdown = CancellationToken::new();
    let mut server_handle = tokio::spawn(server.serve(listener, shutdown.clone()));

    let interrupted = tokio::select! {
        _ = signal::ctrl_c() => true,
        result = &mut server_handle => {
            result.context("Server task failed")??;
            false
        }
    };

    if interrupted {
        info!("🛑 Received Ctrl+C, shutting down gracefully...");
        shutdown.cancel();
        server_handle.await.context("Server task failed")??;
    }

    info!("👋 Proxy server stopped. Goodbye!");
    Ok(())
}
