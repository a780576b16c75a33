use std::{path::PathBuf, process::exit, str::FromStr, sync::Arc};

use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::io::AsyncBufReadExt;

use basalt::config::{self, ConfigProvider};
use basalt::proxy::ProxyServer;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: Option<PathBuf>,
    /// Verbose level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Disable reading from standard input for commands.
    #[arg(long)]
    ignore_stdin: bool,
    /// Disable colors from output.
    #[arg(long)]
    no_color: bool,
}

fn main() {
    let args = Args::parse();
    let log_level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_colors(!args.no_color)
        .init()
        .unwrap();

    let config_file = args
        .config
        .as_ref()
        .map(PathBuf::clone)
        .unwrap_or_else(|| PathBuf::from_str("config.toml").unwrap());
    let config_provider = match config::read_config(config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            log::error!(
                "Could not read configuration file ({}): {}",
                config_file.to_string_lossy(),
                err
            );
            return;
        }
    };
    run(config_provider, args);
}

#[tokio::main]
async fn run(config_provider: ConfigProvider, args: Args) {
    {
        let config = config_provider.read().await;
        log::debug!("Parsed configuration: {:#?}", config);
    }
    let config_provider = Arc::new(config_provider);
    let proxy = match ProxyServer::init(config_provider.clone()).await {
        Ok(proxy) => proxy,
        Err(err) => {
            log::error!("Could not initialize the proxy: {}", err);
            return;
        }
    };
    if !args.ignore_stdin {
        tokio::spawn({
            let proxy = proxy.clone();
            let config_provider = config_provider.clone();
            async move {
                log::info!("Console commands enabled");
                run_stdin_handler(proxy, config_provider).await;
            }
        });
    }
    tokio::spawn({
        let proxy = proxy.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("Shutdown requested...");
                        exit(0);
                    }
                    _ = config_provider.wait_reload() => {
                        proxy.reload_config().await;
                    }
                }
            }
        }
    });
    if let Err(err) = proxy.run().await {
        log::error!("{}", err);
    }
}

async fn run_stdin_handler(proxy: Arc<ProxyServer>, config_provider: Arc<ConfigProvider>) {
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    loop {
        let mut buf = String::new();
        let len = match reader.read_line(&mut buf).await {
            Ok(line) => line,
            Err(err) => {
                log::error!("Error reading user input: {:?}", err);
                continue;
            }
        };
        let line = &buf[0..len].trim();
        match line.to_lowercase().as_str() {
            "reload" => config_provider.reload().await,
            "list" | "count" => {
                log::info!(
                    "There are {} online players ({} live sessions)",
                    proxy.directory.player_count().await,
                    proxy.session_registry.len().await,
                )
            }
            _ => log::warn!("Unknown command '{}'", line),
        }
    }
}
