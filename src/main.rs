use anyhow::{Context, Result};
use clap::Parser;
use relay_proxy::cli::{Cli, Commands};
use relay_proxy::config::AppConfig;
use relay_proxy::server;
use relay_proxy::upstream::Upstream;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先于命令行参数
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match &cli.command {
        Commands::Check { config } => check_config(config),
        Commands::Template { output } => generate_config_template(output.as_deref()),
        Commands::Run { config } => {
            info!("relay-proxy v{}", env!("CARGO_PKG_VERSION"));
            info!("Loading configuration from: {}", config);
            let app_config = AppConfig::load(config)?;

            if let Err(e) = server::run_server(app_config).await {
                error!("{:#}", e);
                return Err(e);
            }
            Ok(())
        }
    }
}

/// Generate configuration template
fn generate_config_template(output: Option<&str>) -> Result<()> {
    let content = AppConfig::default().to_toml()?;

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", content);
    }

    Ok(())
}

/// Check configuration file format
fn check_config(config_path: &str) -> Result<()> {
    if !Path::new(config_path).exists() {
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    println!("Checking configuration file: {}\n", config_path);

    match AppConfig::load(config_path) {
        Ok(config) => {
            println!("✓ Listen address: {}", config.proxy.bind_address());
            println!("✓ Max connections: {}", config.proxy.max_connections);
            println!("✓ Data directory: {:?}", config.root_path());
            println!(
                "✓ Upstream: {}",
                Upstream::from_config(&config.output_proxy)
            );
            if config.output_proxy.is_active() {
                println!(
                    "✓ Upstream user: {}, password: {}",
                    if config.output_proxy.user.is_empty() {
                        "(empty)"
                    } else {
                        config.output_proxy.user.as_str()
                    },
                    if config.output_proxy.password.is_empty() {
                        "(empty)"
                    } else {
                        "****"
                    }
                );
            }
            println!(
                "✓ Security: {} deny host(s), {} deny network(s), enforce = {}",
                config.security.deny_hosts.len(),
                config.security.deny_networks.len(),
                config.security.enforce
            );
            match config.status.port {
                Some(port) => println!("✓ Status endpoint: http://{}:{}", config.status.addr, port),
                None => println!("✓ Status endpoint: disabled"),
            }

            println!("\n✓ Configuration is valid!");
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed!");
            println!("\nError details:");
            println!("{:#}", e);

            println!("\nCommon issues:");
            println!("  1. Check TOML syntax (brackets, quotes, commas)");
            println!("  2. Verify section and field names ([proxy], [output_proxy], [security], [counter], [status])");
            println!("  3. Ensure port numbers are valid (1-65535)");
            println!("  4. An enabled [output_proxy] needs host and port");

            Err(e)
        }
    }
}
