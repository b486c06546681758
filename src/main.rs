mod cli;
mod client;
mod config;
mod daemon;
mod error;
mod message;
mod plugins;
mod registry;
mod schedule;
mod server;
mod task;
mod time_util;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Map;
use tracing::info;

use crate::cli::{Cli, ClientCommands, Commands, ServerCommands};
use crate::config::{load_config, validate_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?
    } else {
        config::Config::default()
    };
    validate_config(&config).context("config validation failed")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Server { command: ServerCommands::Run { update_path, set_env, host, port } } => {
            let (resolved_host, resolved_port) = cli::resolve_addr(host, port);
            let server_config = config::ServerConfig {
                host: resolved_host,
                port: resolved_port,
                update_path: update_path.or(config.server.update_path),
                log_level: config.server.log_level,
            };
            daemon::run(server_config, set_env).await?;
        }
        Commands::Client { command } => run_client_command(command).await?,
    }

    Ok(())
}

async fn run_client_command(command: ClientCommands) -> Result<()> {
    match command {
        ClientCommands::QuitServer(connect) => {
            let (host, port) = cli::resolve_addr(connect.host, connect.port);
            let mut client = client::Client::connect(format!("{host}:{port}")).await?;
            let response = client.quit_server().await?;
            print_response(&response);
        }
        ClientCommands::RequestSchedules(connect) => {
            let (host, port) = cli::resolve_addr(connect.host, connect.port);
            let mut client = client::Client::connect(format!("{host}:{port}")).await?;
            let response = client.request_schedules().await?;
            print_response(&response);
        }
        ClientCommands::UpdateServer { module, connect } => {
            let (host, port) = cli::resolve_addr(connect.host, connect.port);
            let mut client = client::Client::connect(format!("{host}:{port}")).await?;
            let response = client.update_server(module.unwrap_or_default()).await?;
            print_response(&response);
        }
        ClientCommands::StopSchedule { name, connect } => {
            let (host, port) = cli::resolve_addr(connect.host, connect.port);
            let mut client = client::Client::connect(format!("{host}:{port}")).await?;
            let response = client.stop_schedule(name).await?;
            print_response(&response);
        }
        ClientCommands::RunCommand { name, args, kwargs, connect } => {
            let (host, port) = cli::resolve_addr(connect.host, connect.port);
            let mut client = client::Client::connect(format!("{host}:{port}")).await?;
            let kwargs = Map::from_iter(kwargs);
            let response = client.run_command(name, args, kwargs).await?;
            print_response(&response);
        }
        ClientCommands::ScheduleCommand { name, callback, args, kwargs, schedule, connect } => {
            let (host, port) = cli::resolve_addr(connect.host, connect.port);
            let mut client = client::Client::connect(format!("{host}:{port}")).await?;
            let kwargs = Map::from_iter(kwargs);
            let schedule = schedule.into_schedule()?;
            let response = client.schedule_command(name, schedule, callback, args, kwargs).await?;
            print_response(&response);
        }
    }
    Ok(())
}

fn print_response(response: &message::Message) {
    info!(?response, "server responded");
    println!("{}", serde_json::to_string_pretty(response).expect("Message always serializes"));
}
