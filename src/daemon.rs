use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::ServerConfig as AppServerConfig;
use crate::plugins::{DylibPluginSource, ManifestPluginSource, PluginSource};
use crate::registry::{CallbackRegistry, set_server};
use crate::server::{Scheduler, ServerConfig};

/// The compiled-in table `ManifestPluginSource` resolves `callable_id`
/// entries against. Empty until callers register constructors ahead of
/// `run` — the scheduler ships no built-in callbacks of its own.
pub fn default_plugin_sources(
    constructors: std::collections::HashMap<String, fn() -> Arc<dyn crate::registry::Callback>>,
) -> Vec<Box<dyn PluginSource>> {
    vec![
        Box::new(ManifestPluginSource::new(constructors)),
        Box::new(DylibPluginSource::new()),
    ]
}

pub async fn run(config: AppServerConfig, set_env: bool) -> Result<()> {
    let callbacks = Arc::new(CallbackRegistry::new());
    let plugin_sources = default_plugin_sources(std::collections::HashMap::new());

    let scheduler = Scheduler::new(
        ServerConfig {
            host: config.host.clone(),
            port: config.port,
            update_path: config.update_path.clone(),
        },
        callbacks,
        plugin_sources,
    );

    let addr = scheduler.start().await.context("binding scheduler server")?;
    info!(addr = %addr, "scheduler server started");

    set_server(scheduler.clone()).await;

    if set_env {
        // SAFETY: single-threaded at this point in startup, before any
        // plugin module or subprocess reads these back.
        unsafe {
            std::env::set_var("ASYNC_SCHED_HOST", addr.ip().to_string());
            std::env::set_var("ASYNC_SCHED_PORT", addr.port().to_string());
        }
    }

    wait_for_shutdown().await;
    info!("shutdown signal received");

    scheduler.stop().await;
    info!("shutdown complete");

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
