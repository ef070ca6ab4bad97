// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entry point for the FRAICAP coordinator process (spec.md §6 "CLI").

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fraicap_common::config::{AgentsConfig, ManagerConfig};
use fraicap_common::protocol::{DataPayload, Message};
use fraicap_common::types::Device;
use fraicap_common::Catalog;
use fraicap_manager::bootstrap;
use fraicap_manager::coordinator::{Coordinator, UserCommand};
use fraicap_manager::{health, input};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(about = "FRAICAP capture coordinator")]
struct Args {
    coordinator_config: Option<PathBuf>,
    agents_config: Option<PathBuf>,
}

fn spawn_sigint_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, shutting down");
            shutdown.cancel();
        }
    });
}

async fn run(args: Args) -> anyhow::Result<()> {
    let coordinator_config = args.coordinator_config.unwrap_or_else(|| PathBuf::from("manager.json"));
    let agents_config = args.agents_config.unwrap_or_else(|| PathBuf::from("agents.json"));

    let manager_cfg = ManagerConfig::load(&coordinator_config)?;
    let agents_cfg = AgentsConfig::load(&agents_config)?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(manager_cfg.logging.filter.clone()))
        .init();
    tracing::info!("***** starting FRAICAP manager *****");

    std::fs::create_dir_all(&manager_cfg.capture.output_path)?;
    let catalog = Arc::new(Catalog::open(std::path::Path::new(&manager_cfg.sqlite.db_file))?);
    let sys_id = match catalog.get_system_id()? {
        Some(id) => id,
        None => {
            tracing::warn!(
                default = %manager_cfg.default_sys_id,
                "no sys_id recorded in the catalog yet, using the configured default"
            );
            manager_cfg.default_sys_id.clone()
        }
    };

    let shutdown = CancellationToken::new();
    spawn_sigint_watcher(shutdown.clone());

    let mut agent_set =
        bootstrap::spawn_agents(&manager_cfg, &agents_cfg, &agents_config, shutdown.clone()).await?;

    tracing::info!("waiting for critical agents to report ready");
    while !agent_set.critical_agents_ready() {
        if shutdown.is_cancelled() {
            anyhow::bail!("shutdown requested before critical agents became ready");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::info!("critical agents are ready");

    if let Some(data_copy) = agent_set.get(Device::DataCopy) {
        let db_path = PathBuf::from(&manager_cfg.sqlite.db_file);
        data_copy.send(Message::Data(DataPayload::DatabasePath(db_path)));
    }

    let watched: Vec<_> = health::watched_devices()
        .into_iter()
        .filter_map(|device| agent_set.get(device).cloned().map(|proxy| (device, proxy)))
        .collect();
    let atmega_enabled = agent_set.get(Device::Atmega).is_some_and(|p| p.enabled);
    if let Some(atmega) = agent_set.get(Device::Atmega).cloned() {
        if atmega_enabled {
            health::spawn(watched, atmega, shutdown.clone());
        }
    }

    let (user_cmd_tx, user_cmd_rx) = mpsc::unbounded_channel::<UserCommand>();
    input::spawn_keyboard(user_cmd_tx.clone(), shutdown.clone());
    if atmega_enabled {
        if let Some(atmega_data_rx) = agent_set.take_data_rx(Device::Atmega) {
            input::spawn_button_bridge(atmega_data_rx, user_cmd_tx.clone(), shutdown.clone());
        }
        if let Some(data_copy_sys_state_rx) = agent_set.take_sys_state_rx(Device::DataCopy) {
            if let Some(atmega) = agent_set.get(Device::Atmega).cloned() {
                input::spawn_data_copy_bridge(data_copy_sys_state_rx, atmega, shutdown.clone());
            }
        }
    }

    let gps_rx = agent_set
        .take_data_rx(Device::Gps)
        .unwrap_or_else(|| mpsc::unbounded_channel().1);

    let coordinator = Coordinator::new(
        agent_set,
        catalog,
        manager_cfg.capture.clone(),
        sys_id,
        user_cmd_rx,
        gps_rx,
        shutdown.clone(),
        Duration::from_millis(manager_cfg.shutdown_drain_ms),
    );
    coordinator.run().await?;

    tracing::info!("manager terminated. have a good day");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    if let Err(e) = runtime.block_on(run(args)) {
        tracing::error!(error = %e, "manager exiting with error");
        std::process::exit(1);
    }
    Ok(())
}
