// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup sequencing: spawn each enabled agent as a free-standing child
//! process, build its proxy, and wait for every enabled agent to connect
//! (spec.md §4.4 "Capture coordinator", §9 "Subprocess spawning of
//! agents"). Grounded on `original_source/manager.py`'s `initialize`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use fraicap_common::config::{AgentsConfig, ManagerConfig};
use fraicap_common::protocol::SysState;
use fraicap_common::types::Device;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::proxy::{self, AgentProxy};

/// One enabled agent's spawned child process plus its manager-side proxy.
pub struct AgentHandle {
    pub proxy: AgentProxy,
    pub data_rx: tokio::sync::mpsc::UnboundedReceiver<fraicap_common::protocol::DataPayload>,
    pub sys_state_rx: tokio::sync::mpsc::UnboundedReceiver<SysState>,
    child: Option<Child>,
}

pub struct AgentSet {
    handles: HashMap<Device, AgentHandle>,
}

impl AgentSet {
    pub fn get(&self, device: Device) -> Option<&AgentProxy> {
        self.handles.get(&device).map(|h| &h.proxy)
    }

    pub fn take_data_rx(
        &mut self,
        device: Device,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<fraicap_common::protocol::DataPayload>> {
        self.handles.get_mut(&device).map(|h| {
            std::mem::replace(&mut h.data_rx, tokio::sync::mpsc::unbounded_channel().1)
        })
    }

    pub fn take_sys_state_rx(
        &mut self,
        device: Device,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<SysState>> {
        self.handles.get_mut(&device).map(|h| {
            std::mem::replace(&mut h.sys_state_rx, tokio::sync::mpsc::unbounded_channel().1)
        })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &AgentProxy> {
        self.handles.values().filter(|h| h.proxy.enabled).map(|h| &h.proxy)
    }

    pub fn send_all_enabled(&self, msg: fraicap_common::protocol::Message) {
        for proxy in self.enabled() {
            proxy.send(msg.clone());
        }
    }

    /// All enabled agents are reachable (receiving at least one poll reply).
    pub fn all_connected(&self) -> bool {
        self.enabled().all(|p| p.is_connected())
    }

    /// spec.md §4.4 "Critical agents": LiDAR and ATMEGA, when enabled, must
    /// report STAND_BY/CAPTURING before the coordinator leaves STARTING.
    pub fn critical_agents_ready(&self) -> bool {
        [Device::Os1Lidar, Device::Atmega].into_iter().all(|device| match self.get(device) {
            Some(proxy) if proxy.enabled => proxy.agent_status().is_ready(),
            _ => true,
        })
    }

    pub async fn kill_children(&mut self) {
        for handle in self.handles.values_mut() {
            if let Some(child) = handle.child.as_mut() {
                let _ = child.kill().await;
            }
        }
    }
}

/// Locate `agent_<name>` next to the manager's own executable.
fn agent_binary_path(device: Device) -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| anyhow::anyhow!("manager executable has no parent dir"))?;
    Ok(dir.join(format!("agent_{}", device.name())))
}

/// Spawn every agent enabled in `manager_cfg.use_agents`, wire up its proxy,
/// and block until all enabled agents have connected.
pub async fn spawn_agents(
    manager_cfg: &ManagerConfig,
    agents_cfg: &AgentsConfig,
    agents_config_path: &std::path::Path,
    shutdown: CancellationToken,
) -> anyhow::Result<AgentSet> {
    let mut handles = HashMap::new();

    for device in Device::ALL {
        let enabled = manager_cfg.use_agents.get(device);
        let Some(agent_cfg) = agents_cfg.get(device) else {
            if enabled {
                anyhow::bail!("use_agents enables {} but agents.json has no section for it", device.name());
            }
            continue;
        };

        let child = if enabled {
            let bin = agent_binary_path(device)?;
            let child = Command::new(&bin)
                .arg(agents_config_path)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::inherit())
                .spawn()
                .map_err(|e| anyhow::anyhow!("failed to spawn {}: {e}", bin.display()))?;
            tracing::info!(agent = device.name(), pid = child.id(), "agent process started");
            Some(child)
        } else {
            None
        };

        let addr: SocketAddr = ([127, 0, 0, 1], agent_cfg.local_port).into();
        let (proxy, data_rx, sys_state_rx) =
            proxy::spawn(device.name().to_owned(), device, enabled, addr, shutdown.clone());
        handles.insert(device, AgentHandle { proxy, data_rx, sys_state_rx, child });
    }

    // Give freshly spawned processes a moment to bind their listeners
    // before the proxies start dialing (`original_source/manager.py`
    // `self.flags.quit.wait(1)`).
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
    }

    let set = AgentSet { handles };
    tracing::info!("waiting for enabled agents to connect");
    loop {
        if set.all_connected() {
            break;
        }
        if shutdown.is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tracing::info!("connected to all enabled agents");
    Ok(set)
}
