// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Internet-connectivity agent: pings two configured hosts every 5s and
//! falls back to checking whether the interface merely holds an address.
//! Reports health only, captures no data. Grounded on
//! `original_source/agents/agent_inet.py`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fraicap_agent::writer::SampleQueue;
use fraicap_agent::{AgentRuntime, DeviceDriver, RuntimeConfig};
use fraicap_common::protocol::Message;
use fraicap_common::types::{Device, HwStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn encode(status: HwStatus) -> u8 {
    match status {
        HwStatus::Nominal => 0,
        HwStatus::Warning => 1,
        HwStatus::Error => 2,
        HwStatus::NotConnected => 3,
    }
}

fn decode(code: u8) -> HwStatus {
    match code {
        0 => HwStatus::Nominal,
        1 => HwStatus::Warning,
        _ => HwStatus::Error,
    }
}

#[derive(Parser)]
struct Args {
    config: Option<PathBuf>,
}

struct InetDriver {
    interface: String,
    ping_ip_1: String,
    ping_ip_2: String,
    status: Arc<AtomicU8>,
}

impl DeviceDriver for InetDriver {
    fn device(&self) -> Device {
        Device::Inet
    }

    fn connect_hw(&mut self) -> anyhow::Result<()> {
        // Connectivity is checked continuously in the main loop, not on connect.
        Ok(())
    }

    fn disconnect_hw(&mut self) {}

    fn check_hw_connected(&mut self) -> HwStatus {
        decode(self.status.load(Ordering::Relaxed))
    }

    fn process_manager_message(&mut self, _msg: &Message) -> Option<Message> {
        None
    }

    fn spawn_acquisition(
        &mut self,
        _samples: SampleQueue,
        _outbound: mpsc::UnboundedSender<Message>,
        _capturing: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interface = self.interface.clone();
        let ping_ip_1 = self.ping_ip_1.clone();
        let ping_ip_2 = self.ping_ip_2.clone();
        let status = Arc::clone(&self.status);

        tokio::spawn(async move {
            loop {
                let reachable = check_ping(&ping_ip_1).await || check_ping(&ping_ip_2).await;
                let new_status = if reachable {
                    HwStatus::Nominal
                } else if check_iface_has_address(&interface).await {
                    HwStatus::Warning
                } else {
                    HwStatus::Error
                };
                status.store(encode(new_status), Ordering::Relaxed);

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        })
    }
}

async fn check_ping(ip: &str) -> bool {
    if ip.is_empty() {
        return false;
    }
    tokio::process::Command::new("ping")
        .args(["-c", "1", ip])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn check_iface_has_address(interface: &str) -> bool {
    tokio::process::Command::new("ifconfig")
        .arg(interface)
        .output()
        .await
        .map(|o| String::from_utf8_lossy(&o.stdout).contains("inet "))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let agents_path = args.config.unwrap_or_else(|| PathBuf::from("agents.json"));
    let agents = fraicap_common::config::AgentsConfig::load(&agents_path)?;
    let cfg = agents
        .get(Device::Inet)
        .ok_or_else(|| anyhow::anyhow!("missing agent_inet section"))?;

    let interface = cfg.extra.get("interface").and_then(|v| v.as_str()).unwrap_or("eth0").to_owned();
    let ping_ip_1 =
        cfg.extra.get("ping_ip_1").and_then(|v| v.as_str()).unwrap_or("8.8.8.8").to_owned();
    let ping_ip_2 =
        cfg.extra.get("ping_ip_2").and_then(|v| v.as_str()).unwrap_or("1.1.1.1").to_owned();

    let driver = InetDriver {
        interface,
        ping_ip_1,
        ping_ip_2,
        status: Arc::new(AtomicU8::new(encode(HwStatus::Error))),
    };
    let runtime_cfg = RuntimeConfig {
        local_port: cfg.local_port,
        hw_connection_retries: cfg.hw_connection_retries,
        output_file_name: cfg.output_file_name.clone().unwrap_or_else(|| "inet.log".to_owned()),
    };

    if let Err(e) = AgentRuntime::new(runtime_cfg, driver).run().await {
        tracing::error!(error = %e, "inet agent exiting with error");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_recognized_statuses() {
        for status in [HwStatus::Nominal, HwStatus::Warning, HwStatus::Error] {
            assert_eq!(decode(encode(status)), status);
        }
    }
}
