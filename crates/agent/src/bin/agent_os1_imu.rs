// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OS1-IMU agent: vendor UDP IMU packet on port 7503, CSV rows while
//! capturing. Grounded on `original_source/agents/agent_os1_imu.py` and
//! `agents/os1/imu_packet.py`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use fraicap_agent::writer::SampleQueue;
use fraicap_agent::{AgentRuntime, DeviceDriver, RuntimeConfig};
use fraicap_common::protocol::Message;
use fraicap_common::types::{Device, HwStatus};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const OS1_IMU_UDP_PORT: u16 = 7503;
/// timestamp_accel(u64) + timestamp_gyro(u64) + 6 floats, little-endian.
const PACKET_SIZE: usize = 8 + 8 + 6 * 4;

const HEADER: &[u8] = b"timestamp_system_s;timestamp_accel_us;timestamp_gyro_us;accel_x_g;accel_y_g;accel_z_g;gyro_x_degsec;gyro_y_degsec;gyro_z_degsec\r\n";

#[derive(Parser)]
struct Args {
    config: Option<PathBuf>,
}

struct Os1ImuDriver {
    sensor_ip: std::net::Ipv4Addr,
    host_ip: std::net::Ipv4Addr,
    bound: bool,
}

impl DeviceDriver for Os1ImuDriver {
    fn device(&self) -> Device {
        Device::Os1Imu
    }

    fn connect_hw(&mut self) -> anyhow::Result<()> {
        // The UDP socket is bound inside the acquisition task; here we just
        // mark the driver ready to try.
        self.bound = true;
        Ok(())
    }

    fn disconnect_hw(&mut self) {
        self.bound = false;
    }

    fn check_hw_connected(&mut self) -> HwStatus {
        if self.bound {
            HwStatus::Nominal
        } else {
            HwStatus::NotConnected
        }
    }

    fn process_manager_message(&mut self, _msg: &Message) -> Option<Message> {
        None
    }

    fn file_header(&self) -> Option<Vec<u8>> {
        Some(HEADER.to_vec())
    }

    fn spawn_acquisition(
        &mut self,
        samples: SampleQueue,
        _outbound: mpsc::UnboundedSender<Message>,
        capturing: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let sensor_ip = self.sensor_ip;
        let host_ip = self.host_ip;
        tokio::spawn(async move {
            let socket = match UdpSocket::bind((host_ip, OS1_IMU_UDP_PORT)).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(%host_ip, port = OS1_IMU_UDP_PORT, error = %e, "failed to bind OS1-IMU socket");
                    return;
                }
            };
            let mut buf = [0u8; PACKET_SIZE];
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    r = socket.recv_from(&mut buf) => r,
                };
                let Ok((n, peer)) = received else { continue };
                if !capturing.load(Ordering::Relaxed) || n != PACKET_SIZE || peer.ip() != sensor_ip {
                    continue;
                }
                if let Some(row) = decode_imu_packet(&buf) {
                    samples.push(row.into_bytes()).await;
                }
            }
        })
    }
}

fn decode_imu_packet(packet: &[u8; PACKET_SIZE]) -> Option<String> {
    let ta = u64::from_le_bytes(packet[0..8].try_into().ok()?);
    let tg = u64::from_le_bytes(packet[8..16].try_into().ok()?);
    let floats: Option<Vec<f32>> = packet[16..]
        .chunks_exact(4)
        .map(|c| c.try_into().ok().map(f32::from_le_bytes))
        .collect();
    let floats = floats?;
    let [ax, ay, az, gx, gy, gz] = floats[..6].try_into().ok()?;
    Some(format!(
        "{:.3};{};{};{ax:.3};{ay:.3};{az:.3};{gx:.3};{gy:.3};{gz:.3}\r\n",
        now_secs(),
        ta / 1000,
        tg / 1000,
    ))
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
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
        .get(Device::Os1Imu)
        .ok_or_else(|| anyhow::anyhow!("missing agent_os1_imu section"))?;

    let sensor_ip: std::net::Ipv4Addr = cfg
        .extra
        .get("sensor_ip")
        .and_then(|v| v.as_str())
        .unwrap_or("192.168.1.100")
        .parse()?;
    let host_ip: std::net::Ipv4Addr =
        cfg.extra.get("host_ip").and_then(|v| v.as_str()).unwrap_or("0.0.0.0").parse()?;

    let driver = Os1ImuDriver { sensor_ip, host_ip, bound: false };
    let runtime_cfg = RuntimeConfig {
        local_port: cfg.local_port,
        hw_connection_retries: cfg.hw_connection_retries,
        output_file_name: cfg.output_file_name.clone().unwrap_or_else(|| "os1_imu.csv".to_owned()),
    };

    if let Err(e) = AgentRuntime::new(runtime_cfg, driver).run().await {
        tracing::error!(error = %e, "os1-imu agent exiting with error");
        std::process::exit(1);
    }
    Ok(())
}
