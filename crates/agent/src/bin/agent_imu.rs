// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Body-IMU agent: serial stream of fixed-size accel/gyro/quaternion
//! records, CSV rows while capturing. Grounded on
//! `original_source/agents/agent_imu.py` and `agents/yost3space/api.py`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use fraicap_agent::writer::SampleQueue;
use fraicap_agent::{AgentRuntime, DeviceDriver, RuntimeConfig};
use fraicap_common::protocol::Message;
use fraicap_common::types::{Device, HwStatus};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;

const HEADER: &[u8] = b"system_time;accel_x;accel_y;accel_z;gyro_x;gyro_y;gyro_z;q1;q2;q3;q4\r\n";
/// One sample: timestamp omitted (written by the driver), 10 big-endian f32s.
const RECORD_FLOATS: usize = 10;

#[derive(Parser)]
struct Args {
    config: Option<PathBuf>,
}

struct ImuDriver {
    com_port: String,
    baudrate: u32,
    connected: bool,
}

impl DeviceDriver for ImuDriver {
    fn device(&self) -> Device {
        Device::Imu
    }

    fn connect_hw(&mut self) -> anyhow::Result<()> {
        if self.com_port.is_empty() {
            anyhow::bail!("no com_port configured");
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect_hw(&mut self) {
        self.connected = false;
    }

    fn check_hw_connected(&mut self) -> HwStatus {
        if self.connected {
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
        let com_port = self.com_port.clone();
        let baudrate = self.baudrate;
        tokio::spawn(async move {
            let port = match tokio_serial::new(&com_port, baudrate).open_native_async() {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(%com_port, error = %e, "failed to open IMU serial port");
                    return;
                }
            };
            let mut port = port;
            let mut buf = [0u8; RECORD_FLOATS * 4];
            loop {
                let read = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    r = port.read_exact(&mut buf) => r,
                };
                if read.is_err() {
                    tracing::warn!("IMU serial read failed, dropping sample");
                    continue;
                }
                if !capturing.load(Ordering::Relaxed) {
                    continue;
                }
                let mut values = [0f32; RECORD_FLOATS];
                for (i, chunk) in buf.chunks_exact(4).enumerate() {
                    let Ok(bytes) = chunk.try_into() else { continue };
                    values[i] = f32::from_be_bytes(bytes);
                }
                let row = format!(
                    "{:.3};{}\r\n",
                    now_secs(),
                    values.iter().map(|v| format!("{v:.3}")).collect::<Vec<_>>().join(";")
                );
                samples.push(row.into_bytes()).await;
            }
        })
    }
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
        .get(Device::Imu)
        .ok_or_else(|| anyhow::anyhow!("missing agent_imu section"))?;

    let com_port = cfg
        .extra
        .get("com_port")
        .and_then(|v| v.as_str())
        .unwrap_or("/dev/ttyIMU0")
        .to_owned();
    let baudrate = cfg.extra.get("baudrate").and_then(|v| v.as_u64()).unwrap_or(115_200) as u32;

    let driver = ImuDriver { com_port, baudrate, connected: false };
    let runtime_cfg = RuntimeConfig {
        local_port: cfg.local_port,
        hw_connection_retries: cfg.hw_connection_retries,
        output_file_name: cfg.output_file_name.clone().unwrap_or_else(|| "imu.csv".to_owned()),
    };

    if let Err(e) = AgentRuntime::new(runtime_cfg, driver).run().await {
        tracing::error!(error = %e, "imu agent exiting with error");
        std::process::exit(1);
    }
    Ok(())
}
