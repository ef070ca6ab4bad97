// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! LiDAR agent: UDP port 7502, accepts only packets whose first
//! measurement-id falls in the configured angle span, re-packs each
//! accepted azimuth block into a compact XYZ+reflectivity record, and
//! downgrades `hw_status` to ERROR once lost-packet% or invalid-block%
//! exceeds 5% (spec.md §4.6, Open Question #1 resolved to ERROR).
//!
//! Full vendor beam-intrinsics trig calibration is out of scope (spec.md
//! §1): XYZ here is a flat-beam approximation sufficient to demonstrate the
//! driver contract (angle filtering, re-packing, stats-driven health).
//! Grounded on `original_source/agents/agent_os1_lidar.py` and
//! `agents/os1/lidar_packet.py`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
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

const LIDAR_UDP_PORT: u16 = 7502;
const AZIMUTH_DIVS: u32 = 511;
const ANGLE_SPAN_DEG: f64 = 140.0;
const AZIMUTH_BLOCK_COUNT: usize = 16;
const CHANNEL_BLOCK_COUNT: usize = 64;
const NUM_USED_CHANNELS: usize = 16;
const CHANNEL_BLOCK_SIZE: usize = 4 + 2 + 2 + 2 + 2; // range(u32) + reflectivity + signal + noise + unused
const AZIMUTH_HEADER_SIZE: usize = 8 + 2 + 2 + 4; // timestamp + meas_id + frame_id + encoder_count
const AZIMUTH_BLOCK_SIZE: usize =
    AZIMUTH_HEADER_SIZE + CHANNEL_BLOCK_COUNT * CHANNEL_BLOCK_SIZE + 4; // + status
const PACKET_SIZE: usize = AZIMUTH_BLOCK_COUNT * AZIMUTH_BLOCK_SIZE;
const RANGE_BIT_MASK: u32 = 0x000F_FFFF;

const LOST_PACKETS_ERROR_THRESHOLD_PC: f64 = 5.0;
const INVALID_BLOCKS_ERROR_THRESHOLD_PC: f64 = 5.0;

#[derive(Parser)]
struct Args {
    config: Option<PathBuf>,
}

struct LidarDriver {
    sensor_ip: std::net::Ipv4Addr,
    host_ip: std::net::Ipv4Addr,
    bound: bool,
    packets_total: Arc<AtomicU32>,
    packets_lost: Arc<AtomicU32>,
    blocks_total: Arc<AtomicU32>,
    blocks_invalid: Arc<AtomicU32>,
    degraded: bool,
}

fn admitted_measurement_id_range() -> (u32, u32) {
    let low = (16.0 * ((AZIMUTH_DIVS as f64 * (180.0 - ANGLE_SPAN_DEG / 2.0) / 360.0) / 16.0).round())
        as u32;
    let high = (16.0 * ((AZIMUTH_DIVS as f64 * (180.0 + ANGLE_SPAN_DEG / 2.0) / 360.0) / 16.0).round())
        as u32;
    (low, high)
}

impl DeviceDriver for LidarDriver {
    fn device(&self) -> Device {
        Device::Os1Lidar
    }

    fn connect_hw(&mut self) -> anyhow::Result<()> {
        self.bound = true;
        Ok(())
    }

    fn disconnect_hw(&mut self) {
        self.bound = false;
    }

    fn check_hw_connected(&mut self) -> HwStatus {
        if !self.bound {
            return HwStatus::NotConnected;
        }
        let total = self.packets_total.swap(0, Ordering::Relaxed).max(1) as f64;
        let lost = self.packets_lost.swap(0, Ordering::Relaxed) as f64;
        let blocks_total = self.blocks_total.swap(0, Ordering::Relaxed).max(1) as f64;
        let blocks_invalid = self.blocks_invalid.swap(0, Ordering::Relaxed) as f64;

        let lost_pc = 100.0 * lost / total;
        let invalid_pc = 100.0 * blocks_invalid / blocks_total;
        self.degraded = lost_pc > LOST_PACKETS_ERROR_THRESHOLD_PC
            || invalid_pc > INVALID_BLOCKS_ERROR_THRESHOLD_PC;

        if self.degraded {
            tracing::warn!(lost_pc, invalid_pc, "LiDAR stats exceeded threshold");
            HwStatus::Error
        } else {
            HwStatus::Nominal
        }
    }

    fn process_manager_message(&mut self, _msg: &Message) -> Option<Message> {
        None
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
        let packets_total = Arc::clone(&self.packets_total);
        let packets_lost = Arc::clone(&self.packets_lost);
        let blocks_total = Arc::clone(&self.blocks_total);
        let blocks_invalid = Arc::clone(&self.blocks_invalid);
        let (low, high) = admitted_measurement_id_range();

        tokio::spawn(async move {
            let socket = match UdpSocket::bind((host_ip, LIDAR_UDP_PORT)).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(%host_ip, port = LIDAR_UDP_PORT, error = %e, "failed to bind LiDAR socket");
                    return;
                }
            };
            let mut buf = vec![0u8; PACKET_SIZE];
            let mut last_frame_id: Option<u16> = None;

            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    r = socket.recv_from(&mut buf) => r,
                };
                let Ok((n, peer)) = received else { continue };
                if peer.ip() != sensor_ip {
                    continue;
                }
                packets_total.fetch_add(1, Ordering::Relaxed);
                if n != PACKET_SIZE {
                    packets_lost.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                if let Some(frame_id) = buf[8..10].try_into().ok().map(u16::from_le_bytes) {
                    if let Some(prev) = last_frame_id {
                        let expected_next = prev.wrapping_add(1);
                        if frame_id != prev && frame_id != expected_next {
                            packets_lost.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    last_frame_id = Some(frame_id);
                }

                if !capturing.load(Ordering::Relaxed) {
                    continue;
                }

                for block_idx in 0..AZIMUTH_BLOCK_COUNT {
                    let start = block_idx * AZIMUTH_BLOCK_SIZE;
                    let block = &buf[start..start + AZIMUTH_BLOCK_SIZE];
                    blocks_total.fetch_add(1, Ordering::Relaxed);

                    let Some(measurement_id) =
                        block.get(8..10).and_then(|s| s.try_into().ok()).map(u16::from_le_bytes)
                    else {
                        blocks_invalid.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let measurement_id = measurement_id as u32;
                    if measurement_id < low || measurement_id > high {
                        continue;
                    }
                    match repack_block(block) {
                        Some(repacked) => samples.push(repacked).await,
                        None => {
                            blocks_invalid.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        })
    }
}

/// Re-pack one accepted azimuth block into `(timestamp, measurement_id,
/// frame_id, [channel_id, x, y, z, reflectivity] * NUM_USED_CHANNELS)`.
fn repack_block(block: &[u8]) -> Option<Vec<u8>> {
    if block.len() < AZIMUTH_BLOCK_SIZE {
        return None;
    }
    let timestamp = u64::from_le_bytes(block[0..8].try_into().ok()?);
    let measurement_id = u16::from_le_bytes(block[8..10].try_into().ok()?);
    let frame_id = u16::from_le_bytes(block[10..12].try_into().ok()?);

    let mut out = Vec::with_capacity(12 + NUM_USED_CHANNELS * 15);
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(&measurement_id.to_le_bytes());
    out.extend_from_slice(&frame_id.to_le_bytes());

    for channel in 0..NUM_USED_CHANNELS {
        let offset = AZIMUTH_HEADER_SIZE + channel * CHANNEL_BLOCK_SIZE;
        let chan_bytes = block.get(offset..offset + CHANNEL_BLOCK_SIZE)?;
        let raw_range = u32::from_le_bytes(chan_bytes[0..4].try_into().ok()?);
        let range_mm = (raw_range & RANGE_BIT_MASK) as f64;
        let reflectivity = u16::from_le_bytes(chan_bytes[4..6].try_into().ok()?);

        // Flat-beam approximation: spread the 16 used channels evenly
        // across +/-16 degrees of elevation (a placeholder for the
        // vendor's beam-intrinsics trig table, out of scope per spec.md §1).
        let elevation = (channel as f64 - NUM_USED_CHANNELS as f64 / 2.0) * (32.0 / NUM_USED_CHANNELS as f64);
        let azimuth = 360.0 * (measurement_id as f64) / (AZIMUTH_DIVS as f64);
        let (elev_sin, elev_cos) = elevation.to_radians().sin_cos();
        let (az_sin, az_cos) = azimuth.to_radians().sin_cos();
        let horiz = range_mm * elev_cos;
        let x = (horiz * az_cos) as i32;
        let y = (horiz * az_sin) as i32;
        let z = (range_mm * elev_sin) as i32;

        out.push(channel as u8);
        out.extend_from_slice(&x.to_le_bytes());
        out.extend_from_slice(&y.to_le_bytes());
        out.extend_from_slice(&z.to_le_bytes());
        out.extend_from_slice(&reflectivity.to_le_bytes());
    }
    Some(out)
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
        .get(Device::Os1Lidar)
        .ok_or_else(|| anyhow::anyhow!("missing agent_os1_lidar section"))?;

    let sensor_ip: std::net::Ipv4Addr = cfg
        .extra
        .get("sensor_ip")
        .and_then(|v| v.as_str())
        .unwrap_or("192.168.1.100")
        .parse()?;
    let host_ip: std::net::Ipv4Addr =
        cfg.extra.get("host_ip").and_then(|v| v.as_str()).unwrap_or("0.0.0.0").parse()?;

    let driver = LidarDriver {
        sensor_ip,
        host_ip,
        bound: false,
        packets_total: Arc::new(AtomicU32::new(0)),
        packets_lost: Arc::new(AtomicU32::new(0)),
        blocks_total: Arc::new(AtomicU32::new(0)),
        blocks_invalid: Arc::new(AtomicU32::new(0)),
        degraded: false,
    };
    let runtime_cfg = RuntimeConfig {
        local_port: cfg.local_port,
        hw_connection_retries: cfg.hw_connection_retries,
        output_file_name: cfg.output_file_name.clone().unwrap_or_else(|| "lidar.bin".to_owned()),
    };

    if let Err(e) = AgentRuntime::new(runtime_cfg, driver).run().await {
        tracing::error!(error = %e, "lidar agent exiting with error");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn admitted_range_centers_on_180_degrees() {
        let (low, high) = admitted_measurement_id_range();
        let mid_deg = 360.0 * ((low + high) as f64 / 2.0) / (AZIMUTH_DIVS as f64);
        assert!((mid_deg - 180.0).abs() < 2.0);
    }

    #[test]
    fn repack_block_round_trips_header_fields() {
        let mut block = vec![0u8; AZIMUTH_BLOCK_SIZE];
        block[0..8].copy_from_slice(&42u64.to_le_bytes());
        block[8..10].copy_from_slice(&7u16.to_le_bytes());
        block[10..12].copy_from_slice(&3u16.to_le_bytes());
        let repacked = repack_block(&block).expect("valid block");
        assert_eq!(u64::from_le_bytes(repacked[0..8].try_into().unwrap()), 42);
        assert_eq!(u16::from_le_bytes(repacked[8..10].try_into().unwrap()), 7);
        assert_eq!(u16::from_le_bytes(repacked[10..12].try_into().unwrap()), 3);
    }
}
