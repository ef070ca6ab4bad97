// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ATMEGA panel agent: serial port shared by button reading and LED
//! dispatch (the agent is the panel's sole serial-port owner, spec.md §5).
//! Two ADC voltages per frame, 3-sample stability debounce (<0.05V jitter)
//! plus per-button voltage tolerance (<0.1V), button feedback pulse, and
//! SYS_STATE/DEVICE_STATE-driven status LEDs. Grounded on
//! `original_source/agents/agent_atmega.py`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use fraicap_agent::writer::SampleQueue;
use fraicap_agent::{AgentRuntime, DeviceDriver, RuntimeConfig};
use fraicap_common::protocol::{DataPayload, Message, SysState};
use fraicap_common::types::{Device, HwStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;

const STABILITY_THRESHOLD: f64 = 0.05;
const BUTTON_TOLERANCE: f64 = 0.1;
const ADC_VALUE_TO_VOLTS: f64 = 5.0 / 1023.0;
const START_OF_TEXT: u8 = 0xFF;

const LED_BUT_FDBK: u8 = 0x02;
const LED_CAPTURING: u8 = 0x03;
const LED_ONLINE: u8 = 0x04;
const LED_OFFLINE: u8 = 0x05;
const LED_EXT_DRIVE: u8 = 0x06;
const OFF: u8 = 0x00;
const ON: u8 = 0x01;
const BLINK: u8 = 0x02;

fn device_led(device: Device) -> Option<u8> {
    match device {
        Device::Os1Lidar | Device::Os1Imu => Some(0x07),
        Device::Gps => Some(0x08),
        Device::Imu => Some(0x09),
        Device::Camera => Some(0x0A),
        Device::Inet => Some(0x0B),
        Device::Atmega | Device::DataCopy => None,
    }
}

fn default_keys() -> HashMap<String, (f64, f64)> {
    // Evenly-spaced synthetic voltage codes; real deployments override these
    // via the `keys` config key with hardware-calibrated pairs.
    let names =
        ["bNoButton", "bSingleButton", "b+", "b-", "b<", "b>", "bMute", "bGPS", "bStop", "bPickup", "bHangup", "bM"];
    names
        .iter()
        .enumerate()
        .map(|(i, name)| ((*name).to_owned(), (i as f64 * 0.3, 0.0)))
        .collect()
}

#[derive(Parser)]
struct Args {
    config: Option<PathBuf>,
}

struct AtmegaDriver {
    com_port: String,
    baudrate: u32,
    keys: HashMap<String, (f64, f64)>,
    connected: bool,
    led_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

fn led_frame(led: u8, mode: u8) -> Vec<u8> {
    vec![START_OF_TEXT, led, mode]
}

impl DeviceDriver for AtmegaDriver {
    fn device(&self) -> Device {
        Device::Atmega
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
        self.led_tx = None;
    }

    fn check_hw_connected(&mut self) -> HwStatus {
        if self.connected {
            HwStatus::Nominal
        } else {
            HwStatus::NotConnected
        }
    }

    fn process_manager_message(&mut self, msg: &Message) -> Option<Message> {
        let Some(led_tx) = &self.led_tx else { return None };
        let frames: Vec<Vec<u8>> = match msg {
            Message::SysState(state) => match state {
                SysState::Offline => vec![led_frame(LED_ONLINE, OFF), led_frame(LED_OFFLINE, ON)],
                SysState::Online => vec![led_frame(LED_ONLINE, ON), led_frame(LED_OFFLINE, OFF)],
                SysState::Error => {
                    vec![led_frame(LED_ONLINE, ON), led_frame(LED_OFFLINE, ON), led_frame(LED_ONLINE, BLINK)]
                }
                SysState::CaptureOff => vec![led_frame(LED_CAPTURING, OFF)],
                SysState::CaptureOn => vec![led_frame(LED_CAPTURING, ON)],
                SysState::CapturePaused => vec![led_frame(LED_CAPTURING, BLINK)],
                SysState::ExtDriveInUse => vec![led_frame(LED_EXT_DRIVE, ON)],
                SysState::ExtDriveNotInUse => vec![led_frame(LED_EXT_DRIVE, OFF)],
                SysState::ExtDriveFull => vec![led_frame(LED_EXT_DRIVE, BLINK)],
            },
            Message::DeviceState { device, status } => {
                let Ok(device) = device.parse::<DeviceName>() else { return None };
                let Some(led) = device_led(device.0) else { return None };
                let mode = match status {
                    HwStatus::NotConnected => ON,
                    HwStatus::Error | HwStatus::Warning => BLINK,
                    HwStatus::Nominal => OFF,
                };
                vec![led_frame(led, mode)]
            }
            _ => return None,
        };
        for frame in frames {
            let _ = led_tx.send(frame);
        }
        None
    }

    fn spawn_acquisition(
        &mut self,
        _samples: SampleQueue,
        outbound: mpsc::UnboundedSender<Message>,
        _capturing: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let com_port = self.com_port.clone();
        let baudrate = self.baudrate;
        let keys = self.keys.clone();
        let (led_tx, mut led_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.led_tx = Some(led_tx);

        tokio::spawn(async move {
            let mut port = match tokio_serial::new(&com_port, baudrate).open_native_async() {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(%com_port, error = %e, "failed to open ATMEGA serial port");
                    return;
                }
            };

            let mut samples: Vec<(f64, f64)> = Vec::new();
            let mut unpressed = true;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,

                    frame = read_adc_frame(&mut port) => {
                        let Some((v1, v2)) = frame else { continue };
                        samples.push((v1, v2));
                        if samples.len() < 4 {
                            continue;
                        }
                        if !is_stable(&samples[samples.len() - 4..]) {
                            samples.remove(0);
                            continue;
                        }
                        let Some(&(v1, v2)) = samples.last() else { continue };
                        samples.clear();

                        if let Some(button) = classify_button(&keys, v1, v2) {
                            if button == "bNoButton" {
                                unpressed = true;
                            } else if unpressed {
                                unpressed = false;
                                let _ = outbound.send(Message::Data(DataPayload::Button(button)));
                                let _ = port.write_all(&led_frame(LED_BUT_FDBK, ON)).await;
                                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                                let _ = port.write_all(&led_frame(LED_BUT_FDBK, OFF)).await;
                            }
                        }
                    }

                    led = led_rx.recv() => {
                        let Some(bytes) = led else { break };
                        let _ = port.write_all(&bytes).await;
                    }
                }
            }
        })
    }
}

async fn read_adc_frame(port: &mut tokio_serial::SerialStream) -> Option<(f64, f64)> {
    let mut byte = [0u8; 1];
    loop {
        port.read_exact(&mut byte).await.ok()?;
        if byte[0] == START_OF_TEXT {
            break;
        }
    }
    let mut raw = [0u8; 4];
    port.read_exact(&mut raw).await.ok()?;
    let v1 = i16::from_le_bytes([raw[0], raw[1]]) as f64 * ADC_VALUE_TO_VOLTS;
    let v2 = i16::from_le_bytes([raw[2], raw[3]]) as f64 * ADC_VALUE_TO_VOLTS;
    Some((v1, v2))
}

fn is_stable(window: &[(f64, f64)]) -> bool {
    window.windows(2).all(|pair| {
        let (a, b) = (pair[0], pair[1]);
        (a.0 - b.0).abs() <= STABILITY_THRESHOLD && (a.1 - b.1).abs() <= STABILITY_THRESHOLD
    })
}

fn classify_button(keys: &HashMap<String, (f64, f64)>, v1: f64, v2: f64) -> Option<String> {
    keys.iter()
        .find(|(_, (k1, k2))| (v1 - k1).abs() < BUTTON_TOLERANCE && (v2 - k2).abs() < BUTTON_TOLERANCE)
        .map(|(name, _)| name.clone())
}

struct DeviceName(Device);

impl std::str::FromStr for DeviceName {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Device::ALL.iter().find(|d| d.name() == s).map(|d| DeviceName(*d)).ok_or(())
    }
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
        .get(Device::Atmega)
        .ok_or_else(|| anyhow::anyhow!("missing agent_atmega section"))?;

    let com_port = cfg
        .extra
        .get("com_port")
        .and_then(|v| v.as_str())
        .unwrap_or("/dev/ttyARD0")
        .to_owned();
    let baudrate = cfg.extra.get("baudrate").and_then(|v| v.as_u64()).unwrap_or(115_200) as u32;
    let keys = cfg
        .extra
        .get("keys")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| {
                    let pair = v.as_array()?;
                    Some((k.clone(), (pair.first()?.as_f64()?, pair.get(1)?.as_f64()?)))
                })
                .collect()
        })
        .unwrap_or_else(default_keys);

    let driver = AtmegaDriver { com_port, baudrate, keys, connected: false, led_tx: None };
    let runtime_cfg = RuntimeConfig {
        local_port: cfg.local_port,
        hw_connection_retries: cfg.hw_connection_retries,
        output_file_name: cfg.output_file_name.clone().unwrap_or_else(|| "atmega.log".to_owned()),
    };

    if let Err(e) = AgentRuntime::new(runtime_cfg, driver).run().await {
        tracing::error!(error = %e, "atmega agent exiting with error");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_button_respects_tolerance() {
        let mut keys = HashMap::new();
        keys.insert("bSingleButton".to_owned(), (1.0, 0.0));
        assert_eq!(classify_button(&keys, 1.05, 0.02).as_deref(), Some("bSingleButton"));
        assert_eq!(classify_button(&keys, 1.2, 0.0), None);
    }

    #[test]
    fn is_stable_detects_jitter_above_threshold() {
        let stable = [(1.0, 0.0), (1.01, 0.0), (1.02, 0.0), (1.0, 0.0)];
        assert!(is_stable(&stable));
        let jittery = [(1.0, 0.0), (1.2, 0.0), (1.0, 0.0), (1.0, 0.0)];
        assert!(!is_stable(&jittery));
    }
}
