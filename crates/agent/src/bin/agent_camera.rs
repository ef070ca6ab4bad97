// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Camera agent: periodically shells out to `fswebcam` to grab a still into
//! the current segment's `img/` subdirectory. Grounded on
//! `original_source/agents/agent_camera.py`.
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use fraicap_agent::writer::SampleQueue;
use fraicap_agent::{AgentRuntime, DeviceDriver, RuntimeConfig};
use fraicap_common::protocol::Message;
use fraicap_common::types::{Device, HwStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const IMAGES_FOLDER: &str = "img";

#[derive(Parser)]
struct Args {
    config: Option<PathBuf>,
}

struct CameraDriver {
    dev_file: String,
    resolution: String,
    period_s: f64,
    connected: bool,
    segment_dir: Arc<Mutex<Option<PathBuf>>>,
}

impl DeviceDriver for CameraDriver {
    fn device(&self) -> Device {
        Device::Camera
    }

    fn connect_hw(&mut self) -> anyhow::Result<()> {
        if !Path::new(&self.dev_file).exists() {
            anyhow::bail!("camera device {} not present", self.dev_file);
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect_hw(&mut self) {
        self.connected = false;
    }

    fn check_hw_connected(&mut self) -> HwStatus {
        if Path::new(&self.dev_file).exists() {
            HwStatus::Nominal
        } else {
            HwStatus::NotConnected
        }
    }

    fn process_manager_message(&mut self, msg: &Message) -> Option<Message> {
        if let Message::NewCapture(path) = msg {
            // The manager hands us the segment's output file path; the
            // image directory is a sibling of it.
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone());
            *self.segment_dir.lock().expect("segment_dir mutex poisoned") = Some(dir);
        }
        None
    }

    fn spawn_acquisition(
        &mut self,
        _samples: SampleQueue,
        _outbound: mpsc::UnboundedSender<Message>,
        capturing: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let resolution = self.resolution.clone();
        let period = Duration::from_secs_f64(self.period_s.max(0.1));
        let segment_dir = Arc::clone(&self.segment_dir);

        tokio::spawn(async move {
            loop {
                if !capturing.load(Ordering::Relaxed) {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                    continue;
                }
                let Some(dir) = segment_dir.lock().expect("segment_dir mutex poisoned").clone() else {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                    continue;
                };

                let started = std::time::Instant::now();
                if let Err(e) = capture_one(&dir, &resolution).await {
                    tracing::warn!(error = %e, "camera capture failed");
                }
                let elapsed = started.elapsed();
                if elapsed > period {
                    tracing::warn!(
                        elapsed_s = elapsed.as_secs_f64(),
                        period_s = period.as_secs_f64(),
                        "fswebcam took longer than the configured period"
                    );
                }
                let remaining = period.saturating_sub(elapsed);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
        })
    }
}

async fn capture_one(segment_dir: &Path, resolution: &str) -> anyhow::Result<()> {
    let images_dir = segment_dir.join(IMAGES_FOLDER);
    tokio::fs::create_dir_all(&images_dir).await?;
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let file_name = images_dir.join(format!("{ts:.1}.jpeg"));

    let output = tokio::process::Command::new("fswebcam")
        .args(["-r", resolution, "--no-banner", "-q", "--save"])
        .arg(&file_name)
        .output()
        .await?;

    if !output.status.success() || !tokio::fs::try_exists(&file_name).await.unwrap_or(false) {
        anyhow::bail!("fswebcam failed or produced no output file");
    }
    Ok(())
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
        .get(Device::Camera)
        .ok_or_else(|| anyhow::anyhow!("missing agent_camera section"))?;

    let dev_file = cfg
        .extra
        .get("dev_file")
        .and_then(|v| v.as_str())
        .unwrap_or("/dev/video0")
        .to_owned();
    let resolution = cfg
        .extra
        .get("resolution")
        .and_then(|v| v.as_str())
        .unwrap_or("1280x720")
        .to_owned();
    let period_s = cfg.extra.get("period").and_then(|v| v.as_f64()).unwrap_or(5.0);

    let driver = CameraDriver {
        dev_file,
        resolution,
        period_s,
        connected: false,
        segment_dir: Arc::new(Mutex::new(None)),
    };
    let runtime_cfg = RuntimeConfig {
        local_port: cfg.local_port,
        hw_connection_retries: cfg.hw_connection_retries,
        output_file_name: cfg.output_file_name.clone().unwrap_or_else(|| "camera.log".to_owned()),
    };

    if let Err(e) = AgentRuntime::new(runtime_cfg, driver).run().await {
        tracing::error!(error = %e, "camera agent exiting with error");
        std::process::exit(1);
    }
    Ok(())
}
