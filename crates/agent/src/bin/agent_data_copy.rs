// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Replication agent: watches for a USB drive mounted under
//! `usb_mount_path`, waits for the manager to announce the catalog's sqlite
//! path, then drains the copy worklist onto the drive. Grounded on
//! `original_source/agents/agent_data_copy.py`.
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use fraicap_agent::writer::SampleQueue;
use fraicap_agent::{AgentRuntime, DeviceDriver, RuntimeConfig};
use fraicap_common::protocol::{DataPayload, Message, SysState};
use fraicap_common::types::{Device, HwStatus};
use fraicap_common::Catalog;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ENOSPC: i32 = 28;
const EACCES: i32 = 13;

#[derive(Parser)]
struct Args {
    config: Option<PathBuf>,
}

struct DataCopyDriver {
    usb_mount_path: PathBuf,
    database_path: Arc<Mutex<Option<PathBuf>>>,
}

impl DeviceDriver for DataCopyDriver {
    fn device(&self) -> Device {
        Device::DataCopy
    }

    fn connect_hw(&mut self) -> anyhow::Result<()> {
        // No sensor to connect to: this agent only moves files once the
        // manager tells it where the catalog lives.
        Ok(())
    }

    fn disconnect_hw(&mut self) {}

    fn check_hw_connected(&mut self) -> HwStatus {
        HwStatus::Nominal
    }

    fn process_manager_message(&mut self, msg: &Message) -> Option<Message> {
        if let Message::Data(DataPayload::DatabasePath(path)) = msg {
            *self.database_path.lock().expect("database_path mutex poisoned") = Some(path.clone());
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
        let usb_mount_path = self.usb_mount_path.clone();
        let database_path = Arc::clone(&self.database_path);
        let drive_connected = Arc::new(AtomicBool::new(false));
        let destination = Arc::new(Mutex::new(None::<PathBuf>));

        spawn_drive_watcher(usb_mount_path, Arc::clone(&drive_connected), Arc::clone(&destination), shutdown.clone());

        tokio::spawn(async move {
            tracing::info!("waiting for manager to announce the catalog path");
            let db_path = loop {
                if let Some(path) = database_path.lock().expect("database_path mutex poisoned").clone() {
                    break path;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            };
            tracing::info!(?db_path, "catalog path announced");

            let catalog = match tokio::task::spawn_blocking(move || Catalog::open(&db_path)).await {
                Ok(Ok(catalog)) => Arc::new(catalog),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "failed to open catalog");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "catalog open task panicked");
                    return;
                }
            };

            let mut space_available = true;
            loop {
                let connected = drive_connected.load(Ordering::Relaxed);
                let dest = destination.lock().expect("destination mutex poisoned").clone();

                if connected && space_available {
                    if let Some(dest) = dest {
                        let pending = {
                            let catalog = Arc::clone(&catalog);
                            tokio::task::spawn_blocking(move || catalog.get_copy_pending()).await
                        };
                        let pending = pending.ok().and_then(Result::ok).unwrap_or_default();
                        if !pending.is_empty() {
                            tracing::info!(count = pending.len(), "starting replication pass");
                            let _ = outbound.send(Message::SysState(SysState::ExtDriveInUse));

                            for entry in pending {
                                if shutdown.is_cancelled() {
                                    break;
                                }
                                let entry_dest = destination_for(&dest, &entry.directory);
                                let catalog = Arc::clone(&catalog);
                                let src = PathBuf::from(&entry.directory);
                                let folio = entry.folio.clone();
                                let outcome = tokio::task::spawn_blocking(move || {
                                    copy_segment(&src, &entry_dest, &catalog, &folio)
                                })
                                .await;

                                match outcome {
                                    Ok(CopyOutcome::Ok) => {}
                                    Ok(CopyOutcome::NoSpace) => {
                                        tracing::error!("not enough space on external drive");
                                        space_available = false;
                                        let _ = outbound.send(Message::SysState(SysState::ExtDriveFull));
                                        break;
                                    }
                                    Ok(CopyOutcome::PermissionDenied) => {
                                        tracing::error!("lost write permission on external drive");
                                        drive_connected.store(false, Ordering::Relaxed);
                                        break;
                                    }
                                    Ok(CopyOutcome::OtherError(e)) => {
                                        tracing::warn!(error = %e, "segment copy failed");
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "copy task panicked");
                                    }
                                }

                                if !drive_connected.load(Ordering::Relaxed) {
                                    break;
                                }
                            }

                            if !shutdown.is_cancelled() {
                                let _ = outbound.send(Message::SysState(SysState::ExtDriveNotInUse));
                            }
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        })
    }
}

enum CopyOutcome {
    Ok,
    NoSpace,
    PermissionDenied,
    OtherError(std::io::Error),
}

/// Destination mirrors the source's last four path components under the
/// drive's first mounted subdirectory (`original_source` uses `row[0].split(os.sep)[-4:]`).
fn destination_for(drive_root: &Path, source_dir: &str) -> PathBuf {
    let components: Vec<&str> = source_dir.split(std::path::MAIN_SEPARATOR).filter(|c| !c.is_empty()).collect();
    let tail = &components[components.len().saturating_sub(4)..];
    let mut dest = drive_root.to_path_buf();
    for part in tail {
        dest.push(part);
    }
    dest
}

fn copy_segment(src: &Path, dest: &Path, catalog: &Catalog, folio: &str) -> CopyOutcome {
    if dest.is_dir() {
        if let Err(e) = std::fs::remove_dir_all(dest) {
            return CopyOutcome::OtherError(e);
        }
    }
    if let Err(e) = copy_dir_recursive(src, dest) {
        return classify_io_error(e);
    }
    nix::unistd::sync();
    if let Err(e) = catalog.mark_copied(folio) {
        tracing::warn!(error = %e, "failed to record copy completion in catalog");
    }
    CopyOutcome::Ok
}

fn classify_io_error(e: std::io::Error) -> CopyOutcome {
    match e.raw_os_error() {
        Some(ENOSPC) => CopyOutcome::NoSpace,
        Some(EACCES) => CopyOutcome::PermissionDenied,
        _ => CopyOutcome::OtherError(e),
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

fn spawn_drive_watcher(
    usb_mount_path: PathBuf,
    drive_connected: Arc<AtomicBool>,
    destination: Arc<Mutex<Option<PathBuf>>>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let mut entries = tokio::fs::read_dir(&usb_mount_path).await.ok();
            let first_subdir = match &mut entries {
                Some(dir) => first_subdirectory(dir).await,
                None => None,
            };

            match first_subdir {
                Some(name) => {
                    if !drive_connected.load(Ordering::Relaxed) {
                        tracing::info!("external drive connected");
                        *destination.lock().expect("destination mutex poisoned") =
                            Some(usb_mount_path.join(name));
                        drive_connected.store(true, Ordering::Relaxed);
                    }
                }
                None => {
                    if drive_connected.swap(false, Ordering::Relaxed) {
                        tracing::info!("external drive disconnected");
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    });
}

async fn first_subdirectory(dir: &mut tokio::fs::ReadDir) -> Option<std::ffi::OsString> {
    while let Ok(Some(entry)) = dir.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            return Some(entry.file_name());
        }
    }
    None
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
        .get(Device::DataCopy)
        .ok_or_else(|| anyhow::anyhow!("missing agent_data_copy section"))?;

    let usb_mount_path: PathBuf = cfg
        .extra
        .get("usb_mount_path")
        .and_then(|v| v.as_str())
        .unwrap_or("/media/fraicap-usb")
        .into();

    let driver = DataCopyDriver { usb_mount_path, database_path: Arc::new(Mutex::new(None)) };
    let runtime_cfg = RuntimeConfig {
        local_port: cfg.local_port,
        hw_connection_retries: cfg.hw_connection_retries,
        output_file_name: cfg.output_file_name.clone().unwrap_or_else(|| "data_copy.log".to_owned()),
    };

    if let Err(e) = AgentRuntime::new(runtime_cfg, driver).run().await {
        tracing::error!(error = %e, "data-copy agent exiting with error");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn destination_uses_last_four_path_components() {
        let dest = destination_for(
            Path::new("/media/usb/backup"),
            "/data/001/2026.01.01/10.00.00/0003",
        );
        assert_eq!(dest, PathBuf::from("/media/usb/backup/2026.01.01/10.00.00/0003"));
    }

    #[test]
    fn copy_dir_recursive_mirrors_nested_structure() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("img")).unwrap();
        std::fs::write(src.path().join("gps.csv"), b"a;b\r\n").unwrap();
        std::fs::write(src.path().join("img/1.jpeg"), b"\0").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("0003");
        copy_dir_recursive(src.path(), &target).unwrap();

        assert!(target.join("gps.csv").exists());
        assert!(target.join("img/1.jpeg").exists());
    }
}
