// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `AgentRuntime<D>`: the generic skeleton every device binary wraps around
//! its [`crate::driver::DeviceDriver`] impl (spec.md §4.2). Generalizes the
//! teacher's per-detector-task-plus-`CancellationToken` shutdown pattern
//! (`crates/cli/src/driver/process.rs`, `crates/cli/src/driver/mod.rs`) into
//! a single-owner main-supervisor loop: `driver` is touched from exactly one
//! task, so its hooks need no internal synchronization.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fraicap_common::protocol::Message;
use fraicap_common::types::{AgentStatus, HwStatus};
use tokio_util::sync::CancellationToken;

use crate::control::{self, ControlChannel};
use crate::driver::DeviceDriver;
use crate::writer::{self, FileCmd, FileWriter};

/// Configuration every agent binary parses from its section of the agents
/// config document (spec.md §6 "Per-agent").
pub struct RuntimeConfig {
    pub local_port: u16,
    pub hw_connection_retries: u32,
    pub output_file_name: String,
}

pub struct AgentRuntime<D: DeviceDriver> {
    config: RuntimeConfig,
    driver: D,
    status: AgentStatus,
    hw_status: HwStatus,
}

impl<D: DeviceDriver> AgentRuntime<D> {
    pub fn new(config: RuntimeConfig, driver: D) -> Self {
        Self { config, driver, status: AgentStatus::Starting, hw_status: HwStatus::NotConnected }
    }

    /// Drive the agent to completion: connect hardware (retrying up to
    /// `hw_connection_retries`), run the control channel and main
    /// supervisor loop until QUIT or SIGINT, then finalize.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        spawn_sigint_watcher(shutdown.clone());

        if let Err(e) = self.connect_with_retries().await {
            anyhow::bail!("hardware connect failed after retries: {e}");
        }

        let listen_addr: SocketAddr = ([127, 0, 0, 1], self.config.local_port).into();
        let ControlChannel { mut inbound_rx, outbound_tx } =
            control::spawn(listen_addr, shutdown.clone());
        let FileWriter { cmds: file_cmds, queue } =
            writer::spawn(self.config.output_file_name.clone(), shutdown.clone());

        let capturing = Arc::new(AtomicBool::new(false));
        let mut acquisition = self.driver.spawn_acquisition(
            queue,
            outbound_tx.clone(),
            Arc::clone(&capturing),
            shutdown.clone(),
        );

        self.status = AgentStatus::StandBy;
        tracing::info!(device = self.driver.device().name(), "agent ready");

        let mut watchdog = tokio::time::interval(Duration::from_secs(1));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),

                joined = &mut acquisition => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "acquisition task ended unexpectedly");
                    }
                    break Ok(());
                }

                _ = watchdog.tick() => {
                    self.hw_status = self.driver.check_hw_connected();
                    if matches!(self.hw_status, HwStatus::NotConnected | HwStatus::Error) {
                        tracing::warn!(
                            device = self.driver.device().name(),
                            "hardware lost, reconnecting"
                        );
                        self.status = AgentStatus::Starting;
                        self.driver.disconnect_hw();
                        if let Err(e) = self.connect_with_retries().await {
                            break Err(anyhow::anyhow!("hardware reconnect failed: {e}"));
                        }
                        self.status = if capturing.load(Ordering::Relaxed) {
                            AgentStatus::Capturing
                        } else {
                            AgentStatus::StandBy
                        };
                    }
                }

                msg = inbound_rx.recv() => {
                    let Some(msg) = msg else { break Ok(()); };
                    if self.handle_message(&msg, &capturing, &file_cmds, &outbound_tx).is_quit() {
                        break Ok(());
                    }
                }
            }
        };

        acquisition.abort();
        let _ = file_cmds.send(FileCmd::Close);
        self.driver.finalize();
        result
    }

    async fn connect_with_retries(&mut self) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            match self.driver.connect_hw() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if attempts > self.config.hw_connection_retries {
                        return Err(e);
                    }
                    tracing::warn!(
                        attempt = attempts,
                        max = self.config.hw_connection_retries,
                        error = %e,
                        "hardware connect attempt failed, retrying in 1s"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Protocol handled at the runtime layer (spec.md §4.2 table);
    /// everything else is delegated to the driver.
    fn handle_message(
        &mut self,
        msg: &Message,
        capturing: &Arc<AtomicBool>,
        file_cmds: &tokio::sync::mpsc::UnboundedSender<FileCmd>,
        outbound: &tokio::sync::mpsc::UnboundedSender<Message>,
    ) -> Handled {
        match msg {
            Message::QueryAgentState => {
                let _ = outbound.send(Message::AgentState(self.status));
            }
            Message::QueryHwState => {
                let _ = outbound.send(Message::HwState(self.hw_status));
            }
            Message::Quit => return Handled::Quit,
            Message::NewCapture(path) => {
                self.rotate(path.clone(), file_cmds);
                if let Some(reply) = self.driver.process_manager_message(msg) {
                    let _ = outbound.send(reply);
                }
            }
            Message::StartCapture => {
                capturing.store(true, Ordering::Relaxed);
                self.status = AgentStatus::Capturing;
            }
            Message::EndCapture => {
                capturing.store(false, Ordering::Relaxed);
                self.status = AgentStatus::StandBy;
                self.driver.pre_capture_file_update();
            }
            other => {
                if let Some(reply) = self.driver.process_manager_message(other) {
                    let _ = outbound.send(reply);
                }
            }
        }
        Handled::Continue
    }

    fn rotate(&mut self, path: PathBuf, file_cmds: &tokio::sync::mpsc::UnboundedSender<FileCmd>) {
        let header = self.driver.file_header();
        let _ = file_cmds.send(FileCmd::Rotate { path, header });
    }
}

enum Handled {
    Continue,
    Quit,
}

impl Handled {
    fn is_quit(&self) -> bool {
        matches!(self, Handled::Quit)
    }
}

fn spawn_sigint_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, shutting down");
            shutdown.cancel();
        }
    });
}
