// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Manager-side representation of one agent (spec.md §4.3): a reconnecting
//! client socket, a receive loop that demultiplexes replies into cached
//! status, a state-poller, and a best-effort outbound sender. Grounded on
//! the teacher's reconnecting-upstream shape
//! (`crates/mux/src/upstream/client.rs` for the "one client per remote
//! peer" handle, `crates/mux/src/upstream/health.rs` for the
//! poll-then-count-failures staleness pattern), adapted from HTTP polling
//! to the raw framed TCP control channel `fraicap-agent::control` speaks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fraicap_common::protocol::{encode, DataPayload, Framer, Message, SysState};
use fraicap_common::types::{AgentStatus, Device, HwStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Two missed poll replies in a row surfaces the agent as NOT_RESPONDING
/// (spec.md §4.3 "State poller").
const MISSED_REPLIES_THRESHOLD: u32 = 2;

struct Shared {
    agent_status: Mutex<AgentStatus>,
    hw_status: Mutex<HwStatus>,
    connected: AtomicBool,
    missed_polls: AtomicU32,
}

/// Handle to one agent's proxy: cheap to clone (`Arc` inside), safe to call
/// from the coordinator's select-loop.
#[derive(Clone)]
pub struct AgentProxy {
    pub name: String,
    pub device: Device,
    pub enabled: bool,
    outbound_tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl AgentProxy {
    /// Best-effort send; a disconnected agent silently drops the command
    /// (reconnection repairs delivery for subsequent ones, spec.md §4.3 "Send").
    pub fn send(&self, msg: Message) {
        let _ = self.outbound_tx.send(msg);
    }

    pub fn agent_status(&self) -> AgentStatus {
        *self.shared.agent_status.lock().expect("proxy agent_status mutex poisoned")
    }

    pub fn hw_status(&self) -> HwStatus {
        *self.shared.hw_status.lock().expect("proxy hw_status mutex poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }
}

/// Spawn the proxy's connect/receive/poll tasks. Returns the handle plus an
/// unbounded receiver of every `DATA` payload the agent reports (GPS fixes,
/// button presses, spec.md §4.3 "enqueue into `q_data_in`") and every
/// `SYS_STATE` the agent originates itself (the data-copy agent's
/// EXT_DRIVE_* announcements, `original_source/manager.py`'s
/// `check_data_copy`).
pub fn spawn(
    name: String,
    device: Device,
    enabled: bool,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> (AgentProxy, mpsc::UnboundedReceiver<DataPayload>, mpsc::UnboundedReceiver<SysState>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (data_tx, data_rx) = mpsc::unbounded_channel::<DataPayload>();
    let (sys_state_tx, sys_state_rx) = mpsc::unbounded_channel::<SysState>();
    let shared = Arc::new(Shared {
        agent_status: Mutex::new(AgentStatus::Starting),
        hw_status: Mutex::new(HwStatus::NotConnected),
        connected: AtomicBool::new(false),
        missed_polls: AtomicU32::new(0),
    });

    if enabled {
        let shared = Arc::clone(&shared);
        let agent_name = name.clone();
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    stream = TcpStream::connect(addr) => stream,
                };
                let stream = match stream {
                    Ok(s) => s,
                    Err(_) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        }
                    }
                };
                tracing::info!(agent = %agent_name, %addr, "connected to agent");
                shared.connected.store(true, Ordering::Relaxed);
                shared.missed_polls.store(0, Ordering::Relaxed);

                let (mut read_half, mut write_half) = stream.into_split();

                let reader_shared = Arc::clone(&shared);
                let reader_data_tx = data_tx.clone();
                let reader_sys_state_tx = sys_state_tx.clone();
                let reader_shutdown = shutdown.clone();
                let mut reader = tokio::spawn(async move {
                    let mut framer = Framer::new();
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = tokio::select! {
                            _ = reader_shutdown.cancelled() => break,
                            read = read_half.read(&mut buf) => match read {
                                Ok(0) => break,
                                Ok(n) => n,
                                Err(_) => break,
                            },
                        };
                        for result in framer.push(&buf[..n]) {
                            let Ok(msg) = result else { continue };
                            reader_shared.missed_polls.store(0, Ordering::Relaxed);
                            match msg {
                                Message::AgentState(status) => {
                                    *reader_shared
                                        .agent_status
                                        .lock()
                                        .expect("proxy agent_status mutex poisoned") = status;
                                }
                                Message::HwState(status) => {
                                    *reader_shared
                                        .hw_status
                                        .lock()
                                        .expect("proxy hw_status mutex poisoned") = status;
                                }
                                Message::Data(payload) => {
                                    let _ = reader_data_tx.send(payload);
                                }
                                Message::SysState(state) => {
                                    let _ = reader_sys_state_tx.send(state);
                                }
                                _ => {}
                            }
                        }
                    }
                });

                let poller_tx = outbound_tx_clone_for_poller(&outbound_tx);
                let poller_shutdown = shutdown.clone();
                let poller_shared = Arc::clone(&shared);
                let mut poller = tokio::spawn(async move {
                    loop {
                        let missed = poller_shared.missed_polls.fetch_add(1, Ordering::Relaxed) + 1;
                        if missed >= MISSED_REPLIES_THRESHOLD {
                            *poller_shared
                                .agent_status
                                .lock()
                                .expect("proxy agent_status mutex poisoned") = AgentStatus::NotResponding;
                        }
                        if poller_tx.send(Message::QueryAgentState).is_err() {
                            return;
                        }
                        tokio::select! {
                            _ = poller_shutdown.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        if poller_tx.send(Message::QueryHwState).is_err() {
                            return;
                        }
                        tokio::select! {
                            _ = poller_shutdown.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                });

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            reader.abort();
                            poller.abort();
                            return;
                        }
                        _ = &mut reader => { poller.abort(); break; }
                        _ = &mut poller => { reader.abort(); break; }
                        msg = outbound_rx.recv() => {
                            let Some(msg) = msg else { reader.abort(); poller.abort(); return; };
                            let bytes = encode(&msg);
                            if write_half.write_all(&bytes).await.is_err() {
                                reader.abort();
                                poller.abort();
                                break;
                            }
                        }
                    }
                }

                shared.connected.store(false, Ordering::Relaxed);
                tracing::warn!(agent = %agent_name, "disconnected from agent, reconnecting");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        });
    }

    (AgentProxy { name, device, enabled, outbound_tx, shared }, data_rx, sys_state_rx)
}

/// `outbound_tx` is the single stable channel the coordinator and the
/// poller both push onto; the poller gets its own clone so it can run in
/// its own task.
fn outbound_tx_clone_for_poller(tx: &mpsc::UnboundedSender<Message>) -> mpsc::UnboundedSender<Message> {
    tx.clone()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn proxy_reports_connected_after_agent_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let bytes = encode(&Message::AgentState(AgentStatus::StandBy));
                let _ = stream.write_all(&bytes).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let (proxy, _data_rx, _sys_state_rx) =
            spawn("gps".to_owned(), Device::Gps, true, addr, shutdown.clone());

        let mut observed = false;
        for _ in 0..50 {
            if proxy.is_connected() && proxy.agent_status() == AgentStatus::StandBy {
                observed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(observed, "proxy did not observe AGENT_STATE reply in time");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn proxy_forwards_data_payloads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let bytes = encode(&Message::Data(DataPayload::Button("bSingleButton".to_owned())));
                let _ = stream.write_all(&bytes).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let (_proxy, mut data_rx, _sys_state_rx) =
            spawn("atmega".to_owned(), Device::Atmega, true, addr, shutdown.clone());

        let payload = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
            .await
            .expect("timed out waiting for data payload")
            .expect("channel closed");
        assert_eq!(payload, DataPayload::Button("bSingleButton".to_owned()));
        shutdown.cancel();
    }
}
