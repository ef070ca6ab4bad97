// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-channel reader/writer tasks (spec.md §4.2, tasks 1-2). The agent
//! is the server side: it binds `local_port` and waits for the manager's
//! proxy to connect, mirroring `original_source/hwagent/abstract_agent.py`'s
//! `__wait_for_manager_connection`.

use std::net::SocketAddr;

use fraicap_common::protocol::{encode, Framer, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handle returned by [`spawn`]: a stream of decoded inbound messages and a
/// sink for outbound ones, both stable across manager reconnects.
pub struct ControlChannel {
    pub inbound_rx: mpsc::Receiver<Message>,
    pub outbound_tx: mpsc::UnboundedSender<Message>,
}

pub fn spawn(listen_addr: SocketAddr, shutdown: CancellationToken) -> ControlChannel {
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let listener = match TcpListener::bind(listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%listen_addr, error = %e, "failed to bind control listener");
                return;
            }
        };
        tracing::info!(%listen_addr, "control listener bound, waiting for manager");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed, retrying");
                        continue;
                    }
                },
            };
            tracing::info!(%peer, "manager connected");

            let (mut read_half, mut write_half) = stream.into_split();
            let reader_inbound = inbound_tx.clone();
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
                            Err(e) => {
                                tracing::warn!(error = %e, "control read failed");
                                break;
                            }
                        },
                    };
                    for result in framer.push(&buf[..n]) {
                        match result {
                            Ok(msg) => {
                                if reader_inbound.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "dropping malformed record"),
                        }
                    }
                }
            });

            let mut logged_broken_pipe = false;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => { reader.abort(); return; }
                    joined = &mut reader => {
                        if let Err(e) = joined {
                            tracing::warn!(error = %e, "control reader task failed");
                        }
                        break;
                    }
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { reader.abort(); return; };
                        let bytes = encode(&msg);
                        if let Err(e) = write_half.write_all(&bytes).await {
                            if !logged_broken_pipe {
                                tracing::warn!(error = %e, "control write failed, will reconnect");
                                logged_broken_pipe = true;
                            }
                            reader.abort();
                            break;
                        }
                    }
                }
            }
        }
    });

    ControlChannel { inbound_rx, outbound_tx }
}
