// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The two sources of [`UserCommand`]s, merged onto one channel (spec.md §9
//! "user command queue"): a stdin line reader and a bridge from the panel
//! agent's button presses. Grounded on `original_source/manager.py`'s
//! `get_keyboard_input`/`get_buttons`.

use fraicap_common::protocol::{DataPayload, Message, SysState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::UserCommand;
use crate::proxy::AgentProxy;

const SINGLE_BUTTON: &str = "bSingleButton";

/// Read one-character commands from stdin: `s` toggles the capture session,
/// `f` force-starts it, `q` requests shutdown and ends the task.
pub fn spawn_keyboard(
    user_cmd_tx: mpsc::UnboundedSender<UserCommand>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return,
                line = lines.next_line() => line,
            };
            let Ok(Some(line)) = line else { return };
            let Some(key) = line.trim().chars().next() else { continue };
            let cmd = match key {
                's' => UserCommand::ToggleSession,
                'f' => UserCommand::ForceStart,
                'q' => {
                    let _ = user_cmd_tx.send(UserCommand::Quit);
                    return;
                }
                _ => continue,
            };
            if user_cmd_tx.send(cmd).is_err() {
                return;
            }
        }
    })
}

/// Bridge the ATMEGA proxy's data stream: a `bSingleButton` press toggles
/// the capture session, mirroring the keyboard's `s` key.
pub fn spawn_button_bridge(
    mut atmega_data_rx: mpsc::UnboundedReceiver<DataPayload>,
    user_cmd_tx: mpsc::UnboundedSender<UserCommand>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => return,
                payload = atmega_data_rx.recv() => payload,
            };
            let Some(payload) = payload else { return };
            if let DataPayload::Button(button) = payload {
                if button == SINGLE_BUTTON {
                    tracing::debug!("button pressed, toggling capture session");
                    if user_cmd_tx.send(UserCommand::ToggleSession).is_err() {
                        return;
                    }
                }
            }
        }
    })
}

/// Forward the data-copy agent's EXT_DRIVE_* announcements on to the panel
/// agent (`original_source/manager.py`'s `check_data_copy`).
pub fn spawn_data_copy_bridge(
    mut data_copy_sys_state_rx: mpsc::UnboundedReceiver<SysState>,
    atmega: AgentProxy,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let state = tokio::select! {
                _ = shutdown.cancelled() => return,
                state = data_copy_sys_state_rx.recv() => state,
            };
            let Some(state) = state else { return };
            atmega.send(Message::SysState(state));
        }
    })
}
