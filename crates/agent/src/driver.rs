// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The five hooks plus `run_data_threads`/`finalize` every device module
//! implements, one-for-one with `original_source/agents/abstract_agent.py`'s
//! `AbstractHWAgent` abstract methods.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use fraicap_common::protocol::Message;
use fraicap_common::types::{Device, HwStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::writer::SampleQueue;

/// Everything a device-specific agent module must provide. [`crate::runtime::AgentRuntime`]
/// owns one instance exclusively and calls its methods from a single task
/// (the main supervisor), so no internal locking is required here.
pub trait DeviceDriver: Send + 'static {
    /// The well-known device this driver implements.
    fn device(&self) -> Device;

    /// Open the underlying hardware resource (serial port, UDP socket, ...).
    fn connect_hw(&mut self) -> anyhow::Result<()>;

    /// Release the hardware resource. Called before a reconnection attempt
    /// and during shutdown.
    fn disconnect_hw(&mut self);

    /// Polled roughly once a second by the watchdog task.
    fn check_hw_connected(&mut self) -> HwStatus;

    /// Handle a control message the runtime layer doesn't already consume
    /// (spec.md §4.2's "(anything else) → delegated to device-specific
    /// handler"). Return a reply to send back, if any.
    fn process_manager_message(&mut self, msg: &Message) -> Option<Message>;

    /// Run between END_CAPTURE and NEW_CAPTURE, before the new file header is
    /// written. Intended for per-segment statistics (lost-packet %, etc.).
    fn pre_capture_file_update(&mut self) {}

    /// Bytes written at the start of every new segment file for text agents.
    /// `None` for binary agents (no header).
    fn file_header(&self) -> Option<Vec<u8>> {
        None
    }

    /// Start the device-specific acquisition task(s). Samples are pushed as
    /// already-formatted record bytes (CR/LF-terminated for text agents, raw
    /// for binary agents) into `samples`. `capturing` reflects the runtime's
    /// current capture flag so the driver can skip formatting work while
    /// STAND_BY. `outbound` lets device drivers emit their own DATA messages
    /// (GPS fixes, button presses) independent of the sample file stream.
    fn spawn_acquisition(
        &mut self,
        samples: SampleQueue,
        outbound: mpsc::UnboundedSender<Message>,
        capturing: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()>;

    /// Flush any device-side buffers and release resources. Called once,
    /// during shutdown, after the acquisition task has been cancelled.
    fn finalize(&mut self) {
        self.disconnect_hw();
    }
}
