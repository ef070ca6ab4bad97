// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! System health broadcast (spec.md §4.4 "System status"), grounded on
//! `original_source/manager.py`'s `check_hw`. Runs for the lifetime of the
//! process as a background task independent of the coordinator's FSM.

use std::time::Duration;

use fraicap_common::protocol::Message;
use fraicap_common::types::{Device, HwStatus};
use tokio_util::sync::CancellationToken;

use crate::proxy::AgentProxy;

/// Give the LiDAR (the slowest-booting sensor) time to come up before the
/// first report, so a cold boot doesn't read as a false alarm.
const STARTUP_GRACE: Duration = Duration::from_secs(25);
const POLL_PERIOD: Duration = Duration::from_secs(5);

/// Devices whose hardware health feeds the aggregate system-status LED
/// (`original_source/manager.py`'s `check_hw`; deliberately excludes ATMEGA,
/// OS1_IMU, and DATA_COPY).
const WATCHED: [Device; 5] = [Device::Os1Lidar, Device::Imu, Device::Camera, Device::Gps, Device::Inet];

/// Spawn the periodic per-device and aggregate health broadcast to the
/// panel agent. `watched` must already be filtered/ordered to match
/// [`WATCHED`]'s devices (callers build it from the coordinator's
/// [`crate::bootstrap::AgentSet`] before handing the set off to the
/// coordinator).
pub fn spawn(
    watched: Vec<(Device, AgentProxy)>,
    atmega: AgentProxy,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(STARTUP_GRACE) => {}
        }

        let mut interval = tokio::time::interval(POLL_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let mut offline = false;
            let mut error = false;
            for (device, proxy) in &watched {
                if !proxy.enabled {
                    continue;
                }
                let status = proxy.hw_status();
                atmega.send(Message::DeviceState { device: device.name().to_owned(), status });
                match status {
                    HwStatus::NotConnected => offline = true,
                    HwStatus::Error => error = true,
                    HwStatus::Nominal | HwStatus::Warning => {}
                }

                if !proxy.is_connected() {
                    tracing::warn!(agent = device.name(), "agent disconnected from manager");
                } else if status != HwStatus::Nominal {
                    tracing::warn!(agent = device.name(), ?status, "agent reports degraded hardware");
                }
            }

            let sys_state = if offline {
                fraicap_common::protocol::SysState::Offline
            } else if error {
                fraicap_common::protocol::SysState::Error
            } else {
                fraicap_common::protocol::SysState::Online
            };
            atmega.send(Message::SysState(sys_state));
        }
    })
}

/// The device set [`spawn`] expects, in no particular order.
pub fn watched_devices() -> [Device; 5] {
    WATCHED
}
