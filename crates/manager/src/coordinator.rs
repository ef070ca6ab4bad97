// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The capture coordinator's finite state machine (spec.md §4.4), grounded
//! on `original_source/manager.py`'s `run`/`new_segment`/
//! `update_segment_record`/`change_state`. Polls its inputs on a fixed
//! cadence and applies at most one state transition per tick, in the order
//! user command, segment-ended, motion edge (spec.md §5).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fraicap_common::config::CaptureConfig;
use fraicap_common::protocol::{DataPayload, Message, SysState};
use fraicap_common::types::{
    date_label, new_folio, segment_relative_dir, session_label, Coordinates, Device, Segment,
    SegmentStatus,
};
use fraicap_common::Catalog;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::AgentSet;
use crate::segmentation::{SegmentationConfig, SegmentationEngine};

/// How often the coordinator polls its queues and re-evaluates timeouts
/// (`original_source/manager.py`'s `check_spacetime` polls every 0.01 s).
const POLL_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Starting,
    StandBy,
    Capturing,
    WaitingSpeed,
}

/// Keyboard/button-originated commands, merged onto one channel (spec.md
/// §9 "user command queue").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    ToggleSession,
    ForceStart,
    Quit,
}

pub struct Coordinator {
    state: CoordinatorState,
    agents: AgentSet,
    catalog: Arc<Catalog>,
    capture_cfg: CaptureConfig,
    sys_id: String,
    segmentation: SegmentationEngine,
    coordinates: Coordinates,
    segment_coords_ini: Coordinates,
    session: Option<String>,
    segment_no: u32,
    folio: String,
    capture_dir: PathBuf,
    user_cmd_rx: mpsc::UnboundedReceiver<UserCommand>,
    gps_rx: mpsc::UnboundedReceiver<DataPayload>,
    shutdown: CancellationToken,
    shutdown_drain: Duration,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: AgentSet,
        catalog: Arc<Catalog>,
        capture_cfg: CaptureConfig,
        sys_id: String,
        user_cmd_rx: mpsc::UnboundedReceiver<UserCommand>,
        gps_rx: mpsc::UnboundedReceiver<DataPayload>,
        shutdown: CancellationToken,
        shutdown_drain: Duration,
    ) -> Self {
        let segmentation = SegmentationEngine::new(SegmentationConfig::from(&capture_cfg), Instant::now());
        Self {
            state: CoordinatorState::Starting,
            agents,
            catalog,
            capture_cfg,
            sys_id,
            segmentation,
            coordinates: Coordinates::default(),
            segment_coords_ini: Coordinates::default(),
            session: None,
            segment_no: 0,
            folio: String::new(),
            capture_dir: PathBuf::new(),
            user_cmd_rx,
            gps_rx,
            shutdown,
            shutdown_drain,
        }
    }

    /// Drive the coordinator until a `UserCommand::Quit` or external
    /// shutdown, starting from STAND_BY (spec.md §4.4: the coordinator only
    /// reaches STAND_BY once critical agents are ready, which the caller has
    /// already confirmed via [`AgentSet::critical_agents_ready`]).
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.change_state(CoordinatorState::StandBy);

        let mut ticker = tokio::time::interval(POLL_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.poll_once(Instant::now()) {
                        break;
                    }
                }
            }
        }

        tracing::info!("coordinator loop exited, ending capture and agents");
        self.end_capture();
        self.agents.send_all_enabled(Message::Quit);
        tokio::time::sleep(self.shutdown_drain).await;
        self.agents.kill_children().await;
        Ok(())
    }

    /// One 10ms tick: drain pending user commands and GPS fixes, then apply
    /// at most one transition. Returns `true` if the coordinator should
    /// stop running.
    fn poll_once(&mut self, now: Instant) -> bool {
        while let Ok(cmd) = self.user_cmd_rx.try_recv() {
            if self.handle_command(cmd, now) {
                return true;
            }
        }

        let mut segment_ended = false;
        if self.state == CoordinatorState::Capturing && self.segmentation.check_timeout(now) {
            segment_ended = true;
        }
        while let Ok(payload) = self.gps_rx.try_recv() {
            if let DataPayload::GpsFix(fix) = payload {
                self.coordinates = Coordinates {
                    lat: fix.latitude,
                    lon: fix.longitude,
                    speed_mps: fix.spd_over_grnd,
                    distance_delta_m: fix.distance_delta,
                    fix_quality: fix.gps_qual,
                    num_satellites: fix.num_sats,
                };
                if self.segmentation.observe_fix(fix.distance_delta, fix.spd_over_grnd) {
                    segment_ended = true;
                }
            }
        }

        if segment_ended {
            if self.state == CoordinatorState::Capturing {
                self.update_segment_record(now);
                self.new_segment(now);
            }
            return false;
        }

        if self.segmentation.vehicle_moving() {
            if self.state == CoordinatorState::WaitingSpeed {
                tracing::info!("vehicle moving, starting/resuming capture");
                self.new_segment(now);
                self.agents.send_all_enabled(Message::StartCapture);
                self.change_state(CoordinatorState::Capturing);
            }
        } else if self.state == CoordinatorState::Capturing {
            tracing::info!("vehicle stopped, pausing capture until it moves again");
            self.end_capture();
            self.change_state(CoordinatorState::WaitingSpeed);
        }

        false
    }

    /// Returns `true` if this command ends the run loop.
    fn handle_command(&mut self, cmd: UserCommand, now: Instant) -> bool {
        match cmd {
            UserCommand::Quit => return true,
            UserCommand::ToggleSession => match self.state {
                CoordinatorState::Capturing => {
                    tracing::info!("capture session ended by user");
                    self.update_segment_record(now);
                    self.end_capture();
                    self.change_state(CoordinatorState::StandBy);
                }
                CoordinatorState::WaitingSpeed => {
                    tracing::info!("capture session ended by user");
                    self.end_capture();
                    self.change_state(CoordinatorState::StandBy);
                }
                CoordinatorState::StandBy => {
                    tracing::info!("capture session started by user, waiting for vehicle motion");
                    self.new_session();
                    self.change_state(CoordinatorState::WaitingSpeed);
                }
                CoordinatorState::Starting => {}
            },
            UserCommand::ForceStart => {
                if self.state == CoordinatorState::StandBy {
                    tracing::info!("capture session force-started by user");
                    self.segmentation.force_moving();
                    self.new_session();
                    self.new_segment(now);
                    self.agents.send_all_enabled(Message::StartCapture);
                    self.change_state(CoordinatorState::Capturing);
                }
            }
        }
        false
    }

    fn new_session(&mut self) {
        let local_now = chrono::Local::now();
        self.session = Some(session_label(local_now));
        self.segment_no = 0;
        tracing::info!(session = ?self.session, "new capture session");
    }

    /// spec.md §4.4 step 2: snapshot start coordinates, reset the
    /// accumulator, allocate a folio, create the segment directory, and
    /// broadcast NEW_CAPTURE to every enabled agent.
    fn new_segment(&mut self, now: Instant) {
        self.segment_coords_ini = self.coordinates;
        self.segmentation.begin_segment(now);
        let local_now = chrono::Local::now();
        self.folio = new_folio(&self.sys_id, local_now);
        self.segment_no += 1;

        let session = self.session.clone().unwrap_or_else(|| session_label(local_now));
        let rel_dir = segment_relative_dir(&self.sys_id, &date_label(local_now), &session, self.segment_no);
        self.capture_dir = PathBuf::from(&self.capture_cfg.output_path).join(&rel_dir);
        if let Err(e) = std::fs::create_dir_all(&self.capture_dir) {
            tracing::error!(dir = %self.capture_dir.display(), error = %e, "failed to create segment directory");
        }

        tracing::info!(session = %session, segment = self.segment_no, folio = %self.folio, "new segment");
        self.agents.send_all_enabled(Message::NewCapture(self.capture_dir.clone()));
    }

    /// spec.md §4.4 "Segment finalization": persist the just-finished
    /// segment's duration/distance/coordinates before `new_segment` resets
    /// the accumulators.
    fn update_segment_record(&mut self, now: Instant) {
        if self.folio.is_empty() {
            return;
        }
        let duration_s = self.segmentation.elapsed_since_init(now).as_secs() as i64;
        let distance_m = self.segmentation.distance_accum_m();
        let segment = Segment {
            folio: self.folio.clone(),
            directory: self.capture_dir.display().to_string(),
            init_timestamp: chrono::Utc::now().timestamp(),
            duration_s,
            distance_m,
            start: self.segment_coords_ini,
            end: self.coordinates,
            status: SegmentStatus::CapOk,
            copy_status: None,
        };
        tracing::debug!(folio = %segment.folio, duration_s, distance_m, "finalizing segment record");
        if let Err(e) = self.catalog.save_capture(chrono::Utc::now().timestamp(), &segment) {
            tracing::error!(folio = %segment.folio, error = %e, "failed to persist segment record");
        }
    }

    fn end_capture(&mut self) {
        self.agents.send_all_enabled(Message::EndCapture);
    }

    /// spec.md §4.4 "change_state": broadcasts the matching CAPTURE_ON /
    /// CAPTURE_PAUSED / CAPTURE_OFF to the panel agent.
    fn change_state(&mut self, state: CoordinatorState) {
        self.state = state;
        let sys_state = match state {
            CoordinatorState::Capturing => SysState::CaptureOn,
            CoordinatorState::WaitingSpeed => SysState::CapturePaused,
            CoordinatorState::Starting | CoordinatorState::StandBy => SysState::CaptureOff,
        };
        if let Some(atmega) = self.agents.get(Device::Atmega) {
            atmega.send(Message::SysState(sys_state));
        }
    }
}
