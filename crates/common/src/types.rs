// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core domain types shared by the manager and every agent: status enums,
//! coordinates, sessions, and segments (spec.md §3).

use serde::{Deserialize, Serialize};

/// Lifecycle status of an agent process, as observed by its own runtime and
/// mirrored to the manager via `AGENT_STATE` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Starting,
    StandBy,
    Capturing,
    NotResponding,
}

impl AgentStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::StandBy | Self::Capturing)
    }
}

/// Hardware health as observed by an agent's device-specific health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HwStatus {
    Nominal,
    Warning,
    Error,
    NotConnected,
}

impl HwStatus {
    /// Worst-of ordering used to aggregate per-device health into a single
    /// system indicator (spec.md glossary: "System status").
    pub fn worse_of(self, other: Self) -> Self {
        fn rank(s: HwStatus) -> u8 {
            match s {
                HwStatus::Nominal => 0,
                HwStatus::Warning => 1,
                HwStatus::Error => 2,
                HwStatus::NotConnected => 3,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

/// A named well-known device, used for per-device health reporting to the
/// panel agent (`original_source/agents/agent_atmega.py` LED-per-device map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, std::hash::Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Os1Lidar,
    Os1Imu,
    Imu,
    Gps,
    Camera,
    Atmega,
    Inet,
    DataCopy,
}

impl Device {
    pub const ALL: [Device; 8] = [
        Device::Os1Lidar,
        Device::Os1Imu,
        Device::Imu,
        Device::Gps,
        Device::Camera,
        Device::Atmega,
        Device::Inet,
        Device::DataCopy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Device::Os1Lidar => "os1_lidar",
            Device::Os1Imu => "os1_imu",
            Device::Imu => "imu",
            Device::Gps => "gps",
            Device::Camera => "camera",
            Device::Atmega => "atmega",
            Device::Inet => "inet",
            Device::DataCopy => "data_copy",
        }
    }
}

/// WGS-84 fix snapshot plus the derived quantities the segmentation engine
/// and catalog need (spec.md §3 "Coordinates").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
    pub speed_mps: f64,
    pub distance_delta_m: f64,
    pub fix_quality: u8,
    pub num_satellites: u8,
}

/// A single GPS fix as broadcast over the control channel (`DATA` message
/// payload for the GPS agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub sys_timestamp: i64,
    pub distance_delta: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: String,
    pub spd_over_grnd: f64,
    pub true_course: f64,
    pub gps_qual: u8,
    pub num_sats: u8,
    pub horizontal_dil: f64,
}

/// Status of a segment row in the catalog (`tramos.estado`, spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Capturing = 0,
    CapFailed = -1,
    CapOk = 1,
}

impl SegmentStatus {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

/// Copy status of a segment row (`tramos.copiado`, spec.md §3 "Copy worklist entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyStatus {
    NotCopied = 0,
    CopiedOk = 1,
}

impl CopyStatus {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

/// One durable capture unit (spec.md §3 "Segment").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub folio: String,
    pub directory: String,
    pub init_timestamp: i64,
    pub duration_s: i64,
    pub distance_m: f64,
    pub start: Coordinates,
    pub end: Coordinates,
    pub status: SegmentStatus,
    pub copy_status: Option<CopyStatus>,
}

/// An operator-initiated recording interval (spec.md §3 "Session").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// A (directory, folio) pair pending replication (spec.md §3 "Copy worklist entry").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyWorklistEntry {
    pub directory: String,
    pub folio: String,
}

/// Globally unique segment identifier: `A{sysId}-{yyMMddHHmmss}`.
pub fn new_folio(sys_id: &str, now: chrono::DateTime<chrono::Local>) -> String {
    format!("A{sys_id}-{}", now.format("%y%m%d%H%M%S"))
}

/// `hh.mm.ss` session label (spec.md §3).
pub fn session_label(now: chrono::DateTime<chrono::Local>) -> String {
    now.format("%H.%M.%S").to_string()
}

/// `yyyy.mm.dd` date component of the segment directory path.
pub fn date_label(now: chrono::DateTime<chrono::Local>) -> String {
    now.format("%Y.%m.%d").to_string()
}

/// Relative segment directory: `{sysId}/{yyyy.mm.dd}/{session}/{NNNN}`.
pub fn segment_relative_dir(
    sys_id: &str,
    date: &str,
    session: &str,
    segment_no: u32,
) -> std::path::PathBuf {
    std::path::PathBuf::from(sys_id)
        .join(date)
        .join(session)
        .join(format!("{segment_no:04}"))
}

/// Geodesic (WGS-84 inverse) distance in metres between two fixes, used by
/// the GPS driver to compute `distance_delta` (spec.md §4.5 "Numeric semantics").
pub fn geodesic_distance_m(from: (f64, f64), to: (f64, f64)) -> f64 {
    use geo::{GeodesicDistance, Point};
    let p1 = Point::new(from.1, from.0);
    let p2 = Point::new(to.1, to.0);
    p1.geodesic_distance(&p2)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn hw_status_worse_of_picks_highest_severity() {
        assert_eq!(HwStatus::Nominal.worse_of(HwStatus::Error), HwStatus::Error);
        assert_eq!(HwStatus::Warning.worse_of(HwStatus::Nominal), HwStatus::Warning);
        assert_eq!(HwStatus::NotConnected.worse_of(HwStatus::Error), HwStatus::NotConnected);
    }

    #[test]
    fn folio_format_matches_spec() {
        use chrono::TimeZone;
        let ts = chrono::Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(new_folio("001", ts), "A001-260304050607");
    }

    #[test]
    fn relative_dir_zero_pads_segment_number() {
        let dir = segment_relative_dir("001", "2026.03.04", "05.06.07", 3);
        assert_eq!(dir, std::path::PathBuf::from("001/2026.03.04/05.06.07/0003"));
    }

    #[test]
    fn geodesic_distance_is_zero_for_identical_points() {
        assert!(geodesic_distance_m((-37.21, -73.22), (-37.21, -73.22)) < 1e-6);
    }
}
