// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `manager` binary (which in
//! turn spawns a real `agent_gps` child in simulator mode) and drive it over
//! stdin, asserting on the resulting sqlite catalog.

use std::time::Duration;

use fraicap_specs::{ManagerFixture, ManagerProcess};

const TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn happy_path_session_produces_a_segment() -> anyhow::Result<()> {
    let mut manager = ManagerProcess::start(ManagerFixture::default())?;

    manager.send_key("s")?;

    let rows = manager.wait_for_segment_rows(1, TIMEOUT).await?;
    assert_eq!(rows.len(), 1);
    let (folio, duration_s, _distance_m) = &rows[0];
    assert!(!folio.is_empty());
    assert!(*duration_s >= 0);

    manager.send_key("s")?;
    manager.send_key("q")?;
    manager.wait_exit(TIMEOUT).await?;

    Ok(())
}

#[tokio::test]
async fn force_start_skips_the_wait_for_motion() -> anyhow::Result<()> {
    let mut manager = ManagerProcess::start(ManagerFixture::default())?;

    manager.send_key("f")?;

    let rows = manager.wait_for_segment_rows(1, TIMEOUT).await?;
    assert_eq!(rows.len(), 1);
    assert!(manager.output_path().exists(), "segment directory should be created under the output path");

    manager.send_key("q")?;
    manager.wait_exit(TIMEOUT).await?;

    Ok(())
}

#[tokio::test]
async fn quit_command_terminates_the_process() -> anyhow::Result<()> {
    let mut manager = ManagerProcess::start(ManagerFixture::default())?;

    manager.send_key("q")?;
    let status = manager.wait_exit(TIMEOUT).await?;
    assert!(status.success());

    Ok(())
}
