// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests: spawns the real
//! `manager` binary (and, via its own bootstrap, real `agent_*` binaries)
//! as subprocesses and drives them over stdin, inspecting the resulting
//! sqlite catalog.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Resolve the path to a compiled workspace binary (`manager`, `agent_gps`, ...).
pub fn workspace_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs -> tests -> workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `manager` process plus the temp directory holding its configs,
/// catalog, and capture output. Killed on drop.
pub struct ManagerProcess {
    child: Child,
    _dir: tempfile::TempDir,
    db_file: PathBuf,
    output_path: PathBuf,
}

/// Minimal single-agent fixture: only GPS enabled, in simulator mode, with
/// tight split thresholds so a smoke test doesn't need to wait minutes.
pub struct ManagerFixture {
    pub splitting_distance: f64,
    pub splitting_time: f64,
    pub pause_speed: f64,
    pub resume_speed: f64,
}

impl Default for ManagerFixture {
    fn default() -> Self {
        Self { splitting_distance: 1_000_000.0, splitting_time: 2.0, pause_speed: 0.5, resume_speed: 1.0 }
    }
}

impl ManagerProcess {
    pub fn start(fixture: ManagerFixture) -> anyhow::Result<Self> {
        let binary = workspace_binary("manager");
        anyhow::ensure!(binary.exists(), "manager binary not found at {}", binary.display());
        anyhow::ensure!(
            workspace_binary("agent_gps").exists(),
            "agent_gps binary not found; build the workspace first"
        );

        let dir = tempfile::tempdir()?;
        let output_path = dir.path().join("capture");
        let db_file = dir.path().join("catalog.db");

        let manager_cfg = serde_json::json!({
            "use_agents": {
                "os1_lidar": false, "os1_imu": false, "gps": true, "camera": false,
                "imu": false, "atmega": false, "inet": false, "data_copy": false
            },
            "capture": {
                "output_path": output_path.to_string_lossy(),
                "splitting_distance": fixture.splitting_distance,
                "splitting_time": fixture.splitting_time,
                "pause_speed": fixture.pause_speed,
                "resume_speed": fixture.resume_speed
            },
            "sqlite": { "db_file": db_file.to_string_lossy() },
            "default_sys_id": "042",
            "shutdown_drain_ms": 200
        });
        let manager_cfg_path = dir.path().join("manager.json");
        std::fs::write(&manager_cfg_path, manager_cfg.to_string())?;

        let agents_cfg = serde_json::json!({
            "agent_gps": {
                "local_port": free_port()?,
                "manager_port": free_port()?,
                "hw_connection_retries": 1,
                "simulate": true
            }
        });
        let agents_cfg_path = dir.path().join("agents.json");
        std::fs::write(&agents_cfg_path, agents_cfg.to_string())?;

        let child = Command::new(&binary)
            .arg(&manager_cfg_path)
            .arg(&agents_cfg_path)
            .current_dir(dir.path())
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, _dir: dir, db_file, output_path })
    }

    /// Send one keyboard command line (`"s"`, `"f"`, `"q"`) to the manager's stdin.
    pub fn send_key(&mut self, key: &str) -> anyhow::Result<()> {
        let stdin = self.child.stdin.as_mut().ok_or_else(|| anyhow::anyhow!("no stdin"))?;
        writeln!(stdin, "{key}")?;
        Ok(())
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Poll the catalog's `tramos` table until `want` rows exist or `timeout` elapses.
    pub async fn wait_for_segment_rows(&self, want: usize, timeout: Duration) -> anyhow::Result<Vec<(String, i64, f64)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(conn) = rusqlite::Connection::open(&self.db_file) {
                let rows: Result<Vec<(String, i64, f64)>, _> = (|| {
                    let mut stmt = conn.prepare(
                        "SELECT num_folio, duracion, distancia FROM tramos ORDER BY num_folio",
                    )?;
                    let rows = stmt
                        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok::<_, rusqlite::Error>(rows)
                })();
                if let Ok(rows) = rows {
                    if rows.len() >= want {
                        return Ok(rows);
                    }
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("catalog never reached {want} segment row(s) within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> anyhow::Result<std::process::ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("manager did not exit within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for ManagerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
