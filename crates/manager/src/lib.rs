// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The FRAICAP coordinator/manager process (spec.md §4.4): spawns and
//! supervises the per-device agent processes, runs the capture state
//! machine, and owns the segment catalog.

pub mod bootstrap;
pub mod coordinator;
pub mod health;
pub mod input;
pub mod proxy;
pub mod segmentation;
