// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Unified error taxonomy shared by the manager and every agent binary.
///
/// Mirrors the error taxonomy in spec.md §7: configuration, bind-in-use,
/// hardware-connect, protocol, and catalog failures each get their own
/// variant so callers can decide which are fatal-at-startup versus
/// recoverable-in-place.
#[derive(Debug)]
pub enum FraicapError {
    Config(String),
    BindInUse(std::net::SocketAddr),
    HwConnect(String),
    Protocol(String),
    Catalog(String),
    Io(std::io::Error),
}

impl fmt::Display for FraicapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::BindInUse(addr) => write!(f, "address already in use: {addr}"),
            Self::HwConnect(msg) => write!(f, "hardware connection failed: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Catalog(msg) => write!(f, "catalog error: {msg}"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for FraicapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FraicapError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for FraicapError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for FraicapError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Catalog(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FraicapError>;
