// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wire schema for supervisor <-> camera worker IPC.
//!
//! Messages are newline-delimited JSON records sent over the worker
//! process's inherited pipes: one pipe carries [`Heartbeat`]s from worker to
//! supervisor, the other carries [`Command`]s from supervisor to worker.
//! Any malformed line is logged and dropped rather than killing the
//! connection.

use std::collections::BTreeMap;
use std::io::BufRead;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Capturing,
    Recording,
    RecordingFailed,
    Error,
}

/// A worker's periodic proof of liveness, sent every 5 s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub schema_version: String,
    pub worker_id: String,
    pub timestamp: String,
    pub stream_state: StreamState,
    pub fps: f64,
    pub recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Heartbeat {
    pub fn new(worker_id: impl Into<String>, now: jiff::Timestamp) -> Self {
        Heartbeat {
            schema_version: SCHEMA_VERSION.to_owned(),
            worker_id: worker_id.into(),
            timestamp: now.to_string(),
            stream_state: StreamState::Idle,
            fps: 0.0,
            recording: false,
            error_message: None,
        }
    }

    /// `true` for errors serious enough to move a worker Running -> Unhealthy;
    /// see the supervisor's monitor loop.
    pub fn is_critical_error(&self) -> bool {
        match &self.error_message {
            Some(m) => {
                m.contains("Max connection failures") || m.contains("No valid camera URL")
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    Stop,
    StartRecording,
    StopRecording,
    PtzMove,
}

/// A request sent from the supervisor to a single worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub schema_version: String,
    pub command: CommandName,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl Command {
    pub fn new(command: CommandName) -> Self {
        Command {
            schema_version: SCHEMA_VERSION.to_owned(),
            command,
            params: BTreeMap::new(),
        }
    }
}

/// Serializes `msg` as one newline-delimited JSON line and writes it to `w`.
pub fn write_line<W: std::io::Write, T: Serialize>(w: &mut W, msg: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    w.write_all(&line)
}

/// Reads and parses the next newline-delimited JSON record from `r`, if any.
///
/// A line that isn't valid JSON, or doesn't match `T`'s schema, is logged and
/// skipped (the reader keeps advancing) rather than treated as fatal.
pub fn read_line<R: BufRead, T: serde::de::DeserializeOwned>(
    r: &mut R,
) -> std::io::Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = r.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(msg) => return Ok(Some(msg)),
            Err(e) => {
                warn!(%e, line = %trimmed, "dropping malformed IPC message");
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips() {
        let hb = Heartbeat::new("cam1", jiff::Timestamp::UNIX_EPOCH);
        let mut buf = Vec::new();
        write_line(&mut buf, &hb).unwrap();
        assert!(buf.ends_with(b"\n"));
        let mut cursor = std::io::Cursor::new(buf);
        let parsed: Heartbeat = read_line(&mut cursor).unwrap().unwrap();
        assert_eq!(parsed.worker_id, "cam1");
        assert_eq!(parsed.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn critical_error_classification() {
        let mut hb = Heartbeat::new("cam1", jiff::Timestamp::UNIX_EPOCH);
        hb.error_message = Some("Max connection failures exceeded".to_owned());
        assert!(hb.is_critical_error());
        hb.error_message = Some("transient read timeout".to_owned());
        assert!(!hb.is_critical_error());
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"not json at all\n");
        let hb = Heartbeat::new("cam1", jiff::Timestamp::UNIX_EPOCH);
        write_line(&mut buf, &hb).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let parsed: Heartbeat = read_line(&mut cursor).unwrap().unwrap();
        assert_eq!(parsed.worker_id, "cam1");
    }

    #[test]
    fn command_defaults_to_empty_params() {
        let cmd = Command::new(CommandName::Stop);
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: Command = serde_json::from_str(&json).unwrap();
        assert!(parsed.params.is_empty());
        assert_eq!(parsed.command, CommandName::Stop);
    }
}
