// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Result envelopes and their translation into transport-facing shapes
//!
//! Handlers answer every call with a [`ResultEnvelope`]: a raw status plus an
//! optional payload. The functions here turn an envelope into what the
//! transport expects for a given kind of operation, and normalize handler
//! contract violations to `-EIO` instead of passing them on.

use tracing::warn;

use crate::error::Errno;
use crate::types::DirEntry;

/// Outcome of one handler invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultEnvelope<P> {
    status: i32,
    payload: Option<P>,
}

impl<P> ResultEnvelope<P> {
    /// Success carrying a payload
    pub fn ok(payload: P) -> Self {
        Self {
            status: 0,
            payload: Some(payload),
        }
    }

    /// Success without payload
    pub fn success() -> Self {
        Self {
            status: 0,
            payload: None,
        }
    }

    pub fn error(errno: Errno) -> Self {
        Self {
            status: errno.status(),
            payload: None,
        }
    }

    /// Raw status as a handler reported it; validated later by the codec
    pub fn from_status(status: i32) -> Self {
        Self {
            status,
            payload: None,
        }
    }

    pub fn with_payload(status: i32, payload: P) -> Self {
        Self {
            status,
            payload: Some(payload),
        }
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.status >= 0
    }

    pub fn into_parts(self) -> (i32, Option<P>) {
        (self.status, self.payload)
    }
}

impl ResultEnvelope<()> {
    /// Byte-transfer success: `n` bytes moved
    pub fn count(n: usize) -> Self {
        Self {
            status: i32::try_from(n).unwrap_or(i32::MAX),
            payload: None,
        }
    }
}

impl<P> From<Result<P, Errno>> for ResultEnvelope<P> {
    fn from(result: Result<P, Errno>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(errno) => Self::error(errno),
        }
    }
}

fn violation(op: &'static str, status: i32, reason: &str) -> i32 {
    warn!(
        target: "fusegate::codec",
        op,
        status,
        reason,
        "handler contract violation; reporting EIO"
    );
    Errno::EIO.status()
}

/// Status-only operations: zero or a negative errno
pub fn status<P>(op: &'static str, envelope: ResultEnvelope<P>) -> i32 {
    match envelope.status {
        s if s <= 0 => s,
        s => violation(op, s, "positive status for a status-only call"),
    }
}

/// Operations whose payload is mandatory on success (attributes, entries).
/// `out` is written only when the status is zero.
pub fn fill<P>(op: &'static str, envelope: ResultEnvelope<P>, out: &mut P) -> i32 {
    match envelope.into_parts() {
        (0, Some(payload)) => {
            *out = payload;
            0
        }
        (0, None) => violation(op, 0, "success without payload"),
        (s, _) if s < 0 => s,
        (s, _) => violation(op, s, "positive status for an attribute call"),
    }
}

/// Operations whose payload may be omitted on success (open, opendir).
/// A missing payload leaves `out` at its default.
pub fn fill_optional<P: Default>(op: &'static str, envelope: ResultEnvelope<P>, out: &mut P) -> i32 {
    match envelope.into_parts() {
        (0, payload) => {
            *out = payload.unwrap_or_default();
            0
        }
        (s, _) if s < 0 => s,
        (s, _) => violation(op, s, "positive status for an open call"),
    }
}

/// Read: copy exactly the reported number of bytes into `out`.
///
/// `out.len()` is the requested length `L`; a reported count above `L`, or
/// above what the handler actually handed back, is a contract violation.
pub fn read_into(op: &'static str, envelope: ResultEnvelope<Vec<u8>>, out: &mut [u8]) -> i32 {
    let (status, payload) = envelope.into_parts();
    if status < 0 {
        return status;
    }
    let count = status as usize;
    if count > out.len() {
        return violation(op, status, "byte count exceeds requested length");
    }
    if count == 0 {
        return 0;
    }
    match payload {
        Some(data) if data.len() >= count => {
            out[..count].copy_from_slice(&data[..count]);
            status
        }
        _ => violation(op, status, "byte count exceeds returned buffer"),
    }
}

/// Write: the reported count must not exceed the declared payload length
pub fn written<P>(op: &'static str, envelope: ResultEnvelope<P>, requested: usize) -> i32 {
    match envelope.status {
        s if s < 0 => s,
        s if s as usize > requested => violation(op, s, "byte count exceeds payload length"),
        s => s,
    }
}

/// Directory listings: hand entries to `filler` in the order received.
/// `filler` returns `true` once the transport buffer is full.
pub fn entries(
    op: &'static str,
    envelope: ResultEnvelope<Vec<DirEntry>>,
    filler: &mut dyn FnMut(&DirEntry) -> bool,
) -> i32 {
    match envelope.into_parts() {
        (0, listing) => {
            for entry in listing.iter().flatten() {
                if filler(entry) {
                    break;
                }
            }
            0
        }
        (s, _) if s < 0 => s,
        (s, _) => violation(op, s, "positive status for a listing"),
    }
}
