// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Failure taxonomy for everything that can go wrong on behalf of a client.
///
/// Client-facing replies carry `success`/`failureReason` payload fields, never
/// one of these variants directly; the kind is attached to log records so the
/// operator can grep a class of failures across the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed or incomplete client message.
    Decode,
    /// Client version below the configured or per-request minimum.
    VersionTooOld,
    /// Mutating request on a read-only gateway.
    ReadOnlyRefused,
    /// Upstream request expired before an answer arrived.
    Timeout,
    /// Upstream answered with an error.
    Remote,
    /// Client socket died; full cleanup runs.
    ChannelLost,
    /// Invariant violation inside the gateway. Logged, never sent to clients.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "DECODE",
            Self::VersionTooOld => "VERSION_TOO_OLD",
            Self::ReadOnlyRefused => "READONLY_REFUSED",
            Self::Timeout => "TIMEOUT",
            Self::Remote => "REMOTE",
            Self::ChannelLost => "CHANNEL_LOST",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
