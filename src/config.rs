// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared safety-ceiling and warning-sink configuration.
//!
//! Every layer that decodes a length-prefixed region (the block framer, the
//! checksum layer) checks the decoded length against [`Config::too_big`]
//! before allocating. A [`Config`] also carries an optional warning sink for
//! non-fatal diagnostics (unknown multiplex flag bytes, send-timeout
//! fail-closed events) and a deadline used by the multiplexer's background
//! delivery thread.

use std::io::Write;
use std::time::Duration;

/// Default safety ceiling on 64-bit hosts: 128 MiB.
pub const DEFAULT_TOO_BIG_64: usize = 128 * 1024 * 1024;
/// Default safety ceiling on 32-bit hosts: 32 MiB.
pub const DEFAULT_TOO_BIG_32: usize = 32 * 1024 * 1024;

/// Default deadline for a blocked multiplex stream send before the
/// multiplexer fails closed.
pub const DEFAULT_SEND_DEADLINE: Duration = Duration::from_secs(300);

/// Shared configuration for the framing stack.
///
/// Construct with [`Config::default`] for the spec's stated ceilings, or
/// override individual fields for tests and embedders that need tighter
/// bounds.
pub struct Config {
    /// Maximum decoded length accepted by the block framer or checksum layer.
    pub too_big: usize,
    /// Deadline for a blocked multiplex stream delivery before fail-closed.
    pub send_deadline: Duration,
    /// Optional sink for non-fatal diagnostics. Defaults to none (diagnostics
    /// go through the `log` crate instead). `Send + Sync` so a [`Config`]
    /// can be shared into the multiplexer's background dispatch thread.
    pub warnings: Option<Box<dyn Write + Send + Sync>>,
}

impl Config {
    /// A ceiling tight enough to exercise `too_big` failures in tests without
    /// allocating real megabyte-scale buffers.
    #[must_use]
    pub fn with_too_big(too_big: usize) -> Self {
        Config {
            too_big,
            ..Config::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let too_big = if cfg!(target_pointer_width = "64") {
            DEFAULT_TOO_BIG_64
        } else {
            DEFAULT_TOO_BIG_32
        };
        Config {
            too_big,
            send_deadline: DEFAULT_SEND_DEADLINE,
            warnings: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("too_big", &self.too_big)
            .field("send_deadline", &self.send_deadline)
            .field("warnings", &self.warnings.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ceiling_matches_pointer_width() {
        let cfg = Config::default();
        if cfg!(target_pointer_width = "64") {
            assert_eq!(cfg.too_big, DEFAULT_TOO_BIG_64);
        } else {
            assert_eq!(cfg.too_big, DEFAULT_TOO_BIG_32);
        }
    }

    #[test]
    fn with_too_big_overrides_only_ceiling() {
        let cfg = Config::with_too_big(1024);
        assert_eq!(cfg.too_big, 1024);
        assert_eq!(cfg.send_deadline, DEFAULT_SEND_DEADLINE);
    }
}
