use std::fmt;
use std::io;

use super::codec::CodecError;
use super::relay::Phase;

/// Which connection of a session something happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Downstream,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Downstream => f.write_str("downstream"),
            Side::Upstream => f.write_str("uplink"),
        }
    }
}

/// Errors that end a relay session.
///
/// Non-fatal trouble (malformed lines, idx that cannot be multiplexed or
/// decoded) never surfaces here; it is logged where it is found.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("cannot reach uplink {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("uplink refused the link during {phase}: {reason}")]
    AuthRejected { phase: Phase, reason: String },

    #[error("unexpected line from {side} during {phase}: {line:?}")]
    Protocol {
        side: Side,
        phase: Phase,
        line: String,
    },

    #[error("{side} closed the connection during {phase}")]
    PeerClosed { side: Side, phase: Phase },

    #[error("{side} transport failed during {phase}: {source}")]
    Transport {
        side: Side,
        phase: Phase,
        #[source]
        source: CodecError,
    },

    #[error("uplink TLS setup failed: {0}")]
    Tls(String),
}
