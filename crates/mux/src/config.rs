// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Multiplexer tuning knobs.

use std::time::Duration;

/// Configuration for one multiplexed connection.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Per-channel send window: the number of unacknowledged frames a sender
    /// may keep in flight before `send` suspends.
    pub send_window: usize,

    /// How often a `ping` probe is emitted.
    pub heartbeat_interval: Duration,

    /// How long to wait for a `pong` before declaring the peer dead.
    pub heartbeat_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            send_window: 32,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Which side of the connection this multiplexer plays.
///
/// Fixed at connect time; it partitions the stream-channel id space so the
/// peers allocate without collision. The initiator takes even ids, the
/// acceptor odd ids. Channel 0 is reserved for the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Acceptor,
}

impl Side {
    /// First stream-channel id this side may allocate.
    pub(crate) const fn first_stream_id(self) -> u32 {
        match self {
            Self::Initiator => 2,
            Self::Acceptor => 1,
        }
    }

    /// Whether `id` belongs to the peer's half of the id space.
    pub(crate) const fn is_remote_id(self, id: u32) -> bool {
        match self {
            Self::Initiator => id % 2 == 1,
            Self::Acceptor => id % 2 == 0 && id != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_space_is_partitioned() {
        assert_eq!(Side::Initiator.first_stream_id(), 2);
        assert_eq!(Side::Acceptor.first_stream_id(), 1);
        assert!(Side::Initiator.is_remote_id(1));
        assert!(!Side::Initiator.is_remote_id(2));
        assert!(Side::Acceptor.is_remote_id(2));
        assert!(!Side::Acceptor.is_remote_id(1));
        // The control channel belongs to neither allocation half.
        assert!(!Side::Acceptor.is_remote_id(0));
        assert!(!Side::Initiator.is_remote_id(0));
    }
}
