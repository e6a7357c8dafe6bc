// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Track RTSP interleaved channel->stream assignments.

use smallvec::SmallVec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Rtp,
    Rtcp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelMapping {
    pub stream_i: usize,
    pub kind: ChannelKind,
}

/// Assignment of interleaved channel-id pairs to streams.
///
/// Channels are always assigned in even/odd pairs: the even id carries RTP,
/// its successor RTCP, for the same stream. [RFC 2326 section
/// 10.12](https://tools.ietf.org/html/rfc2326#section-10.12) says
/// `interleaved=n` also assigns channel `n+1`; servers insisting on an odd
/// `n` are rejected. The client proposes ids from a counter that only moves
/// forward, so a pair is never re-proposed within one client, even after a
/// failed `SETUP`; the server may confirm a different (even) pair, which is
/// what gets recorded.
#[derive(Debug, Default)]
pub(super) struct ChannelRegistry {
    /// `(rtp channel id, stream index)`, in assignment order. Presentations
    /// have a handful of streams, so linear scans are fine.
    assigned: SmallVec<[(u8, usize); 4]>,

    /// The next channel id to propose in a `SETUP` `Transport` header.
    /// Wider than a channel id so exhaustion is a state, not a wraparound.
    next_proposal: u16,
}

impl ChannelRegistry {
    /// Returns the channel-id pair to propose for the next TCP `SETUP` and
    /// advances past it, or errors when all 128 pairs have been consumed.
    pub fn propose(&mut self) -> Result<u8, String> {
        if self.next_proposal > u16::from(u8::MAX - 1) {
            return Err("all interleaved channel ids consumed".to_owned());
        }
        let id = self.next_proposal as u8;
        self.next_proposal += 2;
        Ok(id)
    }

    /// Records the server-confirmed channel pair for `stream_i`.
    pub fn assign(&mut self, rtp_channel_id: u8, stream_i: usize) -> Result<(), String> {
        if (rtp_channel_id & 1) != 0 {
            return Err(format!("can't assign odd channel id {rtp_channel_id}"));
        }
        if let Some(&(_, prev)) = self.assigned.iter().find(|&&(c, _)| c == rtp_channel_id) {
            return Err(format!(
                "channel id {rtp_channel_id} is already assigned to stream {prev}; \
                 won't reassign to stream {stream_i}"
            ));
        }
        self.assigned.push((rtp_channel_id, stream_i));
        // Keep future proposals clear of a server-chosen id.
        if u16::from(rtp_channel_id) >= self.next_proposal {
            self.next_proposal = u16::from(rtp_channel_id) + 2;
        }
        Ok(())
    }

    /// Looks up a channel id's mapping.
    pub fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let rtp_id = channel_id & !1;
        self.assigned
            .iter()
            .find(|&&(c, _)| c == rtp_id)
            .map(|&(_, stream_i)| ChannelMapping {
                stream_i,
                kind: if (channel_id & 1) == 0 {
                    ChannelKind::Rtp
                } else {
                    ChannelKind::Rtcp
                },
            })
    }

    /// Drops all assignments (connection teardown). Proposals keep moving
    /// forward so ids stay unique across the client's lifetime.
    pub fn clear_assignments(&mut self) {
        self.assigned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propose_advances_by_two() {
        let mut reg = ChannelRegistry::default();
        assert_eq!(reg.propose().unwrap(), 0);
        assert_eq!(reg.propose().unwrap(), 2);
        assert_eq!(reg.propose().unwrap(), 4);
    }

    #[test]
    fn assign_and_lookup() {
        let mut reg = ChannelRegistry::default();
        let c = reg.propose().unwrap();
        reg.assign(c, 42).unwrap();
        reg.assign(c, 43).unwrap_err();
        reg.assign(1, 43).unwrap_err();
        assert_eq!(
            reg.lookup(0),
            Some(ChannelMapping {
                stream_i: 42,
                kind: ChannelKind::Rtp,
            })
        );
        assert_eq!(
            reg.lookup(1),
            Some(ChannelMapping {
                stream_i: 42,
                kind: ChannelKind::Rtcp,
            })
        );
        assert_eq!(reg.lookup(2), None);
    }

    #[test]
    fn server_override_moves_proposals() {
        let mut reg = ChannelRegistry::default();
        let c = reg.propose().unwrap();
        assert_eq!(c, 0);
        // Server confirms 8-9 instead.
        reg.assign(8, 0).unwrap();
        assert_eq!(reg.propose().unwrap(), 10);
        assert_eq!(reg.lookup(9).unwrap().stream_i, 0);
        assert_eq!(reg.lookup(9).unwrap().kind, ChannelKind::Rtcp);
    }

    #[test]
    fn clear_keeps_counter() {
        let mut reg = ChannelRegistry::default();
        let c = reg.propose().unwrap();
        reg.assign(c, 0).unwrap();
        reg.clear_assignments();
        assert_eq!(reg.lookup(0), None);
        assert_eq!(reg.propose().unwrap(), 2);
    }
}
