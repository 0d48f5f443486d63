//! Bolt protocol versions and the handshake's version proposals.

use std::fmt;

/// Bolt magic preamble bytes.
pub const BOLT_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// The "no version" reply sent when negotiation fails.
pub const NO_VERSION: [u8; 4] = [0, 0, 0, 0];

/// A negotiated Bolt protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const V4_4: Self = Self::new(4, 4);
    pub const V5_0: Self = Self::new(5, 0);
    pub const V5_1: Self = Self::new(5, 1);
    pub const V5_4: Self = Self::new(5, 4);

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Authentication moved from HELLO into LOGON in 5.1.
    pub fn has_logon(self) -> bool {
        self >= Self::V5_1
    }

    /// Graph entities carry string element ids from 5.0.
    pub fn has_element_ids(self) -> bool {
        self >= Self::V5_0
    }

    /// Encodes the version as the server's 4-byte handshake reply.
    pub fn to_reply(self) -> [u8; 4] {
        [0, 0, self.minor, self.major]
    }

    /// Parses the server's reply; all zeroes means "none of your proposals".
    pub fn from_reply(reply: [u8; 4]) -> Option<Self> {
        match reply {
            NO_VERSION => None,
            [_, _, minor, major] => Some(Self::new(major, minor)),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Versions this client speaks, highest first.
pub const SUPPORTED_VERSIONS: [ProtocolVersion; 6] = [
    ProtocolVersion::new(5, 4),
    ProtocolVersion::new(5, 3),
    ProtocolVersion::new(5, 2),
    ProtocolVersion::new(5, 1),
    ProtocolVersion::new(5, 0),
    ProtocolVersion::new(4, 4),
];

/// The 16 bytes of proposals sent after the magic preamble.
///
/// Each 4-byte slot is `[0, range, minor, major]`, where `range` is how many
/// minor versions below `minor` are also accepted.
pub fn client_proposals() -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..4].copy_from_slice(&[0, 4, 4, 5]); // 5.4 down to 5.0
    out[4..8].copy_from_slice(&[0, 0, 4, 4]);
    out
}

/// Picks the first proposal slot that matches one of `supported`, preferring
/// the highest supported version inside that slot's range.
pub fn negotiate_version(
    proposals: &[u8; 16],
    supported: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    for slot in proposals.chunks_exact(4) {
        let range = slot[1];
        let minor = slot[2];
        let major = slot[3];

        if major == 0 && minor == 0 {
            continue;
        }

        let lowest = minor.saturating_sub(range);
        let best = supported
            .iter()
            .filter(|v| v.major == major && v.minor <= minor && v.minor >= lowest)
            .max();
        if let Some(v) = best {
            return Some(*v);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_proposals_cover_supported_versions() {
        let proposals = client_proposals();
        for v in SUPPORTED_VERSIONS {
            assert_eq!(negotiate_version(&proposals, &[v]), Some(v), "{v}");
        }
        assert_eq!(
            negotiate_version(&proposals, &[ProtocolVersion::new(4, 3)]),
            None
        );
    }

    #[test]
    fn highest_in_range_wins() {
        let proposals = client_proposals();
        let server = [ProtocolVersion::new(5, 2), ProtocolVersion::V4_4];
        assert_eq!(
            negotiate_version(&proposals, &server),
            Some(ProtocolVersion::new(5, 2))
        );
    }

    #[test]
    fn later_slot_used_when_first_misses() {
        let proposals = client_proposals();
        assert_eq!(
            negotiate_version(&proposals, &[ProtocolVersion::V4_4]),
            Some(ProtocolVersion::V4_4)
        );
    }

    #[test]
    fn reply_encoding() {
        assert_eq!(ProtocolVersion::V5_4.to_reply(), [0, 0, 4, 5]);
        assert_eq!(
            ProtocolVersion::from_reply([0, 0, 4, 5]),
            Some(ProtocolVersion::V5_4)
        );
        assert_eq!(ProtocolVersion::from_reply(NO_VERSION), None);
    }

    #[test]
    fn feature_gates() {
        assert!(!ProtocolVersion::V5_0.has_logon());
        assert!(ProtocolVersion::V5_1.has_logon());
        assert!(!ProtocolVersion::V4_4.has_element_ids());
        assert_eq!(ProtocolVersion::V4_4.to_string(), "4.4");
    }
}
