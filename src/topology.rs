//! Link discovery: the probe frames each switch emits over its ports and
//! the liveness bookkeeping for the edges they reveal.

use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

use crate::physical_switch::SwitchId;

/// The value used for infinite in the shortest-path computation. Chosen so
/// it does not overflow when added to itself but is longer than any possible
/// path in the network.
pub const INFINITE: u32 = 10_000;

/// The period over which every port of a switch gets probed once.
pub const PERIOD: Duration = Duration::from_millis(1000);

/// How long a link survives without a probe refreshing it.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_millis(3000);

/// Destination of probe frames: the bridge-local multicast address that
/// switches do not flood.
pub const PROBE_DST_MAC: [u8; 6] = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e];
pub const PROBE_SRC_MAC: [u8; 6] = [0x02, 0x4f, 0x56, 0x00, 0x00, 0x01];
pub const PROBE_ETH_TYPE: u16 = 0x88cc;

const PROBE_MAGIC: u32 = 0x4f56_5031;
const PROBE_FRAME_LENGTH: usize = 14 + 4 + 4 + 4;

/// Build a probe frame carrying the emitting switch and port.
pub fn encode_probe(switch_id: SwitchId, port_no: u32) -> Vec<u8> {
    let mut frame = vec![0u8; PROBE_FRAME_LENGTH];
    frame[..6].copy_from_slice(&PROBE_DST_MAC);
    frame[6..12].copy_from_slice(&PROBE_SRC_MAC);
    BigEndian::write_u16(&mut frame[12..14], PROBE_ETH_TYPE);
    BigEndian::write_u32(&mut frame[14..18], PROBE_MAGIC);
    BigEndian::write_u32(&mut frame[18..22], switch_id.0);
    BigEndian::write_u32(&mut frame[22..26], port_no);
    frame
}

/// The `(switch, port)` a probe frame was emitted from, or `None` when the
/// frame is not one of ours.
pub fn decode_probe(frame: &[u8]) -> Option<(SwitchId, u32)> {
    if frame.len() < PROBE_FRAME_LENGTH {
        return None;
    }
    if BigEndian::read_u16(&frame[12..14]) != PROBE_ETH_TYPE {
        return None;
    }
    if BigEndian::read_u32(&frame[14..18]) != PROBE_MAGIC {
        return None;
    }
    let switch_id = SwitchId(BigEndian::read_u32(&frame[18..22]));
    let port_no = BigEndian::read_u32(&frame[22..26]);
    Some((switch_id, port_no))
}

/// Identity of a discovered link in the hypervisor registry. The two
/// endpoint ports hold this id; the link itself holds no owning references
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// A live point-to-point edge between two physical ports.
#[derive(Debug, Clone)]
pub struct DiscoveredLink {
    pub endpoint_a: (SwitchId, u32),
    pub endpoint_b: (SwitchId, u32),
    expires_at: Instant,
}

impl DiscoveredLink {
    pub fn new(endpoint_a: (SwitchId, u32), endpoint_b: (SwitchId, u32)) -> DiscoveredLink {
        DiscoveredLink {
            endpoint_a,
            endpoint_b,
            expires_at: Instant::now() + LIVENESS_TIMEOUT,
        }
    }

    /// A fresh probe arrived; push the deadline out.
    pub fn refresh(&mut self) {
        self.expires_at = Instant::now() + LIVENESS_TIMEOUT;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Force the deadline into the past. Test hook for link-loss scenarios.
    pub fn expire_now(&mut self) {
        self.expires_at = Instant::now() - Duration::from_millis(1);
    }

    pub fn connects(&self, a: (SwitchId, u32), b: (SwitchId, u32)) -> bool {
        (self.endpoint_a == a && self.endpoint_b == b)
            || (self.endpoint_a == b && self.endpoint_b == a)
    }

    /// The far end as seen from `switch_id`.
    pub fn other_endpoint(&self, switch_id: SwitchId) -> Option<(SwitchId, u32)> {
        if self.endpoint_a.0 == switch_id {
            Some(self.endpoint_b)
        } else if self.endpoint_b.0 == switch_id {
            Some(self.endpoint_a)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_round_trip() {
        let frame = encode_probe(SwitchId(7), 42);
        assert_eq!(decode_probe(&frame), Some((SwitchId(7), 42)));
    }

    #[test]
    fn test_probe_rejects_foreign_frames() {
        assert_eq!(decode_probe(&[]), None);
        assert_eq!(decode_probe(&[0u8; 26]), None);

        // Right ethertype, wrong magic.
        let mut frame = encode_probe(SwitchId(1), 1);
        frame[15] = 0xff;
        assert_eq!(decode_probe(&frame), None);

        // Too short for the payload.
        let frame = encode_probe(SwitchId(1), 1);
        assert_eq!(decode_probe(&frame[..20]), None);
    }

    #[test]
    fn test_link_endpoints() {
        let link = DiscoveredLink::new((SwitchId(1), 4), (SwitchId(2), 9));
        assert!(link.connects((SwitchId(2), 9), (SwitchId(1), 4)));
        assert!(!link.connects((SwitchId(2), 9), (SwitchId(1), 5)));
        assert_eq!(link.other_endpoint(SwitchId(1)), Some((SwitchId(2), 9)));
        assert_eq!(link.other_endpoint(SwitchId(2)), Some((SwitchId(1), 4)));
        assert_eq!(link.other_endpoint(SwitchId(3)), None);
    }

    #[test]
    fn test_link_liveness() {
        let mut link = DiscoveredLink::new((SwitchId(1), 1), (SwitchId(2), 1));
        assert!(!link.expired(Instant::now()));
        assert!(link.expired(Instant::now() + LIVENESS_TIMEOUT));
        link.expire_now();
        assert!(link.expired(Instant::now()));
        link.refresh();
        assert!(!link.expired(Instant::now()));
    }
}
