//! Packet-group assembly. A group holds one keyframe and everything up to
//! (not including) the next one, so every group is independently decodable
//! and maps one-to-one onto a segment file.

use ffmpeg::{Packet, Rational};

pub struct PacketGroup {
    /// Wall-clock ms at which the opening keyframe was demuxed.
    pub start_ts: i64,
    /// Time base of the source video stream, shared by all packets.
    pub time_base: Rational,
    pub packets: Vec<Packet>,
}

impl PacketGroup {
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Ingest-side state accumulating the in-flight group.
#[derive(Default)]
pub struct GroupAssembler {
    current: Option<PacketGroup>,
}

impl GroupAssembler {
    pub fn new() -> GroupAssembler {
        GroupAssembler::default()
    }

    /// Starts a new group at a keyframe boundary, returning the completed
    /// previous group (if it had any packets) for archiving.
    pub fn begin_group(&mut self, start_ts: i64, time_base: Rational) -> Option<PacketGroup> {
        self.current
            .replace(PacketGroup { start_ts, time_base, packets: Vec::new() })
            .filter(|group| !group.is_empty())
    }

    /// Appends to the open group. Returns false when no group is open yet,
    /// which only happens before the first keyframe.
    pub fn push(&mut self, packet: Packet) -> bool {
        match &mut self.current {
            Some(group) => {
                group.packets.push(packet);
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<&PacketGroup> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(key: bool, dts: i64) -> Packet {
        let mut packet = Packet::copy(&[0u8; 8]);
        packet.set_dts(Some(dts));
        packet.set_pts(Some(dts));
        if key {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        packet
    }

    #[test]
    fn test_group_has_single_leading_keyframe() {
        crate::init();
        let tb = Rational::new(1, 90_000);
        let mut assembler = GroupAssembler::new();

        assert!(assembler.begin_group(1_000, tb).is_none());
        assembler.push(packet(true, 0));
        assembler.push(packet(false, 1));
        assembler.push(packet(false, 2));

        let closed = assembler.begin_group(2_000, tb).unwrap();
        assert_eq!(closed.start_ts, 1_000);
        assert_eq!(closed.len(), 3);
        assert!(closed.packets[0].is_key());
        assert!(closed.packets[1..].iter().all(|p| !p.is_key()));
    }

    #[test]
    fn test_push_without_open_group_is_refused() {
        crate::init();
        let mut assembler = GroupAssembler::new();
        assert!(!assembler.push(packet(false, 0)));
        assert!(assembler.current().is_none());
    }

    #[test]
    fn test_empty_group_is_not_emitted() {
        crate::init();
        let tb = Rational::new(1, 90_000);
        let mut assembler = GroupAssembler::new();
        assembler.begin_group(1_000, tb);
        // camera reconnected straight onto another keyframe
        assert!(assembler.begin_group(2_000, tb).is_none());
    }
}
