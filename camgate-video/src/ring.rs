//! In-memory compressed ring: a bounded stream of the newest packets plus a
//! parallel keyframe index used to seek without scanning the ring.
//!
//! Index entries are appended *at the ring id of the keyframe*, so a seek
//! resolves directly to a position in the ring.

use anyhow::Result;
use camgate_store::{SeqId, Store};

use crate::{frame::StoredPacket, keys};

#[derive(Clone)]
pub struct MemoryRing {
    store: Store,
    capacity: usize,
    queue_key: String,
    index_key: String,
}

impl MemoryRing {
    pub fn new(store: Store, device_id: &str, capacity: usize) -> MemoryRing {
        MemoryRing {
            store,
            capacity,
            queue_key: keys::compressed_ring(device_id),
            index_key: keys::keyframe_index(device_id),
        }
    }

    /// Drops all ring and index state, e.g. leftovers of a previous run.
    pub fn clear(&self) -> Result<()> {
        self.store.stream_delete(&self.queue_key)?;
        self.store.stream_delete(&self.index_key)?;
        Ok(())
    }

    /// Appends one packet; keyframes are also recorded in the index. With a
    /// capacity of zero the ring is disabled and nothing is stored.
    pub fn push(&self, packet: &StoredPacket) -> Result<Option<SeqId>> {
        if self.capacity == 0 {
            return Ok(None);
        }
        let id = self
            .store
            .stream_append(&self.queue_key, packet.encode()?, self.capacity)?;
        if packet.is_keyframe {
            self.store
                .stream_append_at(&self.index_key, id, Vec::new(), self.capacity)?;
        }
        Ok(Some(id))
    }

    /// Finds where decoding for `from_ts` (wall-clock ms) must start: the
    /// latest keyframe at or before `from_ts`, or the oldest indexed
    /// keyframe when the request predates the whole ring. Returns the id to
    /// pass to an exclusive-lower-bound read so that the keyframe itself is
    /// included, or `None` when the index is empty.
    ///
    /// Starting at-or-before the requested instant is mandatory: the
    /// packets after a keyframe are undecodable without it, so overshooting
    /// into the past beats returning broken frames.
    pub fn seek(&self, from_ts: i64) -> Result<Option<SeqId>> {
        let index = self.store.stream_all(&self.index_key)?;
        let Some(&(first, _)) = index.first() else {
            return Ok(None);
        };
        let mut candidate = first;
        for (id, _) in index {
            if id.ms > from_ts {
                break;
            }
            candidate = id;
        }
        Ok(Some(candidate.prev_tick()))
    }

    pub fn read_after(&self, after: SeqId, count: usize) -> Result<Vec<(SeqId, StoredPacket)>> {
        self.store
            .stream_read_after(&self.queue_key, after, count)?
            .into_iter()
            .map(|(id, bytes)| Ok((id, StoredPacket::decode(&bytes)?)))
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        self.store.stream_len(&self.queue_key)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_packet(keyframe: bool) -> StoredPacket {
        StoredPacket {
            data: vec![0, 0, 1],
            pts: Some(0),
            dts: Some(0),
            duration: 0,
            time_base: (1, 90_000),
            is_keyframe: keyframe,
            is_corrupt: false,
        }
    }

    /// Seeds ring + index at explicit ids: keyframes at the given
    /// millisecond timestamps with two delta frames after each.
    fn seeded_ring(store: &Store, keyframe_ts: &[i64]) -> MemoryRing {
        let ring = MemoryRing::new(store.clone(), "cam0", 1000);
        for &ts in keyframe_ts {
            for offset in 0..3i64 {
                let id = SeqId::new(ts + offset * 40, 0);
                let packet = test_packet(offset == 0);
                store
                    .stream_append_at(&ring.queue_key, id, packet.encode().unwrap(), 1000)
                    .unwrap();
                if offset == 0 {
                    store
                        .stream_append_at(&ring.index_key, id, Vec::new(), 1000)
                        .unwrap();
                }
            }
        }
        ring
    }

    #[test]
    fn test_push_indexes_keyframes_at_ring_ids() {
        let store = Store::new();
        let ring = MemoryRing::new(store.clone(), "cam0", 100);

        let kf = ring.push(&test_packet(true)).unwrap().unwrap();
        ring.push(&test_packet(false)).unwrap().unwrap();
        let kf2 = ring.push(&test_packet(true)).unwrap().unwrap();

        let index = store.stream_all(&keys::keyframe_index("cam0")).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].0, kf);
        assert_eq!(index[1].0, kf2);
        assert_eq!(ring.len().unwrap(), 3);
    }

    #[test]
    fn test_zero_capacity_disables_ring() {
        let store = Store::new();
        let ring = MemoryRing::new(store.clone(), "cam0", 0);
        assert_eq!(ring.push(&test_packet(true)).unwrap(), None);
        assert!(ring.is_empty().unwrap());
    }

    #[test]
    fn test_seek_picks_keyframe_at_or_before() {
        let store = Store::new();
        let ring = seeded_ring(&store, &[1000, 3000, 5000]);

        // between keyframes: latest one not after from_ts wins
        let seek = ring.seek(3500).unwrap().unwrap();
        let first = ring.read_after(seek, 1).unwrap();
        assert_eq!(first[0].0, SeqId::new(3000, 0));
        assert!(first[0].1.is_keyframe);

        // exact hit is included
        let seek = ring.seek(5000).unwrap().unwrap();
        assert_eq!(ring.read_after(seek, 1).unwrap()[0].0, SeqId::new(5000, 0));
    }

    #[test]
    fn test_seek_before_ring_start_falls_back_to_oldest() {
        let store = Store::new();
        let ring = seeded_ring(&store, &[10_000, 12_000]);
        let seek = ring.seek(0).unwrap().unwrap();
        assert_eq!(ring.read_after(seek, 1).unwrap()[0].0, SeqId::new(10_000, 0));
    }

    #[test]
    fn test_seek_empty_index() {
        let store = Store::new();
        let ring = MemoryRing::new(store, "cam0", 100);
        assert_eq!(ring.seek(123).unwrap(), None);
    }

    #[test]
    fn test_index_order_matches_ring_order() {
        let store = Store::new();
        let ring = MemoryRing::new(store.clone(), "cam0", 1000);
        for i in 0..20 {
            ring.push(&test_packet(i % 5 == 0)).unwrap();
        }
        let index = store.stream_all(&keys::keyframe_index("cam0")).unwrap();
        let ring_ids: Vec<SeqId> = store
            .stream_all(&keys::compressed_ring("cam0"))
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let mut last = SeqId::ZERO;
        for (id, _) in index {
            assert!(id > last);
            assert!(ring_ids.contains(&id));
            last = id;
        }
    }
}
