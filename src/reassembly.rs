use std::time::{Duration, Instant};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::datagram_header::{DatagramHeader, SourceId};

/// The fragments received so far for one logical command.
struct ReassemblyBuffer {
    fragments: Vec<Option<Vec<u8>>>,
    num_received: usize,
    created_at: Instant,
}

/// Reassembles multi-fragment commands, keyed by (source id, sequence number).
///
/// An entry is removed exactly once: either all fragments arrive and the concatenated payload
///  is handed back, or the entry exceeds the staleness window and is purged. A purge is not an
///  error - the command simply never completes, and the broker's redelivery layer is
///  responsible for recovery.
pub struct ReassemblyTable {
    entries: FxHashMap<(SourceId, u32), ReassemblyBuffer>,
    staleness_window: Duration,
}

impl ReassemblyTable {
    pub fn new(staleness_window: Duration) -> ReassemblyTable {
        ReassemblyTable {
            entries: FxHashMap::default(),
            staleness_window,
        }
    }

    /// Store one fragment, returning the complete payload if it was the last missing one.
    ///  Fragments that contradict the header invariants or an existing entry are dropped.
    pub fn on_fragment(&mut self, header: &DatagramHeader, payload: &[u8], now: Instant) -> Option<Vec<u8>> {
        if header.fragment_index >= header.fragment_count {
            warn!("dropping fragment with index {} >= count {}", header.fragment_index, header.fragment_count);
            return None;
        }

        let key = (header.source_id, header.sequence_number);
        let buffer = self.entries.entry(key)
            .or_insert_with(|| ReassemblyBuffer {
                fragments: vec![None; header.fragment_count as usize],
                num_received: 0,
                created_at: now,
            });

        if buffer.fragments.len() != header.fragment_count as usize {
            warn!("dropping fragment with count {} contradicting an earlier fragment's count {} for the same command", header.fragment_count, buffer.fragments.len());
            return None;
        }

        let slot = &mut buffer.fragments[header.fragment_index as usize];
        if slot.is_some() {
            // at-least-once medium: duplicates are expected and ignored
            trace!("ignoring duplicate fragment {} of command {:?}", header.fragment_index, key);
            return None;
        }
        *slot = Some(payload.to_vec());
        buffer.num_received += 1;

        if buffer.num_received < buffer.fragments.len() {
            trace!("buffered fragment {}/{} of command {:?}", header.fragment_index, header.fragment_count, key);
            return None;
        }

        // complete: remove the entry and concatenate payloads in fragment order
        let buffer = self.entries.remove(&key)
            .expect("entry was just inserted or found");

        let mut complete = Vec::with_capacity(buffer.fragments.iter()
            .map(|f| f.as_ref().map(|p| p.len()).unwrap_or(0))
            .sum());
        for fragment in buffer.fragments {
            complete.extend_from_slice(&fragment.expect("all fragments are present on completion"));
        }
        Some(complete)
    }

    /// Purge entries older than the staleness window, bounding memory under fragment loss.
    pub fn purge_stale(&mut self, now: Instant) {
        let staleness_window = self.staleness_window;
        let before = self.entries.len();
        self.entries.retain(|_, buffer| now.duration_since(buffer.created_at) <= staleness_window);

        let purged = before - self.entries.len();
        if purged > 0 {
            debug!("purged {} stale reassembly entries", purged);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram_header::DatagramFlags;

    fn fragment_header(source_id: SourceId, seq: u32, index: u16, count: u16) -> DatagramHeader {
        DatagramHeader {
            flags: DatagramFlags::empty(),
            source_id,
            sequence_number: seq,
            fragment_index: index,
            fragment_count: count,
            reply_to: None,
        }
    }

    #[test]
    fn test_in_order_completion() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30));
        let source = SourceId::new_random();
        let now = Instant::now();

        assert_eq!(table.on_fragment(&fragment_header(source, 5, 0, 3), b"aa", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 1, 3), b"bb", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 2, 3), b"cc", now), Some(b"aabbcc".to_vec()));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30));
        let source = SourceId::new_random();
        let now = Instant::now();

        assert_eq!(table.on_fragment(&fragment_header(source, 5, 2, 3), b"cc", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 0, 3), b"aa", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 1, 3), b"bb", now), Some(b"aabbcc".to_vec()));
    }

    #[test]
    fn test_interleaved_sources_and_sequences() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30));
        let source_a = SourceId::new_random();
        let source_b = SourceId::new_random();
        let now = Instant::now();

        assert_eq!(table.on_fragment(&fragment_header(source_a, 1, 0, 2), b"a1", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source_b, 1, 0, 2), b"b1", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source_a, 2, 0, 2), b"a2", now), None);

        assert_eq!(table.on_fragment(&fragment_header(source_a, 1, 1, 2), b"x", now), Some(b"a1x".to_vec()));
        assert_eq!(table.on_fragment(&fragment_header(source_b, 1, 1, 2), b"y", now), Some(b"b1y".to_vec()));
        assert_eq!(table.on_fragment(&fragment_header(source_a, 2, 1, 2), b"z", now), Some(b"a2z".to_vec()));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30));
        let source = SourceId::new_random();
        let now = Instant::now();

        assert_eq!(table.on_fragment(&fragment_header(source, 5, 0, 2), b"aa", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 0, 2), b"xx", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 1, 2), b"bb", now), Some(b"aabb".to_vec()));
    }

    #[test]
    fn test_index_out_of_range_dropped() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30));
        let source = SourceId::new_random();
        let now = Instant::now();

        assert_eq!(table.on_fragment(&fragment_header(source, 5, 2, 2), b"aa", now), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_contradicting_fragment_count_dropped() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30));
        let source = SourceId::new_random();
        let now = Instant::now();

        assert_eq!(table.on_fragment(&fragment_header(source, 5, 0, 3), b"aa", now), None);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 1, 4), b"bb", now), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_purge_stale_removes_exactly_once() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30));
        let source = SourceId::new_random();
        let now = Instant::now();

        table.on_fragment(&fragment_header(source, 5, 0, 4), b"aa", now);
        table.on_fragment(&fragment_header(source, 5, 1, 4), b"bb", now);
        table.on_fragment(&fragment_header(source, 5, 2, 4), b"cc", now);
        assert_eq!(table.len(), 1);

        // within the window: entry survives
        table.purge_stale(now + Duration::from_secs(29));
        assert_eq!(table.len(), 1);

        // past the window: entry is purged, silently
        table.purge_stale(now + Duration::from_secs(31));
        assert_eq!(table.len(), 0);

        // a second purge has nothing left to remove
        table.purge_stale(now + Duration::from_secs(60));
        assert_eq!(table.len(), 0);

        // a late fragment starts a fresh (incomplete) entry rather than resurrecting the old one
        let late = now + Duration::from_secs(61);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 3, 4), b"dd", late), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_completion_and_purge_are_exclusive() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30));
        let source = SourceId::new_random();
        let now = Instant::now();

        table.on_fragment(&fragment_header(source, 5, 0, 2), b"aa", now);
        assert_eq!(table.on_fragment(&fragment_header(source, 5, 1, 2), b"bb", now), Some(b"aabb".to_vec()));

        // completed entries are already gone when the purge runs
        table.purge_stale(now + Duration::from_secs(60));
        assert_eq!(table.len(), 0);
    }
}
