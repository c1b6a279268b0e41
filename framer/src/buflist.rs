//! Outbound message buflist (spec.md §4.F/§9): preserves SOM/EOM
//! fragment grouping across partial-write transport schedules by
//! carrying the flags inside each fragment rather than in a sidecar
//! field alongside the byte stream.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::VecDeque;

pub const SOM: u8 = 0b01;
pub const EOM: u8 = 0b10;

/// Default sub-buffer size `queue_json` chunks serialized payloads to.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// 5 MiB backpressure ceiling (spec.md §9) on the web-facing path.
pub const BACKPRESSURE_CEILING: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Fragment {
    flags: u8,
    data: Bytes,
    /// Bytes of `data` already drained by a previous `drain_for_write`.
    offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SomEom {
    pub som: bool,
    pub eom: bool,
}

/// FIFO queue of outgoing fragments for one logical peer link. Framer
/// ordering within one link is guaranteed by draining this queue in
/// order (spec.md §5).
#[derive(Debug, Default)]
pub struct OutboundBuflist {
    fragments: VecDeque<Fragment>,
}

impl OutboundBuflist {
    pub fn new() -> OutboundBuflist {
        OutboundBuflist::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn buflist_total_len(&self) -> usize {
        self.fragments
            .iter()
            .map(|f| f.data.len() - f.offset)
            .sum()
    }

    /// Queues one fragment carrying both SOM and EOM bits embedded in
    /// the fragment itself — this is the trick spec §9 calls load-
    /// bearing: no sidecar field ever needs to survive a partial write.
    pub fn queue_tx(&mut self, data: Bytes, som: bool, eom: bool) {
        let mut flags = 0u8;
        if som {
            flags |= SOM;
        }
        if eom {
            flags |= EOM;
        }
        self.fragments.push_back(Fragment {
            flags,
            data,
            offset: 0,
        });
    }

    /// Serializes `value` with `serde_json`, chunks to `chunk_size`, and
    /// issues one `queue_tx` per chunk with SOM on the first chunk and
    /// EOM on the last (spec.md §4.F `queue_json`).
    pub fn queue_json(&mut self, value: &impl Serialize, chunk_size: usize) -> serde_json::Result<()> {
        let encoded = serde_json::to_vec(value)?;
        if encoded.is_empty() {
            self.queue_tx(Bytes::new(), true, true);
            return Ok(());
        }
        let mut chunks = encoded.chunks(chunk_size.max(1)).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let is_last = chunks.peek().is_none();
            self.queue_tx(Bytes::copy_from_slice(chunk), first, is_last);
            first = false;
        }
        Ok(())
    }

    /// Pulls up to `max_len` bytes for a single transport write. SOM is
    /// set iff this is the first pull from the current fragment and the
    /// fragment's stored flags had SOM; EOM iff this pull exhausts the
    /// fragment and the fragment's stored flags had EOM (spec.md §4.F).
    pub fn drain_for_write(&mut self, max_len: usize) -> Option<(Bytes, SomEom)> {
        let fragment = self.fragments.front_mut()?;
        let som = fragment.offset == 0 && fragment.flags & SOM != 0;
        let remaining = fragment.data.len() - fragment.offset;
        let take = remaining.min(max_len.max(1));
        let slice = fragment.data.slice(fragment.offset..fragment.offset + take);
        fragment.offset += take;

        let exhausted = fragment.offset >= fragment.data.len();
        let eom = exhausted && fragment.flags & EOM != 0;
        if exhausted {
            self.fragments.pop_front();
        }
        Some((slice, SomEom { som, eom }))
    }

    /// Drains the entire buflist, concatenating payload bytes (SOM/EOM
    /// stripped), for the round-trip law in spec.md §8.
    pub fn drain_all_concat(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        while let Some((bytes, _)) = self.drain_for_write(usize::MAX) {
            out.extend_from_slice(&bytes);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_fragment_som_and_eom_on_one_pull() {
        let mut buf = OutboundBuflist::new();
        buf.queue_tx(Bytes::from_static(b"hello"), true, true);
        let (bytes, flags) = buf.drain_for_write(1024).unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(flags, SomEom { som: true, eom: true });
        assert!(buf.drain_for_write(1024).is_none());
    }

    #[test]
    fn partial_writes_preserve_som_eom_at_fragment_boundaries() {
        let mut buf = OutboundBuflist::new();
        buf.queue_tx(Bytes::from_static(b"0123456789"), true, true);

        let (chunk1, flags1) = buf.drain_for_write(4).unwrap();
        assert_eq!(&chunk1[..], b"0123");
        assert_eq!(flags1, SomEom { som: true, eom: false });

        let (chunk2, flags2) = buf.drain_for_write(4).unwrap();
        assert_eq!(&chunk2[..], b"4567");
        assert_eq!(flags2, SomEom { som: false, eom: false });

        let (chunk3, flags3) = buf.drain_for_write(4).unwrap();
        assert_eq!(&chunk3[..], b"89");
        assert_eq!(flags3, SomEom { som: false, eom: true });
    }

    #[test]
    fn queue_json_chunks_with_som_first_eom_last() {
        let mut buf = OutboundBuflist::new();
        let value = json!({"schema": "com-warmcat-sai-ba", "platforms": ["linux/x86_64/gcc"]});
        buf.queue_json(&value, 8).unwrap();

        let mut reassembled = Vec::new();
        let mut saw_som = false;
        let mut saw_eom = false;
        while let Some((bytes, flags)) = buf.drain_for_write(8) {
            if flags.som {
                saw_som = true;
                assert!(reassembled.is_empty());
            }
            reassembled.extend_from_slice(&bytes);
            if flags.eom {
                saw_eom = true;
            }
        }
        assert!(saw_som && saw_eom);
        let round_tripped: serde_json::Value = serde_json::from_slice(&reassembled).unwrap();
        assert_eq!(round_tripped, value);
    }

    #[test]
    fn concat_law_holds_across_many_small_pulls() {
        let mut buf = OutboundBuflist::new();
        buf.queue_tx(Bytes::from_static(b"abc"), true, false);
        buf.queue_tx(Bytes::from_static(b"def"), false, true);
        let concat = buf.drain_all_concat();
        assert_eq!(&concat[..], b"abcdef");
    }

    #[test]
    fn total_len_tracks_undrained_bytes() {
        let mut buf = OutboundBuflist::new();
        buf.queue_tx(Bytes::from_static(b"0123456789"), true, true);
        assert_eq!(buf.buflist_total_len(), 10);
        buf.drain_for_write(4);
        assert_eq!(buf.buflist_total_len(), 6);
    }
}
