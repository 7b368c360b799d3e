use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{CompletedStream, CompletionReason, FlowKey, Segment};

/// Buffering caps. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyLimits {
    pub max_buffered_segments_per_connection: usize,
    pub max_buffered_bytes_per_connection: usize,
    pub max_buffered_segments_total: usize,
    pub max_buffered_bytes_total: usize,
    /// Reassembled bytes kept per stream; the rest is counted but dropped.
    pub max_stream_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    pub connections: usize,
    pub buffered_segments: usize,
    pub buffered_bytes: usize,
    pub skipped_bytes: u64,
    pub gaps_skipped: u64,
    pub completed: u64,
}

/// Turns per-direction TCP segments into ordered byte streams.
pub struct Reassembler {
    limits: ReassemblyLimits,
    connections: HashMap<FlowKey, Connection>,
    buffered_segments: usize,
    buffered_bytes: usize,
    skipped_bytes: u64,
    gaps_skipped: u64,
    completed: u64,
}

struct Connection {
    next_seq: Option<u32>,
    fin_seq: Option<u32>,
    buffer: ReorderBuffer,
    data: Vec<u8>,
    packets: u64,
    bytes: u64,
    out_of_order: u64,
    skipped: u64,
    start: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    saw_start: bool,
    saw_end: bool,
}

struct ReorderBuffer {
    segments: VecDeque<BufSeg>,
    bytes: usize,
    /// Arrival time -> number of buffered segments that arrived then.
    arrivals: BTreeMap<DateTime<Utc>, usize>,
}

struct BufSeg {
    seq: u32,
    data: Vec<u8>,
    ts: DateTime<Utc>,
}

impl ReorderBuffer {
    fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            bytes: 0,
            arrivals: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.segments.len()
    }

    fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Keeps segments sorted in sequence space. A segment at an already
    /// buffered position replaces the old one only if it carries more bytes.
    fn insert(&mut self, seq: u32, data: Vec<u8>, ts: DateTime<Utc>) {
        let pos = self.segments.partition_point(|s| seq_lt(s.seq, seq));
        if let Some(existing) = self.segments.get_mut(pos) {
            if existing.seq == seq {
                if data.len() > existing.data.len() {
                    let old_ts = existing.ts;
                    self.bytes = self.bytes - existing.data.len() + data.len();
                    existing.data = data;
                    existing.ts = ts;
                    self.forget_arrival(old_ts);
                    *self.arrivals.entry(ts).or_default() += 1;
                }
                return;
            }
        }
        self.bytes += data.len();
        *self.arrivals.entry(ts).or_default() += 1;
        self.segments.insert(pos, BufSeg { seq, data, ts });
    }

    fn front_seq(&self) -> Option<u32> {
        self.segments.front().map(|s| s.seq)
    }

    fn pop_front(&mut self) -> Option<BufSeg> {
        let seg = self.segments.pop_front()?;
        self.bytes -= seg.data.len();
        self.forget_arrival(seg.ts);
        Some(seg)
    }

    fn forget_arrival(&mut self, ts: DateTime<Utc>) {
        if let Some(count) = self.arrivals.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                self.arrivals.remove(&ts);
            }
        }
    }

    fn oldest_arrival(&self) -> Option<DateTime<Utc>> {
        self.arrivals.first_key_value().map(|(ts, _)| *ts)
    }
}

impl Connection {
    fn new(ts: DateTime<Utc>) -> Self {
        Self {
            next_seq: None,
            fin_seq: None,
            buffer: ReorderBuffer::new(),
            data: Vec::new(),
            packets: 0,
            bytes: 0,
            out_of_order: 0,
            skipped: 0,
            start: ts,
            last_seen: ts,
            saw_start: false,
            saw_end: false,
        }
    }

    fn append(&mut self, data: &[u8], max_stream_bytes: usize) {
        if let Some(next) = self.next_seq.as_mut() {
            *next = next.wrapping_add(data.len() as u32);
        }
        self.bytes += data.len() as u64;
        let keep = if max_stream_bytes == 0 {
            data.len()
        } else {
            max_stream_bytes.saturating_sub(self.data.len()).min(data.len())
        };
        self.data.extend_from_slice(&data[..keep]);
    }

    fn accept(&mut self, seq: u32, payload: Vec<u8>, ts: DateTime<Utc>, max_stream_bytes: usize) {
        let next = *self.next_seq.get_or_insert(seq);
        let end = seq.wrapping_add(payload.len() as u32);

        // Entirely at or behind the high-water mark: retransmission.
        if !seq_lt(next, end) {
            return;
        }

        if seq_lt(next, seq) {
            self.out_of_order += 1;
            self.buffer.insert(seq, payload, ts);
            return;
        }

        let overlap = next.wrapping_sub(seq) as usize;
        self.append(&payload[overlap..], max_stream_bytes);
        self.drain(max_stream_bytes);
    }

    fn drain(&mut self, max_stream_bytes: usize) {
        while let (Some(next), Some(front)) = (self.next_seq, self.buffer.front_seq()) {
            if seq_lt(next, front) {
                break;
            }
            let Some(seg) = self.buffer.pop_front() else { break };
            let end = seg.seq.wrapping_add(seg.data.len() as u32);
            if seq_lt(next, end) {
                let overlap = next.wrapping_sub(seg.seq) as usize;
                self.append(&seg.data[overlap..], max_stream_bytes);
            }
        }
    }

    /// Jump the high-water mark to the first buffered segment. Returns the
    /// number of sequence positions given up.
    fn skip_gap(&mut self, max_stream_bytes: usize) -> Option<u64> {
        let front = self.buffer.front_seq()?;
        let next = self.next_seq.unwrap_or(front);
        let gap = if seq_lt(next, front) {
            front.wrapping_sub(next) as u64
        } else {
            0
        };
        self.next_seq = Some(front);
        self.skipped += gap;
        self.drain(max_stream_bytes);
        Some(gap)
    }

    fn over_limit(&self, limits: &ReassemblyLimits) -> bool {
        exceeds(self.buffer.len(), limits.max_buffered_segments_per_connection)
            || exceeds(self.buffer.bytes, limits.max_buffered_bytes_per_connection)
    }

    fn finished(&self) -> bool {
        match (self.fin_seq, self.next_seq) {
            (Some(fin), Some(next)) => !seq_lt(next, fin),
            _ => false,
        }
    }
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            connections: HashMap::new(),
            buffered_segments: 0,
            buffered_bytes: 0,
            skipped_bytes: 0,
            gaps_skipped: 0,
            completed: 0,
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        ReassemblyStats {
            connections: self.connections.len(),
            buffered_segments: self.buffered_segments,
            buffered_bytes: self.buffered_bytes,
            skipped_bytes: self.skipped_bytes,
            gaps_skipped: self.gaps_skipped,
            completed: self.completed,
        }
    }

    /// Feed one segment. Returns every stream that completed as a result,
    /// including streams of other connections evicted by the global caps.
    pub fn ingest(&mut self, segment: Segment) -> Vec<CompletedStream> {
        let Segment {
            key,
            seq,
            payload,
            timestamp,
            flags,
        } = segment;

        // Bare ACKs and resets for connections we never saw carry nothing.
        if payload.is_empty() && !flags.syn && !flags.fin && !self.connections.contains_key(&key) {
            return Vec::new();
        }

        let max_stream_bytes = self.limits.max_stream_bytes;
        let conn = self
            .connections
            .entry(key)
            .or_insert_with(|| Connection::new(timestamp));
        let before = (conn.buffer.len(), conn.buffer.bytes);

        conn.packets += 1;
        if timestamp > conn.last_seen {
            conn.last_seen = timestamp;
        }

        let data_seq = if flags.syn {
            conn.saw_start = true;
            let isn_next = seq.wrapping_add(1);
            conn.next_seq.get_or_insert(isn_next);
            isn_next
        } else {
            seq
        };

        let payload_len = payload.len() as u32;
        if !payload.is_empty() {
            conn.accept(data_seq, payload, timestamp, max_stream_bytes);
        }

        if flags.fin {
            let fin = data_seq.wrapping_add(payload_len);
            conn.saw_end = true;
            conn.fin_seq = Some(fin);
            conn.next_seq.get_or_insert(fin);
        }
        if flags.rst {
            conn.saw_end = true;
        }

        while conn.over_limit(&self.limits) {
            let Some(gap) = conn.skip_gap(max_stream_bytes) else { break };
            self.skipped_bytes += gap;
            self.gaps_skipped += 1;
            tracing::debug!(flow = %key, gap, "per-connection buffer cap hit, skipping gap");
        }

        let after = (conn.buffer.len(), conn.buffer.bytes);
        let done = flags.rst || conn.finished();
        self.buffered_segments = self.buffered_segments + after.0 - before.0;
        self.buffered_bytes = self.buffered_bytes + after.1 - before.1;

        let mut completed = Vec::new();
        if done {
            completed.extend(self.complete(&key, CompletionReason::Closed));
        }
        self.enforce_global_limits(&mut completed);
        completed
    }

    fn enforce_global_limits(&mut self, completed: &mut Vec<CompletedStream>) {
        let max_stream_bytes = self.limits.max_stream_bytes;
        while exceeds(self.buffered_segments, self.limits.max_buffered_segments_total)
            || exceeds(self.buffered_bytes, self.limits.max_buffered_bytes_total)
        {
            let victim = self
                .connections
                .iter()
                .filter_map(|(k, c)| c.buffer.oldest_arrival().map(|ts| (ts, *k)))
                .min_by_key(|(ts, _)| *ts)
                .map(|(_, k)| k);
            let Some(key) = victim else { break };
            let Some(conn) = self.connections.get_mut(&key) else { break };

            let before = (conn.buffer.len(), conn.buffer.bytes);
            let Some(gap) = conn.skip_gap(max_stream_bytes) else { break };
            let after = (conn.buffer.len(), conn.buffer.bytes);
            let done = conn.finished();

            self.buffered_segments -= before.0 - after.0;
            self.buffered_bytes -= before.1 - after.1;
            self.skipped_bytes += gap;
            self.gaps_skipped += 1;
            tracing::debug!(flow = %key, gap, "global buffer cap hit, skipping gap");

            if done {
                completed.extend(self.complete(&key, CompletionReason::Closed));
            }
        }
    }

    /// Complete every connection idle since before `deadline`.
    pub fn flush_older_than(&mut self, deadline: DateTime<Utc>) -> Vec<CompletedStream> {
        let stale: Vec<FlowKey> = self
            .connections
            .iter()
            .filter(|(_, c)| c.last_seen < deadline)
            .map(|(k, _)| *k)
            .collect();

        stale
            .iter()
            .filter_map(|k| self.complete(k, CompletionReason::Idle))
            .collect()
    }

    pub fn flush_all(&mut self) -> Vec<CompletedStream> {
        let keys: Vec<FlowKey> = self.connections.keys().copied().collect();
        keys.iter()
            .filter_map(|k| self.complete(k, CompletionReason::Shutdown))
            .collect()
    }

    fn complete(&mut self, key: &FlowKey, reason: CompletionReason) -> Option<CompletedStream> {
        let mut conn = self.connections.remove(key)?;
        self.buffered_segments -= conn.buffer.len();
        self.buffered_bytes -= conn.buffer.bytes;

        while let Some(gap) = conn.skip_gap(self.limits.max_stream_bytes) {
            self.skipped_bytes += gap;
            if gap > 0 {
                self.gaps_skipped += 1;
            }
        }
        self.completed += 1;

        Some(CompletedStream {
            key: *key,
            payload: conn.data,
            packets: conn.packets,
            bytes: conn.bytes,
            out_of_order: conn.out_of_order,
            skipped: conn.skipped,
            start: conn.start,
            end: conn.last_seen,
            saw_start: conn.saw_start,
            saw_end: conn.saw_end,
            reason,
        })
    }
}

fn exceeds(value: usize, cap: usize) -> bool {
    cap > 0 && value > cap
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SegmentFlags;
    use chrono::Duration;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn key(src_port: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
        )
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn seg(k: FlowKey, seq: u32, data: &[u8], secs: i64) -> Segment {
        Segment {
            key: k,
            seq,
            payload: data.to_vec(),
            timestamp: ts(secs),
            flags: SegmentFlags::default(),
        }
    }

    fn syn(k: FlowKey, seq: u32) -> Segment {
        Segment {
            flags: SegmentFlags { syn: true, ..Default::default() },
            ..seg(k, seq, b"", 0)
        }
    }

    fn fin(k: FlowKey, seq: u32, data: &[u8], secs: i64) -> Segment {
        Segment {
            flags: SegmentFlags { fin: true, ..Default::default() },
            ..seg(k, seq, data, secs)
        }
    }

    #[test]
    fn test_seq_lt_wraparound() {
        assert!(seq_lt(100, 200));
        assert!(!seq_lt(200, 100));
        assert!(seq_lt(u32::MAX - 5, 5));
        assert!(!seq_lt(5, u32::MAX - 5));
    }

    #[test]
    fn test_in_order_with_fin() {
        let k = key(40000);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        assert!(r.ingest(syn(k, 999)).is_empty());
        assert!(r.ingest(seg(k, 1000, b"GET / ", 1)).is_empty());
        assert!(r.ingest(seg(k, 1006, b"HTTP/1.1\r\n", 2)).is_empty());
        let done = r.ingest(fin(k, 1016, b"\r\n", 3));

        assert_eq!(done.len(), 1);
        let s = &done[0];
        assert_eq!(s.payload, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(s.reason, CompletionReason::Closed);
        assert!(s.saw_start && s.saw_end);
        assert_eq!(s.packets, 4);
        assert_eq!(s.end, ts(3));
        assert_eq!(r.stats().connections, 0);
        assert_eq!(r.stats().completed, 1);
    }

    #[test]
    fn test_out_of_order_is_reordered() {
        let k = key(40001);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        r.ingest(syn(k, 0));
        r.ingest(seg(k, 7, b"world", 1));
        assert_eq!(r.stats().buffered_segments, 1);
        assert_eq!(r.stats().buffered_bytes, 5);
        r.ingest(seg(k, 1, b"hello ", 2));
        assert_eq!(r.stats().buffered_segments, 0);

        let done = r.flush_all();
        assert_eq!(done[0].payload, b"hello world");
        assert_eq!(done[0].out_of_order, 1);
        assert_eq!(done[0].skipped, 0);
        assert_eq!(done[0].reason, CompletionReason::Shutdown);
    }

    #[test]
    fn test_retransmission_and_overlap() {
        let k = key(40002);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        r.ingest(seg(k, 100, b"abcd", 0));
        r.ingest(seg(k, 100, b"abcd", 1));
        r.ingest(seg(k, 102, b"cdef", 2));
        r.ingest(seg(k, 110, b"kl", 3));
        r.ingest(seg(k, 105, b"fghijk", 4));

        let done = r.flush_all();
        assert_eq!(done[0].payload, b"abcdefghijkl");
    }

    #[test]
    fn test_fin_before_last_data_waits() {
        let k = key(40003);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        r.ingest(syn(k, 0));
        assert!(r.ingest(fin(k, 4, b"", 1)).is_empty());
        let done = r.ingest(seg(k, 1, b"abc", 2));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, b"abc");
    }

    #[test]
    fn test_rst_completes_and_releases_buffer() {
        let k = key(40004);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        r.ingest(seg(k, 1, b"ab", 0));
        r.ingest(seg(k, 10, b"xy", 1));
        let rst = Segment {
            flags: SegmentFlags { rst: true, ..Default::default() },
            ..seg(k, 12, b"", 2)
        };
        let done = r.ingest(rst);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, b"abxy");
        assert_eq!(done[0].skipped, 7);
        assert_eq!(r.stats().buffered_bytes, 0);
        assert_eq!(r.stats().skipped_bytes, 7);
    }

    #[test]
    fn test_sequence_wraparound() {
        let k = key(40005);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        let start = u32::MAX - 2;
        r.ingest(seg(k, start.wrapping_add(3), b"defg", 1));
        // Mid-stream pickup anchors at the first segment seen.
        let mut r2 = Reassembler::new(ReassemblyLimits::default());
        r2.ingest(syn(k, start.wrapping_sub(1)));
        r2.ingest(seg(k, start.wrapping_add(3), b"def", 1));
        r2.ingest(seg(k, start, b"abc", 2));
        assert_eq!(r2.flush_all()[0].payload, b"abcdef");
        assert_eq!(r.flush_all()[0].payload, b"defg");
    }

    #[test]
    fn test_per_connection_byte_cap_skips_oldest_gap() {
        let k = key(40006);
        let limits = ReassemblyLimits {
            max_buffered_bytes_per_connection: 10,
            ..Default::default()
        };
        let mut r = Reassembler::new(limits);
        r.ingest(syn(k, 0));
        r.ingest(seg(k, 1, b"head", 0));
        r.ingest(seg(k, 105, b"AAAAAAAA", 1));
        assert_eq!(r.stats().buffered_bytes, 8);
        r.ingest(seg(k, 205, b"BBBBBBBB", 2));

        let stats = r.stats();
        assert!(stats.buffered_bytes <= 10);
        assert_eq!(stats.buffered_bytes, 8);
        assert_eq!(stats.skipped_bytes, 100);
        assert_eq!(stats.gaps_skipped, 1);

        let done = r.flush_all();
        assert_eq!(done[0].payload, b"headAAAAAAAABBBBBBBB");
        assert_eq!(done[0].skipped, 100 + 92);
    }

    #[test]
    fn test_per_connection_segment_cap() {
        let k = key(40007);
        let limits = ReassemblyLimits {
            max_buffered_segments_per_connection: 1,
            ..Default::default()
        };
        let mut r = Reassembler::new(limits);
        r.ingest(seg(k, 0, b"a", 0));
        r.ingest(seg(k, 5, b"b", 1));
        r.ingest(seg(k, 9, b"c", 2));
        assert_eq!(r.stats().buffered_segments, 1);
        assert_eq!(r.stats().skipped_bytes, 4);
    }

    #[test]
    fn test_global_cap_evicts_oldest_gap_across_connections() {
        let a = key(40008);
        let b = key(40009);
        let limits = ReassemblyLimits {
            max_buffered_bytes_total: 6,
            ..Default::default()
        };
        let mut r = Reassembler::new(limits);
        r.ingest(seg(a, 0, b"a0", 0));
        r.ingest(seg(b, 0, b"b0", 0));
        r.ingest(seg(a, 10, b"a1a1", 1));
        r.ingest(seg(b, 10, b"b1b1", 2));

        // a's gap is older, so a gives up its hole.
        let stats = r.stats();
        assert!(stats.buffered_bytes <= 6);
        assert_eq!(stats.skipped_bytes, 8);
        assert_eq!(stats.connections, 2);

        let mut done = r.flush_all();
        done.sort_by_key(|s| s.key.src_port);
        assert_eq!(done[0].payload, b"a0a1a1");
        assert_eq!(done[0].skipped, 8);
        assert_eq!(done[1].payload, b"b0b1b1");
    }

    #[test]
    fn test_flush_older_than_only_touches_idle() {
        let idle = key(40010);
        let busy = key(40011);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        r.ingest(seg(idle, 0, b"abc", 0));
        r.ingest(seg(idle, 10, b"xyz", 1));
        r.ingest(seg(busy, 0, b"live", 100));

        let done = r.flush_older_than(ts(50));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key, idle);
        assert_eq!(done[0].payload, b"abcxyz");
        assert_eq!(done[0].reason, CompletionReason::Idle);
        assert_eq!(r.stats().connections, 1);
        assert_eq!(r.stats().buffered_bytes, 0);
    }

    #[test]
    fn test_reorder_buffer_tracks_oldest_arrival() {
        let mut buf = ReorderBuffer::new();
        assert_eq!(buf.oldest_arrival(), None);
        buf.insert(300, b"ccc".to_vec(), ts(5));
        buf.insert(100, b"a".to_vec(), ts(3));
        buf.insert(200, b"bb".to_vec(), ts(3));
        assert_eq!(buf.oldest_arrival(), Some(ts(3)));

        // A longer copy at the same position takes over its arrival time.
        buf.insert(100, b"aaa".to_vec(), ts(9));
        assert_eq!(buf.bytes, 8);
        assert_eq!(buf.oldest_arrival(), Some(ts(3)));

        assert_eq!(buf.pop_front().map(|s| s.seq), Some(100));
        assert_eq!(buf.pop_front().map(|s| s.seq), Some(200));
        assert_eq!(buf.oldest_arrival(), Some(ts(5)));
        assert_eq!(buf.pop_front().map(|s| s.seq), Some(300));
        assert_eq!(buf.oldest_arrival(), None);
        assert!(buf.is_empty());
        assert_eq!(buf.bytes, 0);
    }

    #[test]
    fn test_long_reversed_burst_drains_in_order() {
        let k = key(40015);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        let n: u32 = 5_000;
        r.ingest(syn(k, u32::MAX));
        for i in (1..n).rev() {
            assert!(r.ingest(seg(k, i, &[(i % 251) as u8], i as i64)).is_empty());
        }
        assert_eq!(r.stats().buffered_segments, (n - 1) as usize);
        r.ingest(seg(k, 0, &[0], n as i64));
        assert_eq!(r.stats().buffered_segments, 0);

        let done = r.flush_all();
        let expected: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
        assert_eq!(done[0].payload, expected);
    }

    #[test]
    fn test_completed_exactly_once() {
        let k = key(40012);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        r.ingest(seg(k, 0, b"data", 0));
        assert_eq!(r.flush_older_than(ts(10)).len(), 1);
        assert!(r.flush_older_than(ts(10)).is_empty());
        assert!(r.flush_all().is_empty());
    }

    #[test]
    fn test_bare_ack_for_unknown_connection_is_ignored() {
        let k = key(40013);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        assert!(r.ingest(seg(k, 0, b"", 0)).is_empty());
        assert_eq!(r.stats().connections, 0);
    }

    #[test]
    fn test_max_stream_bytes_truncates_output() {
        let k = key(40014);
        let limits = ReassemblyLimits {
            max_stream_bytes: 5,
            ..Default::default()
        };
        let mut r = Reassembler::new(limits);
        r.ingest(seg(k, 0, b"abc", 0));
        r.ingest(seg(k, 3, b"defgh", 1));
        let done = r.flush_all();
        assert_eq!(done[0].payload, b"abcde");
        assert_eq!(done[0].bytes, 8);
    }

    #[test]
    fn test_flush_deadline_is_exclusive() {
        let k = key(40015);
        let mut r = Reassembler::new(ReassemblyLimits::default());
        r.ingest(seg(k, 0, b"a", 10));
        assert!(r.flush_older_than(ts(10)).is_empty());
        assert_eq!(r.flush_older_than(ts(10) + Duration::seconds(1)).len(), 1);
    }

    fn arb_delivery() -> impl Strategy<Value = (Vec<u8>, u32, Vec<(usize, usize)>, Vec<bool>)> {
        (
            prop::collection::vec(any::<u8>(), 1..1024),
            any::<u32>(),
            1usize..64,
            prop::collection::vec(any::<bool>(), 64),
        )
            .prop_flat_map(|(data, isn, chunk, dups)| {
                let ranges: Vec<(usize, usize)> = (0..data.len())
                    .step_by(chunk)
                    .map(|s| (s, (s + chunk).min(data.len())))
                    .collect();
                (Just(data), Just(isn), Just(ranges).prop_shuffle(), Just(dups))
            })
    }

    proptest! {
        #[test]
        fn any_arrival_order_reassembles_exactly((data, isn, ranges, dups) in arb_delivery()) {
            let k = key(41000);
            let mut r = Reassembler::new(ReassemblyLimits::default());
            r.ingest(syn(k, isn));
            let base = isn.wrapping_add(1);
            for (i, (s, e)) in ranges.iter().enumerate() {
                let segment = seg(k, base.wrapping_add(*s as u32), &data[*s..*e], i as i64);
                if dups[i % dups.len()] {
                    r.ingest(segment.clone());
                }
                r.ingest(segment);
            }
            let done = r.flush_all();
            prop_assert_eq!(done.len(), 1);
            prop_assert_eq!(&done[0].payload, &data);
            prop_assert_eq!(done[0].skipped, 0);
        }

        #[test]
        fn buffered_bytes_never_exceed_cap(
            cap in 1usize..64,
            offsets in prop::collection::vec((0u32..512, 1usize..32), 1..64),
        ) {
            let k = key(41001);
            let limits = ReassemblyLimits {
                max_buffered_bytes_per_connection: cap,
                ..Default::default()
            };
            let mut r = Reassembler::new(limits);
            r.ingest(syn(k, 0));
            for (i, (off, len)) in offsets.into_iter().enumerate() {
                let payload = vec![0xaa; len];
                r.ingest(seg(k, 1 + off, &payload, i as i64));
                prop_assert!(r.stats().buffered_bytes <= cap);
            }
        }
    }
}
