use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::*;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::DecodeError;
use crate::models::{FlowKey, Segment, SegmentFlags};

pub use pcap_parser::Linktype;

/// Anything that produces TCP segments: a capture file, a live interface, a
/// test fixture. `run` blocks until the input ends or `sink` returns false.
pub trait CaptureSource: Send + 'static {
    fn describe(&self) -> String;

    fn run(&mut self, sink: &mut dyn FnMut(Segment) -> bool) -> Result<CaptureStats>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub packets: u64,
    pub bytes: u64,
    pub tcp_segments: u64,
    pub decode_errors: u64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl CaptureStats {
    /// Count one frame and decode it. Returns the TCP segment it carried, if any.
    pub fn decode(&mut self, linktype: Linktype, data: &[u8], timestamp: DateTime<Utc>) -> Option<Segment> {
        self.packets += 1;
        self.bytes += data.len() as u64;
        if self.first_timestamp.map_or(true, |first| timestamp < first) {
            self.first_timestamp = Some(timestamp);
        }
        if self.last_timestamp.map_or(true, |last| timestamp > last) {
            self.last_timestamp = Some(timestamp);
        }

        match decode_frame(linktype, data, timestamp) {
            Ok(Some(segment)) => {
                self.tcp_segments += 1;
                Some(segment)
            }
            Ok(None) => None,
            Err(e) => {
                self.decode_errors += 1;
                tracing::trace!(error = %e, "undecodable frame");
                None
            }
        }
    }
}

/// Strip the link layer and decode IP and TCP. Non-TCP traffic is `Ok(None)`.
pub fn decode_frame(
    linktype: Linktype,
    data: &[u8],
    timestamp: DateTime<Utc>,
) -> Result<Option<Segment>, DecodeError> {
    let malformed = |e: &dyn std::fmt::Display| DecodeError::Malformed(e.to_string());

    let headers = match linktype {
        Linktype::ETHERNET => PacketHeaders::from_ethernet_slice(data).map_err(|e| malformed(&e))?,
        Linktype::RAW | Linktype(12) | Linktype::IPV4 | Linktype::IPV6 => {
            PacketHeaders::from_ip_slice(data).map_err(|e| malformed(&e))?
        }
        Linktype::NULL => {
            // BSD loopback: 4-byte address family
            let ip = data.get(4..).ok_or(DecodeError::ShortFrame {
                len: data.len(),
                needed: 4,
            })?;
            PacketHeaders::from_ip_slice(ip).map_err(|e| malformed(&e))?
        }
        Linktype::LINUX_SLL => {
            // Linux cooked capture: 16-byte header, protocol in the last two
            if data.len() < 16 {
                return Err(DecodeError::ShortFrame {
                    len: data.len(),
                    needed: 16,
                });
            }
            let ethertype = u16::from_be_bytes([data[14], data[15]]);
            if ethertype != 0x0800 && ethertype != 0x86DD {
                return Ok(None);
            }
            PacketHeaders::from_ip_slice(&data[16..]).map_err(|e| malformed(&e))?
        }
        other => return Err(DecodeError::UnsupportedLinktype(other.0)),
    };

    let (src_ip, dst_ip) = match headers.net {
        Some(NetHeaders::Ipv4(ref h, _)) => (
            IpAddr::V4(Ipv4Addr::from(h.source)),
            IpAddr::V4(Ipv4Addr::from(h.destination)),
        ),
        Some(NetHeaders::Ipv6(ref h, _)) => (
            IpAddr::V6(Ipv6Addr::from(h.source)),
            IpAddr::V6(Ipv6Addr::from(h.destination)),
        ),
        _ => return Ok(None),
    };

    let Some(TransportHeader::Tcp(ref tcp)) = headers.transport else {
        return Ok(None);
    };

    Ok(Some(Segment {
        key: FlowKey::new(src_ip, tcp.source_port, dst_ip, tcp.destination_port),
        seq: tcp.sequence_number,
        payload: headers.payload.slice().to_vec(),
        timestamp,
        flags: SegmentFlags {
            syn: tcp.syn,
            fin: tcp.fin,
            rst: tcp.rst,
        },
    }))
}

// ---------------------------------------------------------------------------
// PcapReplay: streaming reader for pcap/pcapng files
// ---------------------------------------------------------------------------

pub struct PcapReplay {
    pub path: PathBuf,
    pub filename: String,
    pub file_sha256: String,
    pub file_size: u64,
}

impl PcapReplay {
    pub fn open(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let file_size = std::fs::metadata(path)
            .with_context(|| format!("cannot stat {}", path.display()))?
            .len();

        let file_sha256 = compute_file_sha256(path)
            .with_context(|| format!("cannot read {}", path.display()))?;

        tracing::info!(
            file = %filename,
            size = file_size,
            sha256 = %file_sha256,
            "replaying capture file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            filename,
            file_sha256,
            file_size,
        })
    }

    fn replay(&self, sink: &mut dyn FnMut(Segment) -> bool) -> Result<CaptureStats> {
        let file = File::open(&self.path)
            .with_context(|| format!("cannot open {}", self.path.display()))?;
        let mut reader = create_reader(65536, file)
            .map_err(|e| anyhow::anyhow!("{}: not a pcap or pcapng file: {e:?}", self.path.display()))?;

        let mut stats = CaptureStats::default();
        let mut linktype = Linktype::ETHERNET;
        let mut nanosecond_precision = false;
        let mut if_tsresol: u64 = 1_000_000;

        loop {
            match reader.next() {
                Ok((consumed, block)) => {
                    let segment = match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            linktype = header.network;
                            nanosecond_precision = header.is_nanosecond_precision();
                            None
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            // The fraction field holds nanoseconds in nano-magic files.
                            let nanos = if nanosecond_precision {
                                packet.ts_usec
                            } else {
                                packet.ts_usec.saturating_mul(1000)
                            };
                            let ts = pcap_ts_to_datetime(packet.ts_sec as i64, nanos);
                            stats.decode(linktype, &packet.data, ts)
                        }
                        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                            linktype = idb.linktype;
                            if_tsresol = tsresol_from_options(&idb.options).unwrap_or(1_000_000);
                            None
                        }
                        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                            let raw = ((epb.ts_high as u64) << 32) | (epb.ts_low as u64);
                            let secs = (raw / if_tsresol) as i64;
                            let nanos = ((raw % if_tsresol) as u128 * 1_000_000_000 / if_tsresol as u128) as u32;
                            stats.decode(linktype, &epb.data, pcap_ts_to_datetime(secs, nanos))
                        }
                        PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                            // No timestamp on simple blocks; reuse the last one seen.
                            let ts = stats.last_timestamp.unwrap_or_else(Utc::now);
                            stats.decode(linktype, &spb.data, ts)
                        }
                        _ => None,
                    };
                    reader.consume(consumed);

                    if let Some(segment) = segment {
                        if !sink(segment) {
                            tracing::debug!(file = %self.filename, "replay stopped by consumer");
                            break;
                        }
                    }
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) => {
                    if let Err(e) = reader.refill() {
                        tracing::warn!(error = ?e, "truncated capture file");
                        stats.decode_errors += 1;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = ?e, "capture parse error");
                    stats.decode_errors += 1;
                    break;
                }
            }
        }

        tracing::info!(
            packets = stats.packets,
            tcp_segments = stats.tcp_segments,
            errors = stats.decode_errors,
            "replay complete"
        );
        Ok(stats)
    }
}

impl CaptureSource for PcapReplay {
    fn describe(&self) -> String {
        format!("file {}", self.filename)
    }

    fn run(&mut self, sink: &mut dyn FnMut(Segment) -> bool) -> Result<CaptureStats> {
        self.replay(sink)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn tsresol_from_options(options: &[PcapNGOption]) -> Option<u64> {
    let opt = options.iter().find(|o| o.code == OptionCode::IfTsresol)?;
    let val = *opt.value.first()?;
    let resolution = if val & 0x80 != 0 {
        2u64.checked_pow((val & 0x7f) as u32)?
    } else {
        10u64.checked_pow(val as u32)?
    };
    (resolution > 0).then_some(resolution)
}

/// Out-of-range timestamps map to the epoch.
pub fn pcap_ts_to_datetime(secs: i64, nanos: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

fn compute_file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use etherparse::PacketBuilder;
    use std::io::Write;

    pub(crate) const CLIENT: [u8; 4] = [10, 0, 0, 1];
    pub(crate) const SERVER: [u8; 4] = [93, 184, 216, 34];

    pub(crate) fn tcp_frame(src: u16, dst: u16, seq: u32, payload: &[u8], syn: bool, fin: bool) -> Vec<u8> {
        let (src_ip, dst_ip) = if dst == 80 || dst == 443 { (CLIENT, SERVER) } else { (SERVER, CLIENT) };
        let mut builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4(src_ip, dst_ip, 64)
            .tcp(src, dst, seq, 65535);
        if syn {
            builder = builder.syn();
        }
        if fin {
            builder = builder.fin();
        }
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    fn udp_frame() -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4(CLIENT, [8, 8, 8, 8], 64)
            .udp(5353, 53);
        let mut out = Vec::new();
        builder.write(&mut out, b"dns?").unwrap();
        out
    }

    /// Classic little-endian pcap with microsecond timestamps.
    pub(crate) fn write_pcap(path: &Path, linktype: u32, frames: &[(u32, Vec<u8>)]) {
        let frames: Vec<(u32, u32, Vec<u8>)> = frames.iter().map(|(secs, f)| (*secs, 0, f.clone())).collect();
        write_pcap_with_magic(path, 0xa1b2_c3d4, linktype, &frames);
    }

    /// `frames` carry (seconds, fraction, bytes); the magic decides whether the
    /// fraction is read as micro- or nanoseconds.
    fn write_pcap_with_magic(path: &Path, magic: u32, linktype: u32, frames: &[(u32, u32, Vec<u8>)]) {
        let mut f = File::create(path).unwrap();
        f.write_all(&magic.to_le_bytes()).unwrap();
        f.write_all(&2u16.to_le_bytes()).unwrap();
        f.write_all(&4u16.to_le_bytes()).unwrap();
        f.write_all(&0i32.to_le_bytes()).unwrap();
        f.write_all(&0u32.to_le_bytes()).unwrap();
        f.write_all(&65535u32.to_le_bytes()).unwrap();
        f.write_all(&linktype.to_le_bytes()).unwrap();
        for (secs, fraction, frame) in frames {
            f.write_all(&secs.to_le_bytes()).unwrap();
            f.write_all(&fraction.to_le_bytes()).unwrap();
            f.write_all(&(frame.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&(frame.len() as u32).to_le_bytes()).unwrap();
            f.write_all(frame).unwrap();
        }
    }

    #[test]
    fn test_decode_ethernet_tcp() {
        let frame = tcp_frame(50000, 80, 1000, b"GET /", false, false);
        let ts = pcap_ts_to_datetime(1_700_000_000, 0);
        let seg = decode_frame(Linktype::ETHERNET, &frame, ts).unwrap().unwrap();
        assert_eq!(seg.key.to_string(), "10.0.0.1:50000 -> 93.184.216.34:80");
        assert_eq!(seg.seq, 1000);
        assert_eq!(seg.payload, b"GET /");
        assert!(!seg.flags.syn);
    }

    #[test]
    fn test_decode_other_link_types() {
        let builder = PacketBuilder::ipv4(CLIENT, SERVER, 64).tcp(40000, 443, 7, 1024).syn();
        let mut ip = Vec::new();
        builder.write(&mut ip, &[]).unwrap();
        let ts = Utc::now();

        let raw = decode_frame(Linktype::RAW, &ip, ts).unwrap().unwrap();
        assert!(raw.flags.syn);

        let mut null = vec![2, 0, 0, 0];
        null.extend_from_slice(&ip);
        assert_eq!(decode_frame(Linktype::NULL, &null, ts).unwrap().unwrap().key, raw.key);

        let mut sll = vec![0u8; 14];
        sll.extend_from_slice(&[0x08, 0x00]);
        sll.extend_from_slice(&ip);
        assert_eq!(decode_frame(Linktype::LINUX_SLL, &sll, ts).unwrap().unwrap().key, raw.key);

        assert!(matches!(
            decode_frame(Linktype::LINUX_SLL, &[0u8; 8], ts),
            Err(DecodeError::ShortFrame { needed: 16, .. })
        ));
        assert!(matches!(
            decode_frame(Linktype(147), &ip, ts),
            Err(DecodeError::UnsupportedLinktype(147))
        ));
    }

    #[test]
    fn test_non_tcp_is_ignored() {
        assert!(decode_frame(Linktype::ETHERNET, &udp_frame(), Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_replay_streams_segments_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.pcap");
        write_pcap(
            &path,
            1,
            &[
                (100, tcp_frame(50000, 80, 0, b"", true, false)),
                (101, udp_frame()),
                (102, tcp_frame(50000, 80, 1, b"GET / HTTP/1.1\r\n", false, false)),
                (103, vec![0xde, 0xad]),
            ],
        );

        let mut replay = PcapReplay::open(&path).unwrap();
        assert_eq!(replay.file_sha256.len(), 64);
        assert_eq!(replay.describe(), "file sample.pcap");

        let mut seen = Vec::new();
        let stats = replay
            .run(&mut |seg| {
                seen.push(seg);
                true
            })
            .unwrap();

        assert_eq!(stats.packets, 4);
        assert_eq!(stats.tcp_segments, 2);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.first_timestamp.unwrap().timestamp(), 100);
        assert_eq!(stats.last_timestamp.unwrap().timestamp(), 103);
        assert_eq!(seen.len(), 2);
        assert!(seen[0].flags.syn);
        assert_eq!(seen[1].payload, b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_replay_stops_when_sink_declines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop.pcap");
        let frames: Vec<_> = (0..5)
            .map(|i| (i, tcp_frame(50000, 80, i * 10, b"0123456789", false, false)))
            .collect();
        write_pcap(&path, 1, &frames);

        let mut count = 0;
        PcapReplay::open(&path)
            .unwrap()
            .run(&mut |_| {
                count += 1;
                count < 2
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_timestamp_precision_follows_file_magic() {
        let dir = tempfile::tempdir().unwrap();
        let frame = tcp_frame(50000, 80, 1, b"GET /", false, false);

        let nano = dir.path().join("nano.pcap");
        write_pcap_with_magic(&nano, 0xa1b2_3c4d, 1, &[(1_700_000_000, 500_000_000, frame.clone())]);
        let micro = dir.path().join("micro.pcap");
        write_pcap_with_magic(&micro, 0xa1b2_c3d4, 1, &[(1_700_000_000, 250_000, frame)]);

        for (path, nanos) in [(nano, 500_000_000), (micro, 250_000_000)] {
            let mut seen = Vec::new();
            PcapReplay::open(&path)
                .unwrap()
                .run(&mut |segment| {
                    seen.push(segment.timestamp);
                    true
                })
                .unwrap();
            assert_eq!(seen, vec![pcap_ts_to_datetime(1_700_000_000, nanos)]);
            assert_eq!(seen[0].timestamp(), 1_700_000_000);
        }
    }

    #[test]
    fn test_open_missing_file() {
        assert!(PcapReplay::open(Path::new("/nonexistent/capture.pcap")).is_err());
    }

    #[test]
    fn test_tsresol_option() {
        assert_eq!(pcap_ts_to_datetime(1_700_000_000, 500_000_000).timestamp_subsec_millis(), 500);
        assert_eq!(tsresol_from_options(&[]), None);
    }
}
