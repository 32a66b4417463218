//! Capture sources.
//!
//! The core consumes packets through the byte-oriented `PacketSource`
//! trait; live capture backends are external collaborators. In-tree
//! implementations cover trace files in pcap format and an in-memory
//! source for tests and replay.

use std::fs::File;
use std::io::{BufReader, Read};
use std::os::unix::io::RawFd;
use std::path::Path;

use meter_common::{MeterError, MeterResult, UsecTs};

use crate::parse::LinkType;

/// What a source hands back for one packet.
#[derive(Debug, Clone, Copy)]
pub struct RawCapture {
    /// Capture timestamp, epoch microseconds
    pub ts: UsecTs,
    /// Original length on the wire
    pub wire_len: u32,
    /// Bytes actually written into the buffer
    pub cap_len: u32,
}

/// A byte-oriented packet supplier.
pub trait PacketSource: Send {
    /// Read the next packet into `buf`. `Ok(None)` means the source is
    /// exhausted (end of trace).
    fn next(&mut self, buf: &mut [u8]) -> MeterResult<Option<RawCapture>>;

    /// Readable descriptor for the main loop's readiness wait, if the
    /// source has one.
    fn fd(&self) -> Option<RawFd>;

    /// Live capture (wall clock) vs. trace replay (trace clock).
    fn is_online(&self) -> bool;

    /// Link encapsulation of the packets this source produces.
    fn link_type(&self) -> LinkType;
}

const PCAP_MAGIC_US: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_NS: u32 = 0xa1b2_3c4d;

/// Offline reader for pcap-format trace files.
///
/// Handles both byte orders and both the microsecond and nanosecond
/// timestamp variants.
pub struct PcapFileSource {
    reader: BufReader<File>,
    swapped: bool,
    nanos: bool,
    snaplen: u32,
    link: LinkType,
}

impl PcapFileSource {
    /// Open a trace file and validate its global header.
    pub fn open(path: &Path) -> MeterResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hdr = [0u8; 24];
        reader.read_exact(&mut hdr)?;

        let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let (swapped, nanos) = match magic {
            PCAP_MAGIC_US => (false, false),
            PCAP_MAGIC_NS => (false, true),
            m if m.swap_bytes() == PCAP_MAGIC_US => (true, false),
            m if m.swap_bytes() == PCAP_MAGIC_NS => (true, true),
            _ => {
                return Err(MeterError::BadTrace(format!(
                    "{}: not a pcap file (magic {magic:#010x})",
                    path.display()
                )))
            }
        };
        let read32 = |b: &[u8]| {
            let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            if swapped {
                v.swap_bytes()
            } else {
                v
            }
        };
        let snaplen = read32(&hdr[16..20]);
        let dlt = read32(&hdr[20..24]);
        let link = LinkType::from_dlt(dlt).ok_or_else(|| {
            MeterError::BadTrace(format!("{}: unsupported link type {dlt}", path.display()))
        })?;

        Ok(Self {
            reader,
            swapped,
            nanos,
            snaplen,
            link,
        })
    }

    /// Snapshot length recorded in the trace header.
    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    #[inline]
    fn u32_at(&self, b: &[u8]) -> u32 {
        let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if self.swapped {
            v.swap_bytes()
        } else {
            v
        }
    }
}

impl PacketSource for PcapFileSource {
    fn next(&mut self, buf: &mut [u8]) -> MeterResult<Option<RawCapture>> {
        let mut rec = [0u8; 16];
        match self.reader.read_exact(&mut rec) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let sec = self.u32_at(&rec[0..4]) as u64;
        let frac = self.u32_at(&rec[4..8]) as u64;
        let cap_len = self.u32_at(&rec[8..12]);
        let wire_len = self.u32_at(&rec[12..16]);

        if cap_len as usize > buf.len() {
            return Err(MeterError::BadTrace(format!(
                "record of {cap_len} bytes exceeds the {}-byte buffer",
                buf.len()
            )));
        }
        self.reader.read_exact(&mut buf[..cap_len as usize])?;

        let ts = if self.nanos {
            sec * 1_000_000 + frac / 1000
        } else {
            sec * 1_000_000 + frac
        };
        Ok(Some(RawCapture {
            ts,
            wire_len,
            cap_len,
        }))
    }

    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn is_online(&self) -> bool {
        false
    }

    fn link_type(&self) -> LinkType {
        self.link
    }
}

/// In-memory source for tests and controlled replay.
pub struct MemorySource {
    packets: std::vec::IntoIter<(UsecTs, Vec<u8>)>,
    link: LinkType,
}

impl MemorySource {
    /// Source replaying `packets` in order.
    pub fn new(packets: Vec<(UsecTs, Vec<u8>)>, link: LinkType) -> Self {
        Self {
            packets: packets.into_iter(),
            link,
        }
    }
}

impl PacketSource for MemorySource {
    fn next(&mut self, buf: &mut [u8]) -> MeterResult<Option<RawCapture>> {
        match self.packets.next() {
            Some((ts, bytes)) => {
                let cap = bytes.len().min(buf.len());
                buf[..cap].copy_from_slice(&bytes[..cap]);
                Ok(Some(RawCapture {
                    ts,
                    wire_len: bytes.len() as u32,
                    cap_len: cap as u32,
                }))
            }
            None => Ok(None),
        }
    }

    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn is_online(&self) -> bool {
        false
    }

    fn link_type(&self) -> LinkType {
        self.link
    }
}

/// ERF record type for ethernet captures
const ERF_TYPE_ETH: u8 = 2;
/// ERF fixed record header length
const ERF_HDR_LEN: usize = 16;

/// Offline reader for ERF (DAG) trace files.
///
/// Each record carries a 64-bit fixed-point timestamp (seconds in the
/// upper half, a binary fraction in the lower), the record type and the
/// record/wire lengths. Only ethernet records are supported; their frame
/// sits behind a two-byte pad.
pub struct ErfFileSource {
    reader: BufReader<File>,
}

impl ErfFileSource {
    /// Open an ERF trace file.
    pub fn open(path: &Path) -> MeterResult<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }

    /// Fixed-point ERF timestamp to epoch microseconds.
    fn erf_ts_to_us(ts: u64) -> UsecTs {
        let secs = ts >> 32;
        let frac = ts & 0xffff_ffff;
        secs * 1_000_000 + ((frac * 1_000_000) >> 32)
    }
}

impl PacketSource for ErfFileSource {
    fn next(&mut self, buf: &mut [u8]) -> MeterResult<Option<RawCapture>> {
        let mut hdr = [0u8; ERF_HDR_LEN];
        match self.reader.read_exact(&mut hdr) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let ts = u64::from_le_bytes(hdr[0..8].try_into().expect("8 byte slice"));
        let rtype = hdr[8] & 0x7f;
        let rlen = u16::from_be_bytes([hdr[10], hdr[11]]) as usize;
        let wlen = u16::from_be_bytes([hdr[14], hdr[15]]) as u32;

        if rtype != ERF_TYPE_ETH {
            return Err(MeterError::BadTrace(format!(
                "unsupported erf record type {rtype}"
            )));
        }
        if rlen < ERF_HDR_LEN + 2 {
            return Err(MeterError::BadTrace(format!("short erf record ({rlen})")));
        }
        // two pad bytes in front of the ethernet frame
        let mut pad = [0u8; 2];
        self.reader.read_exact(&mut pad)?;
        let cap_len = rlen - ERF_HDR_LEN - 2;
        if cap_len > buf.len() {
            return Err(MeterError::BadTrace(format!(
                "record of {cap_len} bytes exceeds the {}-byte buffer",
                buf.len()
            )));
        }
        self.reader.read_exact(&mut buf[..cap_len])?;

        Ok(Some(RawCapture {
            ts: Self::erf_ts_to_us(ts),
            wire_len: wlen,
            cap_len: cap_len as u32,
        }))
    }

    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn is_online(&self) -> bool {
        false
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }
}

/// A live source with no packets.
///
/// Keeps the engine in its online idle loop when capture is not attached;
/// useful for control-plane-only operation and tests.
#[derive(Debug, Default)]
pub struct NullSource;

impl PacketSource for NullSource {
    fn next(&mut self, _buf: &mut [u8]) -> MeterResult<Option<RawCapture>> {
        Ok(None)
    }

    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn is_online(&self) -> bool {
        true
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_pcap(path: &Path, packets: &[(u32, u32, &[u8])]) {
        let mut f = File::create(path).unwrap();
        let mut hdr = Vec::new();
        hdr.extend_from_slice(&PCAP_MAGIC_US.to_le_bytes());
        hdr.extend_from_slice(&2u16.to_le_bytes()); // version major
        hdr.extend_from_slice(&4u16.to_le_bytes()); // version minor
        hdr.extend_from_slice(&0u32.to_le_bytes()); // thiszone
        hdr.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        hdr.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        hdr.extend_from_slice(&1u32.to_le_bytes()); // DLT_EN10MB
        f.write_all(&hdr).unwrap();
        for (sec, usec, data) in packets {
            f.write_all(&sec.to_le_bytes()).unwrap();
            f.write_all(&usec.to_le_bytes()).unwrap();
            f.write_all(&(data.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&(data.len() as u32).to_le_bytes()).unwrap();
            f.write_all(data).unwrap();
        }
    }

    #[test]
    fn test_pcap_roundtrip() {
        let dir = std::env::temp_dir().join("meter-pcap-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("two.pcap");
        write_pcap(&path, &[(1, 500_000, &[0xaa; 60]), (2, 0, &[0xbb; 42])]);

        let mut src = PcapFileSource::open(&path).unwrap();
        assert_eq!(src.snaplen(), 65535);
        assert_eq!(src.link_type(), LinkType::Ethernet);
        assert!(!src.is_online());

        let mut buf = [0u8; 65536];
        let c1 = src.next(&mut buf).unwrap().unwrap();
        assert_eq!(c1.ts, 1_500_000);
        assert_eq!(c1.cap_len, 60);
        assert_eq!(buf[0], 0xaa);
        let c2 = src.next(&mut buf).unwrap().unwrap();
        assert_eq!(c2.ts, 2_000_000);
        assert!(src.next(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = std::env::temp_dir().join("meter-pcap-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.pcap");
        std::fs::write(&path, [0u8; 24]).unwrap();
        assert!(PcapFileSource::open(&path).is_err());
    }

    #[test]
    fn test_erf_roundtrip() {
        let dir = std::env::temp_dir().join("meter-pcap-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("one.erf");

        let mut f = File::create(&path).unwrap();
        // 5.5s as 64-bit fixed point
        let ts: u64 = (5u64 << 32) | (1u64 << 31);
        let frame = [0xccu8; 60];
        let rlen = (ERF_HDR_LEN + 2 + frame.len()) as u16;
        f.write_all(&ts.to_le_bytes()).unwrap();
        f.write_all(&[ERF_TYPE_ETH, 0]).unwrap(); // type, flags
        f.write_all(&rlen.to_be_bytes()).unwrap();
        f.write_all(&0u16.to_be_bytes()).unwrap(); // loss counter
        f.write_all(&64u16.to_be_bytes()).unwrap(); // wire length
        f.write_all(&[0, 0]).unwrap(); // pad
        f.write_all(&frame).unwrap();
        drop(f);

        let mut src = ErfFileSource::open(&path).unwrap();
        let mut buf = [0u8; 65536];
        let c = src.next(&mut buf).unwrap().unwrap();
        assert_eq!(c.ts, 5_500_000);
        assert_eq!(c.cap_len, 60);
        assert_eq!(c.wire_len, 64);
        assert_eq!(buf[0], 0xcc);
        assert!(src.next(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_memory_source_truncates_to_buffer() {
        let mut src = MemorySource::new(vec![(7, vec![1u8; 100])], LinkType::Ethernet);
        let mut buf = [0u8; 64];
        let c = src.next(&mut buf).unwrap().unwrap();
        assert_eq!(c.wire_len, 100);
        assert_eq!(c.cap_len, 64);
    }
}
