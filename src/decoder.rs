//! Pure decode/format path: turn one received UDP datagram into zero-or-more
//! Splunk HEC JSON event lines. No network or queue code lives here, which
//! is what lets this module be property-tested in isolation.

use std::convert::TryInto;
use std::net::Ipv4Addr;

/// Fixed wire sizes, per the NetFlow v5 format.
pub const HEADER_SIZE: usize = 24;
pub const RECORD_SIZE: usize = 48;
/// Largest datagram this collector expects to receive.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Why a datagram was rejected before any JSON was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// `(datagram_len - 24) % 48 != 0`
    #[error("invalid netflow packet length ({0} bytes)")]
    InvalidLength(usize),
    /// header `version` field was not 5
    #[error("packet received with invalid version: {0}")]
    InvalidVersion(u16),
    /// header `count` field didn't match the number of records implied by length
    #[error("invalid number of records: {0}")]
    InvalidCount(u16),
}

/// The 24-byte NetFlow v5 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub count: u16,
    pub sys_uptime: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    // flow_sequence, engine_type, engine_id, sampling_interval are part of
    // the wire format but unused by this collector; they're validated for
    // length only and not retained.
}

impl Header {
    fn read(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_SIZE);
        Header {
            version: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
            count: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
            sys_uptime: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            unix_secs: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            unix_nsecs: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

/// One 48-byte NetFlow v5 flow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub srcaddr: u32,
    pub dstaddr: u32,
    pub nexthop: u32,
    pub input: u16,
    pub output: u16,
    pub packets: u32,
    pub bytes: u32,
    pub first: u32,
    pub last: u32,
    pub srcport: u16,
    pub dstport: u16,
    pub tcp_flags: u8,
    pub prot: u8,
    pub tos: u8,
    pub src_as: u16,
    pub dst_as: u16,
    pub src_mask: u8,
    pub dst_mask: u8,
}

impl Record {
    fn read(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= RECORD_SIZE);
        Record {
            srcaddr: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            dstaddr: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            nexthop: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            input: u16::from_be_bytes(buf[12..14].try_into().unwrap()),
            output: u16::from_be_bytes(buf[14..16].try_into().unwrap()),
            packets: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            bytes: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            first: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            last: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
            srcport: u16::from_be_bytes(buf[32..34].try_into().unwrap()),
            dstport: u16::from_be_bytes(buf[34..36].try_into().unwrap()),
            // buf[36] is padding
            tcp_flags: buf[37],
            prot: buf[38],
            tos: buf[39],
            src_as: u16::from_be_bytes(buf[40..42].try_into().unwrap()),
            dst_as: u16::from_be_bytes(buf[42..44].try_into().unwrap()),
            src_mask: buf[44],
            dst_mask: buf[45],
            // buf[46..48] is padding
        }
    }

    /// `last - first`, carried through as a signed wraparound exactly as
    /// the original C collector does: these are sys_uptime-relative
    /// millisecond counters and `last < first` is possible (counter
    /// rollover), in which case the duration is literally negative in the
    /// emitted event.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        i64::from(self.last) - i64::from(self.first)
    }
}

/// One decoded flow record paired with its exporter address and the
/// sourcetype it will be tagged with, ready to be rendered as a HEC JSON
/// event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<'a> {
    pub exporter: Ipv4Addr,
    pub record: Record,
    pub sourcetype: &'a str,
    pub time: f64,
}

impl Event<'_> {
    /// Render this event as the exact HEC JSON object shape from the wire
    /// protocol: one object, no trailing newline, fields concatenated in
    /// the original's comma-joined `event` string.
    pub fn write_json(&self, out: &mut String) {
        let r = &self.record;
        out.push_str("{\"event\": \"");
        out.push_str(&self.exporter.to_string());
        out.push(',');
        out.push_str(&Ipv4Addr::from(r.srcaddr).to_string());
        out.push(',');
        out.push_str(&Ipv4Addr::from(r.dstaddr).to_string());
        out.push(',');
        out.push_str(&Ipv4Addr::from(r.nexthop).to_string());
        out.push(',');
        use std::fmt::Write as _;
        let _ = write!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            r.input,
            r.output,
            r.packets,
            r.bytes,
            r.duration_ms(),
            r.srcport,
            r.dstport,
            r.tcp_flags,
            r.prot,
            r.tos,
            r.src_as,
            r.dst_as,
        );
        out.push(',');
        let _ = write!(out, "{}", r.src_mask);
        out.push(',');
        let _ = write!(out, "{}", r.dst_mask);
        out.push_str("\", \"sourcetype\": \"");
        out.push_str(self.sourcetype);
        out.push_str("\", \"time\": \"");
        let _ = write!(out, "{:.6}", self.time);
        out.push_str("\"}");
    }
}

/// Decode a single UDP datagram into its concatenated HEC JSON event body.
/// Returns an empty string (no events, no POST should be made) for a
/// well-formed but zero-record datagram (`datagram_len == 24`).
///
/// # Errors
///
/// Returns [`Error`] on the first validation failure, in the order
/// specified: length, then version, then count.
pub fn decode(datagram: &[u8], sender: Ipv4Addr, sourcetype: &str) -> Result<String, Error> {
    let len = datagram.len();
    if len < HEADER_SIZE || (len - HEADER_SIZE) % RECORD_SIZE != 0 {
        return Err(Error::InvalidLength(len));
    }

    let header = Header::read(&datagram[..HEADER_SIZE]);
    if header.version != 5 {
        return Err(Error::InvalidVersion(header.version));
    }

    let expected_count = ((len - HEADER_SIZE) / RECORD_SIZE) as u16;
    if header.count != expected_count {
        return Err(Error::InvalidCount(header.count));
    }

    // Sized per the original's own documented rationale: the largest
    // record minus the variable sourcetype is ~233 bytes, 250 is a
    // reasonable safety margin.
    let record_budget = 250 + sourcetype.len();
    let mut body = String::with_capacity(record_budget * header.count as usize);

    for i in 0..header.count as usize {
        let start = HEADER_SIZE + i * RECORD_SIZE;
        let record = Record::read(&datagram[start..start + RECORD_SIZE]);
        let time = f64::from(header.unix_secs) + f64::from(header.unix_nsecs) / 1_000_000_000.0
            - f64::from(header.sys_uptime) / 1000.0
            + f64::from(record.first) / 1000.0;
        let event = Event {
            exporter: sender,
            record,
            sourcetype,
            time,
        };
        event.write_json(&mut body);
    }

    Ok(body)
}
