//! Fixed-header, tagged-parameter message codec.
//!
//! Wire layout, all multi-byte fields big-endian, no padding:
//!
//!   Bytes  0 ..  3 = magic (u32)
//!   Byte   4       = major version
//!   Byte   5       = minor version
//!   Bytes  6 ..  7 = command (u16)
//!   Bytes  8 .. 11 = status (u32)
//!   Bytes 12 .. 15 = request id (u32)
//!   Bytes 16 .. 19 = parameter count (u32)
//!   Bytes 20 .. 23 = total length incl. header (u32)
//!
//! Each parameter contributes an 8-byte header (type u16, 2 reserved bytes,
//! body length u32) to a block following the message header; the bodies
//! follow that block in the same order, concatenated. Reserved bytes are
//! zero on write and ignored on read. A zero-length body is legal.
//!
//! Field encoding goes through `to_be_bytes`/`from_be_bytes`, never through
//! struct reinterpretation, so host endianness and padding rules cannot
//! leak onto the wire.

use std::io::IoSlice;

use crate::error::{Error, Result};
use crate::net::NetIo;

pub const HDR_LEN: usize = 24;
pub const PHDR_LEN: usize = 8;

const MAGIC_OFF: usize = 0;
const MAJOR_OFF: usize = 4;
const MINOR_OFF: usize = 5;
const CMD_OFF: usize = 6;
const STATUS_OFF: usize = 8;
const REQ_ID_OFF: usize = 12;
const PARAM_NUM_OFF: usize = 16;
const LEN_OFF: usize = 20;

const PTYPE_OFF: usize = 0;
const PBODY_LEN_OFF: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Param {
    ptype: u16,
    body: Vec<u8>,
    /// Wire image of the parameter header, built once at add time so `iov`
    /// can alias straight into it.
    phdr: [u8; PHDR_LEN],
}

impl Param {
    fn new(ptype: u16, body: Vec<u8>) -> Param {
        let mut phdr = [0u8; PHDR_LEN];
        phdr[PTYPE_OFF..PTYPE_OFF + 2].copy_from_slice(&ptype.to_be_bytes());
        phdr[PBODY_LEN_OFF..PBODY_LEN_OFF + 4].copy_from_slice(&(body.len() as u32).to_be_bytes());
        Param { ptype, body, phdr }
    }
}

/// A message under construction or freshly parsed.
#[derive(Debug, Clone)]
pub struct Msg {
    magic: u32,
    major: u8,
    minor: u8,
    cmd: u16,
    status: u32,
    req_id: u32,
    params: Vec<Param>,
    /// Cached wire image of the message header, refreshed before any
    /// scatter/gather use.
    hdr: [u8; HDR_LEN],
}

/// Equality is over wire-visible content; the cached header image is a
/// serialization detail.
impl PartialEq for Msg {
    fn eq(&self, other: &Msg) -> bool {
        self.magic == other.magic
            && self.major == other.major
            && self.minor == other.minor
            && self.cmd == other.cmd
            && self.status == other.status
            && self.req_id == other.req_id
            && self.params == other.params
    }
}

impl Eq for Msg {}

impl Msg {
    pub fn new(magic: u32, major: u8, minor: u8) -> Msg {
        Msg {
            magic,
            major,
            minor,
            cmd: 0,
            status: 0,
            req_id: 0,
            params: Vec::new(),
            hdr: [0u8; HDR_LEN],
        }
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn major(&self) -> u8 {
        self.major
    }

    pub fn minor(&self) -> u8 {
        self.minor
    }

    pub fn cmd(&self) -> u16 {
        self.cmd
    }

    pub fn set_cmd(&mut self, cmd: u16) {
        self.cmd = cmd;
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn set_status(&mut self, status: u32) {
        self.status = status;
    }

    pub fn req_id(&self) -> u32 {
        self.req_id
    }

    pub fn set_req_id(&mut self, req_id: u32) {
        self.req_id = req_id;
    }

    pub fn param_num(&self) -> u32 {
        self.params.len() as u32
    }

    /// Total wire length: header plus every parameter header and body.
    pub fn len(&self) -> u32 {
        let params: usize = self.params.iter().map(|p| PHDR_LEN + p.body.len()).sum();
        (HDR_LEN + params) as u32
    }

    /// Append a parameter; the header's count and total length follow
    /// automatically. Returns the body length taken.
    pub fn add_param(&mut self, ptype: u16, body: &[u8]) -> Result<usize> {
        if body.len() > u32::MAX as usize {
            return Err(Error::Overflow);
        }
        self.params.push(Param::new(ptype, body.to_vec()));
        Ok(body.len())
    }

    pub fn param_by_index(&self, index: usize) -> Option<(u16, &[u8])> {
        self.params.get(index).map(|p| (p.ptype, p.body.as_slice()))
    }

    /// First parameter of the given type. Duplicate types are legal; the
    /// iterator view reaches the rest.
    pub fn param_by_type(&self, ptype: u16) -> Option<&[u8]> {
        self.params.iter().find(|p| p.ptype == ptype).map(|p| p.body.as_slice())
    }

    /// All parameters in wire order.
    pub fn params(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.params.iter().map(|p| (p.ptype, p.body.as_slice()))
    }

    fn refresh_hdr(&mut self) {
        let len = self.len();
        let param_num = self.param_num();
        let hdr = &mut self.hdr;
        hdr[MAGIC_OFF..MAGIC_OFF + 4].copy_from_slice(&self.magic.to_be_bytes());
        hdr[MAJOR_OFF] = self.major;
        hdr[MINOR_OFF] = self.minor;
        hdr[CMD_OFF..CMD_OFF + 2].copy_from_slice(&self.cmd.to_be_bytes());
        hdr[STATUS_OFF..STATUS_OFF + 4].copy_from_slice(&self.status.to_be_bytes());
        hdr[REQ_ID_OFF..REQ_ID_OFF + 4].copy_from_slice(&self.req_id.to_be_bytes());
        hdr[PARAM_NUM_OFF..PARAM_NUM_OFF + 4].copy_from_slice(&param_num.to_be_bytes());
        hdr[LEN_OFF..LEN_OFF + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Scatter/gather view: header, then every parameter header, then every
    /// body. Entries alias into the message and the concatenation equals
    /// `serialize` byte for byte.
    pub fn iov(&mut self) -> Vec<IoSlice<'_>> {
        self.refresh_hdr();
        let mut iovs = Vec::with_capacity(1 + 2 * self.params.len());
        iovs.push(IoSlice::new(&self.hdr));
        for p in &self.params {
            iovs.push(IoSlice::new(&p.phdr));
        }
        for p in &self.params {
            iovs.push(IoSlice::new(&p.body));
        }
        iovs
    }

    /// Contiguous serialization.
    pub fn serialize(&mut self) -> Vec<u8> {
        self.refresh_hdr();
        let mut out = Vec::with_capacity(self.len() as usize);
        out.extend_from_slice(&self.hdr);
        for p in &self.params {
            out.extend_from_slice(&p.phdr);
        }
        for p in &self.params {
            out.extend_from_slice(&p.body);
        }
        out
    }

    /// Parse a complete in-memory message.
    pub fn deserialize(bytes: &[u8]) -> Result<Msg> {
        if bytes.len() < HDR_LEN {
            return Err(Error::Malformed("undersized header"));
        }
        Msg::deserialize_parts(&bytes[..HDR_LEN], &bytes[HDR_LEN..])
    }

    /// Parse a message split the way the two-read receive path produces it:
    /// the fixed header and everything after it.
    pub fn deserialize_parts(hdr: &[u8], body: &[u8]) -> Result<Msg> {
        if hdr.len() != HDR_LEN {
            return Err(Error::Malformed("undersized header"));
        }
        let magic = u32::from_be_bytes(hdr[MAGIC_OFF..MAGIC_OFF + 4].try_into().unwrap());
        let major = hdr[MAJOR_OFF];
        let minor = hdr[MINOR_OFF];
        let cmd = u16::from_be_bytes(hdr[CMD_OFF..CMD_OFF + 2].try_into().unwrap());
        let status = u32::from_be_bytes(hdr[STATUS_OFF..STATUS_OFF + 4].try_into().unwrap());
        let req_id = u32::from_be_bytes(hdr[REQ_ID_OFF..REQ_ID_OFF + 4].try_into().unwrap());
        let param_num = u32::from_be_bytes(hdr[PARAM_NUM_OFF..PARAM_NUM_OFF + 4].try_into().unwrap());
        let total = u32::from_be_bytes(hdr[LEN_OFF..LEN_OFF + 4].try_into().unwrap());

        if total as usize != HDR_LEN + body.len() {
            return Err(Error::Malformed("total length disagrees with payload"));
        }

        // The parameter header block must fit, and the declared body
        // lengths must account for every remaining byte.
        let phdr_block = (param_num as usize).checked_mul(PHDR_LEN).ok_or(Error::Malformed("parameter count overflow"))?;
        if phdr_block > body.len() {
            return Err(Error::Malformed("parameter headers exceed payload"));
        }
        let mut declared: usize = 0;
        let mut lens = Vec::with_capacity(param_num as usize);
        for i in 0..param_num as usize {
            let at = i * PHDR_LEN;
            let ptype = u16::from_be_bytes(body[at + PTYPE_OFF..at + PTYPE_OFF + 2].try_into().unwrap());
            let blen = u32::from_be_bytes(body[at + PBODY_LEN_OFF..at + PBODY_LEN_OFF + 4].try_into().unwrap()) as usize;
            declared = declared.checked_add(blen).ok_or(Error::Malformed("parameter length overflow"))?;
            lens.push((ptype, blen));
        }
        if phdr_block + declared != body.len() {
            return Err(Error::Malformed("parameter lengths disagree with payload"));
        }

        let mut msg = Msg::new(magic, major, minor);
        msg.cmd = cmd;
        msg.status = status;
        msg.req_id = req_id;
        let mut at = phdr_block;
        for (ptype, blen) in lens {
            msg.params.push(Param::new(ptype, body[at..at + blen].to_vec()));
            at += blen;
        }
        Ok(msg)
    }

    /// Send the whole message through `net` as one scatter/gather write.
    /// The count may come back short if `net`'s timeout or break predicate
    /// cut the transfer off.
    pub fn send(&mut self, net: &NetIo) -> Result<usize> {
        let mut iovs = self.iov();
        net.sendv(&mut iovs)
    }

    /// Receive one message: exactly one header, then exactly the payload
    /// the header promises, then parse.
    pub fn recv(net: &NetIo) -> Result<Msg> {
        let mut hdr = [0u8; HDR_LEN];
        let got = net.recv(&mut hdr)?;
        if got < HDR_LEN {
            return Err(Error::ShortRead { wanted: HDR_LEN, got });
        }
        let total = u32::from_be_bytes(hdr[LEN_OFF..LEN_OFF + 4].try_into().unwrap()) as usize;
        if total < HDR_LEN {
            return Err(Error::Malformed("total length below header size"));
        }
        let mut body = vec![0u8; total - HDR_LEN];
        let got = net.recv(&mut body)?;
        if got < body.len() {
            return Err(Error::ShortRead { wanted: body.len(), got });
        }
        Msg::deserialize_parts(&hdr, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Socket, Type};
    use std::os::unix::io::AsRawFd;

    fn sample() -> Msg {
        let mut msg = Msg::new(0xDEAD_BEEF, 1, 0);
        msg.set_cmd(0x0005);
        msg.set_req_id(0x1122_3344);
        msg.add_param(0x0001, b"hello").unwrap();
        msg.add_param(0x0002, b"").unwrap();
        msg
    }

    #[test]
    fn test_header_length_law() {
        let msg = sample();
        assert_eq!(msg.param_num(), 2);
        assert_eq!(msg.len() as usize, HDR_LEN + (PHDR_LEN + 5) + (PHDR_LEN + 0));
    }

    #[test]
    fn test_serialized_header_is_big_endian() {
        let mut msg = sample();
        let bytes = msg.serialize();
        assert_eq!(bytes.len() as u32, msg.len());

        let expect_hdr = [
            0xDE, 0xAD, 0xBE, 0xEF, // magic
            0x01, 0x00, // major, minor
            0x00, 0x05, // cmd
            0x00, 0x00, 0x00, 0x00, // status
            0x11, 0x22, 0x33, 0x44, // req_id
            0x00, 0x00, 0x00, 0x02, // param_num
            0x00, 0x00, 0x00, 0x2D, // len = 24 + 13 + 8 = 45
        ];
        assert_eq!(&bytes[..HDR_LEN], &expect_hdr);

        // First parameter header: type 1, reserved zero, body length 5.
        assert_eq!(&bytes[HDR_LEN..HDR_LEN + PHDR_LEN], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05]);
        // Second: type 2, empty body.
        assert_eq!(
            &bytes[HDR_LEN + PHDR_LEN..HDR_LEN + 2 * PHDR_LEN],
            &[0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        // Bodies concatenated after the header block.
        assert_eq!(&bytes[HDR_LEN + 2 * PHDR_LEN..], b"hello");
    }

    #[test]
    fn test_round_trip() {
        let mut msg = sample();
        let bytes = msg.serialize();
        let parsed = Msg::deserialize(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.magic(), 0xDEAD_BEEF);
        assert_eq!(parsed.major(), 1);
        assert_eq!(parsed.minor(), 0);
        assert_eq!(parsed.cmd(), 0x0005);
        assert_eq!(parsed.status(), 0);
        assert_eq!(parsed.req_id(), 0x1122_3344);
        assert_eq!(parsed.param_by_type(0x0001), Some(&b"hello"[..]));
        assert_eq!(parsed.param_by_type(0x0002), Some(&b""[..]));
    }

    #[test]
    fn test_iov_concatenation_equals_serialize() {
        let mut msg = sample();
        let flat = msg.serialize();
        let iovs = msg.iov();
        assert_eq!(iovs.len(), 1 + 2 * 2);
        let glued: Vec<u8> = iovs.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(glued, flat);
    }

    #[test]
    fn test_param_access() {
        let mut msg = sample();
        msg.add_param(0x0001, b"again").unwrap();

        assert_eq!(msg.param_by_index(0), Some((0x0001, &b"hello"[..])));
        assert_eq!(msg.param_by_index(2), Some((0x0001, &b"again"[..])));
        assert_eq!(msg.param_by_index(3), None);
        // First match wins for typed lookup.
        assert_eq!(msg.param_by_type(0x0001), Some(&b"hello"[..]));
        assert_eq!(msg.param_by_type(0x0009), None);

        let collected: Vec<(u16, Vec<u8>)> =
            msg.params().map(|(t, b)| (t, b.to_vec())).collect();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[2], (0x0001, b"again".to_vec()));
    }

    #[test]
    fn test_deserialize_rejects_inconsistencies() {
        let mut msg = sample();
        let bytes = msg.serialize();

        assert!(matches!(Msg::deserialize(&bytes[..HDR_LEN - 1]), Err(Error::Malformed(_))));
        // Truncated payload no longer matches the total length field.
        assert!(matches!(Msg::deserialize(&bytes[..bytes.len() - 1]), Err(Error::Malformed(_))));

        // Lie about the parameter count.
        let mut lying = bytes.clone();
        lying[PARAM_NUM_OFF..PARAM_NUM_OFF + 4].copy_from_slice(&3u32.to_be_bytes());
        assert!(matches!(Msg::deserialize(&lying), Err(Error::Malformed(_))));

        // Inflate one declared body length.
        let mut lying = bytes.clone();
        lying[HDR_LEN + PBODY_LEN_OFF..HDR_LEN + PBODY_LEN_OFF + 4]
            .copy_from_slice(&6u32.to_be_bytes());
        assert!(matches!(Msg::deserialize(&lying), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_reserved_bytes_ignored_on_read() {
        let mut msg = sample();
        let mut bytes = msg.serialize();
        bytes[HDR_LEN + 2] = 0xFF;
        bytes[HDR_LEN + 3] = 0xFF;
        let parsed = Msg::deserialize(&bytes).unwrap();
        assert_eq!(parsed.param_by_type(0x0001), Some(&b"hello"[..]));
    }

    #[test]
    fn test_send_recv_over_socketpair() -> anyhow::Result<()> {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        let tx = NetIo::new(a.as_raw_fd());
        let rx = NetIo::new(b.as_raw_fd());

        let mut msg = sample();
        let sent = msg.send(&tx)?;
        assert_eq!(sent, msg.len() as usize);

        let got = Msg::recv(&rx)?;
        assert_eq!(got, msg);
        Ok(())
    }

    #[test]
    fn test_recv_short_header_fails() {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        let tx = NetIo::new(a.as_raw_fd());
        let mut rx = NetIo::new(b.as_raw_fd());
        rx.set_recv_timeout(Some(crate::timespec::TimeSpec::new(0, 50_000_000)));

        tx.send(&[0u8; 5]).unwrap();
        drop(a);
        match Msg::recv(&rx) {
            Err(Error::ShortRead { wanted, got }) => {
                assert_eq!(wanted, HDR_LEN);
                assert_eq!(got, 5);
            }
            other => panic!("expected ShortRead, got {other:?}"),
        }
    }
}
