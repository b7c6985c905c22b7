use crate::protocols::{
    ip::{IpAddress, TCP_PROTOCOL},
    utility::Checksum,
};
use thiserror::Error as ThisError;

/// The number of 32-bit words in a TCP header without optional header parts
const BASE_HEADER_WORDS: u8 = 5;
/// The number of bytes in a TCP header without optional header parts
pub const BASE_HEADER_OCTETS: usize = BASE_HEADER_WORDS as usize * 4;

const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;
const OPTION_MSS: u8 = 2;
const OPTION_MSS_LEN: u8 = 4;

/// A decoded TCP header. Sequence arithmetic is left to the connection.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Sequence number of the first octet this segment occupies. On a SYN this
    /// is the sender's initial sequence number.
    pub seq: u32,
    /// Next sequence number the sender expects, valid when ACK is set
    pub ack: u32,
    /// Header length in 32-bit words, options included
    pub data_offset: u8,
    pub ctl: Control,
    /// Octets the sender can still take, counted from `ack`
    pub wnd: u16,
    pub checksum: u16,
    /// The urgent pointer. Carried on the wire but never acted upon.
    pub urg: u16,
    /// The maximum segment size option, only meaningful on SYN segments
    pub mss: Option<u16>,
}

impl TcpHeader {
    /// Parses a serialized TCP segment, verifying its checksum against the
    /// pseudo-header for `src_address` and `dst_address`. Returns the header
    /// and the segment text.
    pub fn from_bytes(
        packet: &[u8],
        src_address: IpAddress,
        dst_address: IpAddress,
    ) -> Result<(Self, &[u8]), ParseError> {
        if packet.len() < BASE_HEADER_OCTETS {
            Err(ParseError::HeaderTooShort)?
        }
        let length: u32 = packet
            .len()
            .try_into()
            .map_err(|_| ParseError::PacketTooLong)?;
        if matches!(src_address, IpAddress::V4(_)) && length > u16::MAX as u32 {
            Err(ParseError::PacketTooLong)?
        }

        let u16_at = |i: usize| u16::from_be_bytes([packet[i], packet[i + 1]]);
        let u32_at =
            |i: usize| u32::from_be_bytes([packet[i], packet[i + 1], packet[i + 2], packet[i + 3]]);

        let data_offset = packet[12] >> 4;
        let header_len = data_offset as usize * 4;
        if data_offset < BASE_HEADER_WORDS || header_len > packet.len() {
            Err(ParseError::DataOffset(data_offset))?
        }

        let expected_checksum = u16_at(16);
        let mut checksum = Checksum::new();
        checksum.add_bytes(&packet[..16]);
        checksum.add_bytes(&packet[18..]);
        checksum.add_pseudo_header(src_address, dst_address, TCP_PROTOCOL, length);
        let checksum = checksum.as_u16();
        if checksum != expected_checksum {
            Err(ParseError::Checksum {
                actual: checksum,
                expected: expected_checksum,
            })?
        }

        let header = TcpHeader {
            src_port: u16_at(0),
            dst_port: u16_at(2),
            seq: u32_at(4),
            ack: u32_at(8),
            data_offset,
            ctl: Control::from(packet[13] & 0b11_1111),
            wnd: u16_at(14),
            checksum,
            urg: u16_at(18),
            mss: parse_mss(&packet[BASE_HEADER_OCTETS..header_len]),
        };
        Ok((header, &packet[header_len..]))
    }

    /// Size of the header in bytes
    pub fn bytes(&self) -> usize {
        self.data_offset as usize * 4
    }

    /// Convert the header to its native serialized format, ready to attach to a
    /// packet and send over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes().max(BASE_HEADER_OCTETS));
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(self.data_offset << 4);
        out.push(self.ctl.into());
        out.extend_from_slice(&self.wnd.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.urg.to_be_bytes());
        if let Some(mss) = self.mss {
            out.extend_from_slice(&[OPTION_MSS, OPTION_MSS_LEN]);
            out.extend_from_slice(&mss.to_be_bytes());
        }
        out
    }
}

/// Walks the option list looking for an MSS option. Unknown options are
/// skipped by their length byte. A malformed list ends the walk and keeps
/// whatever was found before it.
fn parse_mss(mut options: &[u8]) -> Option<u16> {
    let mut mss = None;
    while let Some(&kind) = options.first() {
        match kind {
            OPTION_END => break,
            OPTION_NOP => options = &options[1..],
            _ => {
                let Some(&len) = options.get(1) else {
                    break;
                };
                let len = len as usize;
                if len < 2 || len > options.len() {
                    tracing::debug!(kind, len, "Malformed TCP option list");
                    break;
                }
                if kind == OPTION_MSS && len == OPTION_MSS_LEN as usize {
                    mss = Some(u16::from_be_bytes([options[2], options[3]]));
                }
                options = &options[len..];
            }
        }
    }
    mss
}

/// An error that occurred while parsing a TCP header
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("Too few bytes to constitute a TCP header")]
    HeaderTooShort,
    #[error("The packet is longer than the IP pseudo-header can describe")]
    PacketTooLong,
    #[error("Data offset of {0} words does not fit the packet")]
    DataOffset(u8),
    #[error(
        "The computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
}

/// Used for building a serialized TCP header
#[derive(Debug, Clone, Copy)]
pub struct TcpHeaderBuilder(TcpHeader);

impl TcpHeaderBuilder {
    /// Initialize the TCP header with defaults and the given values
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self(TcpHeader {
            src_port,
            dst_port,
            seq,
            wnd: 0,
            ack: 0,
            urg: 0,
            ctl: Control::default(),
            mss: None,

            // Filled in by .build()
            data_offset: 0,
            checksum: 0,
        })
    }

    /// Set the window size
    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    /// Set the acknowledgement number
    pub fn ack(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self.0.ctl.set_ack(true);
        self
    }

    /// Set the psh bit up
    pub fn psh(mut self) -> Self {
        self.0.ctl.set_psh(true);
        self
    }

    /// Set the rst bit up
    pub fn rst(mut self) -> Self {
        self.0.ctl.set_rst(true);
        self
    }

    /// Set the syn bit up
    pub fn syn(mut self) -> Self {
        self.0.ctl.set_syn(true);
        self
    }

    /// Set the fin bit up
    pub fn fin(mut self) -> Self {
        self.0.ctl.set_fin(true);
        self
    }

    /// Attach a maximum segment size option
    pub fn mss(mut self, mss: u16) -> Self {
        self.0.mss = Some(mss);
        self
    }

    /// Get the finished header with its checksum computed over `text` and the
    /// pseudo-header
    pub fn build(
        self,
        src_address: IpAddress,
        dst_address: IpAddress,
        text: &[u8],
    ) -> Result<TcpHeader, BuildHeaderError> {
        let mut header = self.0;
        header.data_offset = BASE_HEADER_WORDS + header.mss.is_some() as u8;
        header.checksum = 0;

        let length = text.len() + header.bytes();
        let limit = match src_address {
            IpAddress::V4(_) => u16::MAX as usize,
            IpAddress::V6(_) => u32::MAX as usize,
        };
        if length > limit {
            Err(BuildHeaderError::OverlyLongPayload)?
        }

        let mut checksum = Checksum::new();
        checksum.add_bytes(&header.serialize());
        checksum.add_bytes(text);
        checksum.add_pseudo_header(src_address, dst_address, TCP_PROTOCOL, length as u32);
        header.checksum = checksum.as_u16();
        Ok(header)
    }
}

/// An error that occurred while building a TCP header
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum BuildHeaderError {
    #[error("The TCP payload is longer than can fit into a single packet")]
    OverlyLongPayload,
}

/// The control bits of a TCP header
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

/// Generates a getter and a setter for one control bit
macro_rules! control_bit {
    ($bit:literal, $get:ident, $set:ident, $doc:literal) => {
        #[doc = concat!("Whether ", $doc)]
        pub const fn $get(self) -> bool {
            self.bit($bit)
        }

        #[doc = concat!("Sets whether ", $doc)]
        pub fn $set(&mut self, state: bool) {
            self.set_bit($bit, state);
        }
    };
}

impl Control {
    /// Packs the six flags, most significant first
    pub const fn new(urg: bool, ack: bool, psh: bool, rst: bool, syn: bool, fin: bool) -> Self {
        let flags = [fin, syn, rst, psh, ack, urg];
        let mut bits = 0;
        let mut i = 0;
        while i < flags.len() {
            bits |= (flags[i] as u8) << i;
            i += 1;
        }
        Self(bits)
    }

    control_bit!(5, urg, set_urg, "the urgent pointer is significant");
    control_bit!(4, ack, set_ack, "the acknowledgement number is significant");
    control_bit!(3, psh, set_psh, "the sender asked for a push");
    control_bit!(2, rst, set_rst, "the connection is being reset");
    control_bit!(1, syn, set_syn, "the segment synchronizes sequence numbers");
    control_bit!(0, fin, set_fin, "the sender has finished sending");

    /// Whether this is a bare SYN, the only segment a listener accepts
    pub const fn is_connection_request(self) -> bool {
        self.syn() && !self.ack() && !self.rst() && !self.fin()
    }

    const fn bit(self, bit: u8) -> bool {
        self.0 & (1 << bit) != 0
    }

    fn set_bit(&mut self, bit: u8, state: bool) {
        if state {
            self.0 |= 1 << bit;
        } else {
            self.0 &= !(1 << bit);
        }
    }
}

impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [&str; 6] = ["FIN", "SYN", "RST", "PSH", "ACK", "URG"];
        let set: Vec<_> = (0..NAMES.len() as u8)
            .rev()
            .filter(|&bit| self.bit(bit))
            .map(|bit| NAMES[bit as usize])
            .collect();
        write!(f, "Control({})", set.join(", "))
    }
}
