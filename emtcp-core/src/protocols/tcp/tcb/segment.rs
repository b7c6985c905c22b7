use crate::protocols::tcp::tcp_parsing::TcpHeader;

/// A TCP header together with the text it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: TcpHeader,
    pub text: Vec<u8>,
}

impl Segment {
    pub fn new(header: TcpHeader, text: impl Into<Vec<u8>>) -> Self {
        Self {
            header,
            text: text.into(),
        }
    }

    /// The header followed by the text, ready for the network layer
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.header.serialize();
        out.extend_from_slice(&self.text);
        out
    }
}
