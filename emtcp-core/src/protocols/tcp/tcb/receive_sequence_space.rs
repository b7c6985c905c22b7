//     1          2          3
// ----------|----------|----------
//        RCV.NXT    RCV.NXT
//                  +RCV.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers allowed for new reception
// 3 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct ReceiveSequenceSpace {
    /// Next sequence number expected on an incoming segment
    pub nxt: u32,
    /// The window advertised to the peer
    pub wnd: u16,
    /// Initial receive sequence number
    pub irs: u32,
}
