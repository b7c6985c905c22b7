//! Prebuilt simulation setups for testing and demonstration.

mod handshake;
pub use handshake::handshake;

mod transfer;
pub use transfer::{transfer, TransferReport};

mod refused;
pub use refused::refused;
