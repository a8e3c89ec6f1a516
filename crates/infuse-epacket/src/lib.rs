//! # infuse-epacket
//!
//! The ePacket envelope: authenticated, versioned packet framing used on
//! every Infuse-IoT transport. This crate owns
//!
//! - the serial frame reconstructor separating sync-delimited binary frames
//!   from interleaved console output,
//! - the ChaCha20-Poly1305 envelope with its exact header/AD/nonce split,
//! - the version-0 header codec, and
//! - packet decode/encode, including the nested `RECEIVED_EPACKET` container
//!   a gateway uses to report traffic it overheard on other interfaces.

pub mod crypto;
pub mod frame;
pub mod header;
pub mod packet;

pub use frame::FrameReconstructor;
pub use header::{Flags, PacketHeader};
pub use packet::{DecodeError, HopOutput, HopReceived, PacketOutput, PacketReceived};
