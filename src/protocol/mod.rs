//! Inter-proxy link protocol.
//!
//! # Data Flow
//! ```text
//! Ship                                        Offshore
//!   request bytes ──frame.rs──▶ [len32|payload] ──frame.rs──▶ request bytes
//!   response bytes ◀──frame.rs── [len32|payload] ◀──frame.rs── response bytes
//!
//! After "200 Connection Established":
//!   client ◀──bridge.rs──▶ link (raw bytes) ◀──bridge.rs──▶ origin
//! ```
//!
//! # Design Decisions
//! - Frames are length-prefixed with a big-endian u32, nothing else
//! - Oversized or truncated frames poison the link
//! - Bridging is raw; a link that carried a tunnel is not reused for frames

pub mod bridge;
pub mod frame;

pub use bridge::{bridge, BridgeEnd, BridgeOutcome, Direction};
pub use frame::{FrameCodec, FrameError, DEFAULT_MAX_FRAME_BYTES};
