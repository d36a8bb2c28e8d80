//! Codec for the recorded velocity commands.
//!
//! A record is CDR encoded: a 4 byte encapsulation header whose representation identifier
//! declares the byte order, followed by the linear and the angular velocity as 8-byte aligned
//! doubles.
//!
//! ```text
//! 0       2       4               12              20
//! ┌───────┬───────┬───────────────┬───────────────┐
//! │ repr  │ opts  │ linear (f64)  │ angular (f64) │
//! └───────┴───────┴───────────────┴───────────────┘
//! ```
use cdr::{CdrBe, CdrLe, Infinite};
use common::robot::Twist;
use serde::{Deserialize, Serialize};

/// Records shorter than this cannot hold two doubles and are never handed to the decoder.
pub const MIN_RECORD_LEN: usize = 16;

/// The record could not be decoded (truncated payload or unknown encapsulation).
#[derive(Debug, thiserror::Error)]
#[error("malformed velocity command: {0}")]
pub struct DecodeError(#[from] cdr::Error);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Serialize, Deserialize)]
struct VelocityCommand {
    linear: f64,
    angular: f64,
}

/// Decodes one record into the commanded body velocity.
///
/// The encapsulation header only selects the byte order, its option bytes are ignored.
/// Bytes after the two velocities are ignored as well.
pub fn decode_twist(bytes: &[u8]) -> Result<Twist, DecodeError> {
    let cmd: VelocityCommand = cdr::deserialize(bytes)?;
    Ok(Twist::new(cmd.linear, cmd.angular))
}

/// Encodes a record the way the recorder writes them.
pub fn encode_twist(twist: Twist, order: ByteOrder) -> cdr::Result<Vec<u8>> {
    let cmd = VelocityCommand {
        linear: twist.linear,
        angular: twist.angular,
    };
    match order {
        ByteOrder::Little => cdr::serialize::<_, _, CdrLe>(&cmd, Infinite),
        ByteOrder::Big => cdr::serialize::<_, _, CdrBe>(&cmd, Infinite),
    }
}
