//! PackStream, the binary value format carried inside Bolt messages.
//!
//! Big-endian throughout. Integers always use the narrowest encoding that
//! holds them exactly; floats are always 64-bit.

pub mod decode;
pub mod encode;
pub mod marker;

pub use decode::{decode_exact, decode_value};
pub use encode::encode_value;
