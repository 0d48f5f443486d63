//! PackStream marker byte constants.

pub const NULL: u8 = 0xC0;

pub const FALSE: u8 = 0xC2;
pub const TRUE: u8 = 0xC3;

/// IEEE 754 double-precision, always eight bytes.
pub const FLOAT_64: u8 = 0xC1;

// TINY_INT is the marker byte itself: 0x00..=0x7F and 0xF0..=0xFF.
pub const TINY_INT_MIN: i64 = -16;
pub const TINY_INT_MAX: i64 = 127;

pub const INT_8: u8 = 0xC8;
pub const INT_16: u8 = 0xC9;
pub const INT_32: u8 = 0xCA;
pub const INT_64: u8 = 0xCB;

pub const BYTES_8: u8 = 0xCC;
pub const BYTES_16: u8 = 0xCD;
pub const BYTES_32: u8 = 0xCE;

pub const STRING_8: u8 = 0xD0;
pub const STRING_16: u8 = 0xD1;
pub const STRING_32: u8 = 0xD2;

pub const LIST_8: u8 = 0xD4;
pub const LIST_16: u8 = 0xD5;
pub const LIST_32: u8 = 0xD6;

pub const DICT_8: u8 = 0xD8;
pub const DICT_16: u8 = 0xD9;
pub const DICT_32: u8 = 0xDA;

// High nibbles of the tiny forms; the low nibble is the size (0..=15).
pub const TINY_STRING_NIBBLE: u8 = 0x80;
pub const TINY_LIST_NIBBLE: u8 = 0x90;
pub const TINY_DICT_NIBBLE: u8 = 0xA0;
pub const TINY_STRUCT_NIBBLE: u8 = 0xB0;
