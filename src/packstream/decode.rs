//! PackStream decoding: bytes → `BoltValue`.
//!
//! Every failure is a [`DriverError::MalformedMessage`]: the input came from
//! the network, so a bad byte means the stream can no longer be trusted.

use bytes::Buf;

use super::marker;
use crate::error::DriverError;
use crate::types::{
    tag, BoltDate, BoltDateTime, BoltDateTimeZoneId, BoltDict, BoltDuration, BoltLocalDateTime,
    BoltLocalTime, BoltNode, BoltPath, BoltPoint2D, BoltPoint3D, BoltRelationship, BoltStructure,
    BoltTime, BoltUnboundRelationship, BoltValue,
};

/// Nesting limit for lists, dicts and structures.
pub const MAX_DEPTH: usize = 512;

/// Decodes a single `BoltValue` from the buffer.
pub fn decode_value(buf: &mut impl Buf) -> Result<BoltValue, DriverError> {
    decode_nested(buf, 0)
}

/// Decodes one value and requires the buffer to be fully consumed.
pub fn decode_exact(mut data: &[u8]) -> Result<BoltValue, DriverError> {
    let value = decode_value(&mut data)?;
    if data.has_remaining() {
        return Err(DriverError::malformed(format!(
            "{} trailing bytes after value",
            data.remaining()
        )));
    }
    Ok(value)
}

fn decode_nested(buf: &mut impl Buf, depth: usize) -> Result<BoltValue, DriverError> {
    if depth > MAX_DEPTH {
        return Err(DriverError::malformed(format!(
            "values nested deeper than {MAX_DEPTH}"
        )));
    }
    ensure_remaining(buf, 1)?;

    let m = buf.get_u8();
    match m {
        marker::NULL => Ok(BoltValue::Null),
        marker::FALSE => Ok(BoltValue::Boolean(false)),
        marker::TRUE => Ok(BoltValue::Boolean(true)),

        marker::FLOAT_64 => {
            ensure_remaining(buf, 8)?;
            Ok(BoltValue::Float(buf.get_f64()))
        }

        marker::INT_8 => {
            ensure_remaining(buf, 1)?;
            Ok(BoltValue::Integer(i64::from(buf.get_i8())))
        }
        marker::INT_16 => {
            ensure_remaining(buf, 2)?;
            Ok(BoltValue::Integer(i64::from(buf.get_i16())))
        }
        marker::INT_32 => {
            ensure_remaining(buf, 4)?;
            Ok(BoltValue::Integer(i64::from(buf.get_i32())))
        }
        marker::INT_64 => {
            ensure_remaining(buf, 8)?;
            Ok(BoltValue::Integer(buf.get_i64()))
        }

        marker::BYTES_8 | marker::BYTES_16 | marker::BYTES_32 => {
            let len = read_size(buf, m - marker::BYTES_8)?;
            ensure_remaining(buf, len)?;
            let mut data = vec![0u8; len];
            buf.copy_to_slice(&mut data);
            Ok(BoltValue::Bytes(data))
        }
        marker::STRING_8 | marker::STRING_16 | marker::STRING_32 => {
            let len = read_size(buf, m - marker::STRING_8)?;
            decode_string_data(buf, len)
        }
        marker::LIST_8 | marker::LIST_16 | marker::LIST_32 => {
            let len = read_size(buf, m - marker::LIST_8)?;
            decode_list_data(buf, len, depth)
        }
        marker::DICT_8 | marker::DICT_16 | marker::DICT_32 => {
            let len = read_size(buf, m - marker::DICT_8)?;
            decode_dict_data(buf, len, depth)
        }

        _ => {
            let low = (m & 0x0F) as usize;
            match m & 0xF0 {
                marker::TINY_STRING_NIBBLE => decode_string_data(buf, low),
                marker::TINY_LIST_NIBBLE => decode_list_data(buf, low, depth),
                marker::TINY_DICT_NIBBLE => decode_dict_data(buf, low, depth),
                marker::TINY_STRUCT_NIBBLE => {
                    ensure_remaining(buf, 1)?;
                    let tag_byte = buf.get_u8();
                    let fields = (0..low)
                        .map(|_| decode_nested(buf, depth + 1))
                        .collect::<Result<Vec<_>, _>>()?;
                    hydrate(tag_byte, fields)
                }
                _ if m <= 0x7F => Ok(BoltValue::Integer(i64::from(m))),
                _ if m >= 0xF0 => Ok(BoltValue::Integer(i64::from(m as i8))),
                _ => Err(DriverError::malformed(format!(
                    "unknown PackStream marker: 0x{m:02X}"
                ))),
            }
        }
    }
}

/// Reads the size that follows an 8/16/32-bit sized marker. `width` is the
/// marker's offset from its family's 8-bit marker (0, 1 or 2).
fn read_size(buf: &mut impl Buf, width: u8) -> Result<usize, DriverError> {
    match width {
        0 => {
            ensure_remaining(buf, 1)?;
            Ok(buf.get_u8() as usize)
        }
        1 => {
            ensure_remaining(buf, 2)?;
            Ok(buf.get_u16() as usize)
        }
        _ => {
            ensure_remaining(buf, 4)?;
            Ok(buf.get_u32() as usize)
        }
    }
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), DriverError> {
    if buf.remaining() < needed {
        Err(DriverError::malformed(format!(
            "need {needed} bytes but only {} remaining",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn decode_string_data(buf: &mut impl Buf, len: usize) -> Result<BoltValue, DriverError> {
    ensure_remaining(buf, len)?;
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    let s = String::from_utf8(data)
        .map_err(|e| DriverError::malformed(format!("invalid UTF-8 string: {e}")))?;
    Ok(BoltValue::String(s))
}

fn decode_list_data(
    buf: &mut impl Buf,
    len: usize,
    depth: usize,
) -> Result<BoltValue, DriverError> {
    // Every item takes at least one byte; cap the allocation by what is left.
    let mut items = Vec::with_capacity(len.min(buf.remaining()));
    for _ in 0..len {
        items.push(decode_nested(buf, depth + 1)?);
    }
    Ok(BoltValue::List(items))
}

fn decode_dict_data(
    buf: &mut impl Buf,
    len: usize,
    depth: usize,
) -> Result<BoltValue, DriverError> {
    let mut dict = BoltDict::with_capacity(len.min(buf.remaining() / 2));
    for _ in 0..len {
        let key = match decode_nested(buf, depth + 1)? {
            BoltValue::String(s) => s,
            other => {
                return Err(DriverError::malformed(format!(
                    "dict key must be a string, got: {other}"
                )));
            }
        };
        let value = decode_nested(buf, depth + 1)?;
        dict.insert(key, value);
    }
    Ok(BoltValue::Dict(dict))
}

/// Turns a decoded structure into its typed form. Unknown tags are kept as
/// [`BoltStructure`] so newer servers can add types without breaking us.
fn hydrate(tag_byte: u8, fields: Vec<BoltValue>) -> Result<BoltValue, DriverError> {
    let mut f = Fields::new(tag_byte, fields);
    let value = match tag_byte {
        tag::NODE => BoltValue::Node(node_from(&mut f)?),
        tag::RELATIONSHIP => {
            f.require_at_least(5)?;
            let id = f.int()?;
            let start_node_id = f.int()?;
            let end_node_id = f.int()?;
            let rel_type = f.string()?;
            let properties = f.dict()?;
            // Bolt < 5 omits element ids; derive them from the numeric ids.
            let element_id = f.opt_string()?.unwrap_or_else(|| id.to_string());
            let start_element_id = f.opt_string()?.unwrap_or_else(|| start_node_id.to_string());
            let end_element_id = f.opt_string()?.unwrap_or_else(|| end_node_id.to_string());
            BoltValue::Relationship(BoltRelationship {
                id,
                start_node_id,
                end_node_id,
                rel_type,
                properties,
                element_id,
                start_element_id,
                end_element_id,
            })
        }
        tag::UNBOUND_RELATIONSHIP => BoltValue::UnboundRelationship(unbound_from(&mut f)?),
        tag::PATH => {
            f.require_at_least(3)?;
            let nodes = f
                .list()?
                .into_iter()
                .map(|v| match v {
                    BoltValue::Node(n) => Ok(n),
                    other => Err(DriverError::malformed(format!(
                        "path nodes must be Node, got: {other}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let rels = f
                .list()?
                .into_iter()
                .map(|v| match v {
                    BoltValue::UnboundRelationship(r) => Ok(r),
                    other => Err(DriverError::malformed(format!(
                        "path rels must be UnboundRelationship, got: {other}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let indices = f
                .list()?
                .into_iter()
                .map(|v| {
                    v.as_int().ok_or_else(|| {
                        DriverError::malformed(format!("path index must be int, got: {v}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            BoltValue::Path(BoltPath {
                nodes,
                rels,
                indices,
            })
        }
        tag::DATE => {
            f.require_at_least(1)?;
            BoltValue::Date(BoltDate { days: f.int()? })
        }
        tag::TIME => {
            f.require_at_least(2)?;
            BoltValue::Time(BoltTime {
                nanoseconds: f.int()?,
                tz_offset_seconds: f.int()?,
            })
        }
        tag::LOCAL_TIME => {
            f.require_at_least(1)?;
            BoltValue::LocalTime(BoltLocalTime {
                nanoseconds: f.int()?,
            })
        }
        tag::DATE_TIME => {
            f.require_at_least(3)?;
            BoltValue::DateTime(BoltDateTime {
                seconds: f.int()?,
                nanoseconds: f.int()?,
                tz_offset_seconds: f.int()?,
            })
        }
        tag::DATE_TIME_ZONE_ID => {
            f.require_at_least(3)?;
            BoltValue::DateTimeZoneId(BoltDateTimeZoneId {
                seconds: f.int()?,
                nanoseconds: f.int()?,
                tz_id: f.string()?,
            })
        }
        tag::LOCAL_DATE_TIME => {
            f.require_at_least(2)?;
            BoltValue::LocalDateTime(BoltLocalDateTime {
                seconds: f.int()?,
                nanoseconds: f.int()?,
            })
        }
        tag::DURATION => {
            f.require_at_least(4)?;
            BoltValue::Duration(BoltDuration {
                months: f.int()?,
                days: f.int()?,
                seconds: f.int()?,
                nanoseconds: f.int()?,
            })
        }
        tag::POINT_2D => {
            f.require_at_least(3)?;
            BoltValue::Point2D(BoltPoint2D {
                srid: f.int()?,
                x: f.float()?,
                y: f.float()?,
            })
        }
        tag::POINT_3D => {
            f.require_at_least(4)?;
            BoltValue::Point3D(BoltPoint3D {
                srid: f.int()?,
                x: f.float()?,
                y: f.float()?,
                z: f.float()?,
            })
        }
        _ => {
            return Ok(BoltValue::Structure(BoltStructure {
                tag: tag_byte,
                fields: f.into_rest(),
            }));
        }
    };
    f.finish()?;
    Ok(value)
}

fn node_from(f: &mut Fields) -> Result<BoltNode, DriverError> {
    f.require_at_least(3)?;
    let id = f.int()?;
    let labels = f
        .list()?
        .into_iter()
        .map(|v| match v {
            BoltValue::String(s) => Ok(s),
            other => Err(DriverError::malformed(format!(
                "node label must be string, got: {other}"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let properties = f.dict()?;
    let element_id = f.opt_string()?.unwrap_or_else(|| id.to_string());
    Ok(BoltNode {
        id,
        labels,
        properties,
        element_id,
    })
}

fn unbound_from(f: &mut Fields) -> Result<BoltUnboundRelationship, DriverError> {
    f.require_at_least(3)?;
    let id = f.int()?;
    let rel_type = f.string()?;
    let properties = f.dict()?;
    let element_id = f.opt_string()?.unwrap_or_else(|| id.to_string());
    Ok(BoltUnboundRelationship {
        id,
        rel_type,
        properties,
        element_id,
    })
}

/// Cursor over a structure's fields with typed extraction.
struct Fields {
    tag: u8,
    iter: std::vec::IntoIter<BoltValue>,
}

impl Fields {
    fn new(tag: u8, fields: Vec<BoltValue>) -> Self {
        Self {
            tag,
            iter: fields.into_iter(),
        }
    }

    fn require_at_least(&self, n: usize) -> Result<(), DriverError> {
        if self.iter.len() < n {
            Err(DriverError::malformed(format!(
                "structure 0x{:02X} needs at least {n} fields, got {}",
                self.tag,
                self.iter.len()
            )))
        } else {
            Ok(())
        }
    }

    fn next(&mut self) -> Result<BoltValue, DriverError> {
        self.iter.next().ok_or_else(|| {
            DriverError::malformed(format!("structure 0x{:02X} is missing fields", self.tag))
        })
    }

    fn int(&mut self) -> Result<i64, DriverError> {
        match self.next()? {
            BoltValue::Integer(i) => Ok(i),
            other => Err(self.mismatch("int", &other)),
        }
    }

    fn float(&mut self) -> Result<f64, DriverError> {
        match self.next()? {
            BoltValue::Float(v) => Ok(v),
            other => Err(self.mismatch("float", &other)),
        }
    }

    fn string(&mut self) -> Result<String, DriverError> {
        match self.next()? {
            BoltValue::String(s) => Ok(s),
            other => Err(self.mismatch("string", &other)),
        }
    }

    fn opt_string(&mut self) -> Result<Option<String>, DriverError> {
        match self.iter.next() {
            None => Ok(None),
            Some(BoltValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.mismatch("string", &other)),
        }
    }

    fn dict(&mut self) -> Result<BoltDict, DriverError> {
        match self.next()? {
            BoltValue::Dict(d) => Ok(d),
            other => Err(self.mismatch("dict", &other)),
        }
    }

    fn list(&mut self) -> Result<Vec<BoltValue>, DriverError> {
        match self.next()? {
            BoltValue::List(l) => Ok(l),
            other => Err(self.mismatch("list", &other)),
        }
    }

    fn into_rest(self) -> Vec<BoltValue> {
        self.iter.collect()
    }

    fn finish(self) -> Result<(), DriverError> {
        match self.iter.len() {
            0 => Ok(()),
            extra => Err(DriverError::malformed(format!(
                "structure 0x{:02X} has {extra} unexpected extra fields",
                self.tag
            ))),
        }
    }

    fn mismatch(&self, expected: &str, got: &BoltValue) -> DriverError {
        DriverError::malformed(format!(
            "structure 0x{:02X}: expected {expected}, got: {got}",
            self.tag
        ))
    }
}
