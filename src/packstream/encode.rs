//! PackStream encoding: `BoltValue` → bytes.

use bytes::{BufMut, BytesMut};

use super::marker;
use crate::error::DriverError;
use crate::types::{
    tag, BoltDict, BoltNode, BoltPath, BoltRelationship, BoltStructure, BoltUnboundRelationship,
    BoltValue,
};

/// Largest field count a structure header can carry.
pub const MAX_STRUCT_FIELDS: usize = 15;

/// Encodes a `BoltValue` into the buffer using PackStream format.
///
/// Fails only for values PackStream cannot represent: collections longer than
/// `u32::MAX` and structures with more than fifteen fields.
pub fn encode_value(buf: &mut BytesMut, value: &BoltValue) -> Result<(), DriverError> {
    match value {
        BoltValue::Null => encode_null(buf),
        BoltValue::Boolean(b) => encode_bool(buf, *b),
        BoltValue::Integer(i) => encode_int(buf, *i),
        BoltValue::Float(f) => encode_float(buf, *f),
        BoltValue::String(s) => encode_string(buf, s)?,
        BoltValue::Bytes(b) => encode_bytes(buf, b)?,
        BoltValue::List(items) => encode_list(buf, items)?,
        BoltValue::Dict(dict) => encode_dict(buf, dict)?,
        BoltValue::Node(n) => encode_node(buf, n)?,
        BoltValue::Relationship(r) => encode_relationship(buf, r)?,
        BoltValue::UnboundRelationship(r) => encode_unbound_relationship(buf, r)?,
        BoltValue::Path(p) => encode_path(buf, p)?,
        BoltValue::Date(d) => {
            encode_struct_header(buf, tag::DATE, 1)?;
            encode_int(buf, d.days);
        }
        BoltValue::Time(t) => {
            encode_struct_header(buf, tag::TIME, 2)?;
            encode_int(buf, t.nanoseconds);
            encode_int(buf, t.tz_offset_seconds);
        }
        BoltValue::LocalTime(t) => {
            encode_struct_header(buf, tag::LOCAL_TIME, 1)?;
            encode_int(buf, t.nanoseconds);
        }
        BoltValue::DateTime(dt) => {
            encode_struct_header(buf, tag::DATE_TIME, 3)?;
            encode_int(buf, dt.seconds);
            encode_int(buf, dt.nanoseconds);
            encode_int(buf, dt.tz_offset_seconds);
        }
        BoltValue::DateTimeZoneId(dt) => {
            encode_struct_header(buf, tag::DATE_TIME_ZONE_ID, 3)?;
            encode_int(buf, dt.seconds);
            encode_int(buf, dt.nanoseconds);
            encode_string(buf, &dt.tz_id)?;
        }
        BoltValue::LocalDateTime(dt) => {
            encode_struct_header(buf, tag::LOCAL_DATE_TIME, 2)?;
            encode_int(buf, dt.seconds);
            encode_int(buf, dt.nanoseconds);
        }
        BoltValue::Duration(d) => {
            encode_struct_header(buf, tag::DURATION, 4)?;
            encode_int(buf, d.months);
            encode_int(buf, d.days);
            encode_int(buf, d.seconds);
            encode_int(buf, d.nanoseconds);
        }
        BoltValue::Point2D(p) => {
            encode_struct_header(buf, tag::POINT_2D, 3)?;
            encode_int(buf, p.srid);
            encode_float(buf, p.x);
            encode_float(buf, p.y);
        }
        BoltValue::Point3D(p) => {
            encode_struct_header(buf, tag::POINT_3D, 4)?;
            encode_int(buf, p.srid);
            encode_float(buf, p.x);
            encode_float(buf, p.y);
            encode_float(buf, p.z);
        }
        BoltValue::Structure(s) => encode_structure(buf, s)?,
    }
    Ok(())
}

pub fn encode_null(buf: &mut BytesMut) {
    buf.put_u8(marker::NULL);
}

pub fn encode_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { marker::TRUE } else { marker::FALSE });
}

/// Encodes an integer using the smallest possible PackStream representation.
pub fn encode_int(buf: &mut BytesMut, value: i64) {
    if (marker::TINY_INT_MIN..=marker::TINY_INT_MAX).contains(&value) {
        buf.put_u8(value as u8);
    } else if let Ok(v) = i8::try_from(value) {
        buf.put_u8(marker::INT_8);
        buf.put_i8(v);
    } else if let Ok(v) = i16::try_from(value) {
        buf.put_u8(marker::INT_16);
        buf.put_i16(v);
    } else if let Ok(v) = i32::try_from(value) {
        buf.put_u8(marker::INT_32);
        buf.put_i32(v);
    } else {
        buf.put_u8(marker::INT_64);
        buf.put_i64(value);
    }
}

pub fn encode_float(buf: &mut BytesMut, value: f64) {
    buf.put_u8(marker::FLOAT_64);
    buf.put_f64(value);
}

/// Encodes a string (size = byte length, not char count).
pub fn encode_string(buf: &mut BytesMut, value: &str) -> Result<(), DriverError> {
    encode_sized_header(
        buf,
        value.len(),
        marker::TINY_STRING_NIBBLE,
        [marker::STRING_8, marker::STRING_16, marker::STRING_32],
    )?;
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Byte arrays have no tiny form.
pub fn encode_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<(), DriverError> {
    let len = value.len();
    if let Ok(n) = u8::try_from(len) {
        buf.put_u8(marker::BYTES_8);
        buf.put_u8(n);
    } else if let Ok(n) = u16::try_from(len) {
        buf.put_u8(marker::BYTES_16);
        buf.put_u16(n);
    } else {
        buf.put_u8(marker::BYTES_32);
        buf.put_u32(size_u32(len)?);
    }
    buf.put_slice(value);
    Ok(())
}

pub fn encode_list(buf: &mut BytesMut, items: &[BoltValue]) -> Result<(), DriverError> {
    encode_list_header(buf, items.len())?;
    for item in items {
        encode_value(buf, item)?;
    }
    Ok(())
}

pub fn encode_dict(buf: &mut BytesMut, dict: &BoltDict) -> Result<(), DriverError> {
    encode_sized_header(
        buf,
        dict.len(),
        marker::TINY_DICT_NIBBLE,
        [marker::DICT_8, marker::DICT_16, marker::DICT_32],
    )?;
    for (key, value) in dict {
        encode_string(buf, key)?;
        encode_value(buf, value)?;
    }
    Ok(())
}

/// Encodes a structure header: marker byte (0xBn) + tag byte.
pub fn encode_struct_header(
    buf: &mut BytesMut,
    tag_byte: u8,
    field_count: usize,
) -> Result<(), DriverError> {
    if field_count > MAX_STRUCT_FIELDS {
        return Err(DriverError::client(format!(
            "structure 0x{tag_byte:02X} has {field_count} fields, at most {MAX_STRUCT_FIELDS} allowed"
        )));
    }
    buf.put_u8(marker::TINY_STRUCT_NIBBLE | field_count as u8);
    buf.put_u8(tag_byte);
    Ok(())
}

fn encode_list_header(buf: &mut BytesMut, len: usize) -> Result<(), DriverError> {
    encode_sized_header(
        buf,
        len,
        marker::TINY_LIST_NIBBLE,
        [marker::LIST_8, marker::LIST_16, marker::LIST_32],
    )
}

/// Shared header layout of strings, lists and dicts: a tiny nibble form for
/// sizes below 16, then 8/16/32-bit size markers.
fn encode_sized_header(
    buf: &mut BytesMut,
    len: usize,
    tiny_nibble: u8,
    markers: [u8; 3],
) -> Result<(), DriverError> {
    if len <= 15 {
        buf.put_u8(tiny_nibble | len as u8);
    } else if let Ok(n) = u8::try_from(len) {
        buf.put_u8(markers[0]);
        buf.put_u8(n);
    } else if let Ok(n) = u16::try_from(len) {
        buf.put_u8(markers[1]);
        buf.put_u16(n);
    } else {
        buf.put_u8(markers[2]);
        buf.put_u32(size_u32(len)?);
    }
    Ok(())
}

fn size_u32(len: usize) -> Result<u32, DriverError> {
    u32::try_from(len)
        .map_err(|_| DriverError::client(format!("value of size {len} exceeds PackStream limits")))
}

// -- Graph structure encoding --

fn encode_node(buf: &mut BytesMut, n: &BoltNode) -> Result<(), DriverError> {
    encode_struct_header(buf, tag::NODE, 4)?;
    encode_int(buf, n.id);
    encode_list_header(buf, n.labels.len())?;
    for label in &n.labels {
        encode_string(buf, label)?;
    }
    encode_dict(buf, &n.properties)?;
    encode_string(buf, &n.element_id)
}

fn encode_relationship(buf: &mut BytesMut, r: &BoltRelationship) -> Result<(), DriverError> {
    encode_struct_header(buf, tag::RELATIONSHIP, 8)?;
    encode_int(buf, r.id);
    encode_int(buf, r.start_node_id);
    encode_int(buf, r.end_node_id);
    encode_string(buf, &r.rel_type)?;
    encode_dict(buf, &r.properties)?;
    encode_string(buf, &r.element_id)?;
    encode_string(buf, &r.start_element_id)?;
    encode_string(buf, &r.end_element_id)
}

fn encode_unbound_relationship(
    buf: &mut BytesMut,
    r: &BoltUnboundRelationship,
) -> Result<(), DriverError> {
    encode_struct_header(buf, tag::UNBOUND_RELATIONSHIP, 4)?;
    encode_int(buf, r.id);
    encode_string(buf, &r.rel_type)?;
    encode_dict(buf, &r.properties)?;
    encode_string(buf, &r.element_id)
}

fn encode_path(buf: &mut BytesMut, p: &BoltPath) -> Result<(), DriverError> {
    encode_struct_header(buf, tag::PATH, 3)?;
    encode_list_header(buf, p.nodes.len())?;
    for node in &p.nodes {
        encode_node(buf, node)?;
    }
    encode_list_header(buf, p.rels.len())?;
    for rel in &p.rels {
        encode_unbound_relationship(buf, rel)?;
    }
    encode_list_header(buf, p.indices.len())?;
    for &idx in &p.indices {
        encode_int(buf, idx);
    }
    Ok(())
}

fn encode_structure(buf: &mut BytesMut, s: &BoltStructure) -> Result<(), DriverError> {
    encode_struct_header(buf, s.tag, s.fields.len())?;
    for field in &s.fields {
        encode_value(buf, field)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &BoltValue) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, value).unwrap();
        buf.to_vec()
    }

    #[test]
    fn scalar_markers() {
        assert_eq!(encoded(&BoltValue::Null), [0xC0]);
        assert_eq!(encoded(&BoltValue::Boolean(true)), [0xC3]);
        assert_eq!(encoded(&BoltValue::Boolean(false)), [0xC2]);
    }

    #[test]
    fn integers_use_smallest_width() {
        assert_eq!(encoded(&BoltValue::Integer(0)), [0x00]);
        assert_eq!(encoded(&BoltValue::Integer(127)), [0x7F]);
        assert_eq!(encoded(&BoltValue::Integer(-16)), [0xF0]);
        assert_eq!(encoded(&BoltValue::Integer(-17)), [marker::INT_8, 0xEF]);
        assert_eq!(encoded(&BoltValue::Integer(128)), [marker::INT_16, 0x00, 0x80]);
        assert_eq!(
            encoded(&BoltValue::Integer(32768)),
            [marker::INT_32, 0x00, 0x00, 0x80, 0x00]
        );

        let big = i64::from(i32::MAX) + 1;
        let bytes = encoded(&BoltValue::Integer(big));
        assert_eq!(bytes[0], marker::INT_64);
        assert_eq!(&bytes[1..], &big.to_be_bytes());
    }

    #[test]
    fn large_integers_are_not_floats() {
        // 2^53 + 1 is not representable as f64; it must survive bit-exact.
        let v = (1i64 << 53) + 1;
        let bytes = encoded(&BoltValue::Integer(v));
        assert_eq!(bytes[0], marker::INT_64);
        assert_eq!(i64::from_be_bytes(bytes[1..9].try_into().unwrap()), v);
    }

    #[test]
    fn float_is_fixed_width() {
        let bytes = encoded(&BoltValue::Float(1.23));
        assert_eq!(bytes[0], marker::FLOAT_64);
        assert_eq!(&bytes[1..], &1.23f64.to_be_bytes());
    }

    #[test]
    fn strings_by_byte_length() {
        assert_eq!(encoded(&BoltValue::from("")), [0x80]);
        assert_eq!(encoded(&BoltValue::from("A")), [0x81, 0x41]);

        let sixteen = "0123456789abcdef";
        let bytes = encoded(&BoltValue::from(sixteen));
        assert_eq!(&bytes[..2], &[marker::STRING_8, 16]);

        // "é" is two bytes in UTF-8.
        assert_eq!(encoded(&BoltValue::from("é"))[0], 0x82);
    }

    #[test]
    fn collections() {
        assert_eq!(encoded(&BoltValue::List(vec![])), [0x90]);
        assert_eq!(
            encoded(&BoltValue::List(vec![
                BoltValue::Integer(1),
                BoltValue::Integer(2),
                BoltValue::Integer(3),
            ])),
            [0x93, 0x01, 0x02, 0x03]
        );
        assert_eq!(encoded(&BoltValue::Dict(BoltDict::new())), [0xA0]);
        assert_eq!(
            encoded(&BoltValue::Bytes(vec![0xDE, 0xAD])),
            [marker::BYTES_8, 0x02, 0xDE, 0xAD]
        );

        let long: Vec<BoltValue> = (0..300).map(|_| BoltValue::Null).collect();
        let bytes = encoded(&BoltValue::List(long));
        assert_eq!(&bytes[..3], &[marker::LIST_16, 0x01, 0x2C]);
    }

    #[test]
    fn generic_structure_keeps_tag() {
        let s = BoltValue::Structure(BoltStructure {
            tag: 0x7A,
            fields: vec![BoltValue::Integer(1)],
        });
        assert_eq!(encoded(&s), [0xB1, 0x7A, 0x01]);
    }

    #[test]
    fn oversized_structure_is_rejected() {
        let s = BoltValue::Structure(BoltStructure {
            tag: 0x01,
            fields: vec![BoltValue::Null; 16],
        });
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_value(&mut buf, &s),
            Err(DriverError::Client(_))
        ));
    }
}
