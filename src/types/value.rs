//! Values exchanged with the server: scalars, collections, graph entities and
//! the temporal/spatial structures.

use std::collections::HashMap;
use std::fmt;

/// Type alias for Bolt dictionaries (maps with string keys).
pub type BoltDict = HashMap<String, BoltValue>;

/// A value carried in query parameters and records.
///
/// Integers are always `i64` and floats always `f64`; the codec never
/// converts one into the other.
#[derive(Debug, Clone, PartialEq)]
pub enum BoltValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<BoltValue>),
    Dict(BoltDict),
    // Graph structures
    Node(BoltNode),
    Relationship(BoltRelationship),
    UnboundRelationship(BoltUnboundRelationship),
    Path(BoltPath),
    // Temporal
    Date(BoltDate),
    Time(BoltTime),
    LocalTime(BoltLocalTime),
    DateTime(BoltDateTime),
    DateTimeZoneId(BoltDateTimeZoneId),
    LocalDateTime(BoltLocalDateTime),
    Duration(BoltDuration),
    // Spatial
    Point2D(BoltPoint2D),
    Point3D(BoltPoint3D),
    /// A structure whose tag this client does not know.
    Structure(BoltStructure),
}

impl BoltValue {
    /// Returns the value as a string reference, if it is a `String` variant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an i64, if it is an `Integer` variant.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BoltValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BoltDict> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

// -- Graph structures --

#[derive(Debug, Clone, PartialEq)]
pub struct BoltNode {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: BoltDict,
    pub element_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltRelationship {
    pub id: i64,
    pub start_node_id: i64,
    pub end_node_id: i64,
    pub rel_type: String,
    pub properties: BoltDict,
    pub element_id: String,
    pub start_element_id: String,
    pub end_element_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltUnboundRelationship {
    pub id: i64,
    pub rel_type: String,
    pub properties: BoltDict,
    pub element_id: String,
}

/// A path as sent on the wire: distinct nodes, distinct relationships, and
/// an index sequence alternating (relationship, node) that walks them.
///
/// Relationship indices are 1-based and signed; a negative index means the
/// relationship is traversed against its direction.
#[derive(Debug, Clone, PartialEq)]
pub struct BoltPath {
    pub nodes: Vec<BoltNode>,
    pub rels: Vec<BoltUnboundRelationship>,
    pub indices: Vec<i64>,
}

impl BoltNode {
    pub fn get(&self, key: &str) -> Option<&BoltValue> {
        self.properties.get(key)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

impl BoltRelationship {
    pub fn get(&self, key: &str) -> Option<&BoltValue> {
        self.properties.get(key)
    }
}

impl BoltPath {
    /// Number of relationships traversed.
    pub fn len(&self) -> usize {
        self.indices.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn start(&self) -> Option<&BoltNode> {
        self.nodes.first()
    }

    /// The last node reached by walking the index sequence.
    pub fn end(&self) -> Option<&BoltNode> {
        match self.indices.last() {
            Some(&i) => usize::try_from(i).ok().and_then(|i| self.nodes.get(i)),
            None => self.nodes.first(),
        }
    }
}

// -- Temporal structures --

#[derive(Debug, Clone, PartialEq)]
pub struct BoltDate {
    /// Days since Unix epoch.
    pub days: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltTime {
    /// Nanoseconds since midnight.
    pub nanoseconds: i64,
    /// Timezone offset in seconds.
    pub tz_offset_seconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltLocalTime {
    /// Nanoseconds since midnight.
    pub nanoseconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltDateTime {
    /// Seconds since Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second.
    pub nanoseconds: i64,
    /// Timezone offset in seconds.
    pub tz_offset_seconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltDateTimeZoneId {
    /// Seconds since Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second.
    pub nanoseconds: i64,
    /// IANA timezone identifier.
    pub tz_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltLocalDateTime {
    /// Seconds since Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second.
    pub nanoseconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltDuration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanoseconds: i64,
}

// -- Spatial structures --

#[derive(Debug, Clone, PartialEq)]
pub struct BoltPoint2D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltPoint3D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Forward-compatible container for structures added by newer servers.
#[derive(Debug, Clone, PartialEq)]
pub struct BoltStructure {
    pub tag: u8,
    pub fields: Vec<BoltValue>,
}

// -- Convenience conversions --

impl From<bool> for BoltValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for BoltValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for BoltValue {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for BoltValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for BoltValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for BoltValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<Vec<u8>> for BoltValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<BoltValue>> for BoltValue {
    fn from(v: Vec<BoltValue>) -> Self {
        Self::List(v)
    }
}

impl From<BoltDict> for BoltValue {
    fn from(d: BoltDict) -> Self {
        Self::Dict(d)
    }
}

impl From<BoltNode> for BoltValue {
    fn from(n: BoltNode) -> Self {
        Self::Node(n)
    }
}

impl From<BoltRelationship> for BoltValue {
    fn from(r: BoltRelationship) -> Self {
        Self::Relationship(r)
    }
}

impl From<BoltPath> for BoltValue {
    fn from(p: BoltPath) -> Self {
        Self::Path(p)
    }
}

impl<T: Into<BoltValue>> From<Option<T>> for BoltValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl fmt::Display for BoltValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Dict(dict) => {
                write!(f, "{{")?;
                for (i, (k, v)) in dict.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Node(n) => write!(f, "(:{} {{id: {}}})", n.labels.join(":"), n.id),
            Self::Relationship(r) => write!(f, "-[:{}]-", r.rel_type),
            Self::UnboundRelationship(r) => write!(f, "-[:{}]-", r.rel_type),
            Self::Path(_) => write!(f, "<path>"),
            Self::Date(d) => write!(f, "date({})", d.days),
            Self::Time(t) => write!(f, "time({})", t.nanoseconds),
            Self::LocalTime(t) => write!(f, "localtime({})", t.nanoseconds),
            Self::DateTime(dt) => write!(f, "datetime({})", dt.seconds),
            Self::DateTimeZoneId(dt) => write!(f, "datetime({}, {})", dt.seconds, dt.tz_id),
            Self::LocalDateTime(dt) => write!(f, "localdatetime({})", dt.seconds),
            Self::Duration(d) => {
                write!(f, "duration({}m {}d {}s)", d.months, d.days, d.seconds)
            }
            Self::Point2D(p) => write!(f, "point({}, {}, {})", p.srid, p.x, p.y),
            Self::Point3D(p) => write!(f, "point({}, {}, {}, {})", p.srid, p.x, p.y, p.z),
            Self::Structure(s) => write!(f, "struct(0x{:02X}, {} fields)", s.tag, s.fields.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64) -> BoltNode {
        BoltNode {
            id,
            labels: vec!["Person".into()],
            properties: BoltDict::from([("name".to_string(), BoltValue::from("n"))]),
            element_id: id.to_string(),
        }
    }

    #[test]
    fn option_converts_to_null() {
        assert_eq!(BoltValue::from(None::<i64>), BoltValue::Null);
        assert_eq!(BoltValue::from(Some(3i64)), BoltValue::Integer(3));
    }

    #[test]
    fn accessors_are_strict() {
        assert_eq!(BoltValue::Integer(1).as_float(), None);
        assert_eq!(BoltValue::Float(1.0).as_int(), None);
        assert_eq!(BoltValue::Boolean(true).as_bool(), Some(true));
        assert!(BoltValue::Null.is_null());
    }

    #[test]
    fn path_walks_indices() {
        let rel = BoltUnboundRelationship {
            id: 9,
            rel_type: "KNOWS".into(),
            properties: BoltDict::new(),
            element_id: "9".into(),
        };
        let path = BoltPath {
            nodes: vec![node(1), node(2), node(3)],
            rels: vec![rel],
            indices: vec![1, 1, -1, 2],
        };
        assert_eq!(path.len(), 2);
        assert_eq!(path.start().map(|n| n.id), Some(1));
        assert_eq!(path.end().map(|n| n.id), Some(3));
        assert!(path.start().is_some_and(|n| n.has_label("Person")));
    }
}
