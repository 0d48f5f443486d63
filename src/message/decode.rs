//! Decode Bolt messages from PackStream bytes.

use bytes::Buf;

use super::{sig, ClientMessage, ServerMessage};
use crate::error::DriverError;
use crate::packstream::decode::decode_value;
use crate::packstream::marker::TINY_STRUCT_NIBBLE;
use crate::types::{BoltDict, BoltValue};

/// Decodes a client message from PackStream bytes.
pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, DriverError> {
    let mut buf = data;
    let (tag, field_count) = read_header(&mut buf)?;

    let msg = match tag {
        sig::HELLO => {
            expect_fields("HELLO", field_count, 1)?;
            ClientMessage::Hello {
                extra: require_dict(decode_value(&mut buf)?)?,
            }
        }
        sig::LOGON => {
            expect_fields("LOGON", field_count, 1)?;
            ClientMessage::Logon {
                auth: require_dict(decode_value(&mut buf)?)?,
            }
        }
        sig::LOGOFF => ClientMessage::Logoff,
        sig::GOODBYE => ClientMessage::Goodbye,
        sig::RESET => ClientMessage::Reset,
        sig::RUN => {
            expect_fields("RUN", field_count, 3)?;
            ClientMessage::Run {
                query: require_string(decode_value(&mut buf)?)?,
                parameters: require_dict(decode_value(&mut buf)?)?,
                extra: require_dict(decode_value(&mut buf)?)?,
            }
        }
        sig::PULL => {
            expect_fields("PULL", field_count, 1)?;
            ClientMessage::Pull {
                extra: require_dict(decode_value(&mut buf)?)?,
            }
        }
        sig::DISCARD => {
            expect_fields("DISCARD", field_count, 1)?;
            ClientMessage::Discard {
                extra: require_dict(decode_value(&mut buf)?)?,
            }
        }
        sig::BEGIN => {
            expect_fields("BEGIN", field_count, 1)?;
            ClientMessage::Begin {
                extra: require_dict(decode_value(&mut buf)?)?,
            }
        }
        sig::COMMIT => ClientMessage::Commit,
        sig::ROLLBACK => ClientMessage::Rollback,
        sig::ROUTE => {
            expect_fields("ROUTE", field_count, 3)?;
            let routing = require_dict(decode_value(&mut buf)?)?;
            let bookmarks = require_list(decode_value(&mut buf)?)?
                .into_iter()
                .map(require_string)
                .collect::<Result<Vec<_>, _>>()?;
            let extra = require_dict(decode_value(&mut buf)?)?;
            ClientMessage::Route {
                routing,
                bookmarks,
                extra,
            }
        }
        _ => {
            return Err(DriverError::protocol(format!(
                "unknown client message tag: 0x{tag:02X}"
            )));
        }
    };
    ensure_consumed(buf)?;
    Ok(msg)
}

/// Decodes a server message from PackStream bytes.
pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, DriverError> {
    let mut buf = data;
    let (tag, field_count) = read_header(&mut buf)?;

    let msg = match tag {
        sig::SUCCESS => {
            expect_fields("SUCCESS", field_count, 1)?;
            ServerMessage::Success {
                metadata: require_dict(decode_value(&mut buf)?)?,
            }
        }
        sig::RECORD => {
            expect_fields("RECORD", field_count, 1)?;
            ServerMessage::Record {
                data: require_list(decode_value(&mut buf)?)?,
            }
        }
        sig::FAILURE => {
            expect_fields("FAILURE", field_count, 1)?;
            ServerMessage::Failure {
                metadata: require_dict(decode_value(&mut buf)?)?,
            }
        }
        sig::IGNORED => ServerMessage::Ignored,
        _ => {
            return Err(DriverError::protocol(format!(
                "unknown server message tag: 0x{tag:02X}"
            )));
        }
    };
    ensure_consumed(buf)?;
    Ok(msg)
}

fn read_header(buf: &mut &[u8]) -> Result<(u8, u8), DriverError> {
    if buf.remaining() < 2 {
        return Err(DriverError::malformed("message shorter than its header"));
    }
    let marker = buf.get_u8();
    if marker & 0xF0 != TINY_STRUCT_NIBBLE {
        return Err(DriverError::malformed(format!(
            "message must start with a structure marker, got 0x{marker:02X}"
        )));
    }
    let tag = buf.get_u8();
    Ok((tag, marker & 0x0F))
}

fn ensure_consumed(buf: &[u8]) -> Result<(), DriverError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(DriverError::malformed(format!(
            "{} trailing bytes after message",
            buf.len()
        )))
    }
}

fn expect_fields(msg_name: &str, got: u8, expected: u8) -> Result<(), DriverError> {
    if got != expected {
        Err(DriverError::malformed(format!(
            "{msg_name} expects {expected} fields, got {got}"
        )))
    } else {
        Ok(())
    }
}

fn require_string(v: BoltValue) -> Result<String, DriverError> {
    match v {
        BoltValue::String(s) => Ok(s),
        other => Err(DriverError::malformed(format!(
            "expected string, got: {other}"
        ))),
    }
}

fn require_dict(v: BoltValue) -> Result<BoltDict, DriverError> {
    match v {
        BoltValue::Dict(d) => Ok(d),
        other => Err(DriverError::malformed(format!("expected dict, got: {other}"))),
    }
}

fn require_list(v: BoltValue) -> Result<Vec<BoltValue>, DriverError> {
    match v {
        BoltValue::List(l) => Ok(l),
        other => Err(DriverError::malformed(format!("expected list, got: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::encode::{encode_client_message, encode_server_message};
    use bytes::BytesMut;

    fn round_trip_client(msg: &ClientMessage) -> ClientMessage {
        let mut buf = BytesMut::new();
        encode_client_message(&mut buf, msg).unwrap();
        decode_client_message(&buf).expect("decode failed")
    }

    fn round_trip_server(msg: &ServerMessage) -> ServerMessage {
        let mut buf = BytesMut::new();
        encode_server_message(&mut buf, msg).unwrap();
        decode_server_message(&buf).expect("decode failed")
    }

    #[test]
    fn client_messages_round_trip() {
        let msgs = [
            ClientMessage::Hello {
                extra: BoltDict::from([("user_agent".to_string(), BoltValue::from("t/1.0"))]),
            },
            ClientMessage::Run {
                query: "RETURN $x".into(),
                parameters: BoltDict::from([("x".to_string(), BoltValue::Integer(1))]),
                extra: BoltDict::from([("db".to_string(), BoltValue::from("neo4j"))]),
            },
            ClientMessage::pull_n(100),
            ClientMessage::discard_all(),
            ClientMessage::Route {
                routing: BoltDict::from([("address".to_string(), BoltValue::from("h:7687"))]),
                bookmarks: vec!["bm1".into(), "bm2".into()],
                extra: BoltDict::from([("db".to_string(), BoltValue::from("movies"))]),
            },
            ClientMessage::Commit,
            ClientMessage::Goodbye,
        ];
        for msg in msgs {
            assert_eq!(round_trip_client(&msg), msg);
        }
    }

    #[test]
    fn server_messages_round_trip() {
        let msgs = [
            ServerMessage::Success {
                metadata: BoltDict::from([("fields".to_string(), BoltValue::List(vec![]))]),
            },
            ServerMessage::Record {
                data: vec![BoltValue::Integer(1), BoltValue::from("hello")],
            },
            ServerMessage::Ignored,
        ];
        for msg in msgs {
            assert_eq!(round_trip_server(&msg), msg);
        }
    }

    #[test]
    fn rejects_non_struct_and_unknown_tags() {
        assert!(matches!(
            decode_server_message(&[0xC0, 0x70]),
            Err(DriverError::MalformedMessage(_))
        ));
        assert!(matches!(
            decode_server_message(&[0xB0, 0x55]),
            Err(DriverError::Protocol(_))
        ));
        assert!(matches!(
            decode_server_message(&[0xB0]),
            Err(DriverError::MalformedMessage(_))
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(matches!(
            decode_server_message(&[0xB0, sig::IGNORED, 0xC0]),
            Err(DriverError::MalformedMessage(_))
        ));
    }

    #[test]
    fn rejects_wrong_shapes() {
        // SUCCESS carrying a list instead of a dict.
        assert!(matches!(
            decode_server_message(&[0xB1, sig::SUCCESS, 0x90]),
            Err(DriverError::MalformedMessage(_))
        ));
        // RECORD declaring two fields.
        assert!(matches!(
            decode_server_message(&[0xB2, sig::RECORD, 0x90, 0x90]),
            Err(DriverError::MalformedMessage(_))
        ));
    }
}
