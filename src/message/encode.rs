//! Encode Bolt messages to PackStream bytes.

use bytes::BytesMut;

use super::{sig, ClientMessage, ServerMessage};
use crate::error::DriverError;
use crate::packstream::encode as ps;

/// Encodes a client message into PackStream bytes.
pub fn encode_client_message(buf: &mut BytesMut, msg: &ClientMessage) -> Result<(), DriverError> {
    match msg {
        ClientMessage::Hello { extra } => {
            ps::encode_struct_header(buf, sig::HELLO, 1)?;
            ps::encode_dict(buf, extra)?;
        }
        ClientMessage::Logon { auth } => {
            ps::encode_struct_header(buf, sig::LOGON, 1)?;
            ps::encode_dict(buf, auth)?;
        }
        ClientMessage::Logoff => ps::encode_struct_header(buf, sig::LOGOFF, 0)?,
        ClientMessage::Goodbye => ps::encode_struct_header(buf, sig::GOODBYE, 0)?,
        ClientMessage::Reset => ps::encode_struct_header(buf, sig::RESET, 0)?,
        ClientMessage::Run {
            query,
            parameters,
            extra,
        } => {
            ps::encode_struct_header(buf, sig::RUN, 3)?;
            ps::encode_string(buf, query)?;
            ps::encode_dict(buf, parameters)?;
            ps::encode_dict(buf, extra)?;
        }
        ClientMessage::Pull { extra } => {
            ps::encode_struct_header(buf, sig::PULL, 1)?;
            ps::encode_dict(buf, extra)?;
        }
        ClientMessage::Discard { extra } => {
            ps::encode_struct_header(buf, sig::DISCARD, 1)?;
            ps::encode_dict(buf, extra)?;
        }
        ClientMessage::Begin { extra } => {
            ps::encode_struct_header(buf, sig::BEGIN, 1)?;
            ps::encode_dict(buf, extra)?;
        }
        ClientMessage::Commit => ps::encode_struct_header(buf, sig::COMMIT, 0)?,
        ClientMessage::Rollback => ps::encode_struct_header(buf, sig::ROLLBACK, 0)?,
        ClientMessage::Route {
            routing,
            bookmarks,
            extra,
        } => {
            ps::encode_struct_header(buf, sig::ROUTE, 3)?;
            ps::encode_dict(buf, routing)?;
            let bookmarks: Vec<_> = bookmarks.iter().map(|b| b.as_str().into()).collect();
            ps::encode_list(buf, &bookmarks)?;
            ps::encode_dict(buf, extra)?;
        }
    }
    Ok(())
}

/// Encodes a server message into PackStream bytes.
pub fn encode_server_message(buf: &mut BytesMut, msg: &ServerMessage) -> Result<(), DriverError> {
    match msg {
        ServerMessage::Success { metadata } => {
            ps::encode_struct_header(buf, sig::SUCCESS, 1)?;
            ps::encode_dict(buf, metadata)?;
        }
        ServerMessage::Record { data } => {
            ps::encode_struct_header(buf, sig::RECORD, 1)?;
            ps::encode_list(buf, data)?;
        }
        ServerMessage::Failure { metadata } => {
            ps::encode_struct_header(buf, sig::FAILURE, 1)?;
            ps::encode_dict(buf, metadata)?;
        }
        ServerMessage::Ignored => ps::encode_struct_header(buf, sig::IGNORED, 0)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoltDict, BoltValue};

    #[test]
    fn reset_is_two_bytes() {
        let mut buf = BytesMut::new();
        encode_client_message(&mut buf, &ClientMessage::Reset).unwrap();
        assert_eq!(&buf[..], &[0xB0, sig::RESET]);
    }

    #[test]
    fn pull_layout() {
        let mut buf = BytesMut::new();
        encode_client_message(&mut buf, &ClientMessage::pull_n(1000)).unwrap();
        // B1 3F, dict{1}, "n", INT_16 1000
        assert_eq!(
            &buf[..],
            &[0xB1, sig::PULL, 0xA1, 0x81, b'n', 0xC9, 0x03, 0xE8]
        );
    }

    #[test]
    fn route_layout() {
        let mut buf = BytesMut::new();
        let msg = ClientMessage::Route {
            routing: BoltDict::from([("address".to_string(), BoltValue::from("a:1"))]),
            bookmarks: vec![],
            extra: BoltDict::new(),
        };
        encode_client_message(&mut buf, &msg).unwrap();
        assert_eq!(&buf[..2], &[0xB3, sig::ROUTE]);
        assert_eq!(&buf[buf.len() - 2..], &[0x90, 0xA0]);
    }
}
