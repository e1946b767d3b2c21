//! The RPC sub-frame carried inside every channel frame body.
//!
//! `is_rpc` is the single wire discriminant (mirroring the teacher protocol's
//! tag-then-variant `rpc_body` encoding, generalized from a fixed NFS-call
//! shape to this runtime's three sub-frame shapes) and which other fields
//! follow it on the wire depends on its value: a post carries no
//! `wait_id`/`coro_id` (there is no reply to rendezvous on), a reply carries
//! no `protocol_id` (the `wait_id` alone identifies which call it answers).

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::error::{Error, Result};
use crate::value::{self, Value};

/// One decoded RPC sub-frame. Each variant's field set matches exactly what
/// is present on the wire for that `is_rpc` value.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `is_rpc = 0`: fire-and-forget, no reply ever sent.
    Post { protocol_id: u16, args: Vec<Value> },
    /// `is_rpc = 1`: a request awaiting a matching `Reply` on `wait_id`.
    Call { wait_id: u32, coro_id: i32, protocol_id: u16, args: Vec<Value> },
    /// `is_rpc = 2`: the answer to a prior `Call` with the same `wait_id`.
    Reply { wait_id: u32, coro_id: i32, retcode: i32, args: Vec<Value> },
}

impl Frame {
    pub fn post(protocol_id: u16, args: Vec<Value>) -> Frame {
        Frame::Post { protocol_id, args }
    }

    pub fn call(wait_id: u32, coro_id: i32, protocol_id: u16, args: Vec<Value>) -> Frame {
        Frame::Call { wait_id, coro_id, protocol_id, args }
    }

    pub fn reply(wait_id: u32, coro_id: i32, retcode: i32, args: Vec<Value>) -> Frame {
        Frame::Reply { wait_id, coro_id, retcode, args }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(&mut out).map_err(Error::Io)?;
        Ok(out)
    }

    fn write(&self, out: &mut impl Write) -> io::Result<()> {
        match self {
            Frame::Post { protocol_id, args } => {
                out.write_u16::<BE>(0)?;
                out.write_u16::<BE>(*protocol_id)?;
                value::encode_args(args, out)
            }
            Frame::Call { wait_id, coro_id, protocol_id, args } => {
                out.write_u16::<BE>(1)?;
                out.write_u32::<BE>(*wait_id)?;
                out.write_i32::<BE>(*coro_id)?;
                out.write_u16::<BE>(*protocol_id)?;
                value::encode_args(args, out)
            }
            Frame::Reply { wait_id, coro_id, retcode, args } => {
                out.write_u16::<BE>(2)?;
                out.write_u32::<BE>(*wait_id)?;
                out.write_i32::<BE>(*coro_id)?;
                out.write_i32::<BE>(*retcode)?;
                value::encode_args(args, out)
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let mut cursor = bytes;
        let is_rpc = cursor.read_u16::<BE>().map_err(Error::Io)?;
        match is_rpc {
            0 => {
                let protocol_id = cursor.read_u16::<BE>().map_err(Error::Io)?;
                let args = value::decode_args(&mut cursor).map_err(Error::Io)?;
                Ok(Frame::Post { protocol_id, args })
            }
            1 => {
                let wait_id = cursor.read_u32::<BE>().map_err(Error::Io)?;
                let coro_id = cursor.read_i32::<BE>().map_err(Error::Io)?;
                let protocol_id = cursor.read_u16::<BE>().map_err(Error::Io)?;
                let args = value::decode_args(&mut cursor).map_err(Error::Io)?;
                Ok(Frame::Call { wait_id, coro_id, protocol_id, args })
            }
            2 => {
                let wait_id = cursor.read_u32::<BE>().map_err(Error::Io)?;
                let coro_id = cursor.read_i32::<BE>().map_err(Error::Io)?;
                let retcode = cursor.read_i32::<BE>().map_err(Error::Io)?;
                let args = value::decode_args(&mut cursor).map_err(Error::Io)?;
                Ok(Frame::Reply { wait_id, coro_id, retcode, args })
            }
            other => Err(Error::Codec(format!("unknown is_rpc value {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trips() {
        let frame = Frame::call(7, 1, 42, vec![Value::I32(9)]);
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn reply_round_trips_with_negative_coro_id_and_retcode() {
        let frame = Frame::reply(7, -1, 3, vec![]);
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn post_round_trips_with_no_wait_id_or_coro_id() {
        let frame = Frame::post(5, vec![Value::Bool(true)]);
        let bytes = frame.encode().unwrap();
        // is_rpc(2B) + protocol_id(2B) + tag(1B) + payload(1B), no wait_id/coro_id.
        assert_eq!(bytes.len(), 2 + 2 + 1 + 1);
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn unknown_is_rpc_value_is_rejected() {
        let bytes = [0u8, 9];
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
