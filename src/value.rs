//! The tagged argument value: the wire payload carried by both RPC sub-frame
//! argument lists and coroutine wait results.
//!
//! The type universe is carried over from a C++ `std::variant`-based duck
//! typed value (signed/unsigned integers of every native width, floating
//! point, bool, an opaque byte buffer, a string, and three string
//! collections) but expressed as a single closed Rust enum instead of a
//! runtime-typed union, so every encode/decode path goes through one
//! exhaustive match instead of a duck-typed dispatch table. `long`/`long
//! long` and their unsigned counterparts collapse onto `i64`/`u64` — Rust
//! doesn't distinguish the two the way C++ does, and nothing in this runtime
//! needs more than 64 bits of range. `long double` collapses onto `f64` for
//! the same reason.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

/// One tagged value in an RPC argument list.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    /// Opaque length-prefixed byte buffer (the original's `XPackBuff`).
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<String>),
    Map(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
#[repr(u8)]
enum Tag {
    I8 = 1,
    U8 = 2,
    I16 = 3,
    U16 = 4,
    I32 = 5,
    U32 = 6,
    I64 = 7,
    U64 = 8,
    F32 = 9,
    F64 = 10,
    Bool = 11,
    Bytes = 12,
    Str = 13,
    List = 14,
    Map = 15,
    Set = 16,
}

fn write_len_prefixed(out: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    let len: u32 = bytes
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "value too large to encode"))?;
    out.write_u32::<BE>(len)?;
    out.write_all(bytes)
}

fn read_len_prefixed(src: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = src.read_u32::<BE>()? as usize;
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_str(out: &mut impl Write, s: &str) -> io::Result<()> {
    write_len_prefixed(out, s.as_bytes())
}

fn read_str(src: &mut impl Read) -> io::Result<String> {
    let bytes = read_len_prefixed(src)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl Value {
    fn tag(&self) -> Tag {
        match self {
            Value::I8(_) => Tag::I8,
            Value::U8(_) => Tag::U8,
            Value::I16(_) => Tag::I16,
            Value::U16(_) => Tag::U16,
            Value::I32(_) => Tag::I32,
            Value::U32(_) => Tag::U32,
            Value::I64(_) => Tag::I64,
            Value::U64(_) => Tag::U64,
            Value::F32(_) => Tag::F32,
            Value::F64(_) => Tag::F64,
            Value::Bool(_) => Tag::Bool,
            Value::Bytes(_) => Tag::Bytes,
            Value::Str(_) => Tag::Str,
            Value::List(_) => Tag::List,
            Value::Map(_) => Tag::Map,
            Value::Set(_) => Tag::Set,
        }
    }

    /// Encode `tag:1B | payload` into `out`, big-endian throughout.
    pub fn encode(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_u8(self.tag() as u8)?;
        match self {
            Value::I8(v) => out.write_i8(*v),
            Value::U8(v) => out.write_u8(*v),
            Value::I16(v) => out.write_i16::<BE>(*v),
            Value::U16(v) => out.write_u16::<BE>(*v),
            Value::I32(v) => out.write_i32::<BE>(*v),
            Value::U32(v) => out.write_u32::<BE>(*v),
            Value::I64(v) => out.write_i64::<BE>(*v),
            Value::U64(v) => out.write_u64::<BE>(*v),
            Value::F32(v) => out.write_f32::<BE>(*v),
            Value::F64(v) => out.write_f64::<BE>(*v),
            Value::Bool(v) => out.write_u8(if *v { 1 } else { 0 }),
            Value::Bytes(v) => write_len_prefixed(out, v),
            Value::Str(v) => write_str(out, v),
            Value::List(items) => {
                out.write_u32::<BE>(items.len() as u32)?;
                for item in items {
                    write_str(out, item)?;
                }
                Ok(())
            }
            Value::Map(map) => {
                out.write_u32::<BE>(map.len() as u32)?;
                for (k, v) in map {
                    write_str(out, k)?;
                    write_str(out, v)?;
                }
                Ok(())
            }
            Value::Set(set) => {
                out.write_u32::<BE>(set.len() as u32)?;
                for item in set {
                    write_str(out, item)?;
                }
                Ok(())
            }
        }
    }

    /// Decode one `tag:1B | payload` value from `src`.
    pub fn decode(src: &mut impl Read) -> io::Result<Value> {
        use num_traits::FromPrimitive;
        let raw_tag = src.read_u8()?;
        let tag = Tag::from_u8(raw_tag)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unknown value tag {raw_tag}")))?;
        Ok(match tag {
            Tag::I8 => Value::I8(src.read_i8()?),
            Tag::U8 => Value::U8(src.read_u8()?),
            Tag::I16 => Value::I16(src.read_i16::<BE>()?),
            Tag::U16 => Value::U16(src.read_u16::<BE>()?),
            Tag::I32 => Value::I32(src.read_i32::<BE>()?),
            Tag::U32 => Value::U32(src.read_u32::<BE>()?),
            Tag::I64 => Value::I64(src.read_i64::<BE>()?),
            Tag::U64 => Value::U64(src.read_u64::<BE>()?),
            Tag::F32 => Value::F32(src.read_f32::<BE>()?),
            Tag::F64 => Value::F64(src.read_f64::<BE>()?),
            Tag::Bool => Value::Bool(src.read_u8()? != 0),
            Tag::Bytes => Value::Bytes(read_len_prefixed(src)?),
            Tag::Str => Value::Str(read_str(src)?),
            Tag::List => {
                let count = src.read_u32::<BE>()?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(read_str(src)?);
                }
                Value::List(items)
            }
            Tag::Map => {
                let count = src.read_u32::<BE>()?;
                let mut map = HashMap::with_capacity(count as usize);
                for _ in 0..count {
                    let k = read_str(src)?;
                    let v = read_str(src)?;
                    map.insert(k, v);
                }
                Value::Map(map)
            }
            Tag::Set => {
                let count = src.read_u32::<BE>()?;
                let mut set = HashSet::with_capacity(count as usize);
                for _ in 0..count {
                    set.insert(read_str(src)?);
                }
                Value::Set(set)
            }
        })
    }
}

/// Encode a full argument list: each value one after another, with no count
/// prefix. The caller (the frame body, whose own length already bounds the
/// whole sub-frame) is what tells a decoder where the vector ends.
pub fn encode_args(args: &[Value], out: &mut impl Write) -> io::Result<()> {
    for arg in args {
        arg.encode(out)?;
    }
    Ok(())
}

/// Decode every value out of `src` until it is exhausted. `src` must be
/// exactly the argument-list bytes — there is no length prefix to bound the
/// loop, so a caller with trailing bytes that aren't a value vector must trim
/// them first.
pub fn decode_args(src: &mut &[u8]) -> io::Result<Vec<Value>> {
    let mut args = Vec::new();
    while !src.is_empty() {
        args.push(Value::decode(src)?);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) {
        let mut buf = Vec::new();
        v.encode(&mut buf).unwrap();
        let decoded = Value::decode(&mut &buf[..]).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(Value::I32(-7));
        round_trip(Value::U64(u64::MAX));
        round_trip(Value::F64(3.25));
        round_trip(Value::Bool(true));
    }

    #[test]
    fn collections_round_trip() {
        round_trip(Value::Bytes(vec![1, 2, 3]));
        round_trip(Value::Str("hello".into()));
        round_trip(Value::List(vec!["a".into(), "b".into()]));
        let mut map = HashMap::new();
        map.insert("k".to_string(), "v".to_string());
        round_trip(Value::Map(map));
        let mut set = HashSet::new();
        set.insert("x".to_string());
        round_trip(Value::Set(set));
    }

    #[test]
    fn arg_list_round_trips() {
        let args = vec![Value::I32(1), Value::Str("two".into()), Value::Bool(false)];
        let mut buf = Vec::new();
        encode_args(&args, &mut buf).unwrap();
        let decoded = decode_args(&mut &buf[..]).unwrap();
        assert_eq!(args, decoded);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let buf = [0xffu8];
        let err = Value::decode(&mut &buf[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
