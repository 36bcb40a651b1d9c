// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Minimal CPython pickle protocol 5 writer.
//!
//! The vLLM block-hash scheme feeds `pickle.dumps((parent_hash, tuple(tokens),
//! extra_keys), protocol=5)` into SHA-256, so the serialized bytes here must
//! match CPython's output exactly: same opcodes, same framing, same memo
//! placement. Only the shapes that appear in a block payload are supported —
//! `bytes`, tuples of ints, and `None`.

use crate::{Token, TokensError};

const PROTO: u8 = 0x80;
const FRAME: u8 = 0x95;
const SHORT_BINBYTES: u8 = b'C';
const BINBYTES: u8 = b'B';
const MEMOIZE: u8 = 0x94;
const MARK: u8 = b'(';
const TUPLE: u8 = b't';
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const EMPTY_TUPLE: u8 = b')';
const NONE: u8 = b'N';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const LONG1: u8 = 0x8a;
const STOP: u8 = b'.';

/// CPython only emits a FRAME opcode when the frame body is at least this long.
const FRAME_SIZE_MIN: usize = 4;

/// Serializes the 3-tuple `(parent_hash, tuple(tokens), extra_keys_or_none)`
/// exactly as `pickle.dumps(obj, protocol=5)` would.
pub fn dumps_block(
    parent_hash: &[u8],
    tokens: &[Token],
    extra_keys: Option<&[Token]>,
) -> Result<Vec<u8>, TokensError> {
    // Everything after the PROTO opcode, STOP included, lives in one frame.
    let mut body = Vec::with_capacity(parent_hash.len() + tokens.len() * 2 + 16);
    put_bytes(&mut body, parent_hash)?;
    put_int_tuple(&mut body, tokens);
    match extra_keys {
        Some(keys) => put_int_tuple(&mut body, keys),
        None => body.push(NONE),
    }
    body.push(TUPLE3);
    body.push(MEMOIZE);
    body.push(STOP);

    let mut out = Vec::with_capacity(body.len() + 11);
    out.push(PROTO);
    out.push(5);
    if body.len() >= FRAME_SIZE_MIN {
        out.push(FRAME);
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    }
    out.extend_from_slice(&body);
    Ok(out)
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<(), TokensError> {
    if data.len() < 256 {
        out.push(SHORT_BINBYTES);
        out.push(data.len() as u8);
    } else if u32::try_from(data.len()).is_ok() {
        out.push(BINBYTES);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    } else {
        // BINBYTES carries a 32-bit length; nothing this serializer emits
        // legitimately grows past it.
        return Err(TokensError::Serialization(format!(
            "bytes object of {} bytes exceeds the BINBYTES length field",
            data.len()
        )));
    }
    out.extend_from_slice(data);
    out.push(MEMOIZE);
    Ok(())
}

fn put_int_tuple(out: &mut Vec<u8>, values: &[Token]) {
    match values.len() {
        // Empty tuples are a singleton in CPython and are not memoized.
        0 => {
            out.push(EMPTY_TUPLE);
            return;
        }
        1..=3 => {
            for &v in values {
                put_int(out, v);
            }
            out.push([TUPLE1, TUPLE2, TUPLE3][values.len() - 1]);
        }
        _ => {
            out.push(MARK);
            for &v in values {
                put_int(out, v);
            }
            out.push(TUPLE);
        }
    }
    out.push(MEMOIZE);
}

fn put_int(out: &mut Vec<u8>, value: Token) {
    if (0..256).contains(&value) {
        out.push(BININT1);
        out.push(value as u8);
    } else if (0..65536).contains(&value) {
        out.push(BININT2);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if (i32::MIN as i64..=i32::MAX as i64).contains(&value) {
        out.push(BININT);
        out.extend_from_slice(&(value as i32).to_le_bytes());
    } else {
        // Minimal little-endian two's-complement, as pickle's encode_long.
        let bytes = encode_long(value);
        out.push(LONG1);
        out.push(bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }
}

fn encode_long(value: i64) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    if value >= 0 {
        while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 && bytes[bytes.len() - 2] < 0x80 {
            bytes.pop();
        }
    } else {
        while bytes.len() > 1 && bytes[bytes.len() - 1] == 0xff && bytes[bytes.len() - 2] >= 0x80 {
            bytes.pop();
        }
    }
    bytes
}
