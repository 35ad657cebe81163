//! Checked walk over lib0 v1 updates and state vectors.
//!
//! `yrs` trusts what it decodes: string segments become `&str` without a
//! UTF-8 check, declared lengths size allocations before any element is
//! read, and clock arithmetic is unchecked. Client bytes go through this
//! walk first. It follows the v1 layout field for field, so every segment
//! the decoder will touch has been bounds-checked and every string
//! verified before `decode_v1` runs.

use thiserror::Error;

/// Nesting limit for `Any` values.
const MAX_ANY_DEPTH: usize = 128;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const CONTENT_MASK: u8 = 0b0000_1111;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;
const CONTENT_MOVE: u8 = 11;

const TYPE_XML_ELEMENT: u8 = 3;

/// Where and why an encoding was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} at byte {offset}")]
pub(crate) struct Malformed {
    pub offset: usize,
    pub reason: &'static str,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn fail<T>(&self, reason: &'static str) -> Result<T, Malformed> {
        Err(Malformed {
            offset: self.pos,
            reason,
        })
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, Malformed> {
        match self.buf.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => self.fail("unexpected end of input"),
        }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], Malformed> {
        if len > self.remaining() {
            return self.fail("segment runs past end of input");
        }
        let segment = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(segment)
    }

    // Unsigned varints wrap like the decoder's: excess high bits are
    // shifted out rather than rejected.
    fn var_u64(&mut self) -> Result<u64, Malformed> {
        let mut num = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.u8()?;
            num |= u64::wrapping_shl(u64::from(b & 0x7f), shift);
            shift += 7;
            if b < 0x80 {
                return Ok(num);
            }
            if shift > 70 {
                return self.fail("varint too long");
            }
        }
    }

    fn var_u32(&mut self) -> Result<u32, Malformed> {
        let mut num = 0u32;
        let mut shift = 0u32;
        loop {
            let b = self.u8()?;
            num |= u32::wrapping_shl(u32::from(b & 0x7f), shift);
            shift += 7;
            if b < 0x80 {
                return Ok(num);
            }
            if shift > 70 {
                return self.fail("varint too long");
            }
        }
    }

    /// Signed varint: sign in bit 6 of the first byte, six data bits there
    /// and seven in each following byte.
    fn var_i64(&mut self) -> Result<i64, Malformed> {
        let first = self.u8()?;
        let negative = first & 0x40 != 0;
        let mut num = i64::from(first & 0x3f);
        let mut shift = 6u32;
        if first >= 0x80 {
            loop {
                let b = self.u8()?;
                if shift >= i64::BITS {
                    return self.fail("signed varint overflows 64 bits");
                }
                num |= i64::from(b & 0x7f) << shift;
                shift += 7;
                if b < 0x80 {
                    break;
                }
            }
        }
        if !negative {
            return Ok(num);
        }
        match num.checked_neg() {
            Some(n) => Ok(n),
            None => self.fail("signed varint overflows 64 bits"),
        }
    }

    fn buf(&mut self) -> Result<&'a [u8], Malformed> {
        let len = self.var_u32()?;
        self.bytes(len as usize)
    }

    fn string(&mut self) -> Result<&'a str, Malformed> {
        let start = self.pos;
        let bytes = self.buf()?;
        std::str::from_utf8(bytes).map_err(|_| Malformed {
            offset: start,
            reason: "string is not valid UTF-8",
        })
    }

    fn id(&mut self) -> Result<(), Malformed> {
        self.var_u32()?;
        self.var_u32()?;
        Ok(())
    }

    /// A declared element count, refused when the rest of the input cannot
    /// hold that many elements of at least `min_size` bytes. The decoder
    /// reserves capacity from these counts up front.
    fn count(&self, declared: u64, min_size: usize) -> Result<usize, Malformed> {
        let fits = (self.remaining() / min_size) as u64;
        if declared > fits {
            return self.fail("declared length exceeds input");
        }
        Ok(declared as usize)
    }
}

/// Walk a v1 update.
pub(crate) fn update(bytes: &[u8]) -> Result<(), Malformed> {
    let mut r = Reader::new(bytes);

    let clients = r.var_u32()?;
    // blocks count, client and clock
    let clients = r.count(clients.into(), 3)?;
    for _ in 0..clients {
        let blocks = r.var_u32()?;
        r.var_u32()?;
        let mut clock = u64::from(r.var_u32()?);
        let blocks = r.count(blocks.into(), 2)?;
        for _ in 0..blocks {
            clock += block(&mut r)?;
            if clock > u64::from(u32::MAX) {
                return r.fail("block clock overflows");
            }
        }
    }

    delete_set(&mut r)
}

/// Walk a v1 state vector.
pub(crate) fn state_vector(bytes: &[u8]) -> Result<(), Malformed> {
    let mut r = Reader::new(bytes);
    let entries = r.var_u32()?;
    let entries = r.count(entries.into(), 2)?;
    for _ in 0..entries {
        r.var_u64()?;
        r.var_u32()?;
    }
    Ok(())
}

/// One block; returns how far it advances its client's clock.
fn block(r: &mut Reader<'_>) -> Result<u64, Malformed> {
    let info = r.u8()?;
    if info == BLOCK_GC || info == BLOCK_SKIP {
        return Ok(r.var_u32()?.into());
    }

    let has_origin = info & HAS_ORIGIN != 0;
    let has_right_origin = info & HAS_RIGHT_ORIGIN != 0;
    if has_origin {
        r.id()?;
    }
    if has_right_origin {
        r.id()?;
    }
    // Parent info is only written when no origin can supply it
    if !has_origin && !has_right_origin {
        if r.var_u32()? == 1 {
            r.string()?;
        } else {
            r.id()?;
        }
        if info & HAS_PARENT_SUB != 0 {
            r.string()?;
        }
    }
    content(r, info & CONTENT_MASK)
}

fn content(r: &mut Reader<'_>, kind: u8) -> Result<u64, Malformed> {
    match kind {
        CONTENT_DELETED => Ok(r.var_u32()?.into()),
        CONTENT_JSON => {
            // The count is one less than the number of strings that follow
            let declared = r.var_u32()?;
            if declared > i32::MAX as u32 {
                return r.fail("declared length exceeds input");
            }
            let strings = r.count(u64::from(declared) + 1, 1)?;
            for _ in 0..strings {
                r.string()?;
            }
            Ok(strings as u64)
        }
        CONTENT_BINARY => {
            r.buf()?;
            Ok(1)
        }
        CONTENT_STRING => {
            let text = r.string()?;
            Ok(text.encode_utf16().count() as u64)
        }
        CONTENT_EMBED => {
            r.string()?;
            Ok(1)
        }
        CONTENT_FORMAT => {
            r.string()?;
            r.string()?;
            Ok(1)
        }
        CONTENT_TYPE => {
            match r.u8()? {
                0 | 1 | 2 | 4 | 5 | 6 | 9 | 15 => {}
                TYPE_XML_ELEMENT => {
                    r.string()?;
                }
                _ => return r.fail("unknown shared type"),
            }
            Ok(1)
        }
        CONTENT_ANY => {
            let values = r.var_u32()?;
            let values = r.count(values.into(), 1)?;
            for _ in 0..values {
                any(r, 0)?;
            }
            Ok(values as u64)
        }
        CONTENT_DOC => {
            r.string()?;
            any(r, 0)?;
            Ok(1)
        }
        CONTENT_MOVE => {
            let flags = r.var_i64()?;
            let Ok(flags) = i32::try_from(flags) else {
                return r.fail("move flags out of range");
            };
            r.var_u64()?;
            r.var_u32()?;
            if flags & 1 == 0 {
                r.var_u64()?;
                r.var_u32()?;
            }
            Ok(1)
        }
        _ => r.fail("unknown content type"),
    }
}

fn any(r: &mut Reader<'_>, depth: usize) -> Result<(), Malformed> {
    if depth >= MAX_ANY_DEPTH {
        return r.fail("value nested too deeply");
    }
    match r.u8()? {
        // undefined, null, true, false
        127 | 126 | 121 | 120 => {}
        125 => {
            r.var_i64()?;
        }
        124 => {
            r.bytes(4)?;
        }
        123 | 122 => {
            r.bytes(8)?;
        }
        119 => {
            r.string()?;
        }
        118 => {
            let entries = r.var_u64()?;
            let entries = r.count(entries, 2)?;
            for _ in 0..entries {
                r.string()?;
                any(r, depth + 1)?;
            }
        }
        117 => {
            let items = r.var_u64()?;
            let items = r.count(items, 1)?;
            for _ in 0..items {
                any(r, depth + 1)?;
            }
        }
        116 => {
            r.buf()?;
        }
        _ => return r.fail("unknown value tag"),
    }
    Ok(())
}

fn delete_set(r: &mut Reader<'_>) -> Result<(), Malformed> {
    let clients = r.var_u32()?;
    let clients = r.count(clients.into(), 2)?;
    for _ in 0..clients {
        r.var_u32()?;
        let ranges = r.var_u32()?;
        let ranges = r.count(ranges.into(), 2)?;
        for _ in 0..ranges {
            let clock = r.var_u32()?;
            let len = r.var_u32()?;
            if clock.checked_add(len).is_none() {
                return r.fail("deleted range overflows");
            }
        }
    }
    Ok(())
}
