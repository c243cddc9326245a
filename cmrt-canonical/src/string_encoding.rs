// CMRT - cmrt-canonical
// Module: String encoding support
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! String encodings of the canonical ABI.
//!
//! Strings cross the boundary as a pointer plus a tagged code-unit
//! count. Three wire encodings exist: UTF-8, UTF-16 little-endian, and
//! the adaptive Latin-1/UTF-16 form, whose length word carries
//! [`UTF16_TAG`] in the high bit when the buffer holds UTF-16.
//!
//! The store path writes through the host transcoder with a worst-case
//! sized destination, then shrinks the allocation to the bytes
//! actually produced. The adaptive writer starts optimistically in
//! Latin-1 and promotes to UTF-16 at the first code point that does
//! not fit, spreading the bytes already written into two-byte slots.

use crate::call_context::LiftLowerContext;
use crate::prelude::*;

/// High bit of the length word: the buffer holds UTF-16
pub const UTF16_TAG: u32 = 1 << 31;

/// Maximum string byte length on the wire
pub const MAX_STRING_BYTE_LENGTH: u32 = (1 << 31) - 1;

/// Supported string encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    /// UTF-8 (default)
    Utf8,
    /// UTF-16 little-endian
    Utf16Le,
    /// Latin-1 (ISO-8859-1); only valid as the resolved simple form of
    /// the adaptive encoding
    Latin1,
    /// Latin-1/UTF-16 adaptive, discriminated by the length-word tag
    Latin1Utf16,
}

impl Default for StringEncoding {
    fn default() -> Self {
        Self::Utf8
    }
}

/// Host string transcoder.
///
/// `(dest, src, src_encoding, dst_encoding) -> bytes written`. The
/// codec always sizes `dest` for the worst case before calling.
pub type HostTranscoder =
    Rc<dyn Fn(&mut [u8], &[u8], StringEncoding, StringEncoding) -> Result<usize>>;

/// Encode a host string into the given simple encoding
pub fn encode_string(s: &str, encoding: StringEncoding) -> Result<Vec<u8>> {
    match encoding {
        StringEncoding::Utf8 => Ok(s.as_bytes().to_vec()),
        StringEncoding::Utf16Le => {
            let mut bytes = Vec::with_capacity(s.len() * 2);
            for unit in s.encode_utf16() {
                bytes.extend_from_slice(&unit.to_le_bytes());
            }
            Ok(bytes)
        }
        StringEncoding::Latin1 => {
            let mut bytes = Vec::with_capacity(s.len());
            for c in s.chars() {
                let point = c as u32;
                if point > 0xFF {
                    return Err(Error::invalid_value(
                        codes::INVALID_ENCODING,
                        "code point does not fit in Latin-1",
                    ));
                }
                bytes.push(point as u8);
            }
            Ok(bytes)
        }
        StringEncoding::Latin1Utf16 => Err(Error::invalid_value(
            codes::INVALID_ENCODING,
            "adaptive encoding has no direct encoder",
        )),
    }
}

/// Decode bytes in the given simple encoding into a host string
pub fn decode_string(bytes: &[u8], encoding: StringEncoding) -> Result<String> {
    match encoding {
        StringEncoding::Utf8 => core::str::from_utf8(bytes)
            .map(ToString::to_string)
            .map_err(|_| Error::invalid_value(codes::INVALID_ENCODING, "invalid UTF-8")),
        StringEncoding::Utf16Le => {
            if bytes.len() % 2 != 0 {
                return Err(Error::invalid_value(
                    codes::INVALID_ENCODING,
                    "odd UTF-16 byte length",
                ));
            }
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units)
                .map_err(|_| Error::invalid_value(codes::INVALID_ENCODING, "invalid UTF-16"))
        }
        StringEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        StringEncoding::Latin1Utf16 => Err(Error::invalid_value(
            codes::INVALID_ENCODING,
            "adaptive encoding has no direct decoder",
        )),
    }
}

/// The built-in transcoder: decode per the source encoding, re-encode
/// into `dest`, report the bytes written.
pub fn default_transcoder() -> HostTranscoder {
    Rc::new(|dest, src, src_encoding, dst_encoding| {
        let decoded = decode_string(src, src_encoding)?;
        let encoded = encode_string(&decoded, dst_encoding)?;
        if encoded.len() > dest.len() {
            return Err(Error::memory_out_of_bounds(
                "transcoded string exceeds destination capacity",
            ));
        }
        dest[..encoded.len()].copy_from_slice(&encoded);
        Ok(encoded.len())
    })
}

fn transcode_into_memory(
    cx: &LiftLowerContext,
    ptr: u32,
    capacity: u32,
    src: &[u8],
    src_encoding: StringEncoding,
    dst_encoding: StringEncoding,
) -> Result<u32> {
    cx.opts.memory.check_range(ptr, u64::from(capacity))?;
    let written = cx.opts.memory.with_mut(|bytes| {
        let dest = &mut bytes[ptr as usize..(ptr + capacity) as usize];
        (cx.transcode)(dest, src, src_encoding, dst_encoding)
    })?;
    Ok(written as u32)
}

/// Store a host string into guest memory, returning `(ptr, tagged
/// code-unit count)`.
pub fn store_string_into_range(cx: &LiftLowerContext, s: &str) -> Result<(u32, u32)> {
    // Host strings are UTF-8, so the source code-unit count is the
    // UTF-8 byte length.
    let src_code_units = u32::try_from(s.len())
        .ok()
        .filter(|&n| n <= MAX_STRING_BYTE_LENGTH)
        .ok_or(Error::invalid_value(codes::STRING_TOO_LONG, "string too long"))?;
    if src_code_units == 0 {
        return Ok((0, 0));
    }

    match cx.opts.string_encoding {
        StringEncoding::Utf8 => {
            let ptr = cx.opts.realloc(0, 0, 1, src_code_units)?;
            cx.opts.memory.write(ptr, s.as_bytes())?;
            Ok((ptr, src_code_units))
        }
        StringEncoding::Utf16Le => store_utf8_to_utf16(cx, s, src_code_units),
        StringEncoding::Latin1Utf16 => store_string_to_latin1_or_utf16(cx, s, src_code_units),
        StringEncoding::Latin1 => Err(Error::invalid_value(
            codes::INVALID_ENCODING,
            "Latin-1 is not a valid guest encoding on its own",
        )),
    }
}

fn store_utf8_to_utf16(cx: &LiftLowerContext, s: &str, src_code_units: u32) -> Result<(u32, u32)> {
    let worst_case_size = src_code_units
        .checked_mul(2)
        .filter(|&n| n <= MAX_STRING_BYTE_LENGTH)
        .ok_or(Error::invalid_value(codes::STRING_TOO_LONG, "string too long"))?;
    let mut ptr = cx.opts.realloc(0, 0, 2, worst_case_size)?;
    let enc_len = transcode_into_memory(
        cx,
        ptr,
        worst_case_size,
        s.as_bytes(),
        StringEncoding::Utf8,
        StringEncoding::Utf16Le,
    )?;
    if enc_len < worst_case_size {
        ptr = cx.opts.realloc(ptr, worst_case_size, 2, enc_len)?;
    }
    Ok((ptr, enc_len / 2))
}

fn store_string_to_latin1_or_utf16(
    cx: &LiftLowerContext,
    s: &str,
    src_code_units: u32,
) -> Result<(u32, u32)> {
    let mut ptr = cx.opts.realloc(0, 0, 2, src_code_units)?;
    let mut dst_byte_length: u32 = 0;

    for (byte_index, c) in s.char_indices() {
        if (c as u32) < 0x100 {
            cx.opts.memory.write(ptr + dst_byte_length, &[c as u32 as u8])?;
            dst_byte_length += 1;
            continue;
        }

        // First code point outside Latin-1: promote the whole string
        // to UTF-16.
        let worst_case_size = src_code_units
            .checked_mul(2)
            .filter(|&n| n <= MAX_STRING_BYTE_LENGTH)
            .ok_or(Error::invalid_value(codes::STRING_TOO_LONG, "string too long"))?;
        ptr = cx.opts.realloc(ptr, src_code_units, 2, worst_case_size)?;
        cx.opts.memory.check_range(ptr, u64::from(worst_case_size))?;

        // Spread the Latin-1 bytes already written into 2-byte slots.
        cx.opts.memory.with_mut(|bytes| {
            let base = ptr as usize;
            for j in (0..dst_byte_length as usize).rev() {
                bytes[base + 2 * j] = bytes[base + j];
                bytes[base + 2 * j + 1] = 0;
            }
        });

        // Convert the remainder directly to UTF-16 after the spread
        // portion.
        let dest_ptr = ptr + 2 * dst_byte_length;
        let dest_capacity = worst_case_size - 2 * dst_byte_length;
        let enc_len = transcode_into_memory(
            cx,
            dest_ptr,
            dest_capacity,
            &s.as_bytes()[byte_index..],
            StringEncoding::Utf8,
            StringEncoding::Utf16Le,
        )?;
        let tagged_code_units = (dst_byte_length + enc_len / 2) | UTF16_TAG;
        return Ok((ptr, tagged_code_units));
    }

    if dst_byte_length < src_code_units {
        ptr = cx.opts.realloc(ptr, src_code_units, 2, dst_byte_length)?;
    }
    Ok((ptr, dst_byte_length))
}

/// Load a string from guest memory given its pointer and tagged
/// code-unit count.
pub fn load_string_from_range(
    cx: &LiftLowerContext,
    ptr: u32,
    tagged_code_units: u32,
) -> Result<String> {
    let (encoding, alignment, byte_length) = match cx.opts.string_encoding {
        StringEncoding::Utf8 => (StringEncoding::Utf8, 1, tagged_code_units),
        StringEncoding::Utf16Le => {
            let byte_length = tagged_code_units
                .checked_mul(2)
                .ok_or(Error::invalid_value(codes::STRING_TOO_LONG, "string too long"))?;
            (StringEncoding::Utf16Le, 2, byte_length)
        }
        StringEncoding::Latin1Utf16 => {
            if tagged_code_units & UTF16_TAG != 0 {
                let units = tagged_code_units ^ UTF16_TAG;
                let byte_length = units
                    .checked_mul(2)
                    .ok_or(Error::invalid_value(codes::STRING_TOO_LONG, "string too long"))?;
                (StringEncoding::Utf16Le, 2, byte_length)
            } else {
                (StringEncoding::Latin1, 2, tagged_code_units)
            }
        }
        StringEncoding::Latin1 => {
            return Err(Error::invalid_value(
                codes::INVALID_ENCODING,
                "Latin-1 is not a valid guest encoding on its own",
            ))
        }
    };
    cx.trap_if(byte_length > MAX_STRING_BYTE_LENGTH, || {
        Error::invalid_value(codes::STRING_TOO_LONG, "string too long")
    })?;
    cx.opts.memory.check_aligned(ptr, alignment)?;
    let bytes = cx.opts.memory.read(ptr, byte_length)?;
    decode_string(&bytes, encoding).map_err(|e| cx.trap(e))
}
