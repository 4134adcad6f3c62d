//! Conversion between primitive tag values and readable strings.
//!
//! Buffers here are in host byte order, the form the client library hands
//! back from reads. Numeric parsing saturates at the type's extremes and
//! still stores the saturated value while reporting `Overflow` or
//! `Underflow`; callers that care check the result, callers that don't get
//! the clamped value. TIME renders as `YYYY-MM-DDTHH:MM:SS.mmm` in UTC.

use chrono::{DateTime, NaiveDateTime};

use crate::error::{DaxError, DaxResult};
use crate::types::{Primitive, TagType};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Render one element of a value buffer as a string.
///
/// `index` selects the element; for BOOL it is the bit index into the
/// buffer.
pub fn val_to_string(tag_type: TagType, val: &[u8], index: usize) -> DaxResult<String> {
    if val.is_empty() {
        return Err(DaxError::Empty);
    }
    let prim = tag_type.primitive().ok_or(DaxError::BadType)?;
    let width = prim.size_bytes() as usize;
    if prim != Primitive::Bool && (index + 1) * width > val.len() {
        return DaxError::bad_arg();
    }
    let at = index * width;
    let text = match prim {
        Primitive::Bool => {
            if index / 8 >= val.len() {
                return DaxError::bad_arg();
            }
            if val[index / 8] & (1 << (index % 8)) != 0 {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        Primitive::Byte => format!("{}", val[at]),
        Primitive::Sint => format!("{}", val[at] as i8),
        Primitive::Char => format!("{}", val[at] as char),
        Primitive::Word | Primitive::Uint => {
            format!("{}", u16::from_ne_bytes(val[at..at + 2].try_into().unwrap()))
        }
        Primitive::Int => format!("{}", i16::from_ne_bytes(val[at..at + 2].try_into().unwrap())),
        Primitive::Dword | Primitive::Udint => {
            format!("{}", u32::from_ne_bytes(val[at..at + 4].try_into().unwrap()))
        }
        Primitive::Dint => format!("{}", i32::from_ne_bytes(val[at..at + 4].try_into().unwrap())),
        Primitive::Real => format!("{}", f32::from_ne_bytes(val[at..at + 4].try_into().unwrap())),
        Primitive::Lword | Primitive::Ulint => {
            format!("{}", u64::from_ne_bytes(val[at..at + 8].try_into().unwrap()))
        }
        Primitive::Lint => format!("{}", i64::from_ne_bytes(val[at..at + 8].try_into().unwrap())),
        Primitive::Lreal => format!("{}", f64::from_ne_bytes(val[at..at + 8].try_into().unwrap())),
        Primitive::Time => {
            let ms = i64::from_ne_bytes(val[at..at + 8].try_into().unwrap());
            match DateTime::from_timestamp_millis(ms) {
                Some(stamp) => stamp.format(TIME_FORMAT).to_string(),
                None => return DaxError::bad_arg(),
            }
        }
    };
    Ok(text)
}

// Integer parse with the usual prefixes. A string that is not a number at
// all parses as zero, like the strtol family the conversion contract
// comes from.
fn parse_int(text: &str) -> i128 {
    let text = text.trim();
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let parsed = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16)
    } else {
        rest.parse::<i128>()
    };
    let magnitude = parsed.unwrap_or(0);
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

fn store_clamped(
    value: i128,
    min: i128,
    max: i128,
    mut store: impl FnMut(i128),
) -> DaxResult<()> {
    if value < min {
        store(min);
        return Err(DaxError::Underflow);
    }
    if value > max {
        store(max);
        return Err(DaxError::Overflow);
    }
    store(value);
    Ok(())
}

/// Parse a string into one element of a value buffer.
///
/// `buff` is indexed by element (bit for BOOL); when `mask` is given, the
/// element's bits are set in it so the caller can turn the conversion into
/// a masked write. Out-of-range numbers clamp to the type's extremes and
/// report `Overflow`/`Underflow` after storing the clamped value.
pub fn string_to_val(
    text: &str,
    tag_type: TagType,
    buff: &mut [u8],
    mut mask: Option<&mut [u8]>,
    index: usize,
) -> DaxResult<()> {
    let prim = tag_type.primitive().ok_or(DaxError::BadType)?;
    let width = prim.size_bytes() as usize;
    if prim != Primitive::Bool && (index + 1) * width > buff.len() {
        return DaxError::bad_arg();
    }
    let at = index * width;
    match prim {
        Primitive::Bool => {
            if index / 8 >= buff.len() {
                return DaxError::bad_arg();
            }
            if parse_int(text) == 0 {
                buff[index / 8] &= !(1 << (index % 8));
            } else {
                buff[index / 8] |= 1 << (index % 8);
            }
            if let Some(mask) = mask.as_deref_mut() {
                mask[index / 8] |= 1 << (index % 8);
            }
            return Ok(());
        }
        Primitive::Char => {
            // A single character stores as itself; anything longer is
            // treated as a number like SINT.
            if text.len() == 1 {
                buff[at] = text.as_bytes()[0];
                if let Some(mask) = mask.as_deref_mut() {
                    mask[at] = 0xFF;
                }
                return Ok(());
            }
        }
        _ => {}
    }
    if let Some(mask) = mask.as_deref_mut() {
        for byte in &mut mask[at..at + width] {
            *byte = 0xFF;
        }
    }
    match prim {
        Primitive::Byte => store_clamped(parse_int(text), 0, u8::MAX as i128, |v| {
            buff[at] = v as u8;
        }),
        Primitive::Sint | Primitive::Char => store_clamped(
            parse_int(text),
            i8::MIN as i128,
            i8::MAX as i128,
            |v| buff[at] = v as i8 as u8,
        ),
        Primitive::Word | Primitive::Uint => store_clamped(parse_int(text), 0, u16::MAX as i128, |v| {
            buff[at..at + 2].copy_from_slice(&(v as u16).to_ne_bytes());
        }),
        Primitive::Int => store_clamped(
            parse_int(text),
            i16::MIN as i128,
            i16::MAX as i128,
            |v| {
                buff[at..at + 2].copy_from_slice(&(v as i16).to_ne_bytes());
            },
        ),
        Primitive::Dword | Primitive::Udint => {
            store_clamped(parse_int(text), 0, u32::MAX as i128, |v| {
                buff[at..at + 4].copy_from_slice(&(v as u32).to_ne_bytes());
            })
        }
        Primitive::Dint => store_clamped(
            parse_int(text),
            i32::MIN as i128,
            i32::MAX as i128,
            |v| {
                buff[at..at + 4].copy_from_slice(&(v as i32).to_ne_bytes());
            },
        ),
        Primitive::Lword | Primitive::Ulint => {
            store_clamped(parse_int(text), 0, u64::MAX as i128, |v| {
                buff[at..at + 8].copy_from_slice(&(v as u64).to_ne_bytes());
            })
        }
        Primitive::Lint => store_clamped(
            parse_int(text),
            i64::MIN as i128,
            i64::MAX as i128,
            |v| {
                buff[at..at + 8].copy_from_slice(&(v as i64).to_ne_bytes());
            },
        ),
        Primitive::Time => {
            let ms = parse_time(text)?;
            buff[at..at + 8].copy_from_slice(&ms.to_ne_bytes());
            Ok(())
        }
        Primitive::Real => {
            let value = text.trim().parse::<f32>().unwrap_or(0.0);
            buff[at..at + 4].copy_from_slice(&value.to_ne_bytes());
            Ok(())
        }
        Primitive::Lreal => {
            let value = text.trim().parse::<f64>().unwrap_or(0.0);
            buff[at..at + 8].copy_from_slice(&value.to_ne_bytes());
            Ok(())
        }
        Primitive::Bool => unreachable!("handled above"),
    }
}

// A TIME string is either the canonical timestamp form or a plain
// millisecond count.
fn parse_time(text: &str) -> DaxResult<i64> {
    let text = text.trim();
    for format in [TIME_FORMAT, "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    let value = parse_int(text);
    if value > i64::MAX as i128 {
        return Err(DaxError::Overflow);
    }
    if value < i64::MIN as i128 {
        return Err(DaxError::Underflow);
    }
    Ok(value as i64)
}
