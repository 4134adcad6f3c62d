//! Byte and bit kernels shared by the server's data engine and the client
//! library: BOOL realignment, masked writes, per-element byte order
//! conversion and the atomic operators.
//!
//! Backing bytes and everything on the wire are little-endian; the
//! conversion routines are their own inverse, so one walk serves both the
//! read and the write direction.

use num_enum::TryFromPrimitive;

use crate::error::{DaxError, DaxResult};
use crate::types::{Primitive, TagType, TypeLookup};

/// Copy `count` bits out of `src` starting at bit `src_bit` into `dst`
/// packed from bit zero. Bytes of `dst` beyond the copied bits are zeroed.
pub fn bits_to_buffer(src: &[u8], src_bit: u32, count: u32, dst: &mut [u8]) {
    for byte in dst.iter_mut() {
        *byte = 0;
    }
    for n in 0..count {
        let i = (src_bit + n) as usize;
        if src[i / 8] & (1 << (i % 8)) != 0 {
            dst[(n / 8) as usize] |= 1 << (n % 8);
        }
    }
}

/// Spread `count` bits of `src` (packed from bit zero) into a data/mask
/// pair whose window starts at bit `dst_bit`. The mask covers exactly the
/// addressed bits so a masked write leaves the neighbours alone.
pub fn bits_from_buffer(src: &[u8], dst_bit: u32, count: u32, data: &mut [u8], mask: &mut [u8]) {
    for byte in data.iter_mut() {
        *byte = 0;
    }
    for byte in mask.iter_mut() {
        *byte = 0;
    }
    for n in 0..count {
        let i = (dst_bit + n) as usize;
        if src[(n / 8) as usize] & (1 << (n % 8)) != 0 {
            data[i / 8] |= 1 << (i % 8);
        }
        mask[i / 8] |= 1 << (i % 8);
    }
}

/// `new = (old & !mask) | (data & mask)`, byte for byte.
pub fn apply_mask(backing: &mut [u8], data: &[u8], mask: &[u8]) {
    for n in 0..backing.len() {
        backing[n] = (backing[n] & !mask[n]) | (data[n] & mask[n]);
    }
}

// Convert every `width`-byte element between wire order and host order.
// The swap is an involution, so the same routine runs in both directions.
fn swap_elements(width: usize, data: &mut [u8]) {
    if width < 2 {
        return;
    }
    for chunk in data.chunks_exact_mut(width) {
        match width {
            2 => {
                let v = u16::from_le_bytes(chunk.try_into().unwrap());
                chunk.copy_from_slice(&v.to_ne_bytes());
            }
            4 => {
                let v = u32::from_le_bytes(chunk.try_into().unwrap());
                chunk.copy_from_slice(&v.to_ne_bytes());
            }
            8 => {
                let v = u64::from_le_bytes(chunk.try_into().unwrap());
                chunk.copy_from_slice(&v.to_ne_bytes());
            }
            _ => unreachable!("element widths are 1, 2, 4 or 8"),
        }
    }
}

// Walk a type's layout and swap every multi-byte primitive leaf in place.
// Offsets are tracked in bits because members pack with no padding; a
// leaf that does not start on a byte boundary has no per-element byte
// order to fix and is left alone.
fn format_region(
    types: &impl TypeLookup,
    tag_type: TagType,
    count: u32,
    data: &mut [u8],
    offset_bits: u64,
) -> DaxResult<()> {
    if let Some(prim) = tag_type.primitive() {
        if prim == Primitive::Bool || offset_bits % 8 != 0 {
            return Ok(());
        }
        let width = prim.size_bytes() as usize;
        let offset = (offset_bits / 8) as usize;
        let len = width * count as usize;
        if offset + len > data.len() {
            return DaxError::bad_arg();
        }
        swap_elements(width, &mut data[offset..offset + len]);
        return Ok(());
    }
    let cdt = types.members_of(tag_type)?;
    for n in 0..count as u64 {
        let base = offset_bits + n * cdt.size_bits as u64;
        let mut bits = 0u64;
        for member in &cdt.members {
            format_region(types, member.tag_type, member.count, data, base + bits)?;
            bits += types.size_bits(member.tag_type)? as u64 * member.count as u64;
        }
    }
    Ok(())
}

/// Rewrite a buffer read off the wire into host byte order, element by
/// element, descending compound types to their primitive leaves.
pub fn wire_to_host(
    types: &impl TypeLookup,
    tag_type: TagType,
    count: u32,
    data: &mut [u8],
) -> DaxResult<()> {
    format_region(types, tag_type, count, data, 0)
}

/// Rewrite a host-order buffer into wire byte order. Symmetric with
/// [`wire_to_host`].
pub fn host_to_wire(
    types: &impl TypeLookup,
    tag_type: TagType,
    count: u32,
    data: &mut [u8],
) -> DaxResult<()> {
    format_region(types, tag_type, count, data, 0)
}

/// The atomic read-modify-write operators.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum AtomicOp {
    Not = 1,
    Or = 2,
    And = 3,
    Nand = 4,
    Nor = 5,
    Xor = 6,
    Add = 7,
    Sub = 8,
    Inc = 9,
    Dec = 10,
}

impl AtomicOp {
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            AtomicOp::Not | AtomicOp::Or | AtomicOp::And | AtomicOp::Nand | AtomicOp::Nor | AtomicOp::Xor
        )
    }

    /// Whether the operator consumes an operand buffer. `Not`, `Inc` and
    /// `Dec` work without one.
    pub fn needs_operand(self) -> bool {
        !matches!(self, AtomicOp::Not | AtomicOp::Inc | AtomicOp::Dec)
    }
}

fn atomic_bits(window: &mut [u8], bit: u32, count: u32, operand: &[u8], op: AtomicOp) -> DaxResult<()> {
    if op.needs_operand() && operand.len() < ((count + 7) / 8) as usize {
        return DaxError::bad_arg();
    }
    for n in 0..count {
        let i = (bit + n) as usize;
        let tag_bit = window[i / 8] & (1 << (i % 8)) != 0;
        let op_bit = if op.needs_operand() {
            operand[(n / 8) as usize] & (1 << (n % 8)) != 0
        } else {
            false
        };
        let result = match op {
            AtomicOp::Not => !tag_bit,
            AtomicOp::Or => tag_bit | op_bit,
            AtomicOp::And => tag_bit & op_bit,
            AtomicOp::Nand => !(tag_bit & op_bit),
            AtomicOp::Nor => !(tag_bit | op_bit),
            AtomicOp::Xor => tag_bit ^ op_bit,
            _ => return Err(DaxError::BadType),
        };
        if result {
            window[i / 8] |= 1 << (i % 8);
        } else {
            window[i / 8] &= !(1 << (i % 8));
        }
    }
    Ok(())
}

fn atomic_floats(window: &mut [u8], width: usize, operand: &[u8], op: AtomicOp) -> DaxResult<()> {
    if op.is_bitwise() {
        return Err(DaxError::BadType);
    }
    if op.needs_operand() && operand.len() < window.len() {
        return DaxError::bad_arg();
    }
    for (n, chunk) in window.chunks_exact_mut(width).enumerate() {
        let rhs = |chunk: &[u8], at: usize| -> f64 {
            match width {
                4 => f32::from_le_bytes(chunk[at..at + 4].try_into().unwrap()) as f64,
                _ => f64::from_le_bytes(chunk[at..at + 8].try_into().unwrap()),
            }
        };
        let value = rhs(chunk, 0);
        let operand_value = if op.needs_operand() {
            rhs(operand, n * width)
        } else {
            0.0
        };
        let result = match op {
            AtomicOp::Add => value + operand_value,
            AtomicOp::Sub => value - operand_value,
            AtomicOp::Inc => value + 1.0,
            AtomicOp::Dec => value - 1.0,
            _ => return Err(DaxError::BadType),
        };
        match width {
            4 => chunk.copy_from_slice(&(result as f32).to_le_bytes()),
            _ => chunk.copy_from_slice(&result.to_le_bytes()),
        }
    }
    Ok(())
}

fn atomic_ints(window: &mut [u8], width: usize, operand: &[u8], op: AtomicOp) -> DaxResult<()> {
    if op.needs_operand() && operand.len() < window.len() {
        return DaxError::bad_arg();
    }
    let load = |bytes: &[u8]| -> u64 {
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(bytes);
        u64::from_le_bytes(buf)
    };
    for (n, chunk) in window.chunks_exact_mut(width).enumerate() {
        let value = load(chunk);
        let operand_value = if op.needs_operand() {
            load(&operand[n * width..(n + 1) * width])
        } else {
            0
        };
        let result = match op {
            AtomicOp::Not => !value,
            AtomicOp::Or => value | operand_value,
            AtomicOp::And => value & operand_value,
            AtomicOp::Nand => !(value & operand_value),
            AtomicOp::Nor => !(value | operand_value),
            AtomicOp::Xor => value ^ operand_value,
            AtomicOp::Add => value.wrapping_add(operand_value),
            AtomicOp::Sub => value.wrapping_sub(operand_value),
            AtomicOp::Inc => value.wrapping_add(1),
            AtomicOp::Dec => value.wrapping_sub(1),
        };
        chunk.copy_from_slice(&result.to_le_bytes()[..width]);
    }
    Ok(())
}

/// Apply an atomic operator to a backing window in wire byte order.
///
/// BOOL regions operate bit-parallel over exactly the addressed bits
/// (`bit` is the window's starting bit, the operand is packed from bit
/// zero). Integer regions operate per element. REAL and LREAL admit only
/// the arithmetic operators.
pub fn apply_atomic(
    tag_type: TagType,
    count: u32,
    bit: u32,
    window: &mut [u8],
    operand: &[u8],
    op: AtomicOp,
) -> DaxResult<()> {
    let prim = tag_type.primitive().ok_or(DaxError::BadType)?;
    match prim {
        Primitive::Bool => {
            if !op.is_bitwise() {
                return Err(DaxError::BadType);
            }
            atomic_bits(window, bit, count, operand, op)
        }
        Primitive::Real | Primitive::Lreal => {
            atomic_floats(window, prim.size_bytes() as usize, operand, op)
        }
        _ => atomic_ints(window, prim.size_bytes() as usize, operand, op),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::TypeRegistry;

    #[test]
    fn realign_read() {
        // Bits 3..13 of 0xAA 0x55, packed down to bit zero.
        let src = [0xAAu8, 0x55];
        let mut dst = [0u8; 2];
        bits_to_buffer(&src, 3, 10, &mut dst);
        // 0xAA 0x55 is bits 1,3,5,7,8,10,12,14; shifted down by three.
        assert_eq!(dst, [0xB5, 0x02]);
    }

    #[test]
    fn realign_write_builds_exact_mask() {
        let src = [0xFFu8, 0xFF];
        let mut data = [0u8; 3];
        let mut mask = [0u8; 3];
        bits_from_buffer(&src, 5, 16, &mut data, &mut mask);
        assert_eq!(data, [0xE0, 0xFF, 0x1F]);
        assert_eq!(mask, [0xE0, 0xFF, 0x1F]);
    }

    #[test]
    fn masked_write_invariant() {
        let mut backing = [0b1010_1010u8, 0xFF];
        let data = [0b0101_0101u8, 0x00];
        let mask = [0b0000_1111u8, 0x0F];
        let expect = [
            (backing[0] & !mask[0]) | (data[0] & mask[0]),
            (backing[1] & !mask[1]) | (data[1] & mask[1]),
        ];
        apply_mask(&mut backing, &data, &mask);
        assert_eq!(backing, expect);
    }

    #[test]
    fn uint_formats_little_endian() {
        let registry = TypeRegistry::new();
        let mut data = 0x1234u16.to_ne_bytes();
        host_to_wire(&registry, TagType::UINT, 1, &mut data).unwrap();
        assert_eq!(data, [0x34, 0x12]);
        wire_to_host(&registry, TagType::UINT, 1, &mut data).unwrap();
        assert_eq!(data, 0x1234u16.to_ne_bytes());
    }

    #[test]
    fn lreal_formats_little_endian() {
        let registry = TypeRegistry::new();
        let mut data = 8.7f64.to_ne_bytes();
        host_to_wire(&registry, TagType::LREAL, 1, &mut data).unwrap();
        assert_eq!(data, 8.7f64.to_le_bytes());
    }

    #[test]
    fn atomic_not_bools() {
        let mut window = [0xAAu8, 0x55];
        apply_atomic(TagType::BOOL, 16, 0, &mut window, &[], AtomicOp::Not).unwrap();
        assert_eq!(window, [0x55, 0xAA]);
        // Partial complement over bits 3..13.
        apply_atomic(TagType::BOOL, 10, 3, &mut window, &[], AtomicOp::Not).unwrap();
        assert_eq!(window, [0xAD, 0xB5]);
    }

    #[test]
    fn atomic_or_bools() {
        let mut window = [0xAAu8, 0x55, 0x00];
        apply_atomic(
            TagType::BOOL,
            16,
            0,
            &mut window,
            &[0x55, 0xAA],
            AtomicOp::Or,
        )
        .unwrap();
        assert_eq!(window, [0xFF, 0xFF, 0x00]);

        let mut window = [0x55u8, 0x55, 0x00];
        apply_atomic(
            TagType::BOOL,
            10,
            3,
            &mut window,
            &[0x55, 0x55],
            AtomicOp::Or,
        )
        .unwrap();
        assert_eq!(window, [0xFD, 0x5F, 0x00]);

        let mut window = [0x00u8, 0x00, 0x00];
        apply_atomic(
            TagType::BOOL,
            16,
            5,
            &mut window,
            &[0xFF, 0xFF],
            AtomicOp::Or,
        )
        .unwrap();
        assert_eq!(window, [0xE0, 0xFF, 0x1F]);
    }

    #[test]
    fn atomic_not_ints() {
        let mut window = [0xAAu8, 0x55, 0x0F, 0xF0];
        apply_atomic(TagType::BYTE, 4, 0, &mut window, &[], AtomicOp::Not).unwrap();
        assert_eq!(window, [0x55, 0xAA, 0xF0, 0x0F]);

        let mut window = Vec::new();
        for v in [1234i32, -3453, -1, 0] {
            window.extend_from_slice(&v.to_le_bytes());
        }
        apply_atomic(TagType::DINT, 4, 0, &mut window, &[], AtomicOp::Not).unwrap();
        for (n, v) in [1234i32, -3453, -1, 0].iter().enumerate() {
            let got = i32::from_le_bytes(window[n * 4..n * 4 + 4].try_into().unwrap());
            assert_eq!(got, !v);
        }
        // Twice is the identity.
        apply_atomic(TagType::DINT, 4, 0, &mut window, &[], AtomicOp::Not).unwrap();
        for (n, v) in [1234i32, -3453, -1, 0].iter().enumerate() {
            let got = i32::from_le_bytes(window[n * 4..n * 4 + 4].try_into().unwrap());
            assert_eq!(got, *v);
        }
    }

    #[test]
    fn atomic_arithmetic() {
        let mut window = 40i16.to_le_bytes().to_vec();
        apply_atomic(TagType::INT, 1, 0, &mut window, &2i16.to_le_bytes(), AtomicOp::Add).unwrap();
        assert_eq!(i16::from_le_bytes(window[..].try_into().unwrap()), 42);
        apply_atomic(TagType::INT, 1, 0, &mut window, &[], AtomicOp::Dec).unwrap();
        assert_eq!(i16::from_le_bytes(window[..].try_into().unwrap()), 41);

        let mut window = 1.5f64.to_le_bytes().to_vec();
        apply_atomic(
            TagType::LREAL,
            1,
            0,
            &mut window,
            &2.25f64.to_le_bytes(),
            AtomicOp::Add,
        )
        .unwrap();
        assert_eq!(f64::from_le_bytes(window[..].try_into().unwrap()), 3.75);
    }

    #[test]
    fn atomic_type_errors() {
        let mut window = [0u8; 4];
        assert!(matches!(
            apply_atomic(TagType::REAL, 1, 0, &mut window, &[], AtomicOp::Not),
            Err(DaxError::BadType)
        ));
        let mut window = [0u8; 8];
        assert!(matches!(
            apply_atomic(TagType::LREAL, 1, 0, &mut window, &[0u8; 8], AtomicOp::Xor),
            Err(DaxError::BadType)
        ));
        let mut window = [0u8; 1];
        assert!(matches!(
            apply_atomic(TagType::BOOL, 8, 0, &mut window, &[], AtomicOp::Add),
            Err(DaxError::BadType)
        ));
    }
}
