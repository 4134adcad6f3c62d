use std::collections::HashMap;
use std::sync::Arc;

use num_enum::TryFromPrimitive;
use parking_lot::RwLock;

use crate::error::{DaxError, DaxResult};

/// Maximum length of a tag, type or member name in bytes.
pub const TAGNAME_SIZE: usize = 32;

/// Bit 31 marks a type identifier as an index into the registry's compound
/// data types; the remaining bits are the index itself.
const CUSTOM_FLAG: u32 = 0x8000_0000;

/// The built-in primitive types.
///
/// The low nibble of each identifier encodes the element width class, so a
/// single shift recovers the size in bits. BOOL is the one exception and is
/// a single bit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum Primitive {
    Bool = 0x10,
    Byte = 0x03,
    Sint = 0x13,
    Char = 0x23,
    Word = 0x04,
    Uint = 0x14,
    Int = 0x24,
    Dword = 0x05,
    Udint = 0x15,
    Dint = 0x25,
    Real = 0x35,
    Lword = 0x06,
    Ulint = 0x16,
    Lint = 0x26,
    Time = 0x36,
    Lreal = 0x46,
}

impl Primitive {
    /// Width of a single element in bits.
    pub fn size_bits(self) -> u32 {
        match self {
            Primitive::Bool => 1,
            other => 1 << (other as u32 & 0x0F),
        }
    }

    /// Width of a single element in bytes, rounding BOOL up to one byte.
    pub fn size_bytes(self) -> u32 {
        (self.size_bits() + 7) / 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::Real | Primitive::Lreal)
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "BOOL",
            Primitive::Byte => "BYTE",
            Primitive::Sint => "SINT",
            Primitive::Char => "CHAR",
            Primitive::Word => "WORD",
            Primitive::Uint => "UINT",
            Primitive::Int => "INT",
            Primitive::Dword => "DWORD",
            Primitive::Udint => "UDINT",
            Primitive::Dint => "DINT",
            Primitive::Real => "REAL",
            Primitive::Lword => "LWORD",
            Primitive::Ulint => "ULINT",
            Primitive::Lint => "LINT",
            Primitive::Time => "TIME",
            Primitive::Lreal => "LREAL",
        }
    }

    pub fn from_name(name: &str) -> Option<Primitive> {
        Some(match name {
            "BOOL" => Primitive::Bool,
            "BYTE" => Primitive::Byte,
            "SINT" => Primitive::Sint,
            "CHAR" => Primitive::Char,
            "WORD" => Primitive::Word,
            "UINT" => Primitive::Uint,
            "INT" => Primitive::Int,
            "DWORD" => Primitive::Dword,
            "UDINT" => Primitive::Udint,
            "DINT" => Primitive::Dint,
            "REAL" => Primitive::Real,
            "LWORD" => Primitive::Lword,
            "ULINT" => Primitive::Ulint,
            "LINT" => Primitive::Lint,
            "TIME" => Primitive::Time,
            "LREAL" => Primitive::Lreal,
            _ => return None,
        })
    }
}

/// A type identifier: either a built-in primitive or a registered compound
/// data type tagged with the custom bit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TagType(u32);

impl TagType {
    pub const BOOL: TagType = TagType(Primitive::Bool as u32);
    pub const BYTE: TagType = TagType(Primitive::Byte as u32);
    pub const SINT: TagType = TagType(Primitive::Sint as u32);
    pub const CHAR: TagType = TagType(Primitive::Char as u32);
    pub const WORD: TagType = TagType(Primitive::Word as u32);
    pub const UINT: TagType = TagType(Primitive::Uint as u32);
    pub const INT: TagType = TagType(Primitive::Int as u32);
    pub const DWORD: TagType = TagType(Primitive::Dword as u32);
    pub const UDINT: TagType = TagType(Primitive::Udint as u32);
    pub const DINT: TagType = TagType(Primitive::Dint as u32);
    pub const REAL: TagType = TagType(Primitive::Real as u32);
    pub const LWORD: TagType = TagType(Primitive::Lword as u32);
    pub const ULINT: TagType = TagType(Primitive::Ulint as u32);
    pub const LINT: TagType = TagType(Primitive::Lint as u32);
    pub const TIME: TagType = TagType(Primitive::Time as u32);
    pub const LREAL: TagType = TagType(Primitive::Lreal as u32);

    /// Wrap a raw identifier read off the wire. No validation happens here;
    /// the registry rejects unknown identifiers when the type is used.
    pub const fn from_raw(raw: u32) -> TagType {
        TagType(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn custom(index: u32) -> TagType {
        TagType(CUSTOM_FLAG | index)
    }

    pub const fn is_custom(self) -> bool {
        self.0 & CUSTOM_FLAG != 0
    }

    /// The registry index for a custom type.
    pub fn custom_index(self) -> Option<u32> {
        if self.is_custom() {
            Some(self.0 & !CUSTOM_FLAG)
        } else {
            None
        }
    }

    /// The primitive this identifier names, if it is not custom.
    pub fn primitive(self) -> Option<Primitive> {
        Primitive::try_from(self.0).ok()
    }
}

impl From<Primitive> for TagType {
    fn from(prim: Primitive) -> TagType {
        TagType(prim as u32)
    }
}

bitflags::bitflags! {
    /// Per-tag attribute bits, stable on the wire.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct TagAttr: u16 {
        /// Clients may not write the tag.
        const READONLY = 0x0001;
        /// Reserved server tag; never deletable.
        const SPECIAL  = 0x0002;
        /// No backing store; reads go through a registered callback.
        const VIRTUAL  = 0x0004;
        /// The tag is a bounded FIFO of records rather than a value.
        const QUEUE    = 0x0008;
        /// The tag would survive a restart where persistence exists.
        const RETAINED = 0x0010;
    }
}

/// One member of a compound data type.
#[derive(Clone, Debug, PartialEq)]
pub struct CdtMember {
    pub name: String,
    pub tag_type: TagType,
    pub count: u32,
}

/// A registered compound data type. The size is computed once at
/// registration and never changes afterwards.
#[derive(Clone, Debug)]
pub struct Cdt {
    pub name: String,
    pub members: Vec<CdtMember>,
    pub size_bits: u32,
}

/// Anything that can answer layout questions about type identifiers.
///
/// The server's registry implements this directly; the client library
/// implements it over its cache of fetched type descriptions so the handle
/// resolver and the data formatter are shared between the two sides.
pub trait TypeLookup {
    /// The member list of a custom type.
    fn members_of(&self, tag_type: TagType) -> DaxResult<Arc<Cdt>>;

    /// Total width of one element of `tag_type` in bits.
    fn size_bits(&self, tag_type: TagType) -> DaxResult<u32> {
        if let Some(prim) = tag_type.primitive() {
            return Ok(prim.size_bits());
        }
        if tag_type.is_custom() {
            return Ok(self.members_of(tag_type)?.size_bits);
        }
        Err(DaxError::BadType)
    }

    /// Byte footprint of `count` elements of `tag_type`, BOOL packing
    /// included.
    fn size_bytes(&self, tag_type: TagType, count: u32) -> DaxResult<u32> {
        let bytes = (self.size_bits(tag_type)? as u64 * count as u64 + 7) / 8;
        if bytes > u32::MAX as u64 {
            return Err(DaxError::TooBig);
        }
        Ok(bytes as u32)
    }
}

/// Compute a compound type's width in bits from its member list.
///
/// The width is the plain running sum of `member_width * count` in
/// declaration order; members of every type pack contiguously with no
/// alignment padding. Rounding up to bytes happens only where a byte size
/// is reported.
pub fn cdt_size_bits(lookup: &impl TypeLookup, members: &[CdtMember]) -> DaxResult<u32> {
    let mut bits = 0u64;
    for member in members {
        bits += lookup.size_bits(member.tag_type)? as u64 * member.count as u64;
    }
    if bits > u32::MAX as u64 {
        return Err(DaxError::TooBig);
    }
    Ok(bits as u32)
}

/// Check a tag, type or member name: no more than [`TAGNAME_SIZE`] bytes,
/// first character a letter or underscore, the rest alphanumeric or
/// underscore.
pub fn valid_tagname(name: &str) -> bool {
    if name.is_empty() || name.len() > TAGNAME_SIZE {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct RegistryInner {
    cdts: Vec<Arc<Cdt>>,
    names: HashMap<String, u32>,
}

/// The registry of user-defined compound data types.
///
/// Registration is rare and guarded by the write half of a single
/// reader-writer lock; lookups clone an `Arc` out under the read half.
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

/// Identifier of the reserved descriptor type carried by the `_tag_added`
/// and `_tag_deleted` tags.
pub const TAG_DESC_TYPE: TagType = TagType::custom(0);

/// Byte footprint of one `_tag_desc` record.
pub const TAG_DESC_SIZE: u32 = 47;

impl TypeRegistry {
    /// Create a registry holding only the reserved `_tag_desc` type.
    pub fn new() -> TypeRegistry {
        let registry = TypeRegistry {
            inner: RwLock::new(RegistryInner {
                cdts: Vec::new(),
                names: HashMap::new(),
            }),
        };
        registry
            .register_cdt(
                "_tag_desc",
                vec![
                    CdtMember {
                        name: "index".to_string(),
                        tag_type: TagType::UDINT,
                        count: 1,
                    },
                    CdtMember {
                        name: "tag_type".to_string(),
                        tag_type: TagType::UDINT,
                        count: 1,
                    },
                    CdtMember {
                        name: "count".to_string(),
                        tag_type: TagType::UDINT,
                        count: 1,
                    },
                    CdtMember {
                        name: "attributes".to_string(),
                        tag_type: TagType::UINT,
                        count: 1,
                    },
                    CdtMember {
                        name: "name".to_string(),
                        tag_type: TagType::CHAR,
                        count: TAGNAME_SIZE as u32 + 1,
                    },
                ],
            )
            .expect("reserved descriptor type registers at boot");
        registry
    }

    /// Register a compound type and return its identifier.
    ///
    /// Members may only reference primitives and previously registered
    /// types, which is also what makes cycles unrepresentable: a type's own
    /// identifier does not exist until registration returns.
    pub fn register_cdt(&self, name: &str, members: Vec<CdtMember>) -> DaxResult<TagType> {
        if !valid_tagname(name) || members.is_empty() {
            return DaxError::bad_arg();
        }
        let mut inner = self.inner.write();
        if inner.names.contains_key(name) || Primitive::from_name(name).is_some() {
            return Err(DaxError::AlreadyExists);
        }
        let mut seen = HashMap::new();
        for member in &members {
            if !valid_tagname(&member.name) || member.count == 0 {
                return DaxError::bad_arg();
            }
            if seen.insert(member.name.clone(), ()).is_some() {
                return Err(DaxError::AlreadyExists);
            }
            match member.tag_type.custom_index() {
                Some(idx) if (idx as usize) < inner.cdts.len() => {}
                Some(_) => return Err(DaxError::BadType),
                None if member.tag_type.primitive().is_some() => {}
                None => return Err(DaxError::BadType),
            }
        }
        let size_bits = cdt_size_bits_inner(&inner.cdts, &members)?;
        let index = inner.cdts.len() as u32;
        inner.cdts.push(Arc::new(Cdt {
            name: name.to_string(),
            members,
            size_bits,
        }));
        inner.names.insert(name.to_string(), index);
        Ok(TagType::custom(index))
    }

    /// Look a compound type up by name.
    pub fn by_name(&self, name: &str) -> DaxResult<TagType> {
        let inner = self.inner.read();
        match inner.names.get(name) {
            Some(&index) => Ok(TagType::custom(index)),
            None => DaxError::not_found(),
        }
    }

    /// The display name of any type identifier.
    pub fn name_of(&self, tag_type: TagType) -> DaxResult<String> {
        if let Some(prim) = tag_type.primitive() {
            return Ok(prim.name().to_string());
        }
        Ok(self.members_of(tag_type)?.name.clone())
    }

    pub fn is_custom(&self, tag_type: TagType) -> bool {
        tag_type.is_custom()
    }

    /// Number of members of a custom type; primitives have none.
    pub fn member_count(&self, tag_type: TagType) -> DaxResult<usize> {
        if tag_type.primitive().is_some() {
            return Ok(0);
        }
        Ok(self.members_of(tag_type)?.members.len())
    }

    /// Visit every member of a custom type in declaration order.
    pub fn iter_members<F>(&self, tag_type: TagType, mut visitor: F) -> DaxResult<()>
    where
        F: FnMut(&CdtMember),
    {
        let cdt = self.members_of(tag_type)?;
        for member in &cdt.members {
            visitor(member);
        }
        Ok(())
    }
}

impl TypeLookup for TypeRegistry {
    fn members_of(&self, tag_type: TagType) -> DaxResult<Arc<Cdt>> {
        let index = tag_type.custom_index().ok_or(DaxError::BadType)?;
        let inner = self.inner.read();
        match inner.cdts.get(index as usize) {
            Some(cdt) => Ok(cdt.clone()),
            None => DaxError::not_found(),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

// Same running sum as `cdt_size_bits`, run against the registry's own
// vector while the write lock is already held.
fn cdt_size_bits_inner(cdts: &[Arc<Cdt>], members: &[CdtMember]) -> DaxResult<u32> {
    let mut bits = 0u64;
    for member in members {
        let member_bits = match member.tag_type.custom_index() {
            Some(idx) => cdts[idx as usize].size_bits,
            None => member.tag_type.primitive().ok_or(DaxError::BadType)?.size_bits(),
        };
        bits += member_bits as u64 * member.count as u64;
    }
    if bits > u32::MAX as u64 {
        return Err(DaxError::TooBig);
    }
    Ok(bits as u32)
}
