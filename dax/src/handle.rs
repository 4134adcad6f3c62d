use crate::error::{DaxError, DaxResult};
use crate::types::{TagType, TypeLookup};

/// A resolved reference to a sub-region of a tag.
///
/// Handles are produced once from a textual path and then used as opaque
/// coordinates; they do not own the tag and carry no liveness guarantee.
/// `bit` is non-zero only when the addressed data starts inside a byte,
/// which in practice means BOOL regions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Handle {
    /// Index of the tag this handle points into.
    pub index: u32,
    /// Byte offset of the window inside the tag's backing.
    pub byte: u32,
    /// Bit offset inside the first byte.
    pub bit: u8,
    /// Number of addressed elements.
    pub count: u32,
    /// The leaf type of the addressed region.
    pub tag_type: TagType,
    /// Size of the window in bytes.
    pub size: u32,
}

/// Base-tag facts the resolver needs from whichever side is resolving.
#[derive(Clone, Copy, Debug)]
pub struct TagRef {
    pub index: u32,
    pub tag_type: TagType,
    pub count: u32,
}

struct Segment<'a> {
    name: &'a str,
    index: Option<u32>,
}

fn parse_segment(text: &str) -> DaxResult<Segment<'_>> {
    match text.find('[') {
        None => Ok(Segment {
            name: text,
            index: None,
        }),
        Some(open) => {
            if !text.ends_with(']') || open + 1 >= text.len() - 1 {
                return DaxError::bad_arg();
            }
            let digits = &text[open + 1..text.len() - 1];
            let index = digits.parse::<u32>().map_err(|_| DaxError::BadArg)?;
            Ok(Segment {
                name: &text[..open],
                index: Some(index),
            })
        }
    }
}

// Bit offset of `name` inside a member list: the plain running sum of the
// preceding members' widths, with no padding between members of any type.
// Returns the member alongside its offset.
fn member_offset(
    types: &impl TypeLookup,
    parent: TagType,
    name: &str,
) -> DaxResult<(crate::types::CdtMember, u32)> {
    let cdt = types.members_of(parent)?;
    let mut bits = 0u32;
    for member in &cdt.members {
        if member.name == name {
            return Ok((member.clone(), bits));
        }
        bits += types.size_bits(member.tag_type)? * member.count;
    }
    DaxError::not_found()
}

/// Resolve a tag path such as `pump.status[2]` to a [`Handle`].
///
/// `count` selects how many elements the handle covers; zero means "through
/// the end of the addressed array". `tag_by_name` supplies the base tag and
/// `types` answers member layout questions, so the server can resolve
/// against its registry and the client against its fetched type cache with
/// the same walk.
pub fn resolve<L, F>(path: &str, count: u32, tag_by_name: F, types: &L) -> DaxResult<Handle>
where
    L: TypeLookup,
    F: FnOnce(&str) -> DaxResult<TagRef>,
{
    let mut segments = path.split('.');
    let base = parse_segment(segments.next().unwrap_or(""))?;
    if base.name.is_empty() {
        return DaxError::not_found();
    }
    let tag = tag_by_name(base.name)?;

    let mut bit_pos = 0u64;
    let mut cur_type = tag.tag_type;
    let mut remaining = tag.count;
    if let Some(idx) = base.index {
        if idx >= remaining {
            return DaxError::too_big();
        }
        bit_pos += idx as u64 * types.size_bits(cur_type)? as u64;
        remaining -= idx;
    }

    for text in segments {
        let segment = parse_segment(text)?;
        if segment.name.is_empty() {
            return DaxError::bad_arg();
        }
        if !cur_type.is_custom() {
            return DaxError::bad_arg();
        }
        let (member, offset) = member_offset(types, cur_type, segment.name)?;
        bit_pos += offset as u64;
        cur_type = member.tag_type;
        remaining = member.count;
        if let Some(idx) = segment.index {
            if idx >= remaining {
                return DaxError::too_big();
            }
            bit_pos += idx as u64 * types.size_bits(cur_type)? as u64;
            remaining -= idx;
        }
    }

    let requested = if count == 0 { remaining } else { count };
    if requested > remaining {
        return DaxError::too_big();
    }

    let bit = (bit_pos % 8) as u8;
    let span = bit as u64 + types.size_bits(cur_type)? as u64 * requested as u64;
    let size = (span + 7) / 8;
    if size > u32::MAX as u64 {
        return DaxError::too_big();
    }
    Ok(Handle {
        index: tag.index,
        byte: (bit_pos / 8) as u32,
        bit,
        count: requested,
        tag_type: cur_type,
        size: size as u32,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{CdtMember, TypeRegistry};

    fn registry_with_point() -> (TypeRegistry, TagType) {
        let registry = TypeRegistry::new();
        let point = registry
            .register_cdt(
                "Point",
                vec![
                    CdtMember {
                        name: "x".to_string(),
                        tag_type: TagType::LREAL,
                        count: 1,
                    },
                    CdtMember {
                        name: "y".to_string(),
                        tag_type: TagType::LREAL,
                        count: 1,
                    },
                    CdtMember {
                        name: "z".to_string(),
                        tag_type: TagType::LREAL,
                        count: 1,
                    },
                ],
            )
            .unwrap();
        (registry, point)
    }

    fn one_tag(tag_type: TagType, count: u32) -> impl FnOnce(&str) -> DaxResult<TagRef> {
        move |name| {
            if name == "tag" {
                Ok(TagRef {
                    index: 7,
                    tag_type,
                    count,
                })
            } else {
                DaxError::not_found()
            }
        }
    }

    #[test]
    fn whole_tag() {
        let registry = TypeRegistry::new();
        let h = resolve("tag", 0, one_tag(TagType::DINT, 4), &registry).unwrap();
        assert_eq!(h.index, 7);
        assert_eq!(h.byte, 0);
        assert_eq!(h.bit, 0);
        assert_eq!(h.count, 4);
        assert_eq!(h.size, 16);
    }

    #[test]
    fn bool_subrange() {
        let registry = TypeRegistry::new();
        let h = resolve("tag[3]", 10, one_tag(TagType::BOOL, 16), &registry).unwrap();
        assert_eq!(h.byte, 0);
        assert_eq!(h.bit, 3);
        assert_eq!(h.count, 10);
        assert_eq!(h.size, 2);

        let h = resolve("tag[5]", 16, one_tag(TagType::BOOL, 24), &registry).unwrap();
        assert_eq!(h.byte, 0);
        assert_eq!(h.bit, 5);
        assert_eq!(h.size, 3);

        let h = resolve("tag[8]", 8, one_tag(TagType::BOOL, 16), &registry).unwrap();
        assert_eq!(h.byte, 1);
        assert_eq!(h.bit, 0);
        assert_eq!(h.size, 1);
    }

    #[test]
    fn member_paths() {
        let (registry, point) = registry_with_point();
        let h = resolve("tag[0].y", 0, one_tag(point, 2), &registry).unwrap();
        assert_eq!(h.byte, 8);
        assert_eq!(h.count, 1);
        assert_eq!(h.size, 8);
        assert_eq!(h.tag_type, TagType::LREAL);

        let h = resolve("tag[1].z", 0, one_tag(point, 2), &registry).unwrap();
        assert_eq!(h.byte, 24 + 16);
    }

    #[test]
    fn empty_name_is_not_found() {
        let registry = TypeRegistry::new();
        assert!(matches!(
            resolve("", 0, one_tag(TagType::DINT, 1), &registry),
            Err(DaxError::NotFound)
        ));
    }

    #[test]
    fn range_and_syntax_errors() {
        let registry = TypeRegistry::new();
        assert!(matches!(
            resolve("tag[4]", 1, one_tag(TagType::DINT, 4), &registry),
            Err(DaxError::TooBig)
        ));
        assert!(matches!(
            resolve("tag", 5, one_tag(TagType::DINT, 4), &registry),
            Err(DaxError::TooBig)
        ));
        assert!(matches!(
            resolve("tag[x]", 1, one_tag(TagType::DINT, 4), &registry),
            Err(DaxError::BadArg)
        ));
        assert!(matches!(
            resolve("tag.member", 1, one_tag(TagType::DINT, 4), &registry),
            Err(DaxError::BadArg)
        ));
        let (registry, point) = registry_with_point();
        assert!(matches!(
            resolve("tag.w", 1, one_tag(point, 1), &registry),
            Err(DaxError::NotFound)
        ));
    }
}
