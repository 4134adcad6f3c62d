use num_enum::TryFromPrimitive;

use crate::data::AtomicOp;
use crate::error::DaxError;
use crate::event::{EventKind, EventOptions};
use crate::handle::Handle;
use crate::types::{TagAttr, TagType};
use crate::wire::WireComponent;

/// Request opcodes. Stable on the wire; `Event` only ever appears in
/// unsolicited server frames whose request identifier is zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    TagAdd = 1,
    TagDel = 2,
    TagByIndex = 3,
    TagByName = 4,
    Read = 5,
    Write = 6,
    MaskWrite = 7,
    Atomic = 8,
    CdtRegister = 9,
    CdtGet = 10,
    EventAdd = 11,
    EventDel = 12,
    EventOptions = 13,
    ModRegister = 14,
    ModSetRunning = 15,
    Event = 16,
}

impl WireComponent for Handle {
    decode!(read {
        Ok(Handle {
            index: u32::decode(read).await?,
            byte: u32::decode(read).await?,
            bit: u8::decode(read).await?,
            count: u32::decode(read).await?,
            tag_type: TagType::from_raw(u32::decode(read).await?),
            size: u32::decode(read).await?,
        })
    });

    encode!(component_ref, write {
        component_ref.index.encode(write).await?;
        component_ref.byte.encode(write).await?;
        component_ref.bit.encode(write).await?;
        component_ref.count.encode(write).await?;
        component_ref.tag_type.raw().encode(write).await?;
        component_ref.size.encode(write).await?;
    });
}

/// A tag's description as returned by the lookup requests.
#[derive(Clone, Debug, PartialEq)]
pub struct TagDesc {
    pub index: u32,
    pub tag_type: TagType,
    pub count: u32,
    pub attributes: TagAttr,
    pub name: String,
}

impl WireComponent for TagDesc {
    decode!(read {
        Ok(TagDesc {
            index: u32::decode(read).await?,
            tag_type: TagType::from_raw(u32::decode(read).await?),
            count: u32::decode(read).await?,
            attributes: TagAttr::from_bits_truncate(u16::decode(read).await?),
            name: String::decode(read).await?,
        })
    });

    encode!(component_ref, write {
        component_ref.index.encode(write).await?;
        component_ref.tag_type.raw().encode(write).await?;
        component_ref.count.encode(write).await?;
        component_ref.attributes.bits().encode(write).await?;
        component_ref.name.encode(write).await?;
    });
}

/// One member in a compound type description on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct CdtMemberDesc {
    pub name: String,
    pub tag_type: TagType,
    pub count: u32,
}

impl WireComponent for CdtMemberDesc {
    decode!(read {
        Ok(CdtMemberDesc {
            name: String::decode(read).await?,
            tag_type: TagType::from_raw(u32::decode(read).await?),
            count: u32::decode(read).await?,
        })
    });

    encode!(component_ref, write {
        component_ref.name.encode(write).await?;
        component_ref.tag_type.raw().encode(write).await?;
        component_ref.count.encode(write).await?;
    });
}

const CDT_MEMBER_CAP: usize = 1024;

impl WireComponent for Vec<CdtMemberDesc> {
    decode!(read {
        let len = u16::decode(read).await? as usize;
        if len > CDT_MEMBER_CAP {
            return DaxError::too_big();
        }
        let mut members = Vec::with_capacity(len);
        for _ in 0..len {
            members.push(CdtMemberDesc::decode(read).await?);
        }
        Ok(members)
    });

    encode!(component_ref, write {
        if component_ref.len() > CDT_MEMBER_CAP {
            return DaxError::too_big();
        }
        (component_ref.len() as u16).encode(write).await?;
        for member in component_ref {
            member.encode(write).await?;
        }
    });
}

/// A compound type description, the `CdtGet` response payload.
#[derive(Clone, Debug, PartialEq)]
pub struct CdtDesc {
    pub name: String,
    pub members: Vec<CdtMemberDesc>,
}

impl WireComponent for CdtDesc {
    decode!(read {
        Ok(CdtDesc {
            name: String::decode(read).await?,
            members: Vec::<CdtMemberDesc>::decode(read).await?,
        })
    });

    encode!(component_ref, write {
        component_ref.name.encode(write).await?;
        component_ref.members.encode(write).await?;
    });
}

/// Every request a client can put on the wire. The encoding starts with
/// the [`Opcode`] discriminant.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    TagAdd {
        name: String,
        tag_type: TagType,
        count: u32,
        attributes: TagAttr,
    },
    TagDel {
        index: u32,
    },
    TagByIndex {
        index: u32,
    },
    TagByName {
        name: String,
    },
    Read {
        handle: Handle,
    },
    Write {
        handle: Handle,
        data: Vec<u8>,
    },
    MaskWrite {
        handle: Handle,
        data: Vec<u8>,
        mask: Vec<u8>,
    },
    Atomic {
        handle: Handle,
        op: AtomicOp,
        operand: Vec<u8>,
    },
    CdtRegister {
        name: String,
        members: Vec<CdtMemberDesc>,
    },
    CdtGet {
        tag_type: TagType,
    },
    EventAdd {
        handle: Handle,
        kind: EventKind,
        value: f64,
        options: EventOptions,
    },
    EventDel {
        event_id: u32,
    },
    EventOptions {
        event_id: u32,
        options: EventOptions,
    },
    ModRegister {
        name: String,
    },
    ModSetRunning {
        running: bool,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::TagAdd { .. } => Opcode::TagAdd,
            Request::TagDel { .. } => Opcode::TagDel,
            Request::TagByIndex { .. } => Opcode::TagByIndex,
            Request::TagByName { .. } => Opcode::TagByName,
            Request::Read { .. } => Opcode::Read,
            Request::Write { .. } => Opcode::Write,
            Request::MaskWrite { .. } => Opcode::MaskWrite,
            Request::Atomic { .. } => Opcode::Atomic,
            Request::CdtRegister { .. } => Opcode::CdtRegister,
            Request::CdtGet { .. } => Opcode::CdtGet,
            Request::EventAdd { .. } => Opcode::EventAdd,
            Request::EventDel { .. } => Opcode::EventDel,
            Request::EventOptions { .. } => Opcode::EventOptions,
            Request::ModRegister { .. } => Opcode::ModRegister,
            Request::ModSetRunning { .. } => Opcode::ModSetRunning,
        }
    }
}

impl WireComponent for Request {
    decode!(read {
        let opcode = Opcode::try_from(u16::decode(read).await?).map_err(|_| DaxError::NotImplemented)?;
        match opcode {
            Opcode::TagAdd => Ok(Request::TagAdd {
                name: String::decode(read).await?,
                tag_type: TagType::from_raw(u32::decode(read).await?),
                count: u32::decode(read).await?,
                attributes: TagAttr::from_bits_truncate(u16::decode(read).await?),
            }),
            Opcode::TagDel => Ok(Request::TagDel {
                index: u32::decode(read).await?,
            }),
            Opcode::TagByIndex => Ok(Request::TagByIndex {
                index: u32::decode(read).await?,
            }),
            Opcode::TagByName => Ok(Request::TagByName {
                name: String::decode(read).await?,
            }),
            Opcode::Read => Ok(Request::Read {
                handle: Handle::decode(read).await?,
            }),
            Opcode::Write => Ok(Request::Write {
                handle: Handle::decode(read).await?,
                data: Vec::<u8>::decode(read).await?,
            }),
            Opcode::MaskWrite => Ok(Request::MaskWrite {
                handle: Handle::decode(read).await?,
                data: Vec::<u8>::decode(read).await?,
                mask: Vec::<u8>::decode(read).await?,
            }),
            Opcode::Atomic => Ok(Request::Atomic {
                handle: Handle::decode(read).await?,
                op: AtomicOp::try_from(u16::decode(read).await?).map_err(|_| DaxError::BadArg)?,
                operand: Vec::<u8>::decode(read).await?,
            }),
            Opcode::CdtRegister => Ok(Request::CdtRegister {
                name: String::decode(read).await?,
                members: Vec::<CdtMemberDesc>::decode(read).await?,
            }),
            Opcode::CdtGet => Ok(Request::CdtGet {
                tag_type: TagType::from_raw(u32::decode(read).await?),
            }),
            Opcode::EventAdd => Ok(Request::EventAdd {
                handle: Handle::decode(read).await?,
                kind: EventKind::try_from(u8::decode(read).await?).map_err(|_| DaxError::BadArg)?,
                value: f64::decode(read).await?,
                options: EventOptions::from_bits_truncate(u16::decode(read).await?),
            }),
            Opcode::EventDel => Ok(Request::EventDel {
                event_id: u32::decode(read).await?,
            }),
            Opcode::EventOptions => Ok(Request::EventOptions {
                event_id: u32::decode(read).await?,
                options: EventOptions::from_bits_truncate(u16::decode(read).await?),
            }),
            Opcode::ModRegister => Ok(Request::ModRegister {
                name: String::decode(read).await?,
            }),
            Opcode::ModSetRunning => Ok(Request::ModSetRunning {
                running: u8::decode(read).await? != 0,
            }),
            Opcode::Event => DaxError::bad_arg(),
        }
    });

    encode!(component_ref, write {
        (component_ref.opcode() as u16).encode(write).await?;
        match component_ref {
            Request::TagAdd {
                name,
                tag_type,
                count,
                attributes,
            } => {
                name.encode(write).await?;
                tag_type.raw().encode(write).await?;
                count.encode(write).await?;
                attributes.bits().encode(write).await?;
            }
            Request::TagDel { index } | Request::TagByIndex { index } => {
                index.encode(write).await?;
            }
            Request::TagByName { name } | Request::ModRegister { name } => {
                name.encode(write).await?;
            }
            Request::Read { handle } => {
                handle.encode(write).await?;
            }
            Request::Write { handle, data } => {
                handle.encode(write).await?;
                data.encode(write).await?;
            }
            Request::MaskWrite { handle, data, mask } => {
                handle.encode(write).await?;
                data.encode(write).await?;
                mask.encode(write).await?;
            }
            Request::Atomic {
                handle,
                op,
                operand,
            } => {
                handle.encode(write).await?;
                (*op as u16).encode(write).await?;
                operand.encode(write).await?;
            }
            Request::CdtRegister { name, members } => {
                name.encode(write).await?;
                members.encode(write).await?;
            }
            Request::CdtGet { tag_type } => {
                tag_type.raw().encode(write).await?;
            }
            Request::EventAdd {
                handle,
                kind,
                value,
                options,
            } => {
                handle.encode(write).await?;
                (*kind as u8).encode(write).await?;
                value.encode(write).await?;
                options.bits().encode(write).await?;
            }
            Request::EventDel { event_id } => {
                event_id.encode(write).await?;
            }
            Request::EventOptions { event_id, options } => {
                event_id.encode(write).await?;
                options.bits().encode(write).await?;
            }
            Request::ModSetRunning { running } => {
                (*running as u8).encode(write).await?;
            }
        }
    });
}

/// An unsolicited notification frame body, following the zero request
/// identifier and the `Event` opcode.
#[derive(Clone, Debug, PartialEq)]
pub struct EventFrame {
    pub event_id: u32,
    pub kind: EventKind,
    /// Present when the event was registered with SEND_DATA.
    pub data: Option<Vec<u8>>,
}

impl WireComponent for EventFrame {
    decode!(read {
        let event_id = u32::decode(read).await?;
        let kind = EventKind::try_from(u8::decode(read).await?).map_err(|_| DaxError::BadArg)?;
        let flags = u8::decode(read).await?;
        let data = if flags & 0x01 != 0 {
            Some(Vec::<u8>::decode(read).await?)
        } else {
            None
        };
        Ok(EventFrame {
            event_id,
            kind,
            data,
        })
    });

    encode!(component_ref, write {
        component_ref.event_id.encode(write).await?;
        (component_ref.kind as u8).encode(write).await?;
        match &component_ref.data {
            Some(data) => {
                1u8.encode(write).await?;
                data.encode(write).await?;
            }
            None => {
                0u8.encode(write).await?;
            }
        }
    });
}
