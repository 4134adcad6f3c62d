//! The event subsystem: predicates that turn tag writes into per-session
//! notifications.
//!
//! Event entries live inside the tag they watch and are scanned in
//! insertion order, under the same lock that served the write, so the
//! notification order per session matches the write order.

use num_enum::TryFromPrimitive;
use tokio::sync::mpsc;

use crate::error::{DaxError, DaxResult};
use crate::types::{Primitive, TagType};

/// What a registered event reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum EventKind {
    /// Any write overlapping the watched range.
    Write = 1,
    /// Any bit of the watched range differs from before the write.
    Change = 2,
    /// A bit in the watched range went 0 to 1.
    Set = 3,
    /// A bit in the watched range went 1 to 0.
    Reset = 4,
    /// Some element is greater than the event value.
    Greater = 5,
    /// Some element is less than the event value.
    Less = 6,
    /// Some element equals the event value.
    Equal = 7,
    /// Some element moved at least the event value away from the last
    /// notified value.
    Deadband = 8,
}

impl EventKind {
    /// The scalar kinds compare decoded element values and therefore only
    /// make sense on non-BOOL primitives.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            EventKind::Greater | EventKind::Less | EventKind::Equal | EventKind::Deadband
        )
    }

    pub fn valid_for(self, tag_type: TagType) -> bool {
        if !self.is_scalar() {
            return true;
        }
        match tag_type.primitive() {
            Some(Primitive::Bool) | None => false,
            Some(_) => true,
        }
    }
}

bitflags::bitflags! {
    /// Per-event option bits, stable on the wire.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct EventOptions: u16 {
        /// Attach the watched range's current bytes to each notification.
        const SEND_DATA = 0x0001;
        /// Remove the event after its first fire.
        const ONESHOT   = 0x0002;
    }
}

/// A notification queued to the owning session.
#[derive(Clone, Debug)]
pub struct EventMessage {
    pub event_id: u32,
    pub kind: EventKind,
    /// The watched range's bytes at fire time, when SEND_DATA is set.
    pub data: Option<Vec<u8>>,
}

/// One registered event, stored in the watched tag's event list.
pub struct EventEntry {
    pub id: u32,
    pub session: u64,
    pub kind: EventKind,
    pub byte: u32,
    pub bit: u8,
    pub count: u32,
    pub tag_type: TagType,
    pub size: u32,
    /// Threshold for the comparison kinds, band width for Deadband.
    pub value: f64,
    pub options: EventOptions,
    baseline: Vec<f64>,
    notify: mpsc::UnboundedSender<EventMessage>,
}

fn decode_element(prim: Primitive, bytes: &[u8]) -> f64 {
    match prim {
        Primitive::Bool => 0.0,
        Primitive::Byte | Primitive::Char => bytes[0] as f64,
        Primitive::Sint => bytes[0] as i8 as f64,
        Primitive::Word | Primitive::Uint => u16::from_le_bytes(bytes[..2].try_into().unwrap()) as f64,
        Primitive::Int => i16::from_le_bytes(bytes[..2].try_into().unwrap()) as f64,
        Primitive::Dword | Primitive::Udint => {
            u32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64
        }
        Primitive::Dint => i32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
        Primitive::Real => f32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
        Primitive::Lword | Primitive::Ulint => {
            u64::from_le_bytes(bytes[..8].try_into().unwrap()) as f64
        }
        Primitive::Lint | Primitive::Time => {
            i64::from_le_bytes(bytes[..8].try_into().unwrap()) as f64
        }
        Primitive::Lreal => f64::from_le_bytes(bytes[..8].try_into().unwrap()),
    }
}

impl EventEntry {
    /// Build an entry for the given watched window. For Deadband the
    /// baseline starts from the tag's current bytes so the first fire
    /// really is a move away from the value the client saw.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        session: u64,
        kind: EventKind,
        byte: u32,
        bit: u8,
        count: u32,
        tag_type: TagType,
        size: u32,
        value: f64,
        options: EventOptions,
        backing: &[u8],
        notify: mpsc::UnboundedSender<EventMessage>,
    ) -> DaxResult<EventEntry> {
        if !kind.valid_for(tag_type) {
            return Err(DaxError::BadType);
        }
        let mut entry = EventEntry {
            id,
            session,
            kind,
            byte,
            bit,
            count,
            tag_type,
            size,
            value,
            options,
            baseline: Vec::new(),
            notify,
        };
        if kind == EventKind::Deadband {
            entry.baseline = entry.elements(backing);
        }
        Ok(entry)
    }

    /// Byte-range overlap with a write window.
    pub fn overlaps(&self, wbyte: usize, wsize: usize) -> bool {
        let start = self.byte as usize;
        let end = start + self.size as usize;
        start < wbyte + wsize && wbyte < end
    }

    // The watched range as bits of the backing.
    fn bit_span(&self) -> (usize, usize) {
        if self.tag_type.primitive() == Some(Primitive::Bool) {
            (self.byte as usize * 8 + self.bit as usize, self.count as usize)
        } else {
            (self.byte as usize * 8, self.size as usize * 8)
        }
    }

    fn elements(&self, backing: &[u8]) -> Vec<f64> {
        let prim = match self.tag_type.primitive() {
            Some(p) => p,
            None => return Vec::new(),
        };
        let width = prim.size_bytes() as usize;
        let mut out = Vec::with_capacity(self.count as usize);
        for n in 0..self.count as usize {
            let at = self.byte as usize + n * width;
            if at + width > backing.len() {
                // Queue and virtual tags have no backing at registration
                // time; their baseline starts from zero.
                out.push(0.0);
            } else {
                out.push(decode_element(prim, &backing[at..at + width]));
            }
        }
        out
    }

    /// Decide whether a completed write fires this event. `pre` holds the
    /// written window's bytes from before the write and `backing` is the
    /// whole tag after it. Called at most once per write, with the tag
    /// lock held.
    pub fn test(&mut self, backing: &[u8], pre: &[u8], wbyte: usize) -> bool {
        match self.kind {
            EventKind::Write => true,
            EventKind::Change => {
                let start = (self.byte as usize).max(wbyte);
                let end = (self.byte as usize + self.size as usize).min(wbyte + pre.len());
                (start..end).any(|i| backing[i] != pre[i - wbyte])
            }
            EventKind::Set | EventKind::Reset => {
                let (first, len) = self.bit_span();
                let want_set = self.kind == EventKind::Set;
                (first..first + len).any(|b| {
                    let byte = b / 8;
                    if byte < wbyte || byte >= wbyte + pre.len() {
                        return false;
                    }
                    let was = pre[byte - wbyte] & (1 << (b % 8)) != 0;
                    let is = backing[byte] & (1 << (b % 8)) != 0;
                    if want_set {
                        !was && is
                    } else {
                        was && !is
                    }
                })
            }
            EventKind::Greater => self.elements(backing).iter().any(|&v| v > self.value),
            EventKind::Less => self.elements(backing).iter().any(|&v| v < self.value),
            EventKind::Equal => self.elements(backing).iter().any(|&v| v == self.value),
            EventKind::Deadband => {
                let current = self.elements(backing);
                let moved = current
                    .iter()
                    .zip(&self.baseline)
                    .any(|(&now, &then)| (now - then).abs() >= self.value);
                if moved {
                    self.baseline = current;
                }
                moved
            }
        }
    }

    /// Queue the notification on the owning session. A dead receiver just
    /// means the session is mid-teardown; its events are about to go away.
    pub fn dispatch(&self, backing: &[u8]) {
        let data = if self.options.contains(EventOptions::SEND_DATA) {
            let start = self.byte as usize;
            Some(backing[start..start + self.size as usize].to_vec())
        } else {
            None
        };
        let _ = self.notify.send(EventMessage {
            event_id: self.id,
            kind: self.kind,
            data,
        });
    }
}
