//! The tag database: the authoritative copy of every named variable in the
//! system.
//!
//! Structure follows an arena-plus-index design. Tags live in an
//! append-only slot vector indexed by tag index, with a name map in front;
//! both sit behind one short-held structural lock. Each tag's bytes, queue
//! and event list sit behind that tag's own mutex, which is the lock that
//! serializes data access and event fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::data::{self, AtomicOp};
use crate::error::{DaxError, DaxResult};
use crate::event::{EventEntry, EventKind, EventMessage, EventOptions};
use crate::handle::{self, Handle, TagRef};
use crate::types::{
    valid_tagname, TagAttr, TagType, TypeLookup, TypeRegistry, TAGNAME_SIZE, TAG_DESC_TYPE,
};

/// Bound on the records a QUEUE tag will hold.
pub const TAG_QUEUE_DEPTH: usize = 128;

/// Reserved tag names created at boot.
pub const LASTINDEX_TAG: &str = "_lastindex";
pub const TAG_ADDED_TAG: &str = "_tag_added";
pub const TAG_DELETED_TAG: &str = "_tag_deleted";
pub const TAG_CHANGED_TAG: &str = "_tag_changed";

/// Who is performing a data operation. Client access respects the
/// attribute protections; the server's own bookkeeping writes do not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Client,
    Internal,
}

/// The immutable description of a tag.
#[derive(Clone, Debug)]
pub struct TagMeta {
    pub index: u32,
    pub name: String,
    pub tag_type: TagType,
    pub count: u32,
    pub attributes: TagAttr,
}

/// Serves reads of a virtual tag. Returns the whole tag's bytes in wire
/// order; the engine slices the requested window out.
pub type VirtualRead = Box<dyn Fn(&TagMeta) -> DaxResult<Vec<u8>> + Send>;

struct TagState {
    data: Vec<u8>,
    queue: VecDeque<Vec<u8>>,
    events: Vec<EventEntry>,
    virtual_read: Option<VirtualRead>,
}

struct Tag {
    meta: TagMeta,
    state: Mutex<TagState>,
}

struct Structural {
    slots: Vec<Option<Arc<Tag>>>,
    names: HashMap<String, u32>,
}

/// The in-memory tag database.
pub struct Tagbase {
    types: TypeRegistry,
    structural: RwLock<Structural>,
    next_event_id: AtomicU32,
}

fn scan_events(events: &mut Vec<EventEntry>, backing: &[u8], wbyte: usize, pre: &[u8]) {
    events.retain_mut(|entry| {
        if !entry.overlaps(wbyte, pre.len()) {
            return true;
        }
        if entry.test(backing, pre, wbyte) {
            entry.dispatch(backing);
            !entry.options.contains(EventOptions::ONESHOT)
        } else {
            true
        }
    });
}

impl Tagbase {
    /// Create a database holding the reserved tags and the reserved
    /// descriptor type.
    pub fn new() -> Tagbase {
        let base = Tagbase {
            types: TypeRegistry::new(),
            structural: RwLock::new(Structural {
                slots: Vec::with_capacity(1024),
                names: HashMap::new(),
            }),
            next_event_id: AtomicU32::new(1),
        };
        let reserved = TagAttr::SPECIAL | TagAttr::READONLY;
        base.add(LASTINDEX_TAG, TagType::UDINT, 1, reserved)
            .expect("reserved tags insert into an empty database");
        base.add(TAG_ADDED_TAG, TAG_DESC_TYPE, 1, reserved).unwrap();
        base.add(TAG_DELETED_TAG, TAG_DESC_TYPE, 1, reserved).unwrap();
        base.add(TAG_CHANGED_TAG, TagType::UDINT, 1, reserved).unwrap();
        base
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Highest index ever allocated, including tombstoned slots.
    pub fn last_index(&self) -> u32 {
        self.structural.read().slots.len() as u32 - 1
    }

    /// Add a tag and return its index.
    ///
    /// Re-adding an identical `(name, type, count)` hands back the existing
    /// index so module restarts are idempotent; any other collision is an
    /// error.
    pub fn add(&self, name: &str, tag_type: TagType, count: u32, attributes: TagAttr) -> DaxResult<u32> {
        if !valid_tagname(name) || count == 0 {
            return DaxError::bad_arg();
        }
        let size = self.types.size_bytes(tag_type, count)?;
        let meta;
        {
            let mut structural = self.structural.write();
            if let Some(&existing) = structural.names.get(name) {
                let tag = structural.slots[existing as usize]
                    .as_ref()
                    .expect("name map only holds live slots");
                if tag.meta.tag_type == tag_type && tag.meta.count == count {
                    return Ok(existing);
                }
                return Err(DaxError::AlreadyExists);
            }
            let index = structural.slots.len() as u32;
            let backing = if attributes.intersects(TagAttr::VIRTUAL | TagAttr::QUEUE) {
                Vec::new()
            } else {
                vec![0u8; size as usize]
            };
            meta = TagMeta {
                index,
                name: name.to_string(),
                tag_type,
                count,
                attributes,
            };
            structural.slots.push(Some(Arc::new(Tag {
                meta: meta.clone(),
                state: Mutex::new(TagState {
                    data: backing,
                    queue: VecDeque::new(),
                    events: Vec::new(),
                    virtual_read: None,
                }),
            })));
            structural.names.insert(name.to_string(), index);
        }
        log::debug!("tag {} added at index {}", meta.name, meta.index);
        self.write_special(LASTINDEX_TAG, &meta.index.to_le_bytes());
        self.write_special(TAG_ADDED_TAG, &descriptor_bytes(&meta));
        Ok(meta.index)
    }

    /// Tombstone a tag. Its index is never handed out again.
    pub fn delete(&self, index: u32) -> DaxResult<()> {
        let meta;
        {
            let mut structural = self.structural.write();
            let slot = structural
                .slots
                .get_mut(index as usize)
                .ok_or(DaxError::NotFound)?;
            let tag = slot.as_ref().ok_or(DaxError::NotFound)?;
            if tag.meta.attributes.contains(TagAttr::SPECIAL) {
                return Err(DaxError::Illegal);
            }
            meta = tag.meta.clone();
            *slot = None;
            structural.names.remove(&meta.name);
        }
        log::debug!("tag {} deleted from index {}", meta.name, meta.index);
        self.write_special(TAG_DELETED_TAG, &descriptor_bytes(&meta));
        Ok(())
    }

    pub fn by_index(&self, index: u32) -> DaxResult<TagMeta> {
        Ok(self.tag(index)?.meta.clone())
    }

    pub fn by_name(&self, name: &str) -> DaxResult<TagMeta> {
        let structural = self.structural.read();
        match structural.names.get(name) {
            Some(&index) => Ok(structural.slots[index as usize]
                .as_ref()
                .expect("name map only holds live slots")
                .meta
                .clone()),
            None => DaxError::not_found(),
        }
    }

    /// Resolve a textual tag path to a handle against this database.
    pub fn resolve_handle(&self, path: &str, count: u32) -> DaxResult<Handle> {
        handle::resolve(
            path,
            count,
            |name| {
                let meta = self.by_name(name)?;
                Ok(TagRef {
                    index: meta.index,
                    tag_type: meta.tag_type,
                    count: meta.count,
                })
            },
            &self.types,
        )
    }

    /// Read the handle's window in wire byte order. Queue tags pop their
    /// front record; virtual tags go through their registered callback.
    pub fn read(&self, h: &Handle) -> DaxResult<Vec<u8>> {
        let tag = self.tag(h.index)?;
        let total = self.tag_size(&tag.meta)?;
        check_window(h, total)?;
        let mut state = tag.state.lock();
        if tag.meta.attributes.contains(TagAttr::QUEUE) {
            if h.size != total {
                return DaxError::bad_arg();
            }
            return state.queue.pop_front().ok_or(DaxError::Empty);
        }
        if tag.meta.attributes.contains(TagAttr::VIRTUAL) {
            let serve = state.virtual_read.as_ref().ok_or(DaxError::Empty)?;
            let full = serve(&tag.meta)?;
            if full.len() < (h.byte + h.size) as usize {
                return Err(DaxError::Empty);
            }
            return Ok(full[h.byte as usize..(h.byte + h.size) as usize].to_vec());
        }
        Ok(state.data[h.byte as usize..(h.byte + h.size) as usize].to_vec())
    }

    /// Write the handle's window. Fires matching events under the tag lock
    /// before returning.
    pub fn write(&self, h: &Handle, bytes: &[u8], access: Access) -> DaxResult<()> {
        if bytes.len() != h.size as usize {
            return DaxError::bad_arg();
        }
        let tag = self.tag(h.index)?;
        check_writable(&tag.meta, access)?;
        let total = self.tag_size(&tag.meta)?;
        check_window(h, total)?;
        {
            let mut state = tag.state.lock();
            if tag.meta.attributes.contains(TagAttr::QUEUE) {
                if h.size != total {
                    return DaxError::bad_arg();
                }
                if state.queue.len() >= TAG_QUEUE_DEPTH {
                    return Err(DaxError::Overflow);
                }
                state.queue.push_back(bytes.to_vec());
                let TagState { queue, events, .. } = &mut *state;
                let record = queue.back().expect("record was just pushed");
                // A queued record has no prior image; only Write and the
                // scalar kinds can fire.
                scan_events(events, record, 0, record);
            } else {
                if tag.meta.attributes.contains(TagAttr::VIRTUAL) {
                    return Err(DaxError::Illegal);
                }
                let window = h.byte as usize..(h.byte + h.size) as usize;
                let pre = state.data[window.clone()].to_vec();
                state.data[window].copy_from_slice(bytes);
                let TagState { data, events, .. } = &mut *state;
                scan_events(events, data, h.byte as usize, &pre);
            }
        }
        if access == Access::Client {
            self.write_special(TAG_CHANGED_TAG, &h.index.to_le_bytes());
        }
        Ok(())
    }

    /// Masked write: mask bits set to one take `data`'s value, the rest
    /// keep the backing's.
    pub fn mask_write(&self, h: &Handle, bytes: &[u8], mask: &[u8], access: Access) -> DaxResult<()> {
        if bytes.len() != h.size as usize || mask.len() != h.size as usize {
            return DaxError::bad_arg();
        }
        let tag = self.tag(h.index)?;
        check_writable(&tag.meta, access)?;
        if tag.meta.attributes.intersects(TagAttr::QUEUE | TagAttr::VIRTUAL) {
            return Err(DaxError::Illegal);
        }
        let total = self.tag_size(&tag.meta)?;
        check_window(h, total)?;
        {
            let mut state = tag.state.lock();
            let window = h.byte as usize..(h.byte + h.size) as usize;
            let pre = state.data[window.clone()].to_vec();
            data::apply_mask(&mut state.data[window], bytes, mask);
            let TagState { data, events, .. } = &mut *state;
            scan_events(events, data, h.byte as usize, &pre);
        }
        if access == Access::Client {
            self.write_special(TAG_CHANGED_TAG, &h.index.to_le_bytes());
        }
        Ok(())
    }

    /// Read-modify-write under the tag lock, indivisible with respect to
    /// reads and event evaluation.
    pub fn atomic(
        &self,
        h: &Handle,
        operand: &[u8],
        op: AtomicOp,
        access: Access,
    ) -> DaxResult<()> {
        let tag = self.tag(h.index)?;
        check_writable(&tag.meta, access)?;
        if tag.meta.attributes.intersects(TagAttr::QUEUE | TagAttr::VIRTUAL) {
            return Err(DaxError::Illegal);
        }
        let total = self.tag_size(&tag.meta)?;
        check_window(h, total)?;
        {
            let mut state = tag.state.lock();
            let window = h.byte as usize..(h.byte + h.size) as usize;
            let pre = state.data[window.clone()].to_vec();
            data::apply_atomic(
                h.tag_type,
                h.count,
                h.bit as u32,
                &mut state.data[window],
                operand,
                op,
            )?;
            let TagState { data, events, .. } = &mut *state;
            scan_events(events, data, h.byte as usize, &pre);
        }
        if access == Access::Client {
            self.write_special(TAG_CHANGED_TAG, &h.index.to_le_bytes());
        }
        Ok(())
    }

    /// Register an event owned by `session`; notifications go out on
    /// `notify`.
    pub fn event_add(
        &self,
        h: &Handle,
        kind: EventKind,
        value: f64,
        options: EventOptions,
        session: u64,
        notify: mpsc::UnboundedSender<EventMessage>,
    ) -> DaxResult<u32> {
        let tag = self.tag(h.index)?;
        let total = self.tag_size(&tag.meta)?;
        check_window(h, total)?;
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let mut state = tag.state.lock();
        let entry = EventEntry::new(
            id, session, kind, h.byte, h.bit, h.count, h.tag_type, h.size, value, options,
            &state.data, notify,
        )?;
        state.events.push(entry);
        Ok(id)
    }

    /// Remove one of `session`'s events from a tag.
    pub fn event_del(&self, tag_index: u32, event_id: u32, session: u64) -> DaxResult<()> {
        let tag = self.tag(tag_index)?;
        let mut state = tag.state.lock();
        let before = state.events.len();
        state
            .events
            .retain(|entry| !(entry.id == event_id && entry.session == session));
        if state.events.len() == before {
            return DaxError::not_found();
        }
        Ok(())
    }

    /// Replace an event's option bits.
    pub fn event_options(
        &self,
        tag_index: u32,
        event_id: u32,
        session: u64,
        options: EventOptions,
    ) -> DaxResult<()> {
        let tag = self.tag(tag_index)?;
        let mut state = tag.state.lock();
        for entry in &mut state.events {
            if entry.id == event_id && entry.session == session {
                entry.options = options;
                return Ok(());
            }
        }
        DaxError::not_found()
    }

    /// Drop every event a departing session left behind. Tags the session
    /// deleted already are skipped silently.
    pub fn remove_session_events(&self, owned: &[(u32, u32)], session: u64) {
        for &(tag_index, event_id) in owned {
            let _ = self.event_del(tag_index, event_id, session);
        }
    }

    /// Install the before-read callback serving a virtual tag.
    pub fn set_virtual_read(&self, index: u32, serve: VirtualRead) -> DaxResult<()> {
        let tag = self.tag(index)?;
        if !tag.meta.attributes.contains(TagAttr::VIRTUAL) {
            return Err(DaxError::Illegal);
        }
        tag.state.lock().virtual_read = Some(serve);
        Ok(())
    }

    fn tag(&self, index: u32) -> DaxResult<Arc<Tag>> {
        let structural = self.structural.read();
        match structural.slots.get(index as usize) {
            Some(Some(tag)) => Ok(tag.clone()),
            _ => DaxError::not_found(),
        }
    }

    fn tag_size(&self, meta: &TagMeta) -> DaxResult<u32> {
        self.types.size_bytes(meta.tag_type, meta.count)
    }

    // Bookkeeping writes into the reserved tags. Quiet during boot while
    // the reserved tags themselves are still being created.
    fn write_special(&self, name: &str, bytes: &[u8]) {
        let meta = match self.by_name(name) {
            Ok(meta) => meta,
            Err(_) => return,
        };
        let h = Handle {
            index: meta.index,
            byte: 0,
            bit: 0,
            count: meta.count,
            tag_type: meta.tag_type,
            size: bytes.len() as u32,
        };
        if let Err(err) = self.write(&h, bytes, Access::Internal) {
            log::warn!("reserved tag {} write failed: {}", name, err);
        }
    }
}

impl Default for Tagbase {
    fn default() -> Self {
        Tagbase::new()
    }
}

// Handles come off the wire untrusted; the window has to land inside the
// tag without wrapping.
fn check_window(h: &Handle, total: u32) -> DaxResult<()> {
    if h.byte as u64 + h.size as u64 > total as u64 {
        return DaxError::too_big();
    }
    Ok(())
}

fn check_writable(meta: &TagMeta, access: Access) -> DaxResult<()> {
    if access == Access::Client && meta.attributes.intersects(TagAttr::READONLY | TagAttr::SPECIAL)
    {
        return Err(DaxError::Illegal);
    }
    Ok(())
}

/// The 47-byte `_tag_desc` record published through `_tag_added` and
/// `_tag_deleted`.
pub fn descriptor_bytes(meta: &TagMeta) -> Vec<u8> {
    let mut out = Vec::with_capacity(47);
    out.extend_from_slice(&meta.index.to_le_bytes());
    out.extend_from_slice(&meta.tag_type.raw().to_le_bytes());
    out.extend_from_slice(&meta.count.to_le_bytes());
    out.extend_from_slice(&meta.attributes.bits().to_le_bytes());
    let mut name = [0u8; TAGNAME_SIZE + 1];
    name[..meta.name.len()].copy_from_slice(meta.name.as_bytes());
    out.extend_from_slice(&name);
    out
}
