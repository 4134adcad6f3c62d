//! The client library: a session to a tag server plus the local caches
//! that keep name resolution off the wire.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::data;
use crate::error::{DaxError, DaxResult};
use crate::event::{EventKind, EventOptions};
use crate::handle::{self, Handle, TagRef};
use crate::types::{cdt_size_bits, Cdt, CdtMember, Primitive, TagAttr, TagType, TypeLookup};
use crate::wire::packet::{CdtDesc, CdtMemberDesc, EventFrame, Opcode, Request, TagDesc};
use crate::wire::{to_bytes, DaxReadExt, DaxWriteExt, WireComponent};

pub mod cache;
pub mod value;

use cache::{CachedTag, TagCache};

/// Default capacity of the client tag cache, overridable with the
/// `cachesize` option.
pub const DEFAULT_CACHE_SIZE: usize = 128;

/// Default tag server port.
pub const DEFAULT_PORT: u16 = 7777;

/// Called at most once when the session ends, cleanly or not.
pub type DisconnectCallback = Box<dyn FnOnce() + Send>;

/// Runs for each delivered notification of the event it is attached to.
pub type EventCallback = Box<dyn FnMut(&EventFrame) + Send>;

/// Runs exactly once when the owning event registration goes away.
pub type FreeCallback = Box<dyn FnOnce() + Send>;

/// Connection options for a module session.
///
/// ```no_run
/// # use dax::client::SessionOptions;
/// # async fn connect() -> dax::error::DaxResult<()> {
/// let session = SessionOptions::new("histlog")
///     .host("10.0.0.5")
///     .cachesize(64)
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionOptions {
    name: String,
    host: String,
    port: u16,
    cachesize: usize,
}

impl SessionOptions {
    pub fn new(name: &str) -> SessionOptions {
        SessionOptions {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            cachesize: DEFAULT_CACHE_SIZE,
        }
    }

    pub fn host(mut self, host: &str) -> SessionOptions {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> SessionOptions {
        self.port = port;
        self
    }

    pub fn cachesize(mut self, cachesize: usize) -> SessionOptions {
        self.cachesize = cachesize;
        self
    }

    /// Connect and register the module with the server.
    pub async fn connect(self) -> DaxResult<Session> {
        Session::connect(self).await
    }
}

struct ClientEvent {
    id: u32,
    callback: Option<EventCallback>,
    free: Option<FreeCallback>,
}

struct Shared {
    connected: AtomicBool,
    pending: Mutex<HashMap<u32, oneshot::Sender<(i32, Vec<u8>)>>>,
    events: Mutex<Vec<ClientEvent>>,
    disconnect: Mutex<Option<DisconnectCallback>>,
}

impl Shared {
    // The one place a session dies. Pending requests fail, free-callbacks
    // run in reverse insertion order, the disconnect callback runs last;
    // the swap makes all of it happen exactly once.
    fn teardown(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pending.lock().clear();
        let mut frees = Vec::new();
        {
            let mut events = self.events.lock();
            for event in events.iter_mut().rev() {
                if let Some(free) = event.free.take() {
                    frees.push(free);
                }
            }
        }
        for free in frees {
            free();
        }
        let callback = self.disconnect.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// The client's view of registered compound types, filled from `CdtGet`
/// responses and shared with the resolver and the data formatter.
struct CdtCache {
    map: Mutex<HashMap<u32, Arc<Cdt>>>,
}

impl TypeLookup for CdtCache {
    fn members_of(&self, tag_type: TagType) -> DaxResult<Arc<Cdt>> {
        if !tag_type.is_custom() {
            return Err(DaxError::BadType);
        }
        match self.map.lock().get(&tag_type.raw()) {
            Some(cdt) => Ok(cdt.clone()),
            None => DaxError::not_found(),
        }
    }
}

/// A connected module session.
///
/// One value per connection, explicitly threaded through calls; requests
/// and responses are matched by identifier, notifications arrive on their
/// own channel and are dispatched from [`Session::event_wait`].
pub struct Session {
    shared: Arc<Shared>,
    writer: AsyncMutex<OwnedWriteHalf>,
    next_id: AtomicU32,
    event_rx: AsyncMutex<mpsc::UnboundedReceiver<EventFrame>>,
    cache: Mutex<TagCache>,
    cdts: CdtCache,
    reader: JoinHandle<()>,
}

async fn reader_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<EventFrame>,
) {
    loop {
        let body = match reader.read_frame().await {
            Ok(body) => body,
            Err(_) => break,
        };
        let mut cursor = Cursor::new(body);
        let request_id = match u32::decode(&mut cursor).await {
            Ok(id) => id,
            Err(_) => break,
        };
        if request_id == 0 {
            let opcode = match u16::decode(&mut cursor).await {
                Ok(op) => op,
                Err(_) => break,
            };
            if opcode != Opcode::Event as u16 {
                continue;
            }
            match EventFrame::decode(&mut cursor).await {
                Ok(frame) => {
                    let _ = event_tx.send(frame);
                }
                Err(_) => break,
            }
        } else {
            let status = match i32::decode(&mut cursor).await {
                Ok(status) => status,
                Err(_) => break,
            };
            let at = cursor.position() as usize;
            let payload = cursor.into_inner()[at..].to_vec();
            let waiter = shared.pending.lock().remove(&request_id);
            if let Some(waiter) = waiter {
                let _ = waiter.send((status, payload));
            }
        }
    }
    shared.teardown();
}

impl Session {
    async fn connect(options: SessionOptions) -> DaxResult<Session> {
        let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            disconnect: Mutex::new(None),
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_loop(read_half, shared.clone(), event_tx));
        let session = Session {
            shared,
            writer: AsyncMutex::new(write_half),
            next_id: AtomicU32::new(1),
            event_rx: AsyncMutex::new(event_rx),
            cache: Mutex::new(TagCache::new(options.cachesize)),
            cdts: CdtCache {
                map: Mutex::new(HashMap::new()),
            },
            reader,
        };
        session
            .request(&Request::ModRegister {
                name: options.name.clone(),
            })
            .await?;
        log::debug!("module {} connected", options.name);
        Ok(session)
    }

    /// Install the callback invoked when the session ends unexpectedly.
    pub fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        *self.shared.disconnect.lock() = Some(callback);
    }

    /// Report this module as running or stopped.
    pub async fn set_running(&self, running: bool) -> DaxResult<()> {
        self.request(&Request::ModSetRunning { running }).await?;
        Ok(())
    }

    /// Create a tag and return a handle covering the whole of it.
    pub async fn tag_add(
        &self,
        name: &str,
        tag_type: TagType,
        count: u32,
        attributes: TagAttr,
    ) -> DaxResult<Handle> {
        let payload = self
            .request(&Request::TagAdd {
                name: name.to_string(),
                tag_type,
                count,
                attributes,
            })
            .await?;
        let index = payload_u32(&payload)?;
        self.ensure_cdt(tag_type).await?;
        let size = self.cdts.size_bytes(tag_type, count)?;
        self.cache.lock().add(CachedTag {
            name: name.to_string(),
            index,
            tag_type,
            count,
        });
        Ok(Handle {
            index,
            byte: 0,
            bit: 0,
            count,
            tag_type,
            size,
        })
    }

    /// Delete a tag by index.
    pub async fn tag_del(&self, index: u32) -> DaxResult<()> {
        self.request(&Request::TagDel { index }).await?;
        self.cache.lock().invalidate(index);
        Ok(())
    }

    /// Look a tag up by name, consulting the cache first.
    pub async fn tag_by_name(&self, name: &str) -> DaxResult<CachedTag> {
        if let Some(hit) = self.cache.lock().find_by_name(name) {
            return Ok(hit);
        }
        let payload = self
            .request(&Request::TagByName {
                name: name.to_string(),
            })
            .await?;
        let desc: TagDesc = payload_component(&payload).await?;
        let tag = CachedTag {
            name: desc.name,
            index: desc.index,
            tag_type: desc.tag_type,
            count: desc.count,
        };
        self.cache.lock().add(tag.clone());
        Ok(tag)
    }

    /// Look a tag up by index, consulting the cache first.
    pub async fn tag_by_index(&self, index: u32) -> DaxResult<CachedTag> {
        if let Some(hit) = self.cache.lock().find_by_index(index) {
            return Ok(hit);
        }
        let payload = self.request(&Request::TagByIndex { index }).await?;
        let desc: TagDesc = payload_component(&payload).await?;
        let tag = CachedTag {
            name: desc.name,
            index: desc.index,
            tag_type: desc.tag_type,
            count: desc.count,
        };
        self.cache.lock().add(tag.clone());
        Ok(tag)
    }

    /// Full description of a tag, attributes included, bypassing the cache.
    pub async fn tag_desc(&self, index: u32) -> DaxResult<TagDesc> {
        let payload = self.request(&Request::TagByIndex { index }).await?;
        payload_component(&payload).await
    }

    /// Register a compound data type with the server.
    pub async fn cdt_register(&self, name: &str, members: &[(String, TagType, u32)]) -> DaxResult<TagType> {
        let payload = self
            .request(&Request::CdtRegister {
                name: name.to_string(),
                members: members
                    .iter()
                    .map(|(name, tag_type, count)| CdtMemberDesc {
                        name: name.clone(),
                        tag_type: *tag_type,
                        count: *count,
                    })
                    .collect(),
            })
            .await?;
        let tag_type = TagType::from_raw(payload_u32(&payload)?);
        self.ensure_cdt(tag_type).await?;
        Ok(tag_type)
    }

    /// Resolve a tag path like `plc.inputs[3]` to a handle.
    ///
    /// `count` of zero covers the rest of the addressed array. Resolution
    /// runs locally against the tag cache and fetched type descriptions.
    pub async fn tag_handle(&self, path: &str, count: u32) -> DaxResult<Handle> {
        let base_name = path.split(['.', '[']).next().unwrap_or("");
        if base_name.is_empty() {
            return DaxError::not_found();
        }
        let base = self.tag_by_name(base_name).await?;
        self.ensure_cdt(base.tag_type).await?;
        handle::resolve(
            path,
            count,
            |_| {
                Ok(TagRef {
                    index: base.index,
                    tag_type: base.tag_type,
                    count: base.count,
                })
            },
            &self.cdts,
        )
    }

    /// Read a handle's value in host byte order.
    ///
    /// BOOL windows that start inside a byte come back realigned so the
    /// first addressed bit is bit zero of the returned buffer.
    pub async fn read(&self, h: &Handle) -> DaxResult<Vec<u8>> {
        let mut payload = self.request(&Request::Read { handle: *h }).await?;
        if payload.len() != h.size as usize {
            return Err(DaxError::BadArg);
        }
        if h.tag_type.primitive() == Some(Primitive::Bool) {
            if h.bit > 0 {
                let mut aligned = vec![0u8; (h.count as usize + 7) / 8];
                data::bits_to_buffer(&payload, h.bit as u32, h.count, &mut aligned);
                return Ok(aligned);
            }
            return Ok(payload);
        }
        self.ensure_cdt(h.tag_type).await?;
        data::wire_to_host(&self.cdts, h.tag_type, h.count, &mut payload)?;
        Ok(payload)
    }

    /// Write a host-order buffer through a handle.
    ///
    /// A BOOL window that starts inside a byte becomes a masked write
    /// covering exactly the addressed bits.
    pub async fn write(&self, h: &Handle, data: &[u8]) -> DaxResult<()> {
        if h.tag_type.primitive() == Some(Primitive::Bool) && h.bit > 0 {
            if data.len() < (h.count as usize + 7) / 8 {
                return DaxError::bad_arg();
            }
            let mut spread = vec![0u8; h.size as usize];
            let mut mask = vec![0u8; h.size as usize];
            data::bits_from_buffer(data, h.bit as u32, h.count, &mut spread, &mut mask);
            self.request(&Request::MaskWrite {
                handle: *h,
                data: spread,
                mask,
            })
            .await?;
            return Ok(());
        }
        if data.len() != h.size as usize {
            return DaxError::bad_arg();
        }
        let mut wire = data.to_vec();
        if h.tag_type.primitive() != Some(Primitive::Bool) {
            self.ensure_cdt(h.tag_type).await?;
            data::host_to_wire(&self.cdts, h.tag_type, h.count, &mut wire)?;
        }
        self.request(&Request::Write {
            handle: *h,
            data: wire,
        })
        .await?;
        Ok(())
    }

    /// Masked write: mask bits set to one take the data's value.
    pub async fn mask_write(&self, h: &Handle, data: &[u8], mask: &[u8]) -> DaxResult<()> {
        if data.len() != h.size as usize || mask.len() != h.size as usize {
            return DaxError::bad_arg();
        }
        let mut wire_data = data.to_vec();
        let mut wire_mask = mask.to_vec();
        if h.tag_type.primitive() != Some(Primitive::Bool) {
            self.ensure_cdt(h.tag_type).await?;
            data::host_to_wire(&self.cdts, h.tag_type, h.count, &mut wire_data)?;
            data::host_to_wire(&self.cdts, h.tag_type, h.count, &mut wire_mask)?;
        }
        self.request(&Request::MaskWrite {
            handle: *h,
            data: wire_data,
            mask: wire_mask,
        })
        .await?;
        Ok(())
    }

    /// Apply an atomic operator to the handle's region. The operand is a
    /// host-order buffer; `Not`, `Inc` and `Dec` take none.
    pub async fn atomic_op(&self, h: &Handle, operand: &[u8], op: data::AtomicOp) -> DaxResult<()> {
        let mut wire = operand.to_vec();
        if h.tag_type.primitive() != Some(Primitive::Bool) && !wire.is_empty() {
            self.ensure_cdt(h.tag_type).await?;
            data::host_to_wire(&self.cdts, h.tag_type, h.count, &mut wire)?;
        }
        self.request(&Request::Atomic {
            handle: *h,
            op,
            operand: wire,
        })
        .await?;
        Ok(())
    }

    /// Register an event on the server.
    ///
    /// `callback` runs from [`Session::event_wait`] for each notification;
    /// `free` runs exactly once when the registration goes away, whether
    /// through [`Session::event_del`] or session teardown.
    pub async fn event_add(
        &self,
        h: &Handle,
        kind: EventKind,
        value: f64,
        options: EventOptions,
        callback: Option<EventCallback>,
        free: Option<FreeCallback>,
    ) -> DaxResult<u32> {
        let payload = self
            .request(&Request::EventAdd {
                handle: *h,
                kind,
                value,
                options,
            })
            .await?;
        let id = payload_u32(&payload)?;
        self.shared.events.lock().push(ClientEvent {
            id,
            callback,
            free,
        });
        Ok(id)
    }

    /// Remove an event registration; its free-callback runs before this
    /// returns.
    pub async fn event_del(&self, event_id: u32) -> DaxResult<()> {
        self.request(&Request::EventDel { event_id }).await?;
        let free = {
            let mut events = self.shared.events.lock();
            match events.iter().position(|event| event.id == event_id) {
                Some(at) => events.remove(at).free,
                None => None,
            }
        };
        if let Some(free) = free {
            free();
        }
        Ok(())
    }

    /// Change an event's option bits.
    pub async fn event_options(&self, event_id: u32, options: EventOptions) -> DaxResult<()> {
        self.request(&Request::EventOptions { event_id, options })
            .await?;
        Ok(())
    }

    /// Wait for notifications and dispatch their callbacks.
    ///
    /// Blocks up to `timeout_ms` for the first notification, then drains
    /// whatever else is already queued; returns the number dispatched. A
    /// zero timeout polls; a negative one is refused.
    pub async fn event_wait(&self, timeout_ms: i64) -> DaxResult<usize> {
        if timeout_ms < 0 {
            return DaxError::bad_arg();
        }
        let mut rx = self.event_rx.lock().await;
        let mut dispatched = 0usize;
        let first = if timeout_ms == 0 {
            match rx.try_recv() {
                Ok(frame) => Some(frame),
                Err(mpsc::error::TryRecvError::Empty) => None,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(DaxError::Disconnected)
                }
            }
        } else {
            let wait = std::time::Duration::from_millis(timeout_ms as u64);
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(frame)) => Some(frame),
                Ok(None) => return Err(DaxError::Disconnected),
                Err(_) => None,
            }
        };
        let Some(first) = first else {
            return Ok(0);
        };
        self.dispatch_event(&first);
        dispatched += 1;
        while let Ok(frame) = rx.try_recv() {
            self.dispatch_event(&frame);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Shut the session down. Free-callbacks and the disconnect callback
    /// run before this returns.
    pub async fn disconnect(self) -> DaxResult<()> {
        self.reader.abort();
        self.shared.teardown();
        Ok(())
    }

    // The callback leaves the lock before running so it can call back
    // into the session.
    fn dispatch_event(&self, frame: &EventFrame) {
        let callback = {
            let mut events = self.shared.events.lock();
            match events.iter().position(|event| event.id == frame.event_id) {
                Some(at) => events[at].callback.take(),
                None => None,
            }
        };
        let Some(mut callback) = callback else {
            return;
        };
        callback(frame);
        let mut events = self.shared.events.lock();
        if let Some(event) = events.iter_mut().find(|event| event.id == frame.event_id) {
            event.callback = Some(callback);
        }
    }

    async fn request(&self, request: &Request) -> DaxResult<Vec<u8>> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(DaxError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        let mut body = id.to_le_bytes().to_vec();
        body.extend_from_slice(&to_bytes(request).await?);
        let sent = self.writer.lock().await.write_frame(&body).await;
        if sent.is_err() {
            self.shared.pending.lock().remove(&id);
            self.shared.teardown();
            return Err(DaxError::Disconnected);
        }
        let (status, payload) = rx.await.map_err(|_| DaxError::Disconnected)?;
        if status != 0 {
            return Err(DaxError::from_code(status));
        }
        Ok(payload)
    }

    // Fetch and cache the description of a custom type, members first so
    // the resolver and formatter can walk the whole tree locally.
    async fn ensure_cdt(&self, tag_type: TagType) -> DaxResult<()> {
        if !tag_type.is_custom() || self.cdts.map.lock().contains_key(&tag_type.raw()) {
            return Ok(());
        }
        let payload = self.request(&Request::CdtGet { tag_type }).await?;
        let desc: CdtDesc = payload_component(&payload).await?;
        for member in &desc.members {
            if member.tag_type.is_custom() {
                Box::pin(self.ensure_cdt(member.tag_type)).await?;
            }
        }
        let members: Vec<CdtMember> = desc
            .members
            .into_iter()
            .map(|member| CdtMember {
                name: member.name,
                tag_type: member.tag_type,
                count: member.count,
            })
            .collect();
        let size_bits = cdt_size_bits(&self.cdts, &members)?;
        self.cdts.map.lock().insert(
            tag_type.raw(),
            Arc::new(Cdt {
                name: desc.name,
                members,
                size_bits,
            }),
        );
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
        self.shared.teardown();
    }
}

fn payload_u32(payload: &[u8]) -> DaxResult<u32> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| DaxError::BadArg)?;
    Ok(u32::from_le_bytes(bytes))
}

async fn payload_component<P: WireComponent>(payload: &[u8]) -> DaxResult<P> {
    let mut cursor = Cursor::new(payload.to_vec());
    cursor.decode_component().await
}
