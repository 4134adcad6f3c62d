//! One connected client: the request loop, the outgoing frame queue and
//! the cleanup that runs when the transport goes away.

use std::collections::HashMap;
use std::io::Cursor;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{DaxError, DaxResult};
use crate::event::EventMessage;
use crate::handle::Handle;
use crate::tagbase::{Access, TagMeta};
use crate::types::{valid_tagname, CdtMember, TagAttr, TagType, TypeLookup};
use crate::wire::packet::{CdtDesc, CdtMemberDesc, EventFrame, Opcode, Request, TagDesc};
use crate::wire::{to_bytes, DaxReadExt, DaxWriteExt, WireComponent};

use super::Server;

struct SessionState {
    id: u64,
    /// `(tag index, event id)` in insertion order, for close-time cleanup.
    events: Vec<(u32, u32)>,
    /// Event id back to the tag holding it, for EventDel and EventOptions.
    event_tags: HashMap<u32, u32>,
    /// Index of the module status tag claimed through ModRegister.
    status_tag: Option<u32>,
}

pub(super) async fn run(server: Server, socket: TcpStream) -> DaxResult<()> {
    let session_id = server.next_session_id();
    let (mut reader, mut writer) = socket.into_split();

    // All outgoing traffic funnels through one queue so responses and
    // event frames never interleave mid-frame.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        while let Some(body) = out_rx.recv().await {
            if writer.write_frame(&body).await.is_err() {
                break;
            }
        }
    });

    // Event notifications are queued by the tag locks and framed here.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<EventMessage>();
    let pump_out = out_tx.clone();
    let pump_task = tokio::spawn(async move {
        while let Some(message) = event_rx.recv().await {
            let frame = EventFrame {
                event_id: message.event_id,
                kind: message.kind,
                data: message.data,
            };
            let mut body = 0u32.to_le_bytes().to_vec();
            body.extend_from_slice(&(Opcode::Event as u16).to_le_bytes());
            match to_bytes(&frame).await {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(_) => continue,
            }
            if pump_out.send(body).is_err() {
                break;
            }
        }
    });

    let mut state = SessionState {
        id: session_id,
        events: Vec::new(),
        event_tags: HashMap::new(),
        status_tag: None,
    };

    let result = loop {
        let body = match reader.read_frame().await {
            Ok(body) => body,
            Err(DaxError::Disconnected) => break Ok(()),
            Err(err) => break Err(err),
        };
        let mut cursor = Cursor::new(body);
        let request_id = match u32::decode(&mut cursor).await {
            Ok(id) => id,
            Err(err) => break Err(err),
        };
        let (status, payload) = match Request::decode(&mut cursor).await {
            Ok(request) => match dispatch(&server, &mut state, &event_tx, request).await {
                Ok(payload) => (0, payload),
                Err(err) => (err.code(), Vec::new()),
            },
            Err(err) => (err.code(), Vec::new()),
        };
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&request_id.to_le_bytes());
        frame.extend_from_slice(&status.to_le_bytes());
        frame.extend_from_slice(&payload);
        if out_tx.send(frame).is_err() {
            break Ok(());
        }
    };

    // Cleanup runs exactly once, whatever ended the loop: events leave
    // their tags, and a registered module reads as stopped.
    server
        .tagbase()
        .remove_session_events(&state.events, session_id);
    if let Some(index) = state.status_tag {
        let h = Handle {
            index,
            byte: 0,
            bit: 0,
            count: 1,
            tag_type: TagType::BOOL,
            size: 1,
        };
        let _ = server.tagbase().write(&h, &[0], Access::Internal);
    }
    drop(event_tx);
    let _ = pump_task.await;
    drop(out_tx);
    let _ = writer_task.await;
    result
}

fn tag_desc(meta: TagMeta) -> TagDesc {
    TagDesc {
        index: meta.index,
        tag_type: meta.tag_type,
        count: meta.count,
        attributes: meta.attributes,
        name: meta.name,
    }
}

async fn dispatch(
    server: &Server,
    state: &mut SessionState,
    event_tx: &mpsc::UnboundedSender<EventMessage>,
    request: Request,
) -> DaxResult<Vec<u8>> {
    let base = server.tagbase();
    match request {
        Request::TagAdd {
            name,
            tag_type,
            count,
            attributes,
        } => {
            // Reserved status is the server's to hand out, not a client's
            // to claim.
            let attributes = attributes & !TagAttr::SPECIAL;
            let index = base.add(&name, tag_type, count, attributes)?;
            Ok(index.to_le_bytes().to_vec())
        }
        Request::TagDel { index } => {
            base.delete(index)?;
            Ok(Vec::new())
        }
        Request::TagByIndex { index } => {
            let meta = base.by_index(index)?;
            to_bytes(&tag_desc(meta)).await
        }
        Request::TagByName { name } => {
            let meta = base.by_name(&name)?;
            to_bytes(&tag_desc(meta)).await
        }
        Request::Read { handle } => base.read(&handle),
        Request::Write { handle, data } => {
            base.write(&handle, &data, Access::Client)?;
            Ok(Vec::new())
        }
        Request::MaskWrite { handle, data, mask } => {
            base.mask_write(&handle, &data, &mask, Access::Client)?;
            Ok(Vec::new())
        }
        Request::Atomic {
            handle,
            op,
            operand,
        } => {
            base.atomic(&handle, &operand, op, Access::Client)?;
            Ok(Vec::new())
        }
        Request::CdtRegister { name, members } => {
            let members = members
                .into_iter()
                .map(|m| CdtMember {
                    name: m.name,
                    tag_type: m.tag_type,
                    count: m.count,
                })
                .collect();
            let tag_type = base.types().register_cdt(&name, members)?;
            Ok(tag_type.raw().to_le_bytes().to_vec())
        }
        Request::CdtGet { tag_type } => {
            let cdt = base.types().members_of(tag_type)?;
            let desc = CdtDesc {
                name: cdt.name.clone(),
                members: cdt
                    .members
                    .iter()
                    .map(|m| CdtMemberDesc {
                        name: m.name.clone(),
                        tag_type: m.tag_type,
                        count: m.count,
                    })
                    .collect(),
            };
            to_bytes(&desc).await
        }
        Request::EventAdd {
            handle,
            kind,
            value,
            options,
        } => {
            let id = base.event_add(&handle, kind, value, options, state.id, event_tx.clone())?;
            state.events.push((handle.index, id));
            state.event_tags.insert(id, handle.index);
            Ok(id.to_le_bytes().to_vec())
        }
        Request::EventDel { event_id } => {
            let tag_index = *state.event_tags.get(&event_id).ok_or(DaxError::NotFound)?;
            base.event_del(tag_index, event_id, state.id)?;
            state.event_tags.remove(&event_id);
            state.events.retain(|&(_, id)| id != event_id);
            Ok(Vec::new())
        }
        Request::EventOptions { event_id, options } => {
            let tag_index = *state.event_tags.get(&event_id).ok_or(DaxError::NotFound)?;
            base.event_options(tag_index, event_id, state.id, options)?;
            Ok(Vec::new())
        }
        Request::ModRegister { name } => {
            if !valid_tagname(&name) {
                return DaxError::bad_arg();
            }
            let status_name = format!("_{name}_status");
            if !valid_tagname(&status_name) {
                return DaxError::bad_arg();
            }
            let index = base.add(
                &status_name,
                TagType::BOOL,
                1,
                TagAttr::SPECIAL | TagAttr::READONLY,
            )?;
            state.status_tag = Some(index);
            log::info!("module {name} registered, status tag {status_name}");
            Ok(index.to_le_bytes().to_vec())
        }
        Request::ModSetRunning { running } => {
            let index = state.status_tag.ok_or(DaxError::Illegal)?;
            let h = Handle {
                index,
                byte: 0,
                bit: 0,
                count: 1,
                tag_type: TagType::BOOL,
                size: 1,
            };
            base.write(&h, &[running as u8], Access::Internal)?;
            Ok(Vec::new())
        }
    }
}
