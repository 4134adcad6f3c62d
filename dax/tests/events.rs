//! The event subsystem end to end: predicates, payload delivery, oneshot
//! removal and session cleanup.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dax::prelude::*;
use parking_lot::Mutex;

#[tokio::test]
async fn change_event_fires_once_per_change() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("t", TagType::INT, 4, TagAttr::empty())
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session
        .event_add(
            &h,
            EventKind::Change,
            0.0,
            EventOptions::SEND_DATA,
            Some(Box::new(move |frame| {
                sink.lock().push(frame.data.clone().unwrap_or_default());
            })),
            None,
        )
        .await
        .unwrap();

    let mut buffer = Vec::new();
    for v in [0i16, 0, 1, 0] {
        buffer.extend_from_slice(&v.to_ne_bytes());
    }
    session.write(&h, &buffer).await.unwrap();
    assert_eq!(session.event_wait(2000).await.unwrap(), 1);
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        // The payload is the watched window in wire order.
        let mut wire = Vec::new();
        for v in [0i16, 0, 1, 0] {
            wire.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(seen[0], wire);
    }

    // The same bytes again change nothing and notify nobody.
    session.write(&h, &buffer).await.unwrap();
    assert_eq!(session.event_wait(200).await.unwrap(), 0);
}

#[tokio::test]
async fn write_event_fires_every_time() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("w", TagType::BYTE, 1, TagAttr::empty())
        .await
        .unwrap();
    session
        .event_add(&h, EventKind::Write, 0.0, EventOptions::empty(), None, None)
        .await
        .unwrap();
    session.write(&h, &[5]).await.unwrap();
    session.write(&h, &[5]).await.unwrap();
    assert_eq!(session.event_wait(2000).await.unwrap() + session.event_wait(2000).await.unwrap(), 2);
}

#[tokio::test]
async fn set_and_reset_events() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("bits", TagType::BOOL, 8, TagAttr::empty())
        .await
        .unwrap();
    let sets = Arc::new(AtomicUsize::new(0));
    let resets = Arc::new(AtomicUsize::new(0));
    let set_count = sets.clone();
    let reset_count = resets.clone();
    session
        .event_add(
            &h,
            EventKind::Set,
            0.0,
            EventOptions::empty(),
            Some(Box::new(move |_| {
                set_count.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .await
        .unwrap();
    session
        .event_add(
            &h,
            EventKind::Reset,
            0.0,
            EventOptions::empty(),
            Some(Box::new(move |_| {
                reset_count.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .await
        .unwrap();

    session.write(&h, &[0b0000_0100]).await.unwrap();
    assert_eq!(session.event_wait(2000).await.unwrap(), 1);
    assert_eq!(sets.load(Ordering::SeqCst), 1);
    assert_eq!(resets.load(Ordering::SeqCst), 0);

    session.write(&h, &[0b0000_0000]).await.unwrap();
    assert_eq!(session.event_wait(2000).await.unwrap(), 1);
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn greater_event_compares_elements() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("level", TagType::DINT, 1, TagAttr::empty())
        .await
        .unwrap();
    session
        .event_add(&h, EventKind::Greater, 100.0, EventOptions::empty(), None, None)
        .await
        .unwrap();

    session.write(&h, &50i32.to_ne_bytes()).await.unwrap();
    assert_eq!(session.event_wait(200).await.unwrap(), 0);
    session.write(&h, &150i32.to_ne_bytes()).await.unwrap();
    assert_eq!(session.event_wait(2000).await.unwrap(), 1);
}

#[tokio::test]
async fn deadband_event_tracks_last_notified() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("pv", TagType::REAL, 1, TagAttr::empty())
        .await
        .unwrap();
    session
        .event_add(&h, EventKind::Deadband, 5.0, EventOptions::empty(), None, None)
        .await
        .unwrap();

    session.write(&h, &3.0f32.to_ne_bytes()).await.unwrap();
    assert_eq!(session.event_wait(200).await.unwrap(), 0);
    session.write(&h, &6.0f32.to_ne_bytes()).await.unwrap();
    assert_eq!(session.event_wait(2000).await.unwrap(), 1);
    // The baseline moved to 6; a small step stays quiet.
    session.write(&h, &8.0f32.to_ne_bytes()).await.unwrap();
    assert_eq!(session.event_wait(200).await.unwrap(), 0);
}

#[tokio::test]
async fn oneshot_events_go_away() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("once", TagType::BYTE, 1, TagAttr::empty())
        .await
        .unwrap();
    session
        .event_add(&h, EventKind::Write, 0.0, EventOptions::ONESHOT, None, None)
        .await
        .unwrap();
    session.write(&h, &[1]).await.unwrap();
    assert_eq!(session.event_wait(2000).await.unwrap(), 1);
    session.write(&h, &[2]).await.unwrap();
    assert_eq!(session.event_wait(200).await.unwrap(), 0);
}

#[tokio::test]
async fn event_del_runs_the_free_callback_once() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("freed", TagType::BYTE, 1, TagAttr::empty())
        .await
        .unwrap();
    let freed = Arc::new(AtomicUsize::new(0));
    let counter = freed.clone();
    let id = session
        .event_add(
            &h,
            EventKind::Write,
            0.0,
            EventOptions::empty(),
            None,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();
    session.event_del(id).await.unwrap();
    assert_eq!(freed.load(Ordering::SeqCst), 1);
    assert!(matches!(session.event_del(id).await, Err(DaxError::NotFound)));

    // Teardown does not run it again.
    session.disconnect().await.unwrap();
    assert_eq!(freed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn session_close_frees_everything_once() {
    let (server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("cleanup", TagType::BYTE, 1, TagAttr::empty())
        .await
        .unwrap();
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for _ in 0..3 {
        let sink = order.clone();
        let cell: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
        let id_cell = cell.clone();
        let id = session
            .event_add(
                &h,
                EventKind::Write,
                0.0,
                EventOptions::empty(),
                None,
                Some(Box::new(move || {
                    if let Some(id) = *id_cell.lock() {
                        sink.lock().push(id);
                    }
                })),
            )
            .await
            .unwrap();
        *cell.lock() = Some(id);
        ids.push(id);
    }
    let disconnects = Arc::new(AtomicUsize::new(0));
    let bumps = disconnects.clone();
    session.set_disconnect_callback(Box::new(move || {
        bumps.fetch_add(1, Ordering::SeqCst);
    }));

    session.disconnect().await.unwrap();
    // Free-callbacks ran in reverse insertion order, then the disconnect
    // callback, each exactly once.
    ids.reverse();
    assert_eq!(*order.lock(), ids);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    // The server side forgets the session's events.
    let raw = server.tagbase().resolve_handle("cleanup", 0).unwrap();
    let mut cleaned = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if server
            .tagbase()
            .event_del(raw.index, ids[0], 1)
            .is_err()
        {
            cleaned = true;
            break;
        }
    }
    assert!(cleaned);
}

#[tokio::test]
async fn tag_added_event_carries_the_descriptor() {
    let (_server, port) = common::spawn_server().await;
    let watcher = common::connect("watcher", port).await;
    let producer = common::connect("producer", port).await;

    let h = watcher.tag_handle("_tag_added", 0).await.unwrap();
    let records: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = records.clone();
    watcher
        .event_add(
            &h,
            EventKind::Write,
            0.0,
            EventOptions::SEND_DATA,
            Some(Box::new(move |frame| {
                sink.lock().push(frame.data.clone().unwrap_or_default());
            })),
            None,
        )
        .await
        .unwrap();

    let added = producer
        .tag_add("announced", TagType::DINT, 2, TagAttr::empty())
        .await
        .unwrap();

    // The producer's own status tag announces itself too; keep waiting
    // until the record for the new tag shows up.
    let mut found = None;
    for _ in 0..20 {
        let _ = watcher.event_wait(200).await.unwrap();
        let records = records.lock();
        found = records
            .iter()
            .find(|record| {
                record.len() == 47
                    && u32::from_le_bytes(record[0..4].try_into().unwrap()) == added.index
            })
            .cloned();
        if found.is_some() {
            break;
        }
    }
    let record = found.expect("descriptor for the announced tag");
    assert_eq!(&record[14..23], b"announced");
}

#[tokio::test]
async fn event_wait_rejects_negative_timeouts() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;
    assert!(matches!(
        session.event_wait(-1).await,
        Err(DaxError::BadArg)
    ));
}

#[tokio::test]
async fn one_write_crossing_two_events_notifies_both() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    session
        .tag_add("span", TagType::BYTE, 4, TagAttr::empty())
        .await
        .unwrap();
    let low = session.tag_handle("span[0]", 2).await.unwrap();
    let high = session.tag_handle("span[2]", 2).await.unwrap();
    let whole = session.tag_handle("span", 0).await.unwrap();

    session
        .event_add(&low, EventKind::Write, 0.0, EventOptions::empty(), None, None)
        .await
        .unwrap();
    session
        .event_add(&high, EventKind::Write, 0.0, EventOptions::empty(), None, None)
        .await
        .unwrap();

    session.write(&whole, &[1, 2, 3, 4]).await.unwrap();
    let mut total = session.event_wait(2000).await.unwrap();
    if total < 2 {
        total += session.event_wait(2000).await.unwrap();
    }
    assert_eq!(total, 2);
}
