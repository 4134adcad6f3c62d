//! Raw data movement: byte order on the backing, bit-granular writes,
//! masks, queues and virtual tags.

mod common;

use dax::prelude::*;

// The backing stores little-endian bytes whatever the host order is; the
// client library converts symmetrically on both sides.
#[tokio::test]
async fn uint_backing_is_little_endian() {
    let (server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("w", TagType::UINT, 1, TagAttr::empty())
        .await
        .unwrap();
    session.write(&h, &0x1234u16.to_ne_bytes()).await.unwrap();

    let raw = server.tagbase().resolve_handle("w", 0).unwrap();
    assert_eq!(server.tagbase().read(&raw).unwrap(), vec![0x34, 0x12]);

    let out = session.read(&h).await.unwrap();
    assert_eq!(u16::from_ne_bytes(out.try_into().unwrap()), 0x1234);
}

// Writing bits 5..21 of a 24-bit BOOL array touches exactly those bits.
#[tokio::test]
async fn partial_bool_write_is_masked() {
    let (server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    session
        .tag_add("b", TagType::BOOL, 24, TagAttr::empty())
        .await
        .unwrap();
    let h = session.tag_handle("b[5]", 16).await.unwrap();
    assert_eq!((h.byte, h.bit, h.size), (0, 5, 3));
    session.write(&h, &[0xFF, 0xFF]).await.unwrap();

    let raw = server.tagbase().resolve_handle("b", 0).unwrap();
    assert_eq!(
        server.tagbase().read(&raw).unwrap(),
        vec![0xE0, 0xFF, 0x1F]
    );

    // Reading the window back realigns to bit zero.
    assert_eq!(session.read(&h).await.unwrap(), vec![0xFF, 0xFF]);
}

#[tokio::test]
async fn write_read_round_trips() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("dints", TagType::DINT, 3, TagAttr::empty())
        .await
        .unwrap();
    let mut buffer = Vec::new();
    for v in [i32::MIN, -1, i32::MAX] {
        buffer.extend_from_slice(&v.to_ne_bytes());
    }
    session.write(&h, &buffer).await.unwrap();
    assert_eq!(session.read(&h).await.unwrap(), buffer);

    let h = session
        .tag_add("times", TagType::TIME, 2, TagAttr::empty())
        .await
        .unwrap();
    let mut buffer = Vec::new();
    for v in [1609556645678i64, -1] {
        buffer.extend_from_slice(&v.to_ne_bytes());
    }
    session.write(&h, &buffer).await.unwrap();
    assert_eq!(session.read(&h).await.unwrap(), buffer);
}

#[tokio::test]
async fn masked_write_preserves_the_rest() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("masked", TagType::BYTE, 2, TagAttr::empty())
        .await
        .unwrap();
    session.write(&h, &[0xAA, 0xFF]).await.unwrap();
    session
        .mask_write(&h, &[0x55, 0x00], &[0x0F, 0xF0])
        .await
        .unwrap();
    assert_eq!(session.read(&h).await.unwrap(), vec![0xA5, 0x0F]);
}

#[tokio::test]
async fn out_of_range_windows_refused() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let mut h = session
        .tag_add("short", TagType::BYTE, 2, TagAttr::empty())
        .await
        .unwrap();
    h.byte = 1;
    assert!(matches!(session.read(&h).await, Err(DaxError::TooBig)));
    assert!(matches!(
        session.write(&h, &[0, 0]).await,
        Err(DaxError::TooBig)
    ));
}

#[tokio::test]
async fn queue_tags_move_records() {
    let (_server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("q", TagType::DINT, 1, TagAttr::QUEUE)
        .await
        .unwrap();
    assert!(matches!(session.read(&h).await, Err(DaxError::Empty)));
    for v in [10i32, 20, 30] {
        session.write(&h, &v.to_ne_bytes()).await.unwrap();
    }
    for v in [10i32, 20, 30] {
        let out = session.read(&h).await.unwrap();
        assert_eq!(i32::from_ne_bytes(out.try_into().unwrap()), v);
    }
    assert!(matches!(session.read(&h).await, Err(DaxError::Empty)));
}

#[tokio::test]
async fn virtual_tags_serve_reads() {
    let (server, port) = common::spawn_server().await;
    let session = common::connect("test", port).await;

    let h = session
        .tag_add("virt", TagType::UDINT, 1, TagAttr::VIRTUAL)
        .await
        .unwrap();
    assert!(matches!(session.read(&h).await, Err(DaxError::Empty)));

    server
        .tagbase()
        .set_virtual_read(h.index, Box::new(|_| Ok(99u32.to_le_bytes().to_vec())))
        .unwrap();
    let out = session.read(&h).await.unwrap();
    assert_eq!(u32::from_ne_bytes(out.try_into().unwrap()), 99);

    assert!(matches!(
        session.write(&h, &[0; 4]).await,
        Err(DaxError::Illegal)
    ));
}
