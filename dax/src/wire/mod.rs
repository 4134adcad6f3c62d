//! The transport layer: length-prefixed frames over a stream socket and the
//! component trait every payload shape implements.
//!
//! All multi-byte values on the wire are little-endian. A frame is a `u32`
//! length followed by that many body bytes; the body starts with the
//! request identifier, which is zero only for unsolicited event frames.

use crate::error::{DaxError, DaxResult};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame body. Anything larger is a protocol violation.
pub const FRAME_MAX: u32 = 16 * 1024 * 1024;

mod frame {
    use std::future::Future;
    use std::marker::PhantomPinned;
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};

    use pin_project_lite::pin_project;
    use tokio::io::{AsyncRead, ReadBuf};

    use crate::error::{DaxError, DaxResult};
    use crate::wire::FRAME_MAX;

    pub(crate) fn read_frame<A>(reader: &mut A) -> ReadFrame<A>
    where
        A: AsyncRead + Unpin + ?Sized,
    {
        ReadFrame {
            reader,
            len_buf: [0u8; 4],
            len_read: 0,
            body: None,
            body_read: 0,
            _pin: PhantomPinned,
        }
    }

    pin_project! {
        #[derive(Debug)]
        #[must_use = "futures do nothing unless you `.await` or poll them"]
        pub struct ReadFrame<'a, A: ?Sized> {
            reader: &'a mut A,
            len_buf: [u8; 4],
            len_read: usize,
            body: Option<Vec<u8>>,
            body_read: usize,
            // Make this future `!Unpin` for compatibility with async trait methods.
            #[pin]
            _pin: PhantomPinned,
        }
    }

    impl<A> Future for ReadFrame<'_, A>
    where
        A: AsyncRead + Unpin + ?Sized,
    {
        type Output = DaxResult<Vec<u8>>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<DaxResult<Vec<u8>>> {
            let me = self.project();

            while me.body.is_none() {
                let mut inner = [0u8; 4];
                let mut buf = ReadBuf::new(&mut inner[..4 - *me.len_read]);
                ready!(Pin::new(&mut *me.reader).poll_read(cx, &mut buf))?;
                let filled = buf.filled().len();
                if filled == 0 {
                    return Poll::Ready(Err(DaxError::Disconnected));
                }
                me.len_buf[*me.len_read..*me.len_read + filled].copy_from_slice(buf.filled());
                *me.len_read += filled;
                if *me.len_read == 4 {
                    let len = u32::from_le_bytes(*me.len_buf);
                    if len > FRAME_MAX {
                        return Poll::Ready(Err(DaxError::TooBig));
                    }
                    *me.body = Some(vec![0u8; len as usize]);
                }
            }

            loop {
                let body = me.body.as_mut().expect("body allocated above");
                if *me.body_read == body.len() {
                    return Poll::Ready(Ok(me.body.take().expect("body allocated above")));
                }
                let mut buf = ReadBuf::new(&mut body[*me.body_read..]);
                ready!(Pin::new(&mut *me.reader).poll_read(cx, &mut buf))?;
                let filled = buf.filled().len();
                if filled == 0 {
                    return Poll::Ready(Err(DaxError::Disconnected));
                }
                *me.body_read += filled;
            }
        }
    }
}

pub use frame::ReadFrame;

/// An extension trait which allows for reading whole frames from tokio
/// AsyncRead types.
pub trait DaxReadExt {
    fn read_frame(&mut self) -> ReadFrame<'_, Self>;

    async fn decode_component<P: WireComponent>(&mut self) -> DaxResult<P>;
}

impl<T> DaxReadExt for T
where
    T: AsyncRead + Unpin + Send + Sync + ?Sized,
{
    fn read_frame(&mut self) -> ReadFrame<'_, Self> {
        frame::read_frame(self)
    }

    async fn decode_component<P: WireComponent>(&mut self) -> DaxResult<P> {
        P::decode(self).await
    }
}

/// An extension trait which allows for writing whole frames to tokio
/// AsyncWrite types.
pub trait DaxWriteExt {
    async fn write_frame(&mut self, body: &[u8]) -> DaxResult<()>;

    async fn encode_component<P: WireComponent>(&mut self, component: &P) -> DaxResult<()>;
}

impl<T> DaxWriteExt for T
where
    T: AsyncWrite + Unpin + Send + Sync + ?Sized,
{
    async fn write_frame(&mut self, body: &[u8]) -> DaxResult<()> {
        if body.len() as u64 > FRAME_MAX as u64 {
            return DaxError::too_big();
        }
        self.write_all(&(body.len() as u32).to_le_bytes()).await?;
        self.write_all(body).await?;
        self.flush().await?;
        Ok(())
    }

    async fn encode_component<P: WireComponent>(&mut self, component: &P) -> DaxResult<()> {
        component.encode(self).await
    }
}

/// Defines a payload shape that can be encoded and decoded.
pub trait WireComponent: Sized {
    /// Decodes the component from the given reader.
    async fn decode<A: AsyncRead + Unpin + Send + Sync + ?Sized>(read: &mut A) -> DaxResult<Self>;

    /// Encodes the component to the given writer.
    async fn encode<A: AsyncWrite + Unpin + Send + Sync + ?Sized>(
        &self,
        write: &mut A,
    ) -> DaxResult<()>;
}

macro_rules! decode {
    ($reader:ident $exec:expr) => {
        async fn decode<A: tokio::io::AsyncRead + Unpin + Send + Sync + ?Sized>(
            $reader: &mut A,
        ) -> crate::error::DaxResult<Self> {
            $exec
        }
    };
}

macro_rules! encode {
    ($component:ident, $writer:ident $exec:expr) => {
        #[allow(redundant_semicolons)]
        async fn encode<A: tokio::io::AsyncWrite + Unpin + Send + Sync + ?Sized>(
            &self,
            $writer: &mut A,
        ) -> crate::error::DaxResult<()> {
            let $component = self;
            $exec;
            Ok(())
        }
    };
}

/// Wire bindings for payloads: requests, responses and event frames.
pub mod packet;

macro_rules! define_primitive_bind {
    ($($prim:ty),*) => {
        $(
            impl WireComponent for $prim {
                decode!(read {
                    use tokio::io::AsyncReadExt;
                    let mut buf = [0; std::mem::size_of::<Self>()];
                    read.read_exact(&mut buf).await?;
                    Ok(Self::from_le_bytes(buf))
                });

                encode!(component_ref, write {
                    write.write_all(component_ref.to_le_bytes().as_ref()).await?;
                });
            }
        )*
    }
}

define_primitive_bind!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

const STRING_DEFAULT_CAP: usize = 1024;

impl WireComponent for String {
    decode!(read {
        use tokio::io::AsyncReadExt;
        let len = u16::decode(read).await? as usize;
        if len > STRING_DEFAULT_CAP {
            return DaxError::too_big();
        }
        let mut buf = vec![0u8; len];
        read.read_exact(&mut buf).await?;
        Ok(String::from_utf8(buf)?)
    });

    encode!(component_ref, write {
        if component_ref.len() > STRING_DEFAULT_CAP {
            return DaxError::too_big();
        }
        (component_ref.len() as u16).encode(write).await?;
        write.write_all(component_ref.as_bytes()).await?;
    });
}

impl WireComponent for Vec<u8> {
    decode!(read {
        use tokio::io::AsyncReadExt;
        let len = u32::decode(read).await?;
        if len > FRAME_MAX {
            return DaxError::too_big();
        }
        let mut buf = vec![0u8; len as usize];
        read.read_exact(&mut buf).await?;
        Ok(buf)
    });

    encode!(component_ref, write {
        (component_ref.len() as u32).encode(write).await?;
        write.write_all(component_ref).await?;
    });
}

/// Encode a component into a standalone buffer.
pub async fn to_bytes<P: WireComponent>(component: &P) -> DaxResult<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    component.encode(&mut cursor).await?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod test {
    use super::{DaxReadExt, DaxWriteExt};
    use crate::error::{DaxError, DaxResult};
    use std::io::Cursor;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn frame_round_trip() -> DaxResult<()> {
        let mut cursor = Cursor::new(vec![]);
        cursor.write_frame(&[1, 2, 3, 4, 5]).await?;
        cursor.set_position(0);
        let body = cursor.read_frame().await?;
        assert_eq!(body, vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn two_frames_in_sequence() -> DaxResult<()> {
        let mut cursor = Cursor::new(vec![]);
        cursor.write_frame(&[7; 3]).await?;
        cursor.write_frame(&[9; 2]).await?;
        cursor.set_position(0);
        assert_eq!(cursor.read_frame().await?, vec![7; 3]);
        assert_eq!(cursor.read_frame().await?, vec![9; 2]);
        Ok(())
    }

    #[tokio::test]
    async fn eof_is_disconnected() {
        let mut cursor = Cursor::new(vec![]);
        assert!(matches!(
            cursor.read_frame().await,
            Err(DaxError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut cursor = Cursor::new((super::FRAME_MAX + 1).to_le_bytes().to_vec());
        assert!(matches!(cursor.read_frame().await, Err(DaxError::TooBig)));
    }

    #[tokio::test]
    async fn string_round_trip() -> DaxResult<()> {
        let mut cursor = Cursor::new(vec![]);
        cursor.encode_component(&"pump_1".to_string()).await?;
        cursor.set_position(0);
        let back: String = cursor.decode_component().await?;
        assert_eq!(back, "pump_1");
        Ok(())
    }

    #[tokio::test]
    async fn string_cap_enforced() {
        let mut cursor = Cursor::new(vec![]);
        let long = "x".repeat(super::STRING_DEFAULT_CAP + 1);
        assert_err!(cursor.encode_component(&long).await);
    }

    #[tokio::test]
    async fn bytes_round_trip() -> DaxResult<()> {
        let mut cursor = Cursor::new(vec![]);
        cursor.encode_component(&vec![1u8, 2, 3]).await?;
        cursor.set_position(0);
        let back: Vec<u8> = cursor.decode_component().await?;
        assert_eq!(back, vec![1, 2, 3]);
        Ok(())
    }
}
