pub use crate::client::{Session, SessionOptions};
pub use crate::data::AtomicOp;
pub use crate::error::{DaxError, DaxResult};
pub use crate::event::{EventKind, EventOptions};
pub use crate::handle::Handle;
pub use crate::server::Server;
pub use crate::tagbase::{Access, TagMeta, Tagbase};
pub use crate::types::{Primitive, TagAttr, TagType};
pub use crate::wire::{DaxReadExt, DaxWriteExt, WireComponent};
