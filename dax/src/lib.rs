#![allow(async_fn_in_trait)]

//! # dax
//!
//! dax is the core of a distributed data acquisition and control platform:
//! a central tag server holding the authoritative state of every named
//! variable in a control system, and the client library that field-bus
//! gateways, loggers and protocol front-ends use to talk to it. <br />
//! <br />
//! The server side is an in-memory database of typed tags and user-defined
//! compound data types, with bit-granular reads, writes, masked writes and
//! atomic operators, and an event subsystem that turns writes into filtered
//! per-session notifications. The client side is a session with a
//! request/response channel, an asynchronous event channel and a small tag
//! cache that keeps name resolution off the wire. <br />
//! <br />
//! Nothing here persists: the database lives and dies with the server
//! process. Modules that need history log it themselves through the client
//! interface.

/// Stable error kinds shared by the database, the wire and the client.
pub mod error;

/// Type identifiers, the compound data type registry and name rules.
pub mod types;

/// Handles: resolved references to sub-regions of tags.
pub mod handle;

/// Byte and bit kernels: realignment, masks, byte order, atomic operators.
pub mod data;

/// Write-driven notifications and their predicates.
pub mod event;

/// The tag database.
pub mod tagbase;

/// Frames and payload components for the server protocol.
pub mod wire;

/// The tag server.
pub mod server;

/// The module-facing client library.
pub mod client;

/// Provides re-exports of the types most embeddings need.
pub mod prelude;
