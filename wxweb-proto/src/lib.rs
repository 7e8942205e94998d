//! Data layer for the WeChat web protocol.
//!
//! Provides:
//! - [`Message`] / [`MessageKind`] — typed chat messages with a memoized
//!   wire encoding and local-id acknowledgment tracking
//! - [`decode`] — sync-batch entry decoder driven by a closed discriminator
//!   table
//! - [`markup`] — the restricted XML dialect embedded in message bodies,
//!   as an ordered key/value tree
//!
//! No I/O lives here; the transport and session machinery are in
//! `wxweb-client`.
//!
//! # Quick start
//!
//! ```rust
//! use wxweb_proto::Message;
//!
//! let msg = Message::text("@me", "@friend", "hello");
//! let wire = msg.wire_value();
//! assert_eq!(wire["Type"], 1);
//! assert_eq!(wire["Content"], "hello");
//! ```

#![deny(unsafe_code)]

pub mod markup;
pub mod message;

pub use markup::{ATTRS_KEY, MarkupError, MarkupTree, MarkupValue};
pub use message::{CodecError, Message, MessageKind, decode};
