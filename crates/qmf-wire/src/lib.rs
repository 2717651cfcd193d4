//! # QMF Wire Model
//!
//! Shared protocol data model for the QMF management fabric.
//!
//! This crate holds everything both sides of the agent's transport boundary
//! agree on: the variant [`Value`] model used for map-encoded QMFv2 bodies,
//! the [`InboundMessage`]/[`OutboundMessage`] envelopes exchanged with the
//! broker adapter, the well-known QMFv2 header and opcode constants, and the
//! small binary framing used by legacy QMFv1 requests.
//!
//! The byte-level MAP/LIST codec is deliberately *not* here. Bodies cross
//! the transport port as structured [`MessageBody`] values; the concrete
//! broker adapter owns their serialization.

pub mod envelope;
pub mod error;
pub mod framing;
pub mod message;
pub mod status;
pub mod value;

pub use envelope::{content, exchange, header, opcode, routing, schema_id};
pub use error::ConversionError;
pub use framing::{check_header, encode_header, FrameHeader, V1Opcode};
pub use message::{InboundMessage, MessageBody, OutboundMessage};
pub use status::MethodStatus;
pub use value::{Value, ValueList, ValueMap};
