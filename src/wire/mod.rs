//! The manager<->worker wire format: header codec, join-buffer, the lazily
//! (de)coded message container, the streaming decoder, and the well-known
//! document/type-registry glue.

pub mod document;
pub mod header;
pub mod joinbuf;
pub mod message;
pub mod types;

pub use document::Document;
pub use header::Header;
pub use joinbuf::JoinBuffer;
pub use message::{CallbackDecoder, DecodedMessage, MessageDecoder};
pub use types::MessageType;
