//! Networking: the line protocol and the links that carry it.

pub mod link;
pub mod protocol;

pub use link::{LinkError, LinkSettings, MessageLink};
pub use protocol::{Envelope, Frame, Message, ProtocolError};
