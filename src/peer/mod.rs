mod bitfield;
mod connection;
mod message;
mod protocol;
mod stream;

pub use bitfield::Bitfield;
pub use connection::spawn_connection;
pub use message::{BlockSpec, PeerMessage};
pub use protocol::{exchange_handshake, Handshake, PROTOCOL_STRING};
pub use stream::MessageStream;

/// Choke and interest flags for one side of a connection.
/// Both sides start choked and uninterested per the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    pub choked: bool,
    pub interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            choked: true,
            interested: false,
        }
    }
}
