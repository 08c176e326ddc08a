use crate::error::{PeerwireError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Total size of the handshake record on the wire
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Handshake record exchanged before any protocol messages
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        // 8 reserved bytes stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn from_bytes(data: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if data[0] as usize != PROTOCOL_STRING.len() {
            return Err(PeerwireError::ProtocolError(
                "Invalid protocol string length".to_string(),
            ));
        }

        if &data[1..20] != PROTOCOL_STRING {
            return Err(PeerwireError::ProtocolError(
                "Invalid protocol string".to_string(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}

/// Send our handshake, receive the peer's, and verify the torrent identifier.
/// Returns the remote peer id on success.
pub async fn exchange_handshake<S>(
    io: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<[u8; 20]>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(info_hash, peer_id);
    io.write_all(&ours.to_bytes()).await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    io.read_exact(&mut buf).await?;

    let theirs = Handshake::from_bytes(&buf)?;
    if theirs.info_hash != info_hash {
        return Err(PeerwireError::ProtocolError(
            "Received wrong info hash from peer".to_string(),
        ));
    }

    Ok(theirs.peer_id)
}
