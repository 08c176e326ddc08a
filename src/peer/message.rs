use crate::error::{PeerwireError, Result};
use crate::piece::BLOCK_SIZE;
use bytes::{Buf, BufMut, BytesMut};

/// The (piece, offset, length) triple carried by request and cancel messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Messages exchanged between peers after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame, holds the transport open
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The sender now has piece `piece_index`
    Have { piece_index: u32 },
    /// The sender's complete piece map
    Bitfield { bits: Vec<u8> },
    /// Ask the peer for a block
    Request { block: BlockSpec },
    /// A block of piece data
    Piece {
        piece_index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    Cancel { block: BlockSpec },
    /// DHT listen port, accepted but unused
    Port { port: u32 },
}

const TAG_CHOKE: u8 = 0;
const TAG_UNCHOKE: u8 = 1;
const TAG_INTERESTED: u8 = 2;
const TAG_NOT_INTERESTED: u8 = 3;
const TAG_HAVE: u8 = 4;
const TAG_BITFIELD: u8 = 5;
const TAG_REQUEST: u8 = 6;
const TAG_PIECE: u8 = 7;
const TAG_CANCEL: u8 = 8;
const TAG_PORT: u8 = 9;

/// Check a frame's declared length against its tag's constraint.
/// `bitfield_bytes` is the exact bitfield payload size for this torrent.
fn validate_len(tag: u8, len: u32, bitfield_bytes: usize) -> Result<()> {
    let ok = match tag {
        TAG_CHOKE | TAG_UNCHOKE | TAG_INTERESTED | TAG_NOT_INTERESTED => len == 1,
        TAG_HAVE | TAG_PORT => len == 5,
        TAG_BITFIELD => len as usize == 1 + bitfield_bytes,
        TAG_REQUEST | TAG_CANCEL => len == 13,
        TAG_PIECE => (9..=9 + BLOCK_SIZE).contains(&len),
        _ => {
            return Err(PeerwireError::ProtocolError(format!(
                "Unknown message tag: {}",
                tag
            )))
        }
    };

    if !ok {
        return Err(PeerwireError::ProtocolError(format!(
            "Invalid length {} for message tag {}",
            len, tag
        )));
    }

    Ok(())
}

/// Inspect the head of a receive buffer. Returns the total frame size
/// (prefix included) once enough bytes are present to know it, `None` if
/// more bytes are needed, or a protocol error for a malformed header.
pub fn frame_size(buf: &[u8], bitfield_bytes: usize) -> Result<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len == 0 {
        return Ok(Some(4));
    }

    // Need the tag byte to validate the declared length
    if buf.len() < 5 {
        return Ok(None);
    }
    validate_len(buf[4], len, bitfield_bytes)?;

    Ok(Some(4 + len as usize))
}

impl PeerMessage {
    /// Serialize to wire format: <4-byte length prefix><tag><payload>
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::KeepAlive => buf.put_u32(0),
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(TAG_CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(TAG_UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(TAG_INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(TAG_NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(TAG_HAVE);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bits } => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(TAG_BITFIELD);
                buf.put_slice(bits);
            }
            PeerMessage::Request { block } => {
                buf.put_u32(13);
                buf.put_u8(TAG_REQUEST);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.begin);
                buf.put_u32(block.length);
            }
            PeerMessage::Piece {
                piece_index,
                begin,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(TAG_PIECE);
                buf.put_u32(*piece_index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            PeerMessage::Cancel { block } => {
                buf.put_u32(13);
                buf.put_u8(TAG_CANCEL);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.begin);
                buf.put_u32(block.length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(5);
                buf.put_u8(TAG_PORT);
                buf.put_u32(*port);
            }
        }

        buf.to_vec()
    }

    /// Deserialize one complete frame (length prefix included)
    pub fn decode(frame: &[u8], bitfield_bytes: usize) -> Result<Self> {
        let mut data = frame;
        if data.len() < 4 {
            return Err(PeerwireError::ProtocolError(
                "Frame shorter than length prefix".to_string(),
            ));
        }

        let len = data.get_u32();
        if len == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if data.len() != len as usize {
            return Err(PeerwireError::ProtocolError(format!(
                "Frame holds {} bytes but declares {}",
                data.len(),
                len
            )));
        }

        let tag = data.get_u8();
        validate_len(tag, len, bitfield_bytes)?;

        let msg = match tag {
            TAG_CHOKE => PeerMessage::Choke,
            TAG_UNCHOKE => PeerMessage::Unchoke,
            TAG_INTERESTED => PeerMessage::Interested,
            TAG_NOT_INTERESTED => PeerMessage::NotInterested,
            TAG_HAVE => PeerMessage::Have {
                piece_index: data.get_u32(),
            },
            TAG_BITFIELD => PeerMessage::Bitfield {
                bits: data.to_vec(),
            },
            TAG_REQUEST => PeerMessage::Request {
                block: BlockSpec {
                    piece_index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                },
            },
            TAG_PIECE => PeerMessage::Piece {
                piece_index: data.get_u32(),
                begin: data.get_u32(),
                data: data.to_vec(),
            },
            TAG_CANCEL => PeerMessage::Cancel {
                block: BlockSpec {
                    piece_index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                },
            },
            TAG_PORT => PeerMessage::Port {
                port: data.get_u32(),
            },
            // validate_len already rejected unknown tags
            _ => unreachable!(),
        };

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BF_BYTES: usize = 2;

    fn roundtrip(msg: PeerMessage) {
        let encoded = msg.encode();
        let decoded = PeerMessage::decode(&encoded, BF_BYTES).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_roundtrip_all_types() {
        roundtrip(PeerMessage::KeepAlive);
        roundtrip(PeerMessage::Choke);
        roundtrip(PeerMessage::Unchoke);
        roundtrip(PeerMessage::Interested);
        roundtrip(PeerMessage::NotInterested);
        roundtrip(PeerMessage::Have { piece_index: 42 });
        roundtrip(PeerMessage::Bitfield {
            bits: vec![0xA0, 0x01],
        });
        roundtrip(PeerMessage::Request {
            block: BlockSpec {
                piece_index: 1,
                begin: 16384,
                length: 16384,
            },
        });
        roundtrip(PeerMessage::Piece {
            piece_index: 3,
            begin: 0,
            data: vec![7u8; 512],
        });
        roundtrip(PeerMessage::Cancel {
            block: BlockSpec {
                piece_index: 1,
                begin: 0,
                length: 16384,
            },
        });
        roundtrip(PeerMessage::Port { port: 6881 });
    }

    #[test]
    fn test_rejects_unknown_tag() {
        let frame = [0, 0, 0, 1, 17];
        assert!(PeerMessage::decode(&frame, BF_BYTES).is_err());
    }

    #[test]
    fn test_rejects_wrong_length_for_tag() {
        // Have with a 2-byte payload instead of 4
        let frame = [0, 0, 0, 3, TAG_HAVE, 0, 1];
        assert!(PeerMessage::decode(&frame, BF_BYTES).is_err());

        // Choke carrying a payload
        let frame = [0, 0, 0, 2, TAG_CHOKE, 0];
        assert!(PeerMessage::decode(&frame, BF_BYTES).is_err());
    }

    #[test]
    fn test_rejects_wrong_bitfield_size() {
        let mut frame = vec![0, 0, 0, 4, TAG_BITFIELD];
        frame.extend_from_slice(&[0xFF; 3]);
        assert!(PeerMessage::decode(&frame, BF_BYTES).is_err());
    }

    #[test]
    fn test_rejects_oversized_piece() {
        let len = 9 + BLOCK_SIZE + 1;
        let mut frame = Vec::new();
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(TAG_PIECE);
        frame.extend_from_slice(&[0u8; 8]);
        frame.extend_from_slice(&vec![0u8; (BLOCK_SIZE + 1) as usize]);
        assert!(PeerMessage::decode(&frame, BF_BYTES).is_err());
    }

    #[test]
    fn test_frame_size_states() {
        // Partial prefix
        assert_eq!(frame_size(&[0, 0], BF_BYTES).unwrap(), None);
        // Keepalive is complete at the prefix alone
        assert_eq!(frame_size(&[0, 0, 0, 0], BF_BYTES).unwrap(), Some(4));
        // Prefix present but tag byte still missing
        assert_eq!(frame_size(&[0, 0, 0, 5], BF_BYTES).unwrap(), None);
        // Complete header for a have message
        assert_eq!(
            frame_size(&[0, 0, 0, 5, TAG_HAVE, 0], BF_BYTES).unwrap(),
            Some(9)
        );
        // Bad header surfaces as a protocol error
        assert!(frame_size(&[0, 0, 0, 5, TAG_CHOKE], BF_BYTES).is_err());
    }
}
