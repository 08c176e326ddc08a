use super::message::{frame_size, PeerMessage};
use super::Bitfield;
use crate::error::{PeerwireError, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Framed view over a peer transport. Incoming bytes accumulate in a
/// receive buffer so the event loop can ask whether a whole message is
/// already buffered without blocking on a partial frame.
pub struct MessageStream<S> {
    io: S,
    inbox: BytesMut,
    bitfield_bytes: usize,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, num_pieces: usize) -> Self {
        Self {
            io,
            inbox: BytesMut::with_capacity(4096),
            bitfield_bytes: Bitfield::num_bytes(num_pieces),
        }
    }

    /// Encode and write one message
    pub async fn send(&mut self, msg: &PeerMessage) -> Result<()> {
        let bytes = msg.encode();
        self.io.write_all(&bytes).await?;
        trace!("Sent message ({} bytes): {:?}", bytes.len(), msg);
        Ok(())
    }

    /// Whether a full frame is already buffered. A malformed frame header
    /// also reports true so the next read surfaces the protocol error.
    pub fn has_complete_message(&self) -> bool {
        match frame_size(&self.inbox, self.bitfield_bytes) {
            Ok(Some(total)) => self.inbox.len() >= total,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    /// Read the next message, pulling from the transport until the frame
    /// is complete. Stream closure mid-frame is a connection-fatal error.
    pub async fn next_message(&mut self) -> Result<PeerMessage> {
        loop {
            if let Some(total) = frame_size(&self.inbox, self.bitfield_bytes)? {
                if self.inbox.len() >= total {
                    let frame = self.inbox.split_to(total);
                    return PeerMessage::decode(&frame, self.bitfield_bytes);
                }
            }
            self.fill().await?;
        }
    }

    /// One read into the receive buffer. Returns an error on EOF; a clean
    /// shutdown from the remote still tears this connection down.
    pub async fn fill(&mut self) -> Result<()> {
        let n = self.io.read_buf(&mut self.inbox).await?;
        if n == 0 {
            return Err(PeerwireError::PeerError(
                "Connection closed by peer".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::BlockSpec;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (near, far) = tokio::io::duplex(4096);
        let mut a = MessageStream::new(near, 16);
        let mut b = MessageStream::new(far, 16);

        a.send(&PeerMessage::Have { piece_index: 3 }).await.unwrap();
        a.send(&PeerMessage::Request {
            block: BlockSpec {
                piece_index: 3,
                begin: 0,
                length: 16384,
            },
        })
        .await
        .unwrap();

        assert_eq!(
            b.next_message().await.unwrap(),
            PeerMessage::Have { piece_index: 3 }
        );
        assert_eq!(
            b.next_message().await.unwrap(),
            PeerMessage::Request {
                block: BlockSpec {
                    piece_index: 3,
                    begin: 0,
                    length: 16384,
                },
            }
        );
    }

    #[tokio::test]
    async fn test_has_complete_message_tracks_partial_frames() {
        let (near, far) = tokio::io::duplex(4096);
        let mut a = MessageStream::new(near, 16);
        let mut b = MessageStream::new(far, 16);

        assert!(!b.has_complete_message());

        a.send(&PeerMessage::Unchoke).await.unwrap();
        b.fill().await.unwrap();
        assert!(b.has_complete_message());

        b.next_message().await.unwrap();
        assert!(!b.has_complete_message());
    }

    #[tokio::test]
    async fn test_closed_mid_frame_is_fatal() {
        let (mut near, far) = tokio::io::duplex(4096);
        let mut b = MessageStream::new(far, 16);

        // A length prefix promising 5 bytes, then the stream closes
        tokio::io::AsyncWriteExt::write_all(&mut near, &[0, 0, 0, 5, 4])
            .await
            .unwrap();
        drop(near);

        assert!(b.next_message().await.is_err());
    }
}
