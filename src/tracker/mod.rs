mod announce;
mod client;

pub use announce::{AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerAddr};
pub use client::TrackerClient;

use rand::Rng;

/// Generate a random peer id: -PW0001- followed by 12 random printable bytes
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-PW0001-");

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.gen_range(b'0'..=b'z');
    }

    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_shape() {
        let peer_id = generate_peer_id();
        assert_eq!(peer_id.len(), 20);
        assert_eq!(&peer_id[0..8], b"-PW0001-");
        assert!(peer_id[8..].iter().all(|b| (b'0'..=b'z').contains(b)));
    }
}
