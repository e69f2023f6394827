use std::fmt::Display;

use rand::{distr::Alphanumeric, Rng};

/// The 20-byte identity a peer presents in its handshake.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// A fresh local peer id in Azureus style.
    pub fn generate() -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-PW0100-");

        for byte in peer_id.iter_mut().skip(8) {
            *byte = rand::rng().sample(Alphanumeric);
        }

        PeerId(peer_id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("a peer id must have exactly 20 bytes");
        }
        let mut buff = [0u8; 20];
        buff.copy_from_slice(&value);
        Ok(PeerId(buff))
    }
}
