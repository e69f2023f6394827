//! Deterministic derivation of a peer's allowed-fast piece set (BEP 6).

use std::net::IpAddr;

use sha1::{Digest, Sha1};

use crate::storage::InfoHash;

/// Computes the allowed-fast set for a peer.
///
/// Both ends derive the set from the peer's IPv4 address (last octet
/// zeroed), the torrent's info hash and the piece count, so no negotiation
/// is needed: SHA1 over `address || info_hash` seeds a hash chain, and each
/// round contributes up to five piece indices from the 4-byte big-endian
/// windows of the digest, modulo the piece count. Duplicates are skipped
/// and insertion order is kept until `count` distinct pieces are collected.
///
/// Peers without an IPv4 address get no set.
pub fn allowed_fast_set(
    addr: IpAddr,
    info_hash: &InfoHash,
    num_pieces: u32,
    count: usize,
) -> Vec<u32> {
    let IpAddr::V4(addr) = addr else {
        return Vec::new();
    };
    if num_pieces == 0 {
        return Vec::new();
    }

    let count = count.min(num_pieces as usize);
    let mut pieces: Vec<u32> = Vec::with_capacity(count);

    let mut masked = addr.octets();
    masked[3] = 0;

    let mut hasher = Sha1::new();
    hasher.update(masked);
    hasher.update(info_hash.0);
    let mut hash = hasher.finalize();

    while pieces.len() < count {
        for window in hash.chunks_exact(4) {
            if pieces.len() >= count {
                break;
            }
            let value = u32::from_be_bytes([
                window[0], window[1], window[2], window[3],
            ]);
            let piece = value % num_pieces;
            if !pieces.contains(&piece) {
                pieces.push(piece);
            }
        }
        hash = Sha1::digest(hash);
    }

    pieces
}
