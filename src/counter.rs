use std::sync::atomic::{AtomicU64, Ordering};

/// Transfer counters for a single peer session.
///
/// Protocol counters cover every byte crossing the wire; block counters only
/// the payload of piece blocks that matched a request (download side) or were
/// served from the store (upload side). All counters are cumulative and
/// relaxed: readers get a recent value, not a synchronized snapshot.
#[derive(Debug, Default)]
pub struct Counter {
    pub protocol_downloaded: AtomicU64,
    pub protocol_uploaded: AtomicU64,
    pub block_downloaded: AtomicU64,
    pub block_uploaded: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_protocol_download(&self, bytes: u64) {
        self.protocol_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_protocol_upload(&self, bytes: u64) {
        self.protocol_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_block_download(&self, bytes: u64) {
        self.block_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_block_upload(&self, bytes: u64) {
        self.block_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }
}
