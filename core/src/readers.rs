//! Readers map: O(1) fan-out of a frame to every reader of a path.

use std::collections::HashMap;

use crate::session::StreamProtocol;

#[derive(Default)]
struct PathReaders {
    udp: Vec<u64>,
    tcp: Vec<u64>,
}

/// Per-path reader sets, partitioned by transport.
#[derive(Default)]
pub struct ReadersMap {
    by_path: HashMap<String, PathReaders>,
}

impl ReadersMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a reader into the fan-out. Callers must not call this until
    /// after the PLAY response is already on the wire, so no frame can
    /// reach a reader before its 200 OK.
    pub fn add(&mut self, path: &str, session_id: u64, protocol: StreamProtocol) {
        let entry = self.by_path.entry(path.to_string()).or_default();
        let bucket = match protocol {
            StreamProtocol::Udp => &mut entry.udp,
            StreamProtocol::Tcp => &mut entry.tcp,
        };
        if !bucket.contains(&session_id) {
            bucket.push(session_id);
        }
    }

    pub fn remove(&mut self, path: &str, session_id: u64) {
        if let Some(entry) = self.by_path.get_mut(path) {
            entry.udp.retain(|id| *id != session_id);
            entry.tcp.retain(|id| *id != session_id);
        }
    }

    pub fn remove_session_everywhere(&mut self, session_id: u64) {
        for entry in self.by_path.values_mut() {
            entry.udp.retain(|id| *id != session_id);
            entry.tcp.retain(|id| *id != session_id);
        }
    }

    /// UDP readers of a path, for datagram fan-out.
    pub fn udp_readers(&self, path: &str) -> &[u64] {
        self.by_path
            .get(path)
            .map(|e| e.udp.as_slice())
            .unwrap_or(&[])
    }

    /// TCP (interleaved) readers of a path.
    pub fn tcp_readers(&self, path: &str) -> &[u64] {
        self.by_path
            .get(path)
            .map(|e| e.tcp.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self, path: &str) -> bool {
        self.by_path
            .get(path)
            .map(|e| e.udp.is_empty() && e.tcp.is_empty())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_partitions_by_transport() {
        let mut readers = ReadersMap::new();
        readers.add("cam1", 1, StreamProtocol::Udp);
        readers.add("cam1", 2, StreamProtocol::Tcp);
        assert_eq!(readers.udp_readers("cam1"), &[1]);
        assert_eq!(readers.tcp_readers("cam1"), &[2]);
    }

    #[test]
    fn add_is_idempotent() {
        let mut readers = ReadersMap::new();
        readers.add("cam1", 1, StreamProtocol::Udp);
        readers.add("cam1", 1, StreamProtocol::Udp);
        assert_eq!(readers.udp_readers("cam1").len(), 1);
    }

    #[test]
    fn remove_drops_from_both_buckets() {
        let mut readers = ReadersMap::new();
        readers.add("cam1", 1, StreamProtocol::Udp);
        readers.remove("cam1", 1);
        assert!(readers.is_empty("cam1"));
    }

    #[test]
    fn remove_session_everywhere_clears_all_paths() {
        let mut readers = ReadersMap::new();
        readers.add("cam1", 7, StreamProtocol::Tcp);
        readers.add("cam2", 7, StreamProtocol::Udp);
        readers.remove_session_everywhere(7);
        assert!(readers.is_empty("cam1"));
        assert!(readers.is_empty("cam2"));
    }
}
