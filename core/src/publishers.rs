//! UDP publisher demux map.
//!
//! Keyed by `(publisher IP, port)` for O(1) lookup on every inbound UDP
//! datagram. IPv4 addresses are stored in IPv4-in-IPv6 form so that
//! equality is a fixed-size array compare.

use std::collections::HashMap;
use std::net::IpAddr;

/// RTP or RTCP, distinguishing the two fixed ports a track uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Rtp,
    Rtcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherEntry {
    pub session_id: u64,
    pub track_id: u32,
    pub stream_type: StreamType,
}

/// `(ip, port)` key in fixed-size form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    ip: [u8; 16],
    port: u16,
}

fn to_v6_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

#[derive(Default)]
pub struct PublisherMap {
    entries: HashMap<Key, PublisherEntry>,
}

impl PublisherMap {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, ip: IpAddr, port: u16, entry: PublisherEntry) {
        self.entries.insert(
            Key {
                ip: to_v6_octets(ip),
                port,
            },
            entry,
        );
    }

    pub fn lookup(&self, ip: IpAddr, port: u16) -> Option<PublisherEntry> {
        self.entries
            .get(&Key {
                ip: to_v6_octets(ip),
                port,
            })
            .copied()
    }

    /// Remove every entry belonging to a session (on TEARDOWN/disconnect).
    pub fn remove_session(&mut self, session_id: u64) {
        self.entries.retain(|_, e| e.session_id != session_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_roundtrips_through_v6_mapped_form() {
        let mut map = PublisherMap::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        map.insert(
            ip,
            30000,
            PublisherEntry {
                session_id: 1,
                track_id: 0,
                stream_type: StreamType::Rtp,
            },
        );
        let hit = map.lookup(ip, 30000).unwrap();
        assert_eq!(hit.session_id, 1);
        assert_eq!(hit.track_id, 0);
    }

    #[test]
    fn miss_on_wrong_port() {
        let mut map = PublisherMap::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        map.insert(
            ip,
            30000,
            PublisherEntry {
                session_id: 1,
                track_id: 0,
                stream_type: StreamType::Rtp,
            },
        );
        assert!(map.lookup(ip, 30001).is_none());
    }

    #[test]
    fn remove_session_clears_all_its_entries() {
        let mut map = PublisherMap::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        map.insert(
            ip,
            30000,
            PublisherEntry {
                session_id: 1,
                track_id: 0,
                stream_type: StreamType::Rtp,
            },
        );
        map.insert(
            ip,
            30001,
            PublisherEntry {
                session_id: 1,
                track_id: 0,
                stream_type: StreamType::Rtcp,
            },
        );
        map.remove_session(1);
        assert!(map.is_empty());
    }
}
