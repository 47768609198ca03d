//! RTSP client session state machine.
//!
//! A six-state machine covering both reader (PLAY) and publisher (RECORD)
//! sessions: `Initial -> WaitDescription -> PrePlay -> Play` and
//! `Initial -> PreRecord -> Record`.

pub mod auth;
pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::{RtspError, Result};
use crate::rtcp::RtcpReceiver;
pub use transport::{StreamProtocol, TrackTransport, TransportHeader};

/// RTSP session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    WaitDescription,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

/// One SETUP'd track's negotiated transport and (for Record sessions)
/// RTCP/liveness bookkeeping.
pub struct TrackSlot {
    pub transport: TrackTransport,
    pub rtcp: RwLock<RtcpReceiver>,
    /// Only meaningful for Record-state UDP tracks.
    pub udp_last_frame_time: RwLock<Instant>,
}

impl TrackSlot {
    fn new(transport: TrackTransport) -> Self {
        Self {
            transport,
            rtcp: RwLock::new(RtcpReceiver::new()),
            udp_last_frame_time: RwLock::new(Instant::now()),
        }
    }
}

/// A single RTSP client connection's session state.
///
/// The dispatcher owns all `Session`s; `id` is the stable key other
/// components (readers map, publisher map) use to refer back to it.
pub struct Session {
    pub id: u64,
    pub peer_addr: SocketAddr,
    state: RwLock<SessionState>,
    /// Path this session is bound to, once DESCRIBE/ANNOUNCE/SETUP names one.
    pub path_name: RwLock<Option<String>>,
    /// Chosen transport; must stay homogeneous across all SETUPs.
    protocol: RwLock<Option<StreamProtocol>>,
    tracks: RwLock<HashMap<u32, Arc<TrackSlot>>>,
    /// Declared publisher track count from ANNOUNCE. RECORD only succeeds
    /// once every declared track has been SETUP.
    pub announced_track_count: RwLock<Option<u32>>,
    auth_failures: AtomicU32,
    pub last_describe_cseq: RwLock<Option<String>>,
    /// Outbound interleaved-frame channel sender, installed once a TCP
    /// writer task is spawned for this session.
    pub frame_tx: RwLock<Option<std::sync::mpsc::Sender<Vec<u8>>>>,
}

impl Session {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            state: RwLock::new(SessionState::Initial),
            path_name: RwLock::new(None),
            protocol: RwLock::new(None),
            tracks: RwLock::new(HashMap::new()),
            announced_track_count: RwLock::new(None),
            auth_failures: AtomicU32::new(0),
            last_describe_cseq: RwLock::new(None),
            frame_tx: RwLock::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: SessionState) {
        tracing::debug!(session_id = self.id, old = ?*self.state.read(), new = ?state, "session state transition");
        *self.state.write() = state;
    }

    pub fn protocol(&self) -> Option<StreamProtocol> {
        *self.protocol.read()
    }

    pub fn path(&self) -> Option<String> {
        self.path_name.read().clone()
    }

    pub fn bind_path(&self, name: &str) {
        *self.path_name.write() = Some(name.to_string());
    }

    /// Register a SETUP'd track, enforcing homogeneous transport across the
    /// session.
    pub fn setup_track(&self, track_id: u32, transport: TrackTransport) -> Result<()> {
        let incoming_protocol = match &transport {
            TrackTransport::Udp { .. } => StreamProtocol::Udp,
            TrackTransport::Tcp { .. } => StreamProtocol::Tcp,
        };

        {
            let mut proto = self.protocol.write();
            match *proto {
                Some(existing) if existing != incoming_protocol => {
                    return Err(RtspError::InvalidTransport(
                        "heterogeneous transport across SETUPs".to_string(),
                    ));
                }
                _ => *proto = Some(incoming_protocol),
            }
        }

        if self.tracks.read().contains_key(&track_id) {
            return Err(RtspError::InvalidTransport(format!(
                "duplicate trackID={track_id}"
            )));
        }

        self.tracks
            .write()
            .insert(track_id, Arc::new(TrackSlot::new(transport)));
        Ok(())
    }

    pub fn track_count(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn track(&self, track_id: u32) -> Option<Arc<TrackSlot>> {
        self.tracks.read().get(&track_id).cloned()
    }

    pub fn tracks_snapshot(&self) -> Vec<(u32, Arc<TrackSlot>)> {
        self.tracks
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect()
    }

    /// Record an auth failure; returns `true` if the session must now be
    /// terminated (the 4th consecutive failure).
    pub fn record_auth_failure(&self) -> bool {
        let n = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
        n > 3
    }

    pub fn reset_auth_failures(&self) {
        self.auth_failures.store(0, Ordering::SeqCst);
    }

    pub fn auth_failure_count(&self) -> u32 {
        self.auth_failures.load(Ordering::SeqCst)
    }
}

/// Registry of live sessions, keyed by id.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<u64, Arc<Session>>>>,
    next_id: Arc<AtomicU64>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn create(&self, peer_addr: SocketAddr) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, peer_addr));
        self.sessions.write().insert(id, session.clone());
        tracing::debug!(session_id = id, %peer_addr, "session created");
        session
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(&id);
        if removed.is_some() {
            tracing::debug!(session_id = id, "session removed");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Session ids currently in `Record` state, for the dispatcher's
    /// stream-dead check and receiver-report ticker.
    pub fn ids_in_record_state(&self) -> Vec<u64> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.state() == SessionState::Record)
            .map(|s| s.id)
            .collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:1234".parse().unwrap()
    }

    #[test]
    fn session_starts_in_initial_state() {
        let s = Session::new(1, addr());
        assert_eq!(s.state(), SessionState::Initial);
    }

    #[test]
    fn setup_track_rejects_heterogeneous_transport() {
        let s = Session::new(1, addr());
        s.setup_track(
            0,
            TrackTransport::Udp {
                client_rtp_port: 3000,
                client_rtcp_port: 3001,
                server_rtp_port: 4000,
                server_rtcp_port: 4001,
            },
        )
        .unwrap();

        let err = s
            .setup_track(
                1,
                TrackTransport::Tcp {
                    rtp_channel: 2,
                    rtcp_channel: 3,
                },
            )
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn setup_track_rejects_duplicate_track_id() {
        let s = Session::new(1, addr());
        s.setup_track(
            0,
            TrackTransport::Tcp {
                rtp_channel: 0,
                rtcp_channel: 1,
            },
        )
        .unwrap();
        assert!(
            s.setup_track(
                0,
                TrackTransport::Tcp {
                    rtp_channel: 2,
                    rtcp_channel: 3,
                }
            )
            .is_err()
        );
    }

    #[test]
    fn auth_failure_terminates_on_fourth() {
        let s = Session::new(1, addr());
        assert!(!s.record_auth_failure());
        assert!(!s.record_auth_failure());
        assert!(!s.record_auth_failure());
        assert!(s.record_auth_failure());
    }

    #[test]
    fn auth_success_resets_counter() {
        let s = Session::new(1, addr());
        s.record_auth_failure();
        s.record_auth_failure();
        s.reset_auth_failures();
        assert_eq!(s.auth_failure_count(), 0);
    }

    #[test]
    fn session_manager_create_get_remove() {
        let mgr = SessionManager::new();
        let session = mgr.create(addr());
        let id = session.id;
        assert!(mgr.get(id).is_some());
        mgr.remove(id);
        assert!(mgr.get(id).is_none());
    }
}
