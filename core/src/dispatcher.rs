//! Central dispatcher: a single-threaded event serializer. Owns every
//! piece of shared mutable domain state — the path manager, the UDP
//! publisher map, and the readers map — and mutates it only in response
//! to events received on one channel, in FIFO order.
//!
//! Once a publisher enters the picture — one path, one publisher, many
//! readers, on-demand activation, describe-wait queueing — the
//! cross-structure invariants (at most one publisher per path; a reader's
//! fan-out installed only after its 200 OK is on the wire) need a single
//! serialization point instead of lock ordering. This module is that
//! point, using the same `std::sync::mpsc` + dedicated-OS-thread shape as
//! every other long-running loop in the crate (`transport::tcp::accept_loop`,
//! `transport::udp`), rather than an async runtime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Config, SourceProtocol};
use crate::error::{Result, RtspError};
use crate::path::{DescribeOutcome, DescribeWaiter, PathManager, Publisher};
use crate::protocol::sdp;
use crate::publishers::{PublisherEntry, PublisherMap, StreamType};
use crate::readers::ReadersMap;
use crate::rtp::{HOLE_PUNCH_RTCP, HOLE_PUNCH_RTP};
use crate::session::auth::{self, Credentials};
use crate::session::{Session, SessionManager, SessionState, StreamProtocol, TrackTransport};

/// Outcome of a SETUP request the dispatcher must gate on path
/// existence, ACL, and enabled-protocol config.
pub struct SetupGrant {
    pub server_rtp_port: u16,
    pub server_rtcp_port: u16,
}

/// Auth outcome surfaced to a connection thread: either proceed, or send
/// a 401 challenge (and, past the 4th failure, close the session).
pub enum AuthDecision {
    Allowed,
    Denied { www_authenticate: String, fatal: bool },
}

pub enum DispatchEvent {
    Connect {
        peer_addr: SocketAddr,
        reply: Sender<Arc<Session>>,
    },
    Describe {
        session_id: u64,
        path_name: String,
        method: String,
        uri: String,
        auth_header: Option<String>,
        reply: Sender<Result<DescribeOutcome>>,
    },
    Announce {
        session_id: u64,
        path_name: String,
        sdp: String,
        uri: String,
        auth_header: Option<String>,
        reply: Sender<Result<u32>>,
    },
    Setup {
        session_id: u64,
        path_name: String,
        mode: SetupMode,
        protocol: StreamProtocol,
        uri: String,
        auth_header: Option<String>,
        reply: Sender<Result<SetupGrant>>,
    },
    /// Sent by the connection thread only *after* the 200 OK for PLAY is
    /// already on the wire, so no frame can precede the response that
    /// authorizes it.
    ConfirmPlay {
        session_id: u64,
        path_name: String,
        protocol: StreamProtocol,
    },
    /// Sent only after the 200 OK for RECORD is on the wire.
    ConfirmRecord {
        session_id: u64,
        path_name: String,
    },
    Pause {
        session_id: u64,
        path_name: String,
    },
    Teardown {
        session_id: u64,
    },
    /// Connection dropped without a clean TEARDOWN.
    Disconnected {
        session_id: u64,
    },
    UdpFrame {
        addr: SocketAddr,
        stream_type: StreamType,
        data: Vec<u8>,
    },
    TcpFrame {
        session_id: u64,
        channel: u8,
        data: Vec<u8>,
    },
    SourceReady {
        path_name: String,
        sdp: String,
        track_count: u32,
    },
    SourceNotReady {
        path_name: String,
    },
    SourceFrame {
        path_name: String,
        track_id: u32,
        stream_type: StreamType,
        data: Vec<u8>,
    },
    /// Hands the dispatcher the stop handle for a source the caller
    /// already spawned directly (e.g. an always-on, non-on-demand path
    /// started at startup rather than via `start_source_if_needed`).
    SourceStarted {
        path_name: String,
        stop: Sender<()>,
        join: thread::JoinHandle<()>,
    },
    Maintenance,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupMode {
    Play,
    Record,
}

/// Handle given to every I/O task (TCP connections, UDP endpoints, source
/// clients) so they can send events into the dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: Sender<DispatchEvent>,
}

impl DispatchHandle {
    pub fn send(&self, event: DispatchEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| RtspError::ChannelClosed("dispatcher"))
    }
}

/// Outbound write request for one of the two fixed UDP endpoints.
pub type UdpWrite = (SocketAddr, Vec<u8>);

struct SourceStop {
    stop_tx: Sender<()>,
    join: thread::JoinHandle<()>,
}

impl SourceStop {
    /// Signal the outer task to stop and block until it exits.
    fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.join.join();
    }
}

/// Installed by the caller that owns network/thread setup (the cli
/// crate's wiring) so the dispatcher can start an upstream source without
/// itself knowing how to open sockets. Given the path name, the upstream
/// URL, and the source's preferred transport, it spawns the outer source
/// task and returns its stop sender plus the outer task's join handle, so
/// the dispatcher can actually join it on shutdown rather than detaching it.
pub type SourceSpawner = Arc<
    dyn Fn(String, String, SourceProtocol, DispatchHandle) -> (Sender<()>, thread::JoinHandle<()>)
        + Send
        + Sync,
>;

pub struct Dispatcher {
    config: Arc<Config>,
    paths: PathManager,
    publishers: PublisherMap,
    readers: ReadersMap,
    sessions: SessionManager,
    rtp_tx: Sender<UdpWrite>,
    rtcp_tx: Sender<UdpWrite>,
    /// Outer-task stop signals for running upstream sources, by path name.
    /// The dispatcher holds the outer handle so it can stop a source
    /// without racing the task's own reconnect loop.
    sources: HashMap<String, SourceStop>,
    source_spawner: Option<SourceSpawner>,
    self_handle: Option<DispatchHandle>,
    nonce: String,
    last_receiver_report: Instant,
    last_stream_check: Instant,
}

impl Dispatcher {
    /// Spawn the dispatcher on its own OS thread and return a handle other
    /// components use to talk to it, plus the join handle for shutdown.
    pub fn spawn(
        config: Config,
        sessions: SessionManager,
        rtp_tx: Sender<UdpWrite>,
        rtcp_tx: Sender<UdpWrite>,
    ) -> (DispatchHandle, thread::JoinHandle<()>) {
        Self::spawn_with_source_spawner(config, sessions, rtp_tx, rtcp_tx, None)
    }

    /// Same as [`Dispatcher::spawn`], additionally wiring a [`SourceSpawner`]
    /// so `DESCRIBE`/`ANNOUNCE` on a path configured with an upstream
    /// `source` can actually start the pull client.
    pub fn spawn_with_source_spawner(
        config: Config,
        sessions: SessionManager,
        rtp_tx: Sender<UdpWrite>,
        rtcp_tx: Sender<UdpWrite>,
        source_spawner: Option<SourceSpawner>,
    ) -> (DispatchHandle, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = DispatchHandle { tx: tx.clone() };

        // Maintenance ticker: every 1s, feeds the 5s describe-timeout, 5s
        // stream-dead, and 10s receiver-report checks.
        let ticker_tx = tx.clone();
        thread::spawn(move || {
            loop {
                thread::sleep(Duration::from_secs(1));
                if ticker_tx.send(DispatchEvent::Maintenance).is_err() {
                    break;
                }
            }
        });

        let config = Arc::new(config);
        let paths = PathManager::new(&config);
        let dispatcher = Dispatcher {
            config,
            paths,
            publishers: PublisherMap::new(),
            readers: ReadersMap::new(),
            sessions,
            rtp_tx,
            rtcp_tx,
            sources: HashMap::new(),
            source_spawner,
            self_handle: Some(handle.clone()),
            nonce: "rtsp-relay-nonce".to_string(),
            last_receiver_report: Instant::now(),
            last_stream_check: Instant::now(),
        };

        let join = thread::spawn(move || dispatcher.run(rx));
        (handle, join)
    }

    fn run(mut self, rx: Receiver<DispatchEvent>) {
        for event in rx {
            match event {
                DispatchEvent::Shutdown => break,
                other => self.handle(other),
            }
        }
        for (path_name, source) in self.sources.drain() {
            tracing::info!(path = path_name, "stopping upstream source for shutdown");
            source.stop();
        }
        tracing::info!("dispatcher stopped");
    }

    fn handle(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Connect { peer_addr, reply } => {
                let session = self.sessions.create(peer_addr);
                let _ = reply.send(session);
            }
            DispatchEvent::Describe {
                session_id,
                path_name,
                method,
                uri,
                auth_header,
                reply,
            } => self.handle_describe(session_id, &path_name, method, &uri, auth_header, reply),
            DispatchEvent::Announce {
                session_id,
                path_name,
                sdp,
                uri,
                auth_header,
                reply,
            } => self.handle_announce(session_id, &path_name, sdp, &uri, auth_header, reply),
            DispatchEvent::Setup {
                session_id,
                path_name,
                mode,
                protocol,
                uri,
                auth_header,
                reply,
            } => self.handle_setup(session_id, &path_name, mode, protocol, &uri, auth_header, reply),
            DispatchEvent::ConfirmPlay {
                session_id,
                path_name,
                protocol,
            } => self.handle_confirm_play(session_id, &path_name, protocol),
            DispatchEvent::ConfirmRecord {
                session_id,
                path_name,
            } => self.handle_confirm_record(session_id, &path_name),
            DispatchEvent::Pause {
                session_id,
                path_name,
            } => {
                self.readers.remove(&path_name, session_id);
            }
            DispatchEvent::Teardown { session_id } => self.handle_disconnect(session_id),
            DispatchEvent::Disconnected { session_id } => self.handle_disconnect(session_id),
            DispatchEvent::UdpFrame {
                addr,
                stream_type,
                data,
            } => self.handle_udp_frame(addr, stream_type, &data),
            DispatchEvent::TcpFrame {
                session_id,
                channel,
                data,
            } => self.handle_tcp_frame(session_id, channel, &data),
            DispatchEvent::SourceReady {
                path_name,
                sdp,
                track_count,
            } => self.handle_source_ready(&path_name, sdp, track_count),
            DispatchEvent::SourceNotReady { path_name } => {
                if let Some(path) = self.paths.get_mut(&path_name) {
                    path.mark_not_ready();
                }
            }
            DispatchEvent::SourceFrame {
                path_name,
                track_id,
                stream_type,
                data,
            } => self.fan_out(&path_name, track_id, stream_type, &data),
            DispatchEvent::SourceStarted { path_name, stop, join } => {
                self.register_source(path_name, stop, join);
            }
            DispatchEvent::Maintenance => self.maintenance(),
            DispatchEvent::Shutdown => unreachable!("filtered in run()"),
        }
    }

    // ---- DESCRIBE ----------------------------------------------------

    fn handle_describe(
        &mut self,
        session_id: u64,
        path_name: &str,
        method: String,
        uri: &str,
        auth_header: Option<String>,
        reply: Sender<Result<DescribeOutcome>>,
    ) {
        let Some(session) = self.sessions.get(session_id) else {
            let _ = reply.send(Err(RtspError::SessionNotFound(session_id.to_string())));
            return;
        };

        let acl = match self.paths.resolve_or_create(path_name) {
            Ok(path) => path.config.read.clone(),
            Err(_) => {
                let _ = reply.send(Ok(DescribeOutcome::NotFound));
                return;
            }
        };

        match self.authorize(&acl, &session, &method, uri, auth_header.as_deref()) {
            AuthDecision::Denied { www_authenticate, fatal } => {
                let _ = reply.send(Err(RtspError::Unauthorized {
                    challenge: www_authenticate,
                    fatal,
                }));
                if fatal {
                    self.handle_disconnect(session_id);
                }
                return;
            }
            AuthDecision::Allowed => {}
        }

        let requires_activation = {
            let path = self.paths.get_mut(path_name).expect("just resolved");
            if path.requires_on_demand_activation() {
                path.on_demand_running = true;
                path.last_describe_activated = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if requires_activation {
            self.start_source_if_needed(path_name);
        }

        let path = self.paths.get_mut(path_name).expect("just resolved");
        if path.ready {
            let sdp = path.sdp.clone().unwrap_or_default();
            let _ = reply.send(Ok(DescribeOutcome::Ready { sdp }));
            return;
        }

        // Not yet ready: queue and let either `mark_ready` (publisher/source
        // comes up) or the 5s describe-timeout maintenance sweep resolve
        // this waiter.
        let (waiter_tx, waiter_rx) = mpsc::channel();
        path.push_describe_waiter(DescribeWaiter {
            session_id,
            requested_at: Instant::now(),
            reply: waiter_tx,
        });
        session.set_state(SessionState::WaitDescription);

        // The dispatcher must not block on this recv (it would stall every
        // other event); hand the waiter's own receiver back isn't possible
        // since `reply` already expects a `DescribeOutcome` directly. We
        // instead spawn nothing here: the connection thread is the one
        // that blocks on `waiter_rx`, so forward it via the same reply
        // channel's sender by proxying through a short-lived thread.
        let forward = reply;
        thread::spawn(move || {
            if let Ok(outcome) = waiter_rx.recv() {
                let _ = forward.send(Ok(outcome));
            }
        });
    }

    // ---- ANNOUNCE ----------------------------------------------------

    fn handle_announce(
        &mut self,
        session_id: u64,
        path_name: &str,
        sdp_body: String,
        uri: &str,
        auth_header: Option<String>,
        reply: Sender<Result<u32>>,
    ) {
        let Some(session) = self.sessions.get(session_id) else {
            let _ = reply.send(Err(RtspError::SessionNotFound(session_id.to_string())));
            return;
        };

        let acl = match self.paths.resolve_or_create(path_name) {
            Ok(path) => path.config.publish.clone(),
            Err(_) => {
                let _ = reply.send(Err(RtspError::PathNotFound(path_name.to_string())));
                return;
            }
        };

        match self.authorize(&acl, &session, "ANNOUNCE", uri, auth_header.as_deref()) {
            AuthDecision::Denied { www_authenticate, fatal } => {
                let _ = reply.send(Err(RtspError::Unauthorized {
                    challenge: www_authenticate,
                    fatal,
                }));
                if fatal {
                    self.handle_disconnect(session_id);
                }
                return;
            }
            AuthDecision::Allowed => {}
        }

        let path = self.paths.get_mut(path_name).expect("just resolved");
        if path.publisher.is_some() {
            let _ = reply.send(Err(RtspError::InvalidTransport(
                "path already has a publisher".to_string(),
            )));
            return;
        }

        let track_count = sdp::track_count(&sdp_body);
        path.publisher = Some(Publisher::Session(session_id));
        path.sdp = Some(sdp_body);
        path.ready = false;
        session.bind_path(path_name);
        *session.announced_track_count.write() = Some(track_count);
        let _ = reply.send(Ok(track_count));
    }

    // ---- SETUP -------------------------------------------------------

    fn handle_setup(
        &mut self,
        session_id: u64,
        path_name: &str,
        mode: SetupMode,
        protocol: StreamProtocol,
        uri: &str,
        auth_header: Option<String>,
        reply: Sender<Result<SetupGrant>>,
    ) {
        let Some(session) = self.sessions.get(session_id) else {
            let _ = reply.send(Err(RtspError::SessionNotFound(session_id.to_string())));
            return;
        };

        let acl = match self.paths.resolve_or_create(path_name) {
            Ok(path) => match mode {
                SetupMode::Play => path.config.read.clone(),
                SetupMode::Record => path.config.publish.clone(),
            },
            Err(_) => {
                let _ = reply.send(Err(RtspError::PathNotFound(path_name.to_string())));
                return;
            }
        };
        match self.authorize(&acl, &session, "SETUP", uri, auth_header.as_deref()) {
            AuthDecision::Denied { www_authenticate, fatal } => {
                let _ = reply.send(Err(RtspError::Unauthorized {
                    challenge: www_authenticate,
                    fatal,
                }));
                if fatal {
                    self.handle_disconnect(session_id);
                }
                return;
            }
            AuthDecision::Allowed => {}
        }

        let enabled = match protocol {
            StreamProtocol::Udp => self.config.server.protocols.contains(&crate::config::Protocol::Udp),
            StreamProtocol::Tcp => self.config.server.protocols.contains(&crate::config::Protocol::Tcp),
        };
        if !enabled {
            let _ = reply.send(Err(RtspError::UnsupportedTransport(format!(
                "{protocol:?} disabled by server config"
            ))));
            return;
        }

        if mode == SetupMode::Record {
            let path = self.paths.get(path_name).expect("just resolved");
            match path.publisher {
                Some(Publisher::Session(id)) if id == session_id => {}
                _ => {
                    let _ = reply.send(Err(RtspError::WrongState {
                        method: "SETUP".to_string(),
                        state: "no matching ANNOUNCE".to_string(),
                    }));
                    return;
                }
            }
        }

        session.bind_path(path_name);
        let _ = reply.send(Ok(SetupGrant {
            server_rtp_port: self.config.server.rtp_port,
            server_rtcp_port: self.config.server.rtcp_port,
        }));
    }

    // ---- PLAY / RECORD confirmation -----------------------------------

    fn handle_confirm_play(&mut self, session_id: u64, path_name: &str, protocol: StreamProtocol) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        session.set_state(SessionState::Play);
        if let Some(path) = self.paths.get_mut(path_name) {
            if !path.readers.contains(&session_id) {
                path.readers.push(session_id);
            }
        }
        // Installed only now — after the 200 OK is already on the wire,
        // so no frame precedes the response that authorizes it.
        self.readers.add(path_name, session_id, protocol);
    }

    fn handle_confirm_record(&mut self, session_id: u64, path_name: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        session.set_state(SessionState::Record);

        // Register this session's UDP tracks in the publisher map, and
        // send the two hole-punch datagrams per track.
        for (track_id, slot) in session.tracks_snapshot() {
            if let TrackTransport::Udp {
                client_rtp_port,
                client_rtcp_port,
                ..
            } = &slot.transport
            {
                let client_rtp_port = *client_rtp_port;
                let client_rtcp_port = *client_rtcp_port;
                self.publishers.insert(
                    session.peer_addr.ip(),
                    client_rtp_port,
                    PublisherEntry {
                        session_id,
                        track_id,
                        stream_type: StreamType::Rtp,
                    },
                );
                self.publishers.insert(
                    session.peer_addr.ip(),
                    client_rtcp_port,
                    PublisherEntry {
                        session_id,
                        track_id,
                        stream_type: StreamType::Rtcp,
                    },
                );
                let client_addr = SocketAddr::new(session.peer_addr.ip(), client_rtp_port);
                let _ = self.rtp_tx.send((client_addr, HOLE_PUNCH_RTP.to_vec()));
                let rtcp_addr = SocketAddr::new(session.peer_addr.ip(), client_rtcp_port);
                let _ = self.rtcp_tx.send((rtcp_addr, HOLE_PUNCH_RTCP.to_vec()));
            }
        }

        if let Some(path) = self.paths.get_mut(path_name) {
            let sdp = path.sdp.clone().unwrap_or_default();
            let track_count = path.track_count.max(session.track_count() as u32);
            path.mark_ready(sdp, track_count);
            tracing::info!(path = path_name, "path became ready (publisher RECORDed)");
        }
    }

    // ---- TEARDOWN / disconnect --------------------------------------------

    fn handle_disconnect(&mut self, session_id: u64) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };
        self.publishers.remove_session(session_id);
        self.readers.remove_session_everywhere(session_id);

        if let Some(path_name) = session.path() {
            if let Some(path) = self.paths.get_mut(&path_name) {
                let was_publisher = matches!(path.publisher, Some(Publisher::Session(id)) if id == session_id);
                if was_publisher {
                    path.mark_not_ready();
                    for reader_id in std::mem::take(&mut path.readers) {
                        // Reader sessions are closed by their own read loop
                        // observing the readers-map removal / socket EOF;
                        // nothing further to mutate here.
                        let _ = reader_id;
                    }
                } else {
                    path.readers.retain(|id| *id != session_id);
                }
                self.paths.remove_if_destroyable(&path_name);
            }
        }
    }

    // ---- RTP/RTCP forwarding -------------------------------------------

    fn handle_udp_frame(&mut self, addr: SocketAddr, stream_type: StreamType, data: &[u8]) {
        let Some(entry) = self.publishers.lookup(addr.ip(), addr.port()) else {
            return; // no matching publisher entry: drop silently
        };
        let Some(session) = self.sessions.get(entry.session_id) else {
            return;
        };
        let Some(slot) = session.track(entry.track_id) else {
            return;
        };
        match stream_type {
            StreamType::Rtp => {
                *slot.udp_last_frame_time.write() = Instant::now();
                slot.rtcp.write().on_rtp(data);
            }
            StreamType::Rtcp => slot.rtcp.write().on_rtcp(data),
        }
        if let Some(path_name) = session.path() {
            self.fan_out(&path_name, entry.track_id, stream_type, data);
        }
    }

    fn handle_tcp_frame(&mut self, session_id: u64, channel: u8, data: &[u8]) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let track_id = (channel / 2) as u32;
        let stream_type = if channel % 2 == 0 {
            StreamType::Rtp
        } else {
            StreamType::Rtcp
        };
        if let Some(slot) = session.track(track_id) {
            match stream_type {
                StreamType::Rtp => {
                    *slot.udp_last_frame_time.write() = Instant::now();
                    slot.rtcp.write().on_rtp(data);
                }
                StreamType::Rtcp => slot.rtcp.write().on_rtcp(data),
            }
        }
        if let Some(path_name) = session.path() {
            self.fan_out(&path_name, track_id, stream_type, data);
        }
    }

    /// Fan a frame out to every reader of `path_name`.
    fn fan_out(&mut self, path_name: &str, track_id: u32, stream_type: StreamType, data: &[u8]) {
        for reader_id in self.readers.udp_readers(path_name).to_vec() {
            let Some(reader) = self.sessions.get(reader_id) else {
                continue;
            };
            let Some(slot) = reader.track(track_id) else {
                continue;
            };
            if let TrackTransport::Udp {
                client_rtp_port,
                client_rtcp_port,
                ..
            } = &slot.transport
            {
                let (port, tx) = match stream_type {
                    StreamType::Rtp => (*client_rtp_port, &self.rtp_tx),
                    StreamType::Rtcp => (*client_rtcp_port, &self.rtcp_tx),
                };
                let addr = SocketAddr::new(reader.peer_addr.ip(), port);
                let _ = tx.send((addr, data.to_vec()));
            }
        }

        for reader_id in self.readers.tcp_readers(path_name).to_vec() {
            let Some(reader) = self.sessions.get(reader_id) else {
                continue;
            };
            let channel = match stream_type {
                StreamType::Rtp => 2 * track_id,
                StreamType::Rtcp => 2 * track_id + 1,
            };
            if let Some(tx) = reader.frame_tx.read().as_ref() {
                let mut framed = Vec::with_capacity(4 + data.len());
                framed.push(b'$');
                framed.push(channel as u8);
                framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
                framed.extend_from_slice(data);
                // A slow reader whose bounded channel is full is dropped by
                // closing its session, rather than blocking fan-out to
                // everyone else (either choice is
                // acceptable; this repo picks "drop the slow reader").
                if tx.send(framed).is_err() {
                    self.handle_disconnect(reader_id);
                }
            }
        }
    }

    // ---- upstream source lifecycle ---------------------------------------

    fn handle_source_ready(&mut self, path_name: &str, sdp_body: String, track_count: u32) {
        if let Some(path) = self.paths.get_mut(path_name) {
            path.publisher = Some(Publisher::Source);
            path.mark_ready(sdp_body, track_count);
            tracing::info!(path = path_name, track_count, "source became ready");
        }
    }

    fn start_source_if_needed(&mut self, path_name: &str) {
        if self.sources.contains_key(path_name) {
            return;
        }
        let Some(spawner) = self.source_spawner.clone() else {
            return;
        };
        let Some(handle) = self.self_handle.clone() else {
            return;
        };
        let Some(path_config) = self.config.path_by_name(path_name) else {
            return;
        };
        let url = match &path_config.source {
            crate::config::SourceKind::Rtsp(url) => url.clone(),
            _ => return,
        };
        let protocol = path_config.source_protocol;
        let (stop, join) = spawner(path_name.to_string(), url, protocol, handle);
        self.register_source(path_name.to_string(), stop, join);
    }

    pub fn register_source(&mut self, path_name: String, stop: Sender<()>, join: thread::JoinHandle<()>) {
        self.sources.insert(path_name, SourceStop { stop_tx: stop, join });
    }

    fn stop_source(&mut self, path_name: &str) {
        if let Some(source) = self.sources.remove(path_name) {
            source.stop();
        }
    }

    // ---- periodic maintenance ----------------------------------------------

    fn maintenance(&mut self) {
        let describe_wait = crate::config::timeouts::DESCRIBE_WAIT;
        let on_demand_idle = crate::config::timeouts::ON_DEMAND_IDLE;
        let do_receiver_report = self.last_receiver_report.elapsed() >= crate::config::timeouts::RECEIVER_REPORT;
        let do_stream_check = self.last_stream_check.elapsed() >= crate::config::timeouts::STREAM_CHECK;

        let path_names: Vec<String> = self.paths.iter().map(|p| p.name.clone()).collect();
        for name in &path_names {
            if let Some(path) = self.paths.get_mut(name) {
                path.fail_expired_waiters(describe_wait);
                if path.config.source_on_demand && path.on_demand_running && path.on_demand_idle(on_demand_idle) {
                    path.on_demand_running = false;
                    self.stop_source(name);
                    tracing::info!(path = name, "on-demand source stopped (idle)");
                }
            }
        }

        if do_stream_check {
            self.last_stream_check = Instant::now();
            self.check_dead_streams();
        }
        if do_receiver_report {
            self.last_receiver_report = Instant::now();
            self.send_receiver_reports();
        }

        for name in &path_names {
            self.paths.remove_if_destroyable(name);
        }
    }

    /// Every 5s, compares `now - udp_last_frame_time` against the
    /// configured read timeout for each UDP RECORD session and tears down
    /// any stream that's gone quiet.
    fn check_dead_streams(&mut self) {
        let read_timeout = self.config.server.read_timeout;
        let dead: Vec<u64> = self
            .sessions
            .ids_in_record_state()
            .into_iter()
            .filter(|id| {
                self.sessions
                    .get(*id)
                    .map(|s| {
                        s.tracks_snapshot()
                            .iter()
                            .any(|(_, slot)| slot.udp_last_frame_time.read().elapsed() >= read_timeout)
                    })
                    .unwrap_or(false)
            })
            .collect();

        for session_id in dead {
            tracing::warn!(session_id, "stream dead: no frame within read_timeout");
            self.handle_disconnect(session_id);
        }
    }

    /// Every 10s, emit one Receiver Report per inbound
    /// track back to the publisher (interleaved RTCP, or the RTCP UDP port).
    fn send_receiver_reports(&mut self) {
        for session_id in self.sessions.ids_in_record_state() {
            let Some(session) = self.sessions.get(session_id) else {
                continue;
            };
            for (track_id, slot) in session.tracks_snapshot() {
                let report = slot.rtcp.read().report();
                match &slot.transport {
                    TrackTransport::Udp { client_rtcp_port, .. } => {
                        let addr = SocketAddr::new(session.peer_addr.ip(), *client_rtcp_port);
                        let _ = self.rtcp_tx.send((addr, report));
                    }
                    TrackTransport::Tcp { rtcp_channel, .. } => {
                        if let Some(tx) = session.frame_tx.read().as_ref() {
                            let mut framed = Vec::with_capacity(4 + report.len());
                            framed.push(b'$');
                            framed.push(*rtcp_channel);
                            framed.extend_from_slice(&(report.len() as u16).to_be_bytes());
                            framed.extend_from_slice(&report);
                            let _ = tx.send(framed);
                        }
                    }
                }
                let _ = track_id;
            }
        }
    }

    // ---- authentication -----------------------------------------------------

    fn authorize(
        &self,
        acl: &crate::config::AccessControl,
        session: &Session,
        method: &str,
        uri: &str,
        auth_header: Option<&str>,
    ) -> AuthDecision {
        if !acl.allows(session.peer_addr.ip()) {
            return self.deny(session, "IP not in allow-list".to_string());
        }
        if acl.user.is_none() && acl.pass.is_none() {
            session.reset_auth_failures();
            return AuthDecision::Allowed;
        }

        let ok = match auth_header.and_then(Credentials::parse) {
            Some(Credentials::Basic { user, pass }) => auth::check_basic(acl, &user, &pass),
            Some(Credentials::Digest { response_fields }) => {
                auth::check_digest(acl, method, uri, &self.nonce, &response_fields)
            }
            None => false,
        };

        if ok {
            session.reset_auth_failures();
            AuthDecision::Allowed
        } else {
            self.deny(session, "credentials rejected".to_string())
        }
    }

    fn deny(&self, session: &Session, _reason: String) -> AuthDecision {
        let fatal = session.record_auth_failure();
        let challenge = format!(
            "Digest realm=\"{}\", nonce=\"{}\", Basic realm=\"{}\"",
            auth::realm(),
            self.nonce,
            auth::realm()
        );
        AuthDecision::Denied {
            www_authenticate: challenge,
            fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathConfig, ServerConfig, SourceKind, SourceProtocol};
    use std::sync::mpsc::channel;

    fn test_config() -> Config {
        Config {
            server: ServerConfig::default(),
            paths: vec![PathConfig {
                name: "cam1".to_string(),
                source: SourceKind::Publisher,
                source_protocol: SourceProtocol::Udp,
                ..Default::default()
            }],
        }
    }

    fn spawn_test() -> (DispatchHandle, SessionManager) {
        let sessions = SessionManager::new();
        let (rtp_tx, _rtp_rx) = channel();
        let (rtcp_tx, _rtcp_rx) = channel();
        let (handle, _join) = Dispatcher::spawn(test_config(), sessions.clone(), rtp_tx, rtcp_tx);
        (handle, sessions)
    }

    fn connect(handle: &DispatchHandle, sessions: &SessionManager) -> Arc<Session> {
        let (tx, rx) = channel();
        handle
            .send(DispatchEvent::Connect {
                peer_addr: "127.0.0.1:5000".parse().unwrap(),
                reply: tx,
            })
            .unwrap();
        let session = rx.recv().unwrap();
        assert!(sessions.get(session.id).is_some());
        session
    }

    #[test]
    fn describe_without_publisher_returns_not_found() {
        let (handle, sessions) = spawn_test();
        let session = connect(&handle, &sessions);
        let (tx, rx) = channel();
        handle
            .send(DispatchEvent::Describe {
                session_id: session.id,
                path_name: "cam1".to_string(),
                method: "DESCRIBE".to_string(),
                uri: "rtsp://x/cam1".to_string(),
                auth_header: None,
                reply: tx,
            })
            .unwrap();
        let outcome = rx.recv().unwrap().unwrap();
        assert!(matches!(outcome, DescribeOutcome::NotFound));
    }

    #[test]
    fn announce_then_record_makes_path_ready() {
        let (handle, sessions) = spawn_test();
        let publisher = connect(&handle, &sessions);

        let (tx, rx) = channel();
        handle
            .send(DispatchEvent::Announce {
                session_id: publisher.id,
                path_name: "cam1".to_string(),
                sdp: "v=0\r\nm=video 0 RTP/AVP 96\r\n".to_string(),
                uri: "rtsp://x/cam1".to_string(),
                auth_header: None,
                reply: tx,
            })
            .unwrap();
        rx.recv().unwrap().unwrap();

        publisher
            .setup_track(
                0,
                TrackTransport::Tcp {
                    rtp_channel: 0,
                    rtcp_channel: 1,
                },
            )
            .unwrap();

        handle
            .send(DispatchEvent::ConfirmRecord {
                session_id: publisher.id,
                path_name: "cam1".to_string(),
            })
            .unwrap();

        // Give the dispatcher thread a moment to process (test-only: real
        // callers never need to wait, since they go through the channel).
        std::thread::sleep(Duration::from_millis(50));

        let (tx2, rx2) = channel();
        let reader = connect(&handle, &sessions);
        handle
            .send(DispatchEvent::Describe {
                session_id: reader.id,
                path_name: "cam1".to_string(),
                method: "DESCRIBE".to_string(),
                uri: "rtsp://x/cam1".to_string(),
                auth_header: None,
                reply: tx2,
            })
            .unwrap();
        let outcome = rx2.recv().unwrap().unwrap();
        assert!(matches!(outcome, DescribeOutcome::Ready { .. }));
    }

    #[test]
    fn auth_failure_past_threshold_is_fatal() {
        let mut config = test_config();
        config.paths[0].read.user = Some("alice".to_string());
        config.paths[0].read.pass = Some("secret".to_string());
        let sessions = SessionManager::new();
        let (rtp_tx, _r1) = channel();
        let (rtcp_tx, _r2) = channel();
        let (handle, _join) = Dispatcher::spawn(config, sessions.clone(), rtp_tx, rtcp_tx);
        let session = connect(&handle, &sessions);

        for _ in 0..4 {
            let (tx, rx) = channel();
            handle
                .send(DispatchEvent::Describe {
                    session_id: session.id,
                    path_name: "cam1".to_string(),
                    method: "DESCRIBE".to_string(),
                    uri: "rtsp://x/cam1".to_string(),
                    auth_header: None,
                    reply: tx,
                })
                .unwrap();
            let _ = rx.recv().unwrap();
        }

        std::thread::sleep(Duration::from_millis(50));
        assert!(sessions.get(session.id).is_none());
    }
}
