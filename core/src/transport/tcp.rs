//! TCP RTSP listener and per-connection request loop.
//!
//! `Connection` demultiplexes line-oriented RTSP requests from
//! `$`-framed interleaved RTP/RTCP off the very same socket. One session
//! is created per connection on accept; the literal session id is shared
//! across all sessions on a connection since there is in practice only
//! ever one.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::dispatcher::{DispatchEvent, DispatchHandle, SetupGrant, SetupMode};
use crate::error::RtspError;
use crate::path::DescribeOutcome;
use crate::protocol::response::RtspResponse;
use crate::protocol::request::RtspRequest;
use crate::protocol::{sdp, uri};
use crate::session::transport::{TransportHeader, valid_interleaved_pair, valid_udp_pair};
use crate::session::{Session, SessionState, StreamProtocol, TrackTransport};

/// Non-blocking TCP accept loop; hands each accepted connection off to
/// the dispatcher rather than mutating any shared state directly.
pub fn accept_loop(
    listener: TcpListener,
    dispatch: DispatchHandle,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let d = dispatch.clone();
                let c = config.clone();
                let r = running.clone();
                thread::spawn(move || Connection::handle(stream, d, c, r));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own session and lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    session: Arc<Session>,
    dispatch: DispatchHandle,
    config: Arc<Config>,
    /// Shared with the dedicated writer task; also installed as
    /// `session.frame_tx` so the dispatcher's fan-out and receiver-report
    /// ticker write through the same single writer as response replies,
    /// so the two never interleave out of order.
    frame_tx: Sender<Vec<u8>>,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn handle(
        stream: TcpStream,
        dispatch: DispatchHandle,
        config: Arc<Config>,
        running: Arc<AtomicBool>,
    ) {
        let Ok(peer_addr) = stream.peer_addr() else {
            return;
        };
        tracing::info!(%peer_addr, "client connected");

        let (connect_tx, connect_rx) = mpsc::channel();
        if dispatch
            .send(DispatchEvent::Connect {
                peer_addr,
                reply: connect_tx,
            })
            .is_err()
        {
            return;
        }
        let Ok(session) = connect_rx.recv() else {
            return;
        };

        let Ok(writer_stream) = stream.try_clone() else {
            return;
        };

        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>();
        *session.frame_tx.write() = Some(frame_tx.clone());

        let writer_handle = thread::spawn(move || writer_loop(writer_stream, frame_rx));

        let mut conn = Connection {
            reader: BufReader::new(stream),
            session: session.clone(),
            dispatch: dispatch.clone(),
            config,
            frame_tx,
            peer_addr,
        };

        let reason = conn.run(&running);
        let _ = dispatch.send(DispatchEvent::Disconnected {
            session_id: session.id,
        });
        drop(conn.frame_tx);
        let _ = writer_handle.join();

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Reads either a `$`-framed interleaved chunk or a full RTSP request
    /// off the socket, dispatches it, and writes the response. Returns the
    /// reason the loop exited.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let marker = match read_byte(&mut self.reader) {
                Ok(b) => b,
                Err(_) => return "read error",
            };

            if marker == b'$' {
                let mut header = [0u8; 3];
                if self.reader.read_exact(&mut header).is_err() {
                    return "read error";
                }
                let channel = header[0];
                let len = u16::from_be_bytes([header[1], header[2]]) as usize;
                let mut payload = vec![0u8; len];
                if self.reader.read_exact(&mut payload).is_err() {
                    return "read error";
                }
                let _ = self.dispatch.send(DispatchEvent::TcpFrame {
                    session_id: self.session.id,
                    channel,
                    data: payload,
                });
                continue;
            }

            let mut request_text = String::new();
            request_text.push(marker as char);
            loop {
                let mut line = String::new();
                match self.reader.read_line(&mut line) {
                    Ok(0) => return "connection closed by client",
                    Ok(_) => {
                        request_text.push_str(&line);
                        if line == "\r\n" || line == "\n" {
                            break;
                        }
                    }
                    Err(_) => return "read error",
                }
            }

            if request_text.trim().is_empty() {
                continue;
            }

            let mut request = match RtspRequest::parse(&request_text) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    continue;
                }
            };

            if request.content_length() > 0 {
                let mut body = vec![0u8; request.content_length()];
                if self.reader.read_exact(&mut body).is_err() {
                    return "read error";
                }
                request = request.with_body(String::from_utf8_lossy(&body).into_owned());
            }

            let Some(cseq) = request.cseq().map(str::to_string) else {
                let err = RtspError::MissingCSeq;
                tracing::warn!(peer = %self.peer_addr, method = %request.method, "missing CSeq");
                self.write(RtspResponse::from_status(err.status_code()).serialize());
                return "missing CSeq";
            };

            tracing::debug!(peer = %self.peer_addr, method = %request.method, uri = %request.uri, %cseq, "request");

            let (should_close, response) = self.dispatch_request(&request, &cseq);
            if let Some(response) = response {
                self.write(response.serialize());
            }
            if should_close {
                return "session closed";
            }
        }

        "server shutting down"
    }

    fn write(&self, text: String) {
        let _ = self.frame_tx.send(text.into_bytes());
    }

    fn dispatch_request(&mut self, request: &RtspRequest, cseq: &str) -> (bool, Option<RtspResponse>) {
        match request.method.as_str() {
            "OPTIONS" => (
                false,
                Some(
                    RtspResponse::ok()
                        .with_cseq(cseq)
                        .with_session()
                        .add_header(
                            "Public",
                            "GET_PARAMETER, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, TEARDOWN",
                        ),
                ),
            ),
            "GET_PARAMETER" => (
                false,
                Some(
                    RtspResponse::ok()
                        .with_cseq(cseq)
                        .with_session()
                        .add_header("Content-Type", "text/parameters")
                        .with_body("\n".to_string()),
                ),
            ),
            "DESCRIBE" => {
                let (close, resp) = self.handle_describe(request, cseq);
                (close, Some(resp))
            }
            "ANNOUNCE" => {
                let (close, resp) = self.handle_announce(request, cseq);
                (close, Some(resp))
            }
            "SETUP" => {
                let (close, resp) = self.handle_setup(request, cseq);
                (close, Some(resp))
            }
            "PLAY" => self.handle_play(cseq),
            "RECORD" => self.handle_record(cseq),
            "PAUSE" => self.handle_pause(cseq),
            "TEARDOWN" => (true, Some(RtspResponse::ok().with_cseq(cseq))),
            other => {
                tracing::warn!(method = other, %cseq, "unsupported RTSP method");
                (false, Some(RtspResponse::new(501, "Not Implemented").with_cseq(cseq)))
            }
        }
    }

    // ---- DESCRIBE ---------------------------------------------------------

    fn handle_describe(&mut self, request: &RtspRequest, cseq: &str) -> (bool, RtspResponse) {
        let (path_name, _track) = uri::path_and_track(&request.uri);
        let auth_header = request.get_header("Authorization").map(str::to_string);

        let (tx, rx) = mpsc::channel();
        if self
            .dispatch
            .send(DispatchEvent::Describe {
                session_id: self.session.id,
                path_name: path_name.to_string(),
                method: "DESCRIBE".to_string(),
                uri: request.uri.clone(),
                auth_header,
                reply: tx,
            })
            .is_err()
        {
            return (true, RtspResponse::new(500, "Internal Server Error").with_cseq(cseq));
        }

        match rx.recv() {
            Ok(Ok(DescribeOutcome::Ready { sdp: upstream_sdp })) => {
                let version: u64 = self.config.server.sdp_session_version.parse().unwrap_or(0);
                let host = self.config.server.public_host.as_deref().unwrap_or("127.0.0.1");
                let body = sdp::transform_for_describe(
                    &upstream_sdp,
                    &self.config.server.sdp_session_name,
                    &self.config.server.sdp_username,
                    &self.config.server.sdp_session_id,
                    version,
                    host,
                );
                let content_base = format!("{}/", request.uri.trim_end_matches('/'));
                (
                    false,
                    RtspResponse::ok()
                        .with_cseq(cseq)
                        .with_session()
                        .add_header("Content-Type", "application/sdp")
                        .add_header("Content-Base", &content_base)
                        .with_body(body),
                )
            }
            Ok(Ok(DescribeOutcome::NotFound)) => (false, RtspResponse::not_found().with_cseq(cseq)),
            Ok(Ok(DescribeOutcome::Timeout)) => (false, RtspResponse::not_found().with_cseq(cseq)),
            Ok(Err(e)) => self.error_response(e, cseq),
            Err(_) => (true, RtspResponse::new(500, "Internal Server Error").with_cseq(cseq)),
        }
    }

    // ---- ANNOUNCE -----------------------------------------------------------

    fn handle_announce(&mut self, request: &RtspRequest, cseq: &str) -> (bool, RtspResponse) {
        let (path_name, _track) = uri::path_and_track(&request.uri);
        let auth_header = request.get_header("Authorization").map(str::to_string);
        let Some(body) = request.body.clone() else {
            return (true, RtspResponse::bad_request().with_cseq(cseq));
        };

        let (tx, rx) = mpsc::channel();
        if self
            .dispatch
            .send(DispatchEvent::Announce {
                session_id: self.session.id,
                path_name: path_name.to_string(),
                sdp: body,
                uri: request.uri.clone(),
                auth_header,
                reply: tx,
            })
            .is_err()
        {
            return (true, RtspResponse::new(500, "Internal Server Error").with_cseq(cseq));
        }

        match rx.recv() {
            Ok(Ok(_track_count)) => {
                self.session.set_state(SessionState::PreRecord);
                (false, RtspResponse::ok().with_cseq(cseq).with_session())
            }
            Ok(Err(e)) => self.error_response(e, cseq),
            Err(_) => (true, RtspResponse::new(500, "Internal Server Error").with_cseq(cseq)),
        }
    }

    // ---- SETUP --------------------------------------------------------------

    fn handle_setup(&mut self, request: &RtspRequest, cseq: &str) -> (bool, RtspResponse) {
        let (path_name, url_track) = uri::path_and_track(&request.uri);
        let Some(transport_header) = request.get_header("Transport") else {
            return (true, RtspResponse::bad_request().with_cseq(cseq));
        };

        let th = match TransportHeader::parse(transport_header) {
            Ok(t) => t,
            Err(e) => return self.error_response(e, cseq),
        };

        let n = self.session.track_count() as u8;
        match th.protocol {
            StreamProtocol::Udp => {
                let (Some(rtp), Some(rtcp)) = (th.client_rtp_port, th.client_rtcp_port) else {
                    return (true, RtspResponse::bad_request().with_cseq(cseq));
                };
                if !valid_udp_pair(rtp, rtcp) {
                    return (true, RtspResponse::bad_request().with_cseq(cseq));
                }
            }
            StreamProtocol::Tcp => {
                let Some((a, b)) = th.interleaved else {
                    return (true, RtspResponse::bad_request().with_cseq(cseq));
                };
                if !valid_interleaved_pair(a, b, n) {
                    return (true, RtspResponse::bad_request().with_cseq(cseq));
                }
            }
        }

        let mode = match self.session.state() {
            SessionState::Initial | SessionState::PrePlay => SetupMode::Play,
            SessionState::PreRecord => SetupMode::Record,
            SessionState::WaitDescription | SessionState::Play | SessionState::Record => {
                return (true, RtspResponse::bad_request().with_cseq(cseq));
            }
        };
        let track_id = url_track.unwrap_or(n as u32);
        let auth_header = request.get_header("Authorization").map(str::to_string);

        let (tx, rx) = mpsc::channel();
        if self
            .dispatch
            .send(DispatchEvent::Setup {
                session_id: self.session.id,
                path_name: path_name.to_string(),
                mode,
                protocol: th.protocol,
                uri: request.uri.clone(),
                auth_header,
                reply: tx,
            })
            .is_err()
        {
            return (true, RtspResponse::new(500, "Internal Server Error").with_cseq(cseq));
        }

        let grant: SetupGrant = match rx.recv() {
            Ok(Ok(g)) => g,
            Ok(Err(e)) => return self.error_response(e, cseq),
            Err(_) => return (true, RtspResponse::new(500, "Internal Server Error").with_cseq(cseq)),
        };

        let (transport, transport_header_out) = match th.protocol {
            StreamProtocol::Udp => {
                let client_rtp_port = th.client_rtp_port.expect("validated above");
                let client_rtcp_port = th.client_rtcp_port.expect("validated above");
                let transport = TrackTransport::Udp {
                    client_rtp_port,
                    client_rtcp_port,
                    server_rtp_port: grant.server_rtp_port,
                    server_rtcp_port: grant.server_rtcp_port,
                };
                let header = format!(
                    "RTP/AVP/UDP;unicast;client_port={}-{};server_port={}-{}",
                    client_rtp_port, client_rtcp_port, grant.server_rtp_port, grant.server_rtcp_port,
                );
                (transport, header)
            }
            StreamProtocol::Tcp => {
                let (a, b) = th.interleaved.expect("validated above");
                let transport = TrackTransport::Tcp {
                    rtp_channel: a,
                    rtcp_channel: b,
                };
                let header = format!("RTP/AVP/TCP;unicast;interleaved={a}-{b}");
                (transport, header)
            }
        };

        if let Err(e) = self.session.setup_track(track_id, transport) {
            return self.error_response(e, cseq);
        }

        match mode {
            SetupMode::Play => self.session.set_state(SessionState::PrePlay),
            SetupMode::Record => self.session.set_state(SessionState::PreRecord),
        }

        (
            false,
            RtspResponse::ok()
                .with_cseq(cseq)
                .with_session()
                .add_header("Transport", &transport_header_out),
        )
    }

    // ---- PLAY / RECORD -------------------------------------------------

    fn handle_play(&mut self, cseq: &str) -> (bool, Option<RtspResponse>) {
        if self.session.state() != SessionState::PrePlay {
            return (true, Some(RtspResponse::bad_request().with_cseq(cseq)));
        }
        let Some(path_name) = self.session.path() else {
            return (true, Some(RtspResponse::bad_request().with_cseq(cseq)));
        };
        let protocol = self.session.protocol().unwrap_or(StreamProtocol::Udp);

        self.write(
            RtspResponse::ok()
                .with_cseq(cseq)
                .with_session()
                .add_header("Range", "npt=0.000-")
                .serialize(),
        );

        self.session.set_state(SessionState::Play);
        let _ = self.dispatch.send(DispatchEvent::ConfirmPlay {
            session_id: self.session.id,
            path_name,
            protocol,
        });
        (false, None)
    }

    fn handle_record(&mut self, cseq: &str) -> (bool, Option<RtspResponse>) {
        if self.session.state() != SessionState::PreRecord {
            return (true, Some(RtspResponse::bad_request().with_cseq(cseq)));
        }
        let announced = *self.session.announced_track_count.read();
        if announced != Some(self.session.track_count() as u32) {
            return (true, Some(RtspResponse::bad_request().with_cseq(cseq)));
        }
        let Some(path_name) = self.session.path() else {
            return (true, Some(RtspResponse::bad_request().with_cseq(cseq)));
        };

        self.write(RtspResponse::ok().with_cseq(cseq).with_session().serialize());

        self.session.set_state(SessionState::Record);
        let _ = self.dispatch.send(DispatchEvent::ConfirmRecord {
            session_id: self.session.id,
            path_name,
        });
        (false, None)
    }

    fn handle_pause(&mut self, cseq: &str) -> (bool, Option<RtspResponse>) {
        if let Some(path_name) = self.session.path() {
            let _ = self.dispatch.send(DispatchEvent::Pause {
                session_id: self.session.id,
                path_name,
            });
        }
        self.session.set_state(SessionState::PrePlay);
        (false, Some(RtspResponse::ok().with_cseq(cseq).with_session()))
    }

    /// Map a dispatcher error to its wire response.
    fn error_response(&self, err: RtspError, cseq: &str) -> (bool, RtspResponse) {
        let fatal = err.is_fatal();
        let mut resp = RtspResponse::from_status(err.status_code()).with_cseq(cseq);
        if let RtspError::Unauthorized { ref challenge, .. } = err {
            resp = resp.add_header("WWW-Authenticate", challenge);
        }
        (fatal, resp)
    }
}

fn read_byte(reader: &mut BufReader<TcpStream>) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    reader.read_exact(&mut b)?;
    Ok(b[0])
}

/// Single dedicated writer task per connection: every outbound byte for
/// this connection — RTSP responses and `$`-framed interleaved media
/// alike — passes through here in send order.
fn writer_loop(mut stream: TcpStream, rx: std::sync::mpsc::Receiver<Vec<u8>>) {
    for bytes in rx {
        if stream.write_all(&bytes).is_err() {
            break;
        }
    }
    tracing::debug!("connection writer loop exited");
}
