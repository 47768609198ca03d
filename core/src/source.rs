//! Upstream RTSP source client: pulls media from another RTSP server so
//! a path can relay it to local readers.
//!
//! This is itself an RTSP client, not a server: it reuses the same
//! "OS thread + `std::net` socket" shape as [`crate::transport::tcp`]/
//! [`crate::transport::udp`], and the wire helpers already built for the
//! server side (`protocol::request`, `protocol::response`, `protocol::sdp`,
//! `session::transport`).
//!
//! Two-level task:
//! - **Outer** ([`spawn`]/[`SourceHandle`]): owns the requested run state.
//!   The dispatcher holds the handle and calls [`SourceHandle::stop`] on
//!   path destruction or shutdown.
//! - **Inner** ([`run_once`]): connects, OPTIONS/DESCRIBE/SETUP(s)/PLAY,
//!   then forwards frames until the connection breaks, retrying forever
//!   (every `SOURCE_RETRY`) until the outer handle is stopped.
//!
//! RTMP pulling is an open question (see `/DESIGN.md`): only the RTSP
//! variant is implemented here; [`Source`] is the seam a future RTMP
//! puller would implement without touching the dispatcher.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use crate::config::{self, SourceProtocol};
use crate::dispatcher::{DispatchEvent, DispatchHandle};
use crate::error::{Result, RtspError};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::publishers::StreamType;
use crate::rtcp::RtcpReceiver;

/// A source the dispatcher can start/stop on behalf of a path. The RTSP
/// puller below is the only implementation; an RTMP puller would
/// implement the same seam.
pub trait Source: Send {
    fn stop(self: Box<Self>);
}

impl Source for SourceHandle {
    fn stop(self: Box<Self>) {
        SourceHandle::stop(*self)
    }
}

/// Outer-task handle the dispatcher owns per running source.
pub struct SourceHandle {
    stop_tx: Sender<()>,
    join: thread::JoinHandle<()>,
}

impl SourceHandle {
    /// Signal the outer task to stop and join it. Closes whatever
    /// connection is in flight to unblock any read in progress.
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.join.join();
    }

    pub fn stop_sender(&self) -> Sender<()> {
        self.stop_tx.clone()
    }

    /// Split into the pieces a caller hands off to the dispatcher, which
    /// then owns stopping and joining the outer task itself rather than
    /// this handle detaching it.
    pub fn into_parts(self) -> (Sender<()>, thread::JoinHandle<()>) {
        (self.stop_tx, self.join)
    }
}

/// Spawn the outer task for one path's upstream source.
pub fn spawn(
    path_name: String,
    url: String,
    source_protocol: SourceProtocol,
    dispatch: DispatchHandle,
    read_timeout: Duration,
) -> SourceHandle {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let running = Arc::new(AtomicBool::new(true));
    let watcher_running = running.clone();
    thread::spawn(move || {
        // Blocks until the dispatcher signals stop; then flips the shared
        // flag every inner loop polls between reads.
        let _ = stop_rx.recv();
        watcher_running.store(false, Ordering::SeqCst);
    });

    let join = thread::spawn(move || {
        outer_loop(path_name, url, source_protocol, dispatch, read_timeout, running)
    });

    SourceHandle { stop_tx, join }
}

fn outer_loop(
    path_name: String,
    url: String,
    source_protocol: SourceProtocol,
    dispatch: DispatchHandle,
    read_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match run_once(&path_name, &url, source_protocol, &dispatch, read_timeout, &running) {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(path = %path_name, error = %e, "source connection failed");
            }
        }
        let _ = dispatch.send(DispatchEvent::SourceNotReady {
            path_name: path_name.clone(),
        });

        // Waits out the retry backoff in 100ms slices so a stop signal
        // doesn't have to wait out the whole backoff.
        let mut waited = Duration::ZERO;
        while waited < config::timeouts::SOURCE_RETRY && running.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            waited += Duration::from_millis(100);
        }
    }
    tracing::debug!(path = %path_name, "source outer task stopped");
}

/// One full connect → negotiate → stream lifecycle. Returns once the
/// connection breaks (error) or the outer task is told to stop (Ok).
fn run_once(
    path_name: &str,
    url: &str,
    source_protocol: SourceProtocol,
    dispatch: &DispatchHandle,
    read_timeout: Duration,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    let (host, port, request_uri) = parse_rtsp_url(url)?;
    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(RtspError::Io)?
        .next()
        .ok_or_else(|| RtspError::Source(format!("cannot resolve {host}")))?;

    let mut stream = TcpStream::connect_timeout(&addr, read_timeout).map_err(RtspError::Io)?;
    stream.set_read_timeout(Some(read_timeout)).map_err(RtspError::Io)?;
    stream.set_nodelay(true).ok();

    let mut cseq = 1u32;
    send_request(&mut stream, "OPTIONS", &request_uri, cseq, &[], None)?;
    expect_ok(&mut stream)?;

    cseq += 1;
    let describe_resp = send_request(&mut stream, "DESCRIBE", &request_uri, cseq, &[("Accept", "application/sdp")], None)?;
    let resp = read_response(&mut stream, &describe_resp)?;
    if resp.status_code != 200 {
        return Err(RtspError::Source(format!("DESCRIBE failed: {}", resp.status_code)));
    }
    let upstream_sdp = resp.body.clone().unwrap_or_default();
    let tracks = sdp::parse_tracks(&upstream_sdp);
    if tracks.is_empty() {
        return Err(RtspError::Source("upstream SDP has no media sections".to_string()));
    }

    let mut udp_sockets: Vec<(UdpSocket, UdpSocket, SocketAddr)> = Vec::new();

    for (i, _track) in tracks.iter().enumerate() {
        cseq += 1;
        let transport = match source_protocol {
            SourceProtocol::Udp => {
                let (rtp_socket, rtcp_socket, rtp_port, rtcp_port) = bind_track_ports()?;
                let header = format!("RTP/AVP;unicast;client_port={rtp_port}-{rtcp_port}");
                udp_sockets.push((rtp_socket, rtcp_socket, addr));
                header
            }
            SourceProtocol::Tcp => {
                format!("RTP/AVP/TCP;unicast;interleaved={}-{}", 2 * i, 2 * i + 1)
            }
        };
        let track_uri = format!("{}/trackID={}", request_uri.trim_end_matches('/'), i);
        let raw = send_request(&mut stream, "SETUP", &track_uri, cseq, &[("Transport", &transport)], None)?;
        let resp = read_response(&mut stream, &raw)?;
        if resp.status_code != 200 {
            return Err(RtspError::Source(format!("SETUP trackID={i} failed: {}", resp.status_code)));
        }
        if let (SourceProtocol::Udp, Some(server_transport)) = (source_protocol, resp.get_header("Transport")) {
            if let Some((server_rtp_port, server_rtcp_port)) = parse_server_ports(server_transport) {
                if let Some((rtp_socket, rtcp_socket, dest)) = udp_sockets.last_mut() {
                    let rtp_dest = SocketAddr::new(addr.ip(), server_rtp_port);
                    let rtcp_dest = SocketAddr::new(addr.ip(), server_rtcp_port);
                    rtp_socket.connect(rtp_dest).map_err(RtspError::Io)?;
                    rtcp_socket.connect(rtcp_dest).map_err(RtspError::Io)?;
                    *dest = rtp_dest;
                }
            }
        }
    }

    cseq += 1;
    let raw = send_request(&mut stream, "PLAY", &request_uri, cseq, &[("Range", "npt=0.000-")], None)?;
    let resp = read_response(&mut stream, &raw)?;
    if resp.status_code != 200 {
        return Err(RtspError::Source(format!("PLAY failed: {}", resp.status_code)));
    }

    let track_count = tracks.len() as u32;
    let server_sdp = sdp::transform_for_describe(&upstream_sdp, "Stream", "-", "0", 0, "127.0.0.1");
    dispatch
        .send(DispatchEvent::SourceReady {
            path_name: path_name.to_string(),
            sdp: server_sdp,
            track_count,
        })
        .map_err(|_| RtspError::ChannelClosed("dispatcher"))?;
    tracing::info!(path = %path_name, track_count, ?source_protocol, "source ready");

    match source_protocol {
        SourceProtocol::Udp => stream_udp(path_name, stream, udp_sockets, dispatch, read_timeout, running),
        SourceProtocol::Tcp => stream_tcp(path_name, stream, track_count, dispatch, read_timeout, running),
    }
}

/// UDP transport body: per-track RTP/RTCP read loops plus keepalive
/// OPTIONS, stream-dead check, and receiver-report ticker.
fn stream_udp(
    path_name: &str,
    mut control: TcpStream,
    udp_sockets: Vec<(UdpSocket, UdpSocket, SocketAddr)>,
    dispatch: &DispatchHandle,
    read_timeout: Duration,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    for (rtp_socket, rtcp_socket, _) in &udp_sockets {
        rtp_socket.set_read_timeout(Some(Duration::from_millis(200))).ok();
        rtcp_socket.set_read_timeout(Some(Duration::from_millis(200))).ok();
    }

    let receivers: Vec<Arc<parking_lot::RwLock<RtcpReceiver>>> = (0..udp_sockets.len())
        .map(|_| Arc::new(parking_lot::RwLock::new(RtcpReceiver::new())))
        .collect();

    let mut handles = Vec::new();
    let mut report_sockets = Vec::new();
    for (track_id, (rtp_socket, rtcp_socket, dest)) in udp_sockets.into_iter().enumerate() {
        report_sockets.push(rtcp_socket.try_clone().map_err(RtspError::Io)?);

        let rtp_running = running.clone();
        let rtp_dispatch = dispatch.clone();
        let path = path_name.to_string();
        let rtp_receiver = receivers[track_id].clone();
        handles.push(thread::spawn(move || {
            udp_track_reader(
                rtp_socket,
                path,
                track_id as u32,
                StreamType::Rtp,
                rtp_dispatch,
                rtp_receiver,
                rtp_running,
            )
        }));

        let rtcp_running = running.clone();
        let rtcp_dispatch = dispatch.clone();
        let path = path_name.to_string();
        let rtcp_receiver = receivers[track_id].clone();
        handles.push(thread::spawn(move || {
            udp_track_reader(
                rtcp_socket,
                path,
                track_id as u32,
                StreamType::Rtcp,
                rtcp_dispatch,
                rtcp_receiver,
                rtcp_running,
            )
        }));
        let _ = dest;
    }

    let mut cseq = 100u32;
    let mut last_keepalive = std::time::Instant::now();
    let mut last_report = std::time::Instant::now();
    let mut last_check = std::time::Instant::now();
    control.set_read_timeout(Some(Duration::from_millis(500))).ok();

    let result = loop {
        if !running.load(Ordering::SeqCst) {
            break Ok(());
        }
        if last_keepalive.elapsed() >= config::timeouts::KEEPALIVE {
            cseq += 1;
            if send_request(&mut control, "OPTIONS", "*", cseq, &[], None).is_err() {
                break Err(RtspError::Source("keepalive write failed".to_string()));
            }
            last_keepalive = std::time::Instant::now();
        }
        if last_check.elapsed() >= config::timeouts::STREAM_CHECK {
            last_check = std::time::Instant::now();
            if receivers.iter().all(|r| !r.read().is_alive(read_timeout)) {
                break Err(RtspError::StreamDead(path_name.to_string()));
            }
        }
        if last_report.elapsed() >= config::timeouts::RECEIVER_REPORT {
            last_report = std::time::Instant::now();
            // Receiver reports for a UDP-pulled source go back on each
            // track's own RTCP socket, not via `dispatch`.
            for (track_id, socket) in report_sockets.iter().enumerate() {
                let rr = receivers[track_id].read().report();
                let _ = socket.send(&rr);
            }
        }
        thread::sleep(Duration::from_millis(200));
    };

    for h in handles {
        let _ = h.join();
    }
    result
}

fn udp_track_reader(
    socket: UdpSocket,
    path_name: String,
    track_id: u32,
    stream_type: StreamType,
    dispatch: DispatchHandle,
    receiver: Arc<parking_lot::RwLock<RtcpReceiver>>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 65_536];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(n) => {
                let data = buf[..n].to_vec();
                match stream_type {
                    StreamType::Rtp => receiver.write().on_rtp(&data),
                    StreamType::Rtcp => receiver.write().on_rtcp(&data),
                }
                let _ = dispatch.send(DispatchEvent::SourceFrame {
                    path_name: path_name.clone(),
                    track_id,
                    stream_type,
                    data,
                });
            }
            Err(ref e)
                if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(_) => break,
        }
    }
}

/// TCP interleaved transport body: a single read loop off
/// the control connection, demultiplexing `$`-framed RTP/RTCP.
fn stream_tcp(
    path_name: &str,
    control: TcpStream,
    track_count: u32,
    dispatch: &DispatchHandle,
    read_timeout: Duration,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    control.set_read_timeout(Some(Duration::from_millis(500))).map_err(RtspError::Io)?;
    let mut writer = control.try_clone().map_err(RtspError::Io)?;
    let mut reader = BufReader::new(control);
    let receivers: Vec<parking_lot::RwLock<RtcpReceiver>> =
        (0..track_count).map(|_| parking_lot::RwLock::new(RtcpReceiver::new())).collect();
    let mut last_check = std::time::Instant::now();
    let mut last_report = std::time::Instant::now();

    while running.load(Ordering::SeqCst) {
        let mut marker = [0u8; 1];
        match reader.read_exact(&mut marker) {
            Ok(()) => {}
            Err(ref e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                if last_check.elapsed() >= config::timeouts::STREAM_CHECK {
                    last_check = std::time::Instant::now();
                    if receivers.iter().all(|r| !r.read().is_alive(read_timeout)) {
                        return Err(RtspError::StreamDead(path_name.to_string()));
                    }
                }
                if last_report.elapsed() >= config::timeouts::RECEIVER_REPORT {
                    last_report = std::time::Instant::now();
                    for (track_id, rx) in receivers.iter().enumerate() {
                        let rr = rx.read().report();
                        let channel = 2 * track_id as u8 + 1;
                        let mut framed = Vec::with_capacity(4 + rr.len());
                        framed.push(b'$');
                        framed.push(channel);
                        framed.extend_from_slice(&(rr.len() as u16).to_be_bytes());
                        framed.extend_from_slice(&rr);
                        if writer.write_all(&framed).is_err() {
                            return Err(RtspError::Source("receiver report write failed".to_string()));
                        }
                    }
                }
                continue;
            }
            Err(e) => return Err(RtspError::Io(e)),
        }
        if marker[0] != b'$' {
            continue; // stray RTSP traffic (e.g. an unsolicited reply); ignore
        }
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).map_err(RtspError::Io)?;
        let channel = header[0];
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).map_err(RtspError::Io)?;

        let track_id = (channel / 2) as u32;
        let stream_type = if channel % 2 == 0 { StreamType::Rtp } else { StreamType::Rtcp };
        if let Some(rx) = receivers.get(track_id as usize) {
            match stream_type {
                StreamType::Rtp => rx.write().on_rtp(&payload),
                StreamType::Rtcp => rx.write().on_rtcp(&payload),
            }
        }
        let _ = dispatch.send(DispatchEvent::SourceFrame {
            path_name: path_name.to_string(),
            track_id,
            stream_type,
            data: payload,
        });
    }
    Ok(())
}

// ---- wire helpers -----------------------------------------------------

fn send_request(
    stream: &mut TcpStream,
    method: &str,
    uri: &str,
    cseq: u32,
    extra_headers: &[(&str, &str)],
    body: Option<&str>,
) -> Result<String> {
    let mut request = format!("{method} {uri} RTSP/1.0\r\nCSeq: {cseq}\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(body) = body {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    if let Some(body) = body {
        request.push_str(body);
    }
    stream.write_all(request.as_bytes()).map_err(RtspError::Io)?;
    Ok(request)
}

/// Read one status line + header block off `stream`, then its body if
/// `Content-Length` names one.
fn read_response(stream: &mut TcpStream, _sent: &str) -> Result<RtspResponse> {
    let mut reader = BufReader::new(stream.try_clone().map_err(RtspError::Io)?);
    let mut raw = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(RtspError::Io)?;
        if n == 0 {
            return Err(RtspError::Source("connection closed mid-response".to_string()));
        }
        raw.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    let mut resp = RtspResponse::parse(&raw)?;
    let len = resp.content_length();
    if len > 0 {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).map_err(RtspError::Io)?;
        resp = resp.with_body(String::from_utf8_lossy(&body).into_owned());
    }
    Ok(resp)
}

/// OPTIONS/keepalive replies are discarded; only the status line matters.
fn expect_ok(stream: &mut TcpStream) -> Result<()> {
    let resp = read_response(stream, "")?;
    if resp.status_code != 200 {
        return Err(RtspError::Source(format!("OPTIONS rejected: {}", resp.status_code)));
    }
    Ok(())
}

/// `rtsp://host[:port]/path` -> (host, port, `/path` request URI passed
/// back through verbatim to the origin).
fn parse_rtsp_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("rtsp://")
        .ok_or_else(|| RtspError::Source(format!("not an rtsp:// URL: {url}")))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(554)),
        None => (authority.to_string(), 554),
    };
    let _ = path;
    Ok((host, port, url.trim_end_matches('/').to_string()))
}

/// Extract `server_port=A-B`'s rtp/rtcp pair from a SETUP response's
/// Transport header.
fn parse_server_ports(transport_header: &str) -> Option<(u16, u16)> {
    for part in transport_header.split(';') {
        if let Some(ports) = part.trim().strip_prefix("server_port=") {
            let mut it = ports.split('-');
            let rtp = it.next()?.parse().ok()?;
            let rtcp = it.next()?.parse().ok()?;
            return Some((rtp, rtcp));
        }
    }
    None
}

/// Bind a fresh (rtp even, rtcp odd) consecutive port pair in [10000,
/// 65535], retrying on bind failure.
fn bind_track_ports() -> Result<(UdpSocket, UdpSocket, u16, u16)> {
    for rtp_port in (10000..65534).step_by(2) {
        let rtp_addr: SocketAddr = format!("0.0.0.0:{rtp_port}").parse().unwrap();
        let rtcp_addr: SocketAddr = format!("0.0.0.0:{}", rtp_port + 1).parse().unwrap();
        if let (Ok(rtp_socket), Ok(rtcp_socket)) = (UdpSocket::bind(rtp_addr), UdpSocket::bind(rtcp_addr)) {
            return Ok((rtp_socket, rtcp_socket, rtp_port, rtp_port + 1));
        }
    }
    Err(RtspError::PortRangeExhausted)
}
