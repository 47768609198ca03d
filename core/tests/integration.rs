//! Integration tests: drive the dispatcher, TCP listener, and connection
//! handling together over real sockets, the way the teacher's own
//! `crates/core/tests/integration.rs` drives a full OPTIONS -> DESCRIBE ->
//! SETUP -> PLAY handshake against a live `TcpListener`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rtsp_relay::config::{AccessControl, Config, PathConfig, ServerConfig, SourceKind, SourceProtocol};
use rtsp_relay::dispatcher::Dispatcher;
use rtsp_relay::publishers::StreamType;
use rtsp_relay::session::SessionManager;
use rtsp_relay::transport::tcp;
use rtsp_relay::transport::udp::UdpEndpoint;

fn read_response(reader: &mut BufReader<TcpStream>) -> String {
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if len > 0 {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).unwrap();
            response.push_str(&String::from_utf8_lossy(&body));
        }
    }
    response
}

fn send_request(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>, request: &str) -> String {
    stream.write_all(request.as_bytes()).unwrap();
    stream.flush().unwrap();
    read_response(reader)
}

/// Spin up a dispatcher and TCP accept loop on `bind` with a single literal
/// path. UDP endpoints are not bound: nothing in these tests exercises UDP
/// transport, and the dispatcher only ever touches `rtp_tx`/`rtcp_tx` when a
/// reader or publisher actually negotiated UDP.
fn spawn_test_server(bind: &str, path: PathConfig) -> SocketAddr {
    let config = Config {
        server: ServerConfig::default(),
        paths: vec![path],
    };

    let listener = TcpListener::bind(bind).unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let sessions = SessionManager::new();
    let (rtp_tx, _rtp_rx) = mpsc::channel();
    let (rtcp_tx, _rtcp_rx) = mpsc::channel();
    let (dispatch, _join) = Dispatcher::spawn(config.clone(), sessions, rtp_tx, rtcp_tx);

    let running = Arc::new(AtomicBool::new(true));
    let cfg = Arc::new(config);
    thread::spawn(move || tcp::accept_loop(listener, dispatch, cfg, running));

    // Give the accept loop's non-blocking poll a moment to come up.
    thread::sleep(Duration::from_millis(20));
    addr
}

fn connect(addr: SocketAddr) -> (TcpStream, BufReader<TcpStream>) {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.set_write_timeout(Some(Duration::from_secs(2))).unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (stream, reader)
}

/// Same as [`spawn_test_server`] but also binds the server's two fixed UDP
/// ports, for scenarios that actually exchange RTP/RTCP datagrams.
fn spawn_test_server_with_udp(rtsp_bind: &str, rtp_port: u16, path: PathConfig) -> SocketAddr {
    let mut server = ServerConfig::default();
    server.rtp_port = rtp_port;
    server.rtcp_port = rtp_port + 1;
    let config = Config {
        server,
        paths: vec![path],
    };

    let listener = TcpListener::bind(rtsp_bind).unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let sessions = SessionManager::new();
    let (rtp_tx, rtp_rx) = mpsc::channel();
    let (rtcp_tx, rtcp_rx) = mpsc::channel();
    let (dispatch, _join) = Dispatcher::spawn(config.clone(), sessions, rtp_tx, rtcp_tx);

    let running = Arc::new(AtomicBool::new(true));
    let write_timeout = Duration::from_secs(2);
    let rtp_bind_addr: SocketAddr = format!("127.0.0.1:{rtp_port}").parse().unwrap();
    let rtcp_bind_addr: SocketAddr = format!("127.0.0.1:{}", rtp_port + 1).parse().unwrap();
    UdpEndpoint::spawn(rtp_bind_addr, StreamType::Rtp, dispatch.clone(), rtp_rx, write_timeout, running.clone())
        .expect("bind RTP endpoint");
    UdpEndpoint::spawn(rtcp_bind_addr, StreamType::Rtcp, dispatch.clone(), rtcp_rx, write_timeout, running.clone())
        .expect("bind RTCP endpoint");

    let cfg = Arc::new(config);
    thread::spawn(move || tcp::accept_loop(listener, dispatch, cfg, running));

    thread::sleep(Duration::from_millis(20));
    addr
}

#[test]
fn tcp_publish_and_tcp_read_relays_interleaved_frames() {
    let path = PathConfig {
        name: "teststream".to_string(),
        source: SourceKind::Publisher,
        source_protocol: SourceProtocol::Udp,
        ..Default::default()
    };
    let addr = spawn_test_server("127.0.0.1:0", path);

    let (mut publisher, mut publisher_reader) = connect(addr);

    let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Stream\r\nt=0 0\r\n\
               m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
    let announce = format!(
        "ANNOUNCE rtsp://{addr}/teststream RTSP/1.0\r\nCSeq: 1\r\n\
         Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
        sdp.len(),
        sdp
    );
    let resp = send_request(&mut publisher, &mut publisher_reader, &announce);
    assert!(resp.starts_with("RTSP/1.0 200"), "ANNOUNCE failed: {resp}");

    let setup = format!(
        "SETUP rtsp://{addr}/teststream/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
         Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
    );
    let resp = send_request(&mut publisher, &mut publisher_reader, &setup);
    assert!(resp.starts_with("RTSP/1.0 200"), "publisher SETUP failed: {resp}");

    let record = format!("RECORD rtsp://{addr}/teststream RTSP/1.0\r\nCSeq: 3\r\n\r\n");
    let resp = send_request(&mut publisher, &mut publisher_reader, &record);
    assert!(resp.starts_with("RTSP/1.0 200"), "RECORD failed: {resp}");

    let (mut reader, mut reader_reader) = connect(addr);

    let describe = format!(
        "DESCRIBE rtsp://{addr}/teststream RTSP/1.0\r\nCSeq: 1\r\nAccept: application/sdp\r\n\r\n"
    );
    let resp = send_request(&mut reader, &mut reader_reader, &describe);
    assert!(resp.starts_with("RTSP/1.0 200"), "DESCRIBE failed: {resp}");
    assert!(resp.contains("a=rtpmap:96 H264/90000"), "DESCRIBE SDP missing rtpmap: {resp}");
    assert!(resp.contains("a=control:trackID=0"), "DESCRIBE SDP missing control line: {resp}");

    let setup = format!(
        "SETUP rtsp://{addr}/teststream/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
         Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
    );
    let resp = send_request(&mut reader, &mut reader_reader, &setup);
    assert!(resp.starts_with("RTSP/1.0 200"), "reader SETUP failed: {resp}");

    let play = format!("PLAY rtsp://{addr}/teststream RTSP/1.0\r\nCSeq: 3\r\n\r\n");
    let resp = send_request(&mut reader, &mut reader_reader, &play);
    assert!(resp.starts_with("RTSP/1.0 200"), "PLAY failed: {resp}");

    // The dispatcher only installs the reader into the fan-out after this
    // 200 OK is already on the wire (spec's ordering guarantee); give it a
    // moment to process that before the publisher's frame is sent.
    thread::sleep(Duration::from_millis(100));

    let mut rtp_payload = vec![0x80, 0x60, 0x00, 0x01];
    rtp_payload.extend_from_slice(&[0xAB; 100]);
    let mut framed = vec![b'$', 0u8];
    framed.extend_from_slice(&(rtp_payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(&rtp_payload);
    publisher.write_all(&framed).unwrap();

    let mut marker = [0u8; 1];
    reader_reader.read_exact(&mut marker).expect("reader should receive an interleaved frame");
    assert_eq!(marker[0], b'$');
    let mut header = [0u8; 3];
    reader_reader.read_exact(&mut header).unwrap();
    assert_eq!(header[0], 0, "expected channel 0 (RTP of track 0)");
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut payload = vec![0u8; len];
    reader_reader.read_exact(&mut payload).unwrap();
    assert_eq!(payload, rtp_payload, "reader must observe the exact publisher bytes");
}

#[test]
fn udp_publish_and_udp_read_relays_exact_datagram() {
    use std::net::UdpSocket;

    let path = PathConfig {
        name: "teststream".to_string(),
        source: SourceKind::Publisher,
        source_protocol: SourceProtocol::Udp,
        ..Default::default()
    };
    // Fixed, well-known-ish test ports: the server's rtpPort/rtcpPort pair
    // plus the publisher's and reader's own client port pairs.
    let addr = spawn_test_server_with_udp("127.0.0.1:0", 38000, path);

    let publisher_rtp = UdpSocket::bind("127.0.0.1:39000").unwrap();
    let _publisher_rtcp = UdpSocket::bind("127.0.0.1:39001").unwrap();
    let reader_rtp = UdpSocket::bind("127.0.0.1:39100").unwrap();
    reader_rtp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let _reader_rtcp = UdpSocket::bind("127.0.0.1:39101").unwrap();

    let (mut publisher, mut publisher_reader) = connect(addr);
    let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Stream\r\nt=0 0\r\n\
               m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
    let announce = format!(
        "ANNOUNCE rtsp://{addr}/teststream RTSP/1.0\r\nCSeq: 1\r\n\
         Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
        sdp.len(),
        sdp
    );
    let resp = send_request(&mut publisher, &mut publisher_reader, &announce);
    assert!(resp.starts_with("RTSP/1.0 200"), "ANNOUNCE failed: {resp}");

    let setup = format!(
        "SETUP rtsp://{addr}/teststream/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
         Transport: RTP/AVP;unicast;client_port=39000-39001\r\n\r\n"
    );
    let resp = send_request(&mut publisher, &mut publisher_reader, &setup);
    assert!(resp.starts_with("RTSP/1.0 200"), "publisher SETUP failed: {resp}");

    let record = format!("RECORD rtsp://{addr}/teststream RTSP/1.0\r\nCSeq: 3\r\n\r\n");
    let resp = send_request(&mut publisher, &mut publisher_reader, &record);
    assert!(resp.starts_with("RTSP/1.0 200"), "RECORD failed: {resp}");

    let (mut reader, mut reader_reader) = connect(addr);
    let describe = format!("DESCRIBE rtsp://{addr}/teststream RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    let resp = send_request(&mut reader, &mut reader_reader, &describe);
    assert!(resp.starts_with("RTSP/1.0 200"), "DESCRIBE failed: {resp}");

    let setup = format!(
        "SETUP rtsp://{addr}/teststream/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
         Transport: RTP/AVP;unicast;client_port=39100-39101\r\n\r\n"
    );
    let resp = send_request(&mut reader, &mut reader_reader, &setup);
    assert!(resp.starts_with("RTSP/1.0 200"), "reader SETUP failed: {resp}");

    let play = format!("PLAY rtsp://{addr}/teststream RTSP/1.0\r\nCSeq: 3\r\n\r\n");
    let resp = send_request(&mut reader, &mut reader_reader, &play);
    assert!(resp.starts_with("RTSP/1.0 200"), "PLAY failed: {resp}");

    thread::sleep(Duration::from_millis(100));

    let mut rtp_packet = vec![0x80, 0x60, 0x00, 0x01];
    rtp_packet.extend_from_slice(&[0xCD; 188]);
    let server_rtp_addr: SocketAddr = format!("{}:38000", addr.ip()).parse().unwrap();
    publisher_rtp.send_to(&rtp_packet, server_rtp_addr).unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = reader_rtp
        .recv_from(&mut buf)
        .expect("reader should receive the forwarded RTP datagram within the read timeout");
    assert_eq!(&buf[..n], rtp_packet.as_slice(), "reader must observe the exact publisher datagram");
}

#[test]
fn describe_with_no_publisher_returns_404_within_timeout() {
    let path = PathConfig {
        name: "later".to_string(),
        source: SourceKind::Publisher,
        source_protocol: SourceProtocol::Udp,
        ..Default::default()
    };
    let addr = spawn_test_server("127.0.0.1:0", path);

    let (mut stream, mut reader) = connect(addr);
    let describe = format!("DESCRIBE rtsp://{addr}/later RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    let resp = send_request(&mut stream, &mut reader, &describe);
    assert!(resp.starts_with("RTSP/1.0 404"), "expected 404, got: {resp}");
}

#[test]
fn wrong_basic_credentials_close_socket_on_fourth_failure() {
    let path = PathConfig {
        name: "secure".to_string(),
        source: SourceKind::Publisher,
        source_protocol: SourceProtocol::Udp,
        read: AccessControl {
            user: Some("alice".to_string()),
            pass: Some("secret".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let addr = spawn_test_server("127.0.0.1:0", path);

    let (mut stream, mut reader) = connect(addr);
    let wrong_auth = format!(
        "Basic {}",
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"alice:wrong")
    );

    for n in 1..=3 {
        let describe = format!(
            "DESCRIBE rtsp://{addr}/secure RTSP/1.0\r\nCSeq: {n}\r\nAuthorization: {wrong_auth}\r\n\r\n"
        );
        let resp = send_request(&mut stream, &mut reader, &describe);
        assert!(resp.starts_with("RTSP/1.0 401"), "attempt {n}: expected 401, got: {resp}");
    }

    // The 4th failure is fatal: the dispatcher tears the session down and
    // the connection thread closes the socket after writing the 401.
    let describe = format!(
        "DESCRIBE rtsp://{addr}/secure RTSP/1.0\r\nCSeq: 4\r\nAuthorization: {wrong_auth}\r\n\r\n"
    );
    stream.write_all(describe.as_bytes()).unwrap();
    stream.flush().unwrap();

    // Read the final 401, then expect EOF (0 bytes) rather than a usable
    // connection for a 5th request.
    let resp = read_response(&mut reader);
    assert!(resp.starts_with("RTSP/1.0 401"), "expected a 401 on the 4th attempt too: {resp}");

    let mut probe = [0u8; 1];
    let n = reader.read(&mut probe).unwrap_or(0);
    assert_eq!(n, 0, "socket should be closed after the 4th auth failure");
}
