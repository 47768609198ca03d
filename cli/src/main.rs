//! Process entry point: argument parsing, config assembly, and wiring the
//! dispatcher to real sockets — a `clap::Parser` struct,
//! `tracing_subscriber::fmt::init()`, start, block on stdin, stop.
//!
//! YAML/file-based config loading is out of scope for the core crate;
//! this is the minimal flag-based loader `core::config`'s doc comment
//! points to. A path is declared with `--path name[=rtsp://source-url]`:
//! with no `=...` it accepts a local publisher via ANNOUNCE, with one it
//! pulls from that upstream RTSP origin.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use clap::Parser;

use rtsp_relay::config::{Config, PathConfig, ServerConfig, SourceKind, SourceProtocol};
use rtsp_relay::dispatcher::Dispatcher;
use rtsp_relay::publishers::StreamType;
use rtsp_relay::session::SessionManager;
use rtsp_relay::transport::{tcp, udp::UdpEndpoint};

#[derive(Parser)]
#[command(name = "rtsp-relay", about = "Multi-client RTSP relay server")]
struct Args {
    /// Address the RTSP TCP listener binds (host:port).
    #[arg(long, default_value = "0.0.0.0:8554")]
    bind: String,

    /// First of the two fixed, consecutive UDP ports (RTP; RTCP is this + 1).
    #[arg(long, default_value_t = 8000)]
    rtp_port: u16,

    /// Path declarations: `name` (accepts a local publisher) or
    /// `name=rtsp://host/stream` (pulls from an upstream RTSP origin).
    /// May be repeated.
    #[arg(long = "path")]
    paths: Vec<String>,

    /// Pull upstream sources over TCP instead of UDP.
    #[arg(long)]
    source_tcp: bool,
}

fn parse_path_arg(raw: &str, source_protocol: SourceProtocol) -> PathConfig {
    let mut cfg = PathConfig::default();
    match raw.split_once('=') {
        Some((name, url)) => {
            cfg.name = name.to_string();
            cfg.source = SourceKind::Rtsp(url.to_string());
            cfg.source_protocol = source_protocol;
        }
        None => {
            cfg.name = raw.to_string();
            cfg.source = SourceKind::Publisher;
        }
    }
    cfg
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let rtsp_addr: SocketAddr = match args.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("invalid --bind address {}: {e}", args.bind);
            return;
        }
    };
    let source_protocol = if args.source_tcp {
        SourceProtocol::Tcp
    } else {
        SourceProtocol::Udp
    };

    let mut server = ServerConfig::default();
    server.rtsp_port = rtsp_addr.port();
    server.rtp_port = args.rtp_port;
    server.rtcp_port = args.rtp_port + 1;
    if let Err(e) = server.validate() {
        eprintln!("invalid server config: {e}");
        return;
    }

    let config = Config {
        server,
        paths: args
            .paths
            .iter()
            .map(|raw| parse_path_arg(raw, source_protocol))
            .collect(),
    };

    let rtp_bind = SocketAddr::new(rtsp_addr.ip(), config.server.rtp_port);
    let rtcp_bind = SocketAddr::new(rtsp_addr.ip(), config.server.rtcp_port);
    let read_timeout = config.server.read_timeout;
    let write_timeout = config.server.write_timeout;

    let listener = match TcpListener::bind(rtsp_addr) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind {rtsp_addr}: {e}");
            return;
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        eprintln!("failed to set non-blocking: {e}");
        return;
    }

    let running = Arc::new(AtomicBool::new(true));
    let sessions = SessionManager::new();
    let (rtp_tx, rtp_rx) = mpsc::channel();
    let (rtcp_tx, rtcp_rx) = mpsc::channel();

    let tcp_config = Arc::new(config.clone());

    // Upstream sources are opaque OS threads to the dispatcher; this
    // closure is the only place it can actually ask one to start, via
    // `Dispatcher::start_source_if_needed`.
    let source_spawner: rtsp_relay::dispatcher::SourceSpawner = Arc::new(
        move |path_name, url, protocol, dispatch| {
            let handle = rtsp_relay::source::spawn(path_name, url, protocol, dispatch, read_timeout);
            handle.into_parts()
        },
    );

    let (dispatch, dispatcher_join) = Dispatcher::spawn_with_source_spawner(
        config.clone(),
        sessions,
        rtp_tx,
        rtcp_tx,
        Some(source_spawner),
    );

    let rtp_endpoint = UdpEndpoint::spawn(
        rtp_bind,
        StreamType::Rtp,
        dispatch.clone(),
        rtp_rx,
        write_timeout,
        running.clone(),
    );
    let rtcp_endpoint = UdpEndpoint::spawn(
        rtcp_bind,
        StreamType::Rtcp,
        dispatch.clone(),
        rtcp_rx,
        write_timeout,
        running.clone(),
    );
    let (rtp_endpoint, rtcp_endpoint) = match (rtp_endpoint, rtcp_endpoint) {
        (Ok(r), Ok(c)) => (r, c),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("failed to bind UDP endpoints: {e}");
            return;
        }
    };

    let accept_dispatch = dispatch.clone();
    let accept_running = running.clone();
    let accept_handle = std::thread::spawn(move || {
        tcp::accept_loop(listener, accept_dispatch, tcp_config, accept_running)
    });

    // Always-on (non on-demand) upstream sources start immediately rather
    // than waiting for a first DESCRIBE.
    for path in config.paths.iter().filter(|p| !p.source_on_demand) {
        if let SourceKind::Rtsp(url) = &path.source {
            let handle = rtsp_relay::source::spawn(
                path.name.clone(),
                url.clone(),
                path.source_protocol,
                dispatch.clone(),
                read_timeout,
            );
            let (stop, join) = handle.into_parts();
            let _ = dispatch.send(rtsp_relay::dispatcher::DispatchEvent::SourceStarted {
                path_name: path.name.clone(),
                stop,
                join,
            });
        }
    }

    println!(
        "rtsp-relay listening on {rtsp_addr} (RTP {rtp_bind}, RTCP {rtcp_bind}) — press Enter to stop"
    );
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    running.store(false, Ordering::SeqCst);
    let _ = dispatch.send(rtsp_relay::dispatcher::DispatchEvent::Shutdown);
    let _ = dispatcher_join.join();
    let _ = accept_handle.join();
    let _ = rtp_endpoint.reader.join();
    let _ = rtp_endpoint.writer.join();
    let _ = rtcp_endpoint.reader.join();
    let _ = rtcp_endpoint.writer.join();
}
