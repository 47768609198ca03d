//! Configuration surface the core consumes.
//!
//! Loading these from YAML/environment, hot-reload file watching, and CLI
//! flag wiring are out of the CORE — those are the caller's job (see the
//! `cli` crate for a minimal flag-based loader). This module only defines
//! the shapes and their defaults, so every loader produces the same typed
//! surface the dispatcher consumes.

use std::time::Duration;

/// Transport protocols the server accepts from clients (RFC 2326 §12.39).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Authentication methods the server accepts (RFC 2617).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    Basic,
    Digest,
}

/// Server-wide configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Enabled client transports; must be non-empty.
    pub protocols: Vec<Protocol>,
    pub rtsp_port: u16,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub auth_methods: Vec<AuthMethod>,
    /// External command run when any client connects. Launching is out of
    /// core; this only records what would be launched.
    pub run_on_connect: Option<String>,
    /// SDP origin/session fields used in the DESCRIBE response body.
    pub sdp_username: String,
    pub sdp_session_id: String,
    pub sdp_session_version: String,
    pub sdp_session_name: String,
    /// Host advertised in SDP `o=`/`c=` lines; inferred from the request
    /// when `None`.
    pub public_host: Option<String>,
}

impl ServerConfig {
    /// `rtcp_port` must be exactly `rtp_port + 1`, `rtp_port` must be even.
    pub fn validate(&self) -> Result<(), String> {
        if self.protocols.is_empty() {
            return Err("protocols must be non-empty".into());
        }
        if self.rtp_port % 2 != 0 {
            return Err("rtp_port must be even".into());
        }
        if self.rtcp_port != self.rtp_port + 1 {
            return Err("rtcp_port must equal rtp_port + 1".into());
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocols: vec![Protocol::Udp, Protocol::Tcp],
            rtsp_port: 8554,
            rtp_port: 8000,
            rtcp_port: 8001,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            auth_methods: vec![AuthMethod::Basic, AuthMethod::Digest],
            run_on_connect: None,
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
        }
    }
}

/// Where a path's media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Accept a local publisher via ANNOUNCE. `record` is a config alias.
    Publisher,
    /// Pull from an upstream RTSP server.
    Rtsp(String),
    /// Pull from an upstream RTMP server.
    Rtmp(String),
    /// Redirect readers to another RTSP URL (not dereferenced by the core;
    /// DESCRIBE against it resolves as [`crate::error::RtspError::NotFound`]-shaped,
    /// since 3xx redirect responses aren't in the supported status code set).
    Redirect(String),
}

/// Upstream transport preference for a pulled source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceProtocol {
    Udp,
    Tcp,
}

/// ACL entry: allowed IP/CIDR set plus an optional credential pair.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    /// Empty means "any source IP allowed".
    pub allowed_ips: Vec<ipnet::IpNet>,
    pub user: Option<String>,
    /// Either a literal password or a `sha256:<base64>` digest of it.
    pub pass: Option<String>,
}

impl AccessControl {
    pub fn allows(&self, addr: std::net::IpAddr) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.iter().any(|net| net.contains(&addr))
    }
}

/// Per-path external-command hooks. `$RTSP_SERVER_PATH` is
/// substituted by the launcher, not by the core.
#[derive(Debug, Clone, Default)]
pub struct RunOnHooks {
    pub run_on_init: Option<String>,
    pub run_on_demand: Option<String>,
    pub run_on_publish: Option<String>,
    pub run_on_read: Option<String>,
}

/// Static configuration for one path entry.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Literal name, or a `~`-prefixed regex pattern (or the `all` alias).
    pub name: String,
    pub source: SourceKind,
    pub source_protocol: SourceProtocol,
    pub source_on_demand: bool,
    pub publish: AccessControl,
    pub read: AccessControl,
    pub hooks: RunOnHooks,
}

impl PathConfig {
    pub fn is_regex(&self) -> bool {
        self.name.starts_with('~') || self.name == "all"
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: SourceKind::Publisher,
            source_protocol: SourceProtocol::Udp,
            source_on_demand: false,
            publish: AccessControl::default(),
            read: AccessControl::default(),
            hooks: RunOnHooks::default(),
        }
    }
}

/// Full configuration surface: server options plus the path table.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    /// Declaration order matters: regex entries are tried in this order
    /// and the first match wins.
    pub paths: Vec<PathConfig>,
}

impl Config {
    pub fn path_by_name(&self, name: &str) -> Option<&PathConfig> {
        self.paths.iter().find(|p| p.name == name)
    }
}

/// Default timeouts shared by several components.
pub mod timeouts {
    use std::time::Duration;

    pub const STREAM_CHECK: Duration = Duration::from_secs(5);
    pub const RECEIVER_REPORT: Duration = Duration::from_secs(10);
    pub const SOURCE_RETRY: Duration = Duration::from_secs(5);
    pub const KEEPALIVE: Duration = Duration::from_secs(60);
    pub const DESCRIBE_WAIT: Duration = Duration::from_secs(5);
    pub const ON_DEMAND_IDLE: Duration = Duration::from_secs(10);
}
