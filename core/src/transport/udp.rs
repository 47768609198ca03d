//! Fixed-port UDP RTP/RTCP endpoints.
//!
//! Each endpoint is bound to one of the two fixed, well-known ports and
//! both reads inbound publisher datagrams and writes outbound reader
//! datagrams, via a single-reader / single-writer split on the cloned
//! socket.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use crate::dispatcher::{DispatchEvent, DispatchHandle, UdpWrite};
use crate::error::Result;
use crate::publishers::StreamType;

/// Datagrams larger than this are truncated by the kernel before we see
/// them; RTP/RTCP over UDP never approaches this in practice.
const BUFFER_SIZE: usize = 65_536;

/// Reader+writer socket pair for one of the two fixed ports.
pub struct UdpEndpoint {
    pub reader: thread::JoinHandle<()>,
    pub writer: thread::JoinHandle<()>,
}

impl UdpEndpoint {
    /// Bind one fixed UDP port and spawn its reader and writer loops.
    pub fn spawn(
        bind_addr: std::net::SocketAddr,
        stream_type: StreamType,
        dispatch: DispatchHandle,
        write_rx: Receiver<UdpWrite>,
        write_timeout: Duration,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_write_timeout(Some(write_timeout))?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;

        let read_socket = socket.try_clone()?;
        let write_socket = socket;

        let writer = thread::spawn(move || writer_loop(write_socket, write_rx));
        let reader_running = running;
        let reader = thread::spawn(move || {
            reader_loop(read_socket, stream_type, dispatch, reader_running)
        });

        Ok(Self { reader, writer })
    }
}

/// Read loop: a 2-slot multi-buffer, so the previous buffer can still be
/// in flight for forwarding while the next read proceeds — each received
/// datagram is copied out into its own owned `Vec` before the next
/// `recv_from` reuses the slot.
fn reader_loop(
    socket: UdpSocket,
    stream_type: StreamType,
    dispatch: DispatchHandle,
    running: Arc<AtomicBool>,
) {
    let mut slots = [vec![0u8; BUFFER_SIZE], vec![0u8; BUFFER_SIZE]];
    let mut current = 0usize;

    while running.load(Ordering::SeqCst) {
        let buf = &mut slots[current];
        match socket.recv_from(buf) {
            Ok((n, addr)) => {
                let data = buf[..n].to_vec();
                current = 1 - current;
                if dispatch
                    .send(DispatchEvent::UdpFrame {
                        addr,
                        stream_type,
                        data,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, ?stream_type, "UDP recv error");
                }
            }
        }
    }
    tracing::debug!(?stream_type, "UDP reader loop exited");
}

/// Write loop: drains the write-request channel, applying the configured
/// write deadline to each send.
fn writer_loop(socket: UdpSocket, rx: Receiver<UdpWrite>) {
    for (addr, data) in rx {
        if let Err(e) = socket.send_to(&data, addr) {
            tracing::debug!(error = %e, %addr, "UDP send error");
        }
    }
    tracing::debug!("UDP writer loop exited");
}
