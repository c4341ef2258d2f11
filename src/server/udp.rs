// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server's shared UDP listeners.
//!
//! One RTP socket and one RTCP socket serve every UDP session: incoming
//! datagrams are routed by `(source address, source port)` to the owning
//! session and medium. The table holds weak references; listeners never
//! extend a session's lifetime, and a session deregisters itself on stop.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{debug, trace};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::session::ServerSession;
use crate::MAX_UDP_PACKET_SIZE;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum UdpKind {
    Rtp,
    Rtcp,
}

struct UdpClient {
    session: Weak<ServerSession>,
    medium: usize,
}

/// The pair of shared sockets and their routing table.
pub(super) struct UdpListenerPair {
    pub(super) rtp_socket: Arc<UdpSocket>,
    pub(super) rtcp_socket: Arc<UdpSocket>,
    pub(super) rtp_port: u16,

    /// Keyed by `(peer ip, peer port)`; RTP and RTCP entries live in one
    /// table because the peer's RTP and RTCP ports are distinct.
    clients: Mutex<HashMap<(IpAddr, u16), UdpClient>>,
}

impl UdpListenerPair {
    /// Binds the pair and spawns both reader tasks, which run until `token`
    /// cancellation.
    pub(super) async fn bind(
        ip: IpAddr,
        rtp_port: u16,
        token: CancellationToken,
    ) -> Result<Arc<Self>, std::io::Error> {
        const MAX_TRIES: usize = 10;
        let (rtp_socket, rtcp_socket, rtp_port) = 'bind: {
            let mut last_err = None;
            for _ in 0..MAX_TRIES {
                let rtp_socket = UdpSocket::bind(SocketAddr::new(ip, rtp_port)).await?;
                let bound = rtp_socket.local_addr()?.port();
                match UdpSocket::bind(SocketAddr::new(ip, bound + 1)).await {
                    Ok(rtcp_socket) => break 'bind (rtp_socket, rtcp_socket, bound),
                    // An ephemeral RTP port whose successor is taken: retry
                    // with a fresh one. A configured port is a hard error.
                    Err(e) if rtp_port == 0 => last_err = Some(e),
                    Err(e) => return Err(e),
                }
            }
            return Err(last_err.expect("at least one bind attempt"));
        };
        let pair = Arc::new(Self {
            rtp_socket: Arc::new(rtp_socket),
            rtcp_socket: Arc::new(rtcp_socket),
            rtp_port,
            clients: Mutex::new(HashMap::new()),
        });
        for kind in [UdpKind::Rtp, UdpKind::Rtcp] {
            let pair = Arc::clone(&pair);
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = pair.run_reader(kind) => {}
                    _ = token.cancelled() => {}
                }
            });
        }
        Ok(pair)
    }

    /// Registers a session-medium as the owner of datagrams from the given
    /// source.
    pub(super) fn add_client(
        &self,
        addr: (IpAddr, u16),
        session: &Arc<ServerSession>,
        medium: usize,
    ) {
        self.clients.lock().expect("not poisoned").insert(
            addr,
            UdpClient {
                session: Arc::downgrade(session),
                medium,
            },
        );
    }

    /// Removes every registration owned by the given session.
    pub(super) fn remove_session(&self, session: &ServerSession) {
        self.clients
            .lock()
            .expect("not poisoned")
            .retain(|_, c| match c.session.upgrade() {
                Some(s) => !std::ptr::eq(&*s, session),
                None => false,
            });
    }

    async fn run_reader(self: Arc<Self>, kind: UdpKind) {
        let socket = match kind {
            UdpKind::Rtp => &self.rtp_socket,
            UdpKind::Rtcp => &self.rtcp_socket,
        };
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE + 1];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    debug!("UDP {kind:?} listener recv error: {e}");
                    continue;
                }
            };
            let (session, medium) = {
                let clients = self.clients.lock().expect("not poisoned");
                match clients.get(&(src.ip(), src.port())) {
                    Some(c) => match c.session.upgrade() {
                        Some(s) => (s, c.medium),
                        None => continue, // session gone; entry reaped on next remove.
                    },
                    None => {
                        trace!("dropping {len}-byte datagram from unknown source {src}");
                        continue;
                    }
                }
            };
            if len > MAX_UDP_PACKET_SIZE {
                session.warn_packet_too_big(kind == UdpKind::Rtp);
                continue;
            }
            let body = Bytes::copy_from_slice(&buf[..len]);
            match kind {
                UdpKind::Rtp => session.handle_rtp(medium, body),
                UdpKind::Rtcp => session.handle_rtcp(medium, body),
            }
        }
    }
}
