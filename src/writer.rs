// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session packet egress: a bounded FIFO drained by a single consumer
//! task.
//!
//! The queue serializes writes across media, guaranteeing that
//! interleaved-TCP frames are not multiplexed mid-frame and that UDP sends
//! are never invoked concurrently on the same socket from one session. A full
//! queue means the peer (or our own connection) can't keep up; that's a fatal
//! session error rather than a reason to buffer without bound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorInt;
use crate::Error;

/// The default bound on queued packets per session.
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PacketKind {
    Rtp,
    Rtcp,
}

/// One queued packet: a serialized RTP or RTCP packet bound for one medium.
pub(crate) struct QueuedPacket {
    pub medium: usize,
    pub kind: PacketKind,
    pub payload: Bytes,
}

/// Where one medium's packets go, bound at `PLAY`/`RECORD` time.
pub(crate) enum MediumWriteTarget {
    /// Datagrams directly to the peer's ports.
    Udp {
        rtp_socket: Arc<UdpSocket>,
        rtp_to: SocketAddr,
        rtcp_socket: Arc<UdpSocket>,
        rtcp_to: SocketAddr,
    },

    /// Interleaved frames relayed through the connection's outgoing message
    /// channel; even channel id for RTP, odd for RTCP.
    Interleaved {
        tx: mpsc::Sender<rtsp_types::Message<Bytes>>,
        rtp_channel_id: u8,
    },
}

/// Sending half of a session's writer queue.
///
/// Clones share the same bounded queue; dropping all of them ends the
/// consumer task.
#[derive(Clone)]
pub(crate) struct SessionWriter {
    tx: mpsc::Sender<QueuedPacket>,
}

impl SessionWriter {
    #[cfg(test)]
    pub(crate) fn for_test(tx: mpsc::Sender<QueuedPacket>) -> Self {
        Self { tx }
    }

    /// Enqueues a packet without waiting. A full queue is a fatal session
    /// error (slow reader).
    pub(crate) fn try_queue(&self, pkt: QueuedPacket) -> Result<(), Error> {
        self.tx.try_send(pkt).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => wrap!(ErrorInt::WriteQueueFull),
            mpsc::error::TrySendError::Closed(_) => wrap!(ErrorInt::Cancelled),
        })
    }
}

/// Spawns the consumer task for a session's writer queue.
///
/// On any write failure or timeout the task records the error via `on_fatal`
/// and cancels `token`, collapsing the session; `token` cancellation also
/// stops the task.
pub(crate) fn spawn(
    targets: Vec<MediumWriteTarget>,
    capacity: usize,
    write_timeout: Duration,
    token: CancellationToken,
    on_fatal: impl FnOnce(Error) + Send + 'static,
) -> SessionWriter {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        if let Err(e) = run(targets, rx, write_timeout, token.clone()).await {
            debug!("session writer failed: {e}");
            on_fatal(e);
            token.cancel();
        }
    });
    SessionWriter { tx }
}

async fn run(
    targets: Vec<MediumWriteTarget>,
    mut rx: mpsc::Receiver<QueuedPacket>,
    write_timeout: Duration,
    token: CancellationToken,
) -> Result<(), Error> {
    loop {
        let pkt = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => return Ok(()),
            },
        };
        let target = match targets.get(pkt.medium) {
            Some(t) => t,
            None => continue, // medium not armed for writing; drop.
        };
        let write = async {
            match target {
                MediumWriteTarget::Udp {
                    rtp_socket,
                    rtp_to,
                    rtcp_socket,
                    rtcp_to,
                } => {
                    let (socket, to) = match pkt.kind {
                        PacketKind::Rtp => (rtp_socket, rtp_to),
                        PacketKind::Rtcp => (rtcp_socket, rtcp_to),
                    };
                    socket
                        .send_to(&pkt.payload[..], to)
                        .await
                        .map(|_| ())
                        .map_err(|e| wrap!(ErrorInt::UdpSendError(e)))
                }
                MediumWriteTarget::Interleaved { tx, rtp_channel_id } => {
                    let channel_id = match pkt.kind {
                        PacketKind::Rtp => *rtp_channel_id,
                        PacketKind::Rtcp => *rtp_channel_id + 1,
                    };
                    tx.send(crate::conn::make_data_frame(channel_id, pkt.payload))
                        .await
                        .map_err(|_| wrap!(ErrorInt::Cancelled))
                }
            }
        };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => bail!(ErrorInt::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// FIFO order is preserved across concurrent enqueues from distinct
    /// media of the same session: whatever interleaving the producers win,
    /// the consumer sees each medium's packets in its enqueue order, and the
    /// relative order of any two packets matches their enqueue order.
    #[tokio::test(flavor = "multi_thread")]
    async fn fifo_across_media() {
        let (tx, mut rx) = mpsc::channel::<QueuedPacket>(DEFAULT_QUEUE_CAPACITY);
        let writer = SessionWriter { tx };
        let mut tasks = Vec::new();
        for medium in 0..4usize {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..32u8 {
                    writer
                        .try_queue(QueuedPacket {
                            medium,
                            kind: PacketKind::Rtp,
                            payload: Bytes::from(vec![i]),
                        })
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        drop(writer);
        let mut last_per_medium = [None::<u8>; 4];
        while let Some(pkt) = rx.recv().await {
            let last = &mut last_per_medium[pkt.medium];
            let this = pkt.payload[0];
            if let Some(last) = last {
                assert!(this > *last, "medium {} out of order", pkt.medium);
            }
            *last = Some(this);
        }
        assert_eq!(last_per_medium, [Some(31); 4]);
    }

    #[tokio::test]
    async fn queue_full_is_fatal() {
        let (tx, _rx) = mpsc::channel::<QueuedPacket>(2);
        let writer = SessionWriter { tx };
        for _ in 0..2 {
            writer
                .try_queue(QueuedPacket {
                    medium: 0,
                    kind: PacketKind::Rtp,
                    payload: Bytes::new(),
                })
                .unwrap();
        }
        let e = writer
            .try_queue(QueuedPacket {
                medium: 0,
                kind: PacketKind::Rtcp,
                payload: Bytes::new(),
            })
            .unwrap_err();
        assert!(e.to_string().contains("Write queue is full"));
    }

    /// Interleaved writes come out as data frames on the right channels.
    #[tokio::test]
    async fn interleaved_channel_assignment() {
        let (conn_tx, mut conn_rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let writer = spawn(
            vec![MediumWriteTarget::Interleaved {
                tx: conn_tx,
                rtp_channel_id: 4,
            }],
            8,
            Duration::from_secs(1),
            token.clone(),
            |e| panic!("unexpected fatal error: {e}"),
        );
        writer
            .try_queue(QueuedPacket {
                medium: 0,
                kind: PacketKind::Rtp,
                payload: Bytes::from_static(b"rtp"),
            })
            .unwrap();
        writer
            .try_queue(QueuedPacket {
                medium: 0,
                kind: PacketKind::Rtcp,
                payload: Bytes::from_static(b"rtcp"),
            })
            .unwrap();
        match conn_rx.recv().await.unwrap() {
            rtsp_types::Message::Data(d) => {
                assert_eq!(d.channel_id(), 4);
                assert_eq!(&d.into_body()[..], b"rtp");
            }
            _ => panic!("expected data frame"),
        }
        match conn_rx.recv().await.unwrap() {
            rtsp_types::Message::Data(d) => {
                assert_eq!(d.channel_id(), 5);
                assert_eq!(&d.into_body()[..], b"rtcp");
            }
            _ => panic!("expected data frame"),
        }
        token.cancel();
    }
}
