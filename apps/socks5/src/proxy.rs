//! The bridge itself: one `OpenPortal` stream shared by every SOCKS5 client.
//!
//! Each accepted client gets a fresh stream id. Its outbound motes go through
//! an [`OrderedWriter`] onto the shared upstream channel; inbound motes are
//! fanned out by the dispatch loop to a bounded per-stream channel that an
//! [`OrderedReader`] drains.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use portal_proto::mote::Payload;
use portal_proto::{BytesPayloadKind, Mote, OpenPortalRequest, OpenPortalResponse};
use portal_stream::{
    MoteSink, MoteSource, OrderedReader, OrderedWriter, StreamError, StreamResult,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::socks::{self, SocksCommand, SocksError, SocksRequest, SocksStatus};
use crate::udp;
use crate::upstream::UpstreamClient;

/// Motes buffered per client stream before the dispatch loop drops.
pub const STREAM_BUFFER: usize = 1024;
const UPSTREAM_BUFFER: usize = 1024;
const TCP_READ_CHUNK: usize = 32 * 1024;
const UDP_PACKET_MAX: usize = 65_535;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

type StreamTable = Arc<RwLock<HashMap<String, mpsc::Sender<Mote>>>>;

/// Upstream half of the portal stream. The channel serializes writers.
#[derive(Clone)]
struct PortalSink {
    portal_id: i64,
    upstream: mpsc::Sender<OpenPortalRequest>,
}

#[async_trait]
impl MoteSink for PortalSink {
    async fn send_mote(&self, mote: Mote) -> StreamResult<()> {
        self.upstream
            .send(OpenPortalRequest {
                portal_id: self.portal_id,
                mote: Some(mote),
            })
            .await
            .map_err(|_| StreamError::Closed)
    }
}

/// Per-stream mote channel that also ends when the connection is cancelled.
struct StreamInbox {
    motes: mpsc::Receiver<Mote>,
    cancel: CancellationToken,
}

#[async_trait]
impl MoteSource for StreamInbox {
    async fn recv_mote(&mut self) -> StreamResult<Mote> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StreamError::Closed),
            mote = self.motes.recv() => mote.ok_or(StreamError::Closed),
        }
    }
}

/// Removes the stream from the dispatch table when the connection ends.
struct Registration {
    streams: StreamTable,
    stream_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.streams.write().remove(&self.stream_id);
    }
}

pub struct Proxy {
    portal_id: i64,
    listener: TcpListener,
}

impl Proxy {
    pub async fn bind(listen: SocketAddr, portal_id: i64) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Self {
            portal_id,
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Open the portal stream and serve SOCKS clients until the portal
    /// stream ends.
    pub async fn run(self, mut client: UpstreamClient) -> anyhow::Result<()> {
        let (upstream, requests) = mpsc::channel(UPSTREAM_BUFFER);
        upstream
            .send(OpenPortalRequest {
                portal_id: self.portal_id,
                mote: None,
            })
            .await
            .context("queue portal registration")?;
        let inbound = client
            .open_portal(ReceiverStream::new(requests))
            .await
            .context("open portal")?
            .into_inner();
        info!(
            portal_id = self.portal_id,
            listen = %self.listener.local_addr()?,
            "socks5 proxy listening"
        );

        let streams = StreamTable::default();
        let sink = PortalSink {
            portal_id: self.portal_id,
            upstream,
        };
        tokio::select! {
            result = dispatch(inbound, Arc::clone(&streams)) => result,
            result = accept_loop(self.listener, sink, streams) => result,
        }
    }
}

/// Route inbound motes to their stream's channel. Unknown stream ids are
/// dropped; so are motes for a stream whose channel is full.
async fn dispatch(
    mut inbound: Streaming<OpenPortalResponse>,
    streams: StreamTable,
) -> anyhow::Result<()> {
    loop {
        let Some(response) = inbound.message().await.context("portal stream failed")? else {
            bail!("portal stream closed by upstream");
        };
        let Some(mote) = response.mote else {
            continue;
        };
        let sender = streams.read().get(&mote.stream_id).cloned();
        let Some(sender) = sender else {
            debug!(
                stream_id = %mote.stream_id,
                kind = mote.payload_name(),
                "mote for unknown stream dropped"
            );
            continue;
        };
        match sender.try_send(mote) {
            Ok(()) => {}
            Err(TrySendError::Full(mote)) => {
                warn!(stream_id = %mote.stream_id, "stream buffer full, dropping mote");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    sink: PortalSink,
    streams: StreamTable,
) -> anyhow::Result<()> {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let sink = sink.clone();
        let streams = Arc::clone(&streams);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(conn, sink, streams).await {
                debug!(%peer, error = %err, "socks connection failed");
            }
        });
    }
}

async fn handle_connection(
    mut conn: TcpStream,
    sink: PortalSink,
    streams: StreamTable,
) -> Result<(), SocksError> {
    socks::handshake(&mut conn).await?;
    let request = socks::read_request(&mut conn).await?;

    let stream_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    streams.write().insert(stream_id.clone(), tx);
    let _registration = Registration {
        streams,
        stream_id: stream_id.clone(),
    };

    let cancel = CancellationToken::new();
    let _cancel_on_exit = cancel.clone().drop_guard();
    let writer = OrderedWriter::new(stream_id.clone(), sink);
    let reader = OrderedReader::new(StreamInbox {
        motes: rx,
        cancel: cancel.clone(),
    });

    debug!(
        stream_id = %stream_id,
        command = request.command,
        host = %request.host,
        port = request.port,
        "socks request"
    );
    match request.command() {
        Some(SocksCommand::Connect) => handle_tcp(conn, &request, writer, reader, &cancel).await,
        Some(SocksCommand::UdpAssociate) => handle_udp(conn, writer, reader, &cancel).await,
        None => {
            socks::send_reply(&mut conn, SocksStatus::CommandNotSupported, socks::unspecified())
                .await?;
            Ok(())
        }
    }
}

async fn handle_tcp(
    mut conn: TcpStream,
    request: &SocksRequest,
    writer: OrderedWriter<PortalSink>,
    mut reader: OrderedReader<StreamInbox>,
    cancel: &CancellationToken,
) -> Result<(), SocksError> {
    socks::send_reply(&mut conn, SocksStatus::Succeeded, socks::unspecified()).await?;
    let (mut from_client, mut to_client) = conn.into_split();
    let port = u32::from(request.port);

    let uplink = async {
        let mut buf = vec![0u8; TCP_READ_CHUNK];
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                read = from_client.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(stream_id = writer.stream_id(), error = %err, "client read failed");
                        break;
                    }
                },
            };
            if let Err(err) = writer.write_tcp(buf[..n].to_vec(), &request.host, port).await {
                debug!(stream_id = writer.stream_id(), error = %err, "upstream write failed");
                break;
            }
        }
        cancel.cancel();
    };

    let downlink = async {
        loop {
            let mote = match reader.read().await {
                Ok(mote) => mote,
                Err(err) => {
                    debug!(error = %err, "downlink ended");
                    break;
                }
            };
            let data = match mote.payload {
                Some(Payload::Tcp(tcp)) => tcp.data,
                Some(Payload::Bytes(bytes)) if bytes.kind() == BytesPayloadKind::Close => break,
                Some(Payload::Bytes(bytes)) => bytes.data,
                _ => continue,
            };
            if !data.is_empty() && to_client.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = to_client.shutdown().await;
        cancel.cancel();
    };

    tokio::join!(uplink, downlink);
    Ok(())
}

async fn handle_udp(
    mut conn: TcpStream,
    writer: OrderedWriter<PortalSink>,
    mut reader: OrderedReader<StreamInbox>,
    cancel: &CancellationToken,
) -> Result<(), SocksError> {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => socket,
        Err(err) => {
            socks::send_reply(&mut conn, SocksStatus::GeneralFailure, socks::unspecified())
                .await?;
            return Err(err.into());
        }
    };
    let relay_port = socket.local_addr()?.port();
    socks::send_reply(
        &mut conn,
        SocksStatus::Succeeded,
        SocketAddr::from((Ipv4Addr::LOCALHOST, relay_port)),
    )
    .await?;
    debug!(stream_id = writer.stream_id(), relay_port, "udp association open");

    let client_addr: Mutex<Option<SocketAddr>> = Mutex::new(None);

    // The association lives as long as the control connection.
    let control = async {
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = conn.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
            }
        }
        cancel.cancel();
    };

    let uplink = async {
        let mut buf = vec![0u8; UDP_PACKET_MAX];
        loop {
            let (n, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(err) => {
                        debug!(error = %err, "udp relay read failed");
                        break;
                    }
                },
            };
            *client_addr.lock() = Some(from);
            let Some(datagram) = udp::parse_datagram(&buf[..n]) else {
                continue;
            };
            let port = u32::from(datagram.port);
            if let Err(err) = writer
                .write_udp(datagram.data.to_vec(), &datagram.host, port)
                .await
            {
                debug!(stream_id = writer.stream_id(), error = %err, "upstream write failed");
                break;
            }
        }
        cancel.cancel();
    };

    let downlink = async {
        loop {
            let mote = match reader.read().await {
                Ok(mote) => mote,
                Err(err) => {
                    debug!(error = %err, "udp downlink ended");
                    break;
                }
            };
            let Some(Payload::Udp(reply)) = mote.payload else {
                continue;
            };
            let client = *client_addr.lock();
            let Some(client) = client else {
                continue;
            };
            let Ok(port) = u16::try_from(reply.dst_port) else {
                continue;
            };
            let Some(packet) = udp::build_datagram(&reply.dst_addr, port, &reply.data) else {
                continue;
            };
            if let Err(err) = socket.send_to(&packet, client).await {
                debug!(%client, error = %err, "udp relay write failed");
            }
        }
        cancel.cancel();
    };

    tokio::join!(control, uplink, downlink);
    Ok(())
}
