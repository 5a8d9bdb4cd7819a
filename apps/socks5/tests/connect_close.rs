use std::net::SocketAddr;

use portal_proto::mote::Payload;
use portal_proto::rpc::portal_server::{Portal, PortalServer};
use portal_proto::{
    BytesPayload, BytesPayloadKind, CreatePortalRequest, CreatePortalResponse, Mote,
    OpenPortalRequest, OpenPortalResponse, TcpPayload,
};
use tavern_socks5::proxy::Proxy;
use tavern_socks5::upstream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

/// Answers the first TCP mote of every stream with "pong" and then closes
/// the stream with a CLOSE mote.
struct ClosingPortal;

fn reply(stream_id: &str, seq_id: u64, payload: Payload) -> Result<OpenPortalResponse, Status> {
    Ok(OpenPortalResponse {
        mote: Some(Mote {
            stream_id: stream_id.to_string(),
            seq_id,
            payload: Some(payload),
        }),
    })
}

#[tonic::async_trait]
impl Portal for ClosingPortal {
    type OpenPortalStream = ReceiverStream<Result<OpenPortalResponse, Status>>;
    type CreatePortalStream = ReceiverStream<Result<CreatePortalResponse, Status>>;

    async fn open_portal(
        &self,
        request: Request<Streaming<OpenPortalRequest>>,
    ) -> Result<Response<Self::OpenPortalStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Ok(Some(frame)) = inbound.message().await {
                let Some(Mote {
                    stream_id,
                    payload: Some(Payload::Tcp(tcp)),
                    ..
                }) = frame.mote
                else {
                    continue;
                };
                let pong = Payload::Tcp(TcpPayload {
                    data: b"pong".to_vec(),
                    dst_addr: tcp.dst_addr,
                    dst_port: tcp.dst_port,
                });
                let close = Payload::Bytes(BytesPayload {
                    data: Vec::new(),
                    kind: BytesPayloadKind::Close as i32,
                });
                let _ = tx.send(reply(&stream_id, 0, pong)).await;
                let _ = tx.send(reply(&stream_id, 1, close)).await;
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn create_portal(
        &self,
        _request: Request<Streaming<CreatePortalRequest>>,
    ) -> Result<Response<Self::CreatePortalStream>, Status> {
        Err(Status::unimplemented("no agents here"))
    }
}

async fn start_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let portal_addr = listener.local_addr().unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(PortalServer::new(ClosingPortal))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    let client = upstream::connect(&portal_addr.to_string(), None)
        .await
        .unwrap();
    let proxy = Proxy::bind("127.0.0.1:0".parse().unwrap(), 3)
        .await
        .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.run(client));
    proxy_addr
}

#[test_timeout::tokio_timeout_test(10, flavor = "multi_thread")]
async fn close_mote_ends_the_client_connection() {
    let proxy = start_proxy().await;

    let mut conn = TcpStream::connect(proxy).await.unwrap();
    conn.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    conn.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);
    conn.write_all(&[5, 1, 0, 1, 10, 0, 0, 7, 0, 22])
        .await
        .unwrap();
    let mut connected = [0u8; 10];
    conn.read_exact(&mut connected).await.unwrap();
    assert_eq!(connected[1], 0);

    conn.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    conn.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"pong");

    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}
