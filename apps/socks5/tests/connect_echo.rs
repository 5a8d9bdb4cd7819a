use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use portal_proto::mote::Payload;
use portal_proto::rpc::portal_client::PortalClient;
use portal_proto::{CreatePortalRequest, Mote};
use portal_pubsub::InMemoryDriver;
use portal_stream::{OrderedReader, OrderedWriter};
use tavern::mux::{Mux, MuxConfig};
use tavern::portal::{ApiTokenCheck, PortalService};
use tavern::store::{InMemoryPortalStore, TaskRecord};
use tavern_socks5::proxy::Proxy;
use tavern_socks5::upstream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const TASK_ID: i64 = 11;
const PAYLOAD_LEN: usize = 1024 * 1024;

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = conn.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn start_tavern(store: std::sync::Arc<InMemoryPortalStore>) -> SocketAddr {
    let mux = Mux::new(InMemoryDriver::new(), MuxConfig::default());
    let service = PortalService::new(mux, store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(tavern::server::serve(
        listener,
        service,
        ApiTokenCheck::default(),
        std::future::pending(),
    ));
    addr
}

/// A minimal agent: dials the destination of each new TCP stream and relays
/// bytes in both directions.
async fn run_agent(tavern: SocketAddr) {
    let mut client = PortalClient::connect(format!("http://{tavern}"))
        .await
        .unwrap();
    let (requests, outgoing) = mpsc::channel(1024);
    requests
        .send(CreatePortalRequest {
            task_id: TASK_ID,
            mote: None,
        })
        .await
        .unwrap();
    let mut inbound = client
        .create_portal(ReceiverStream::new(outgoing))
        .await
        .unwrap()
        .into_inner();

    let (replies, mut reply_rx) = mpsc::channel::<Mote>(1024);
    let forward = requests.clone();
    tokio::spawn(async move {
        while let Some(mote) = reply_rx.recv().await {
            let frame = CreatePortalRequest {
                task_id: 0,
                mote: Some(mote),
            };
            if forward.send(frame).await.is_err() {
                return;
            }
        }
    });

    tokio::spawn(async move {
        let mut streams: HashMap<String, mpsc::Sender<Mote>> = HashMap::new();
        while let Ok(Some(response)) = inbound.message().await {
            let Some(mote) = response.mote else { continue };
            let Some(Payload::Tcp(tcp)) = &mote.payload else {
                continue;
            };
            if !streams.contains_key(&mote.stream_id) {
                let target = format!("{}:{}", tcp.dst_addr, tcp.dst_port);
                let conn = TcpStream::connect(target).await.unwrap();
                let (to_agent, from_portal) = mpsc::channel(1024);
                streams.insert(mote.stream_id.clone(), to_agent);
                tokio::spawn(relay(
                    conn,
                    mote.stream_id.clone(),
                    from_portal,
                    replies.clone(),
                ));
            }
            let _ = streams[&mote.stream_id].send(mote).await;
        }
        drop(requests);
    });
}

async fn relay(
    conn: TcpStream,
    stream_id: String,
    from_portal: mpsc::Receiver<Mote>,
    replies: mpsc::Sender<Mote>,
) {
    let (mut from_target, mut to_target) = conn.into_split();
    let writer = OrderedWriter::new(stream_id, replies);
    let mut reader = OrderedReader::new(from_portal);

    let down = async move {
        while let Ok(mote) = reader.read().await {
            if to_target.write_all(mote.data()).await.is_err() {
                break;
            }
        }
    };
    let up = async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match from_target.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer
                        .write_tcp(buf[..n].to_vec(), "127.0.0.1", 0)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    };
    tokio::join!(down, up);
}

async fn wait_for_portal(store: &InMemoryPortalStore) -> i64 {
    for _ in 0..200 {
        if let Some(portal) = store.portals().await.first() {
            return portal.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent never opened a portal");
}

async fn socks_connect(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut conn = TcpStream::connect(proxy).await.unwrap();
    conn.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    conn.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let SocketAddr::V4(target) = target else {
        panic!("echo server should be on ipv4");
    };
    let mut request = vec![5, 1, 0, 1];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    conn.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0, "connect refused: {reply:?}");
    conn
}

#[test_timeout::tokio_timeout_test(30, flavor = "multi_thread")]
async fn connect_echoes_one_mebibyte() {
    let echo = start_echo_server().await;
    let store = InMemoryPortalStore::new();
    store
        .insert_task(TaskRecord {
            id: TASK_ID,
            beacon_id: 1,
            quest_creator_id: None,
        })
        .await;
    let tavern = start_tavern(store.clone()).await;
    run_agent(tavern).await;
    let portal_id = wait_for_portal(&store).await;

    let client = upstream::connect(&tavern.to_string(), None).await.unwrap();
    let proxy = Proxy::bind("127.0.0.1:0".parse().unwrap(), portal_id)
        .await
        .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.run(client));

    let conn = socks_connect(proxy_addr, echo).await;
    let (mut reader, mut writer) = conn.into_split();
    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();

    let expected = payload.clone();
    let send = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });
    let mut echoed = vec![0u8; PAYLOAD_LEN];
    reader.read_exact(&mut echoed).await.unwrap();
    let _writer = send.await.unwrap();

    assert!(echoed == expected, "echoed bytes differ from what was sent");
}
