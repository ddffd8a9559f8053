use std::net::SocketAddr;
use std::time::Duration;

use catdog_core::{GlobalChannel, Message};
use catdog_devkit::{init_tracing, wait_until};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

struct Peer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    }

    async fn send(&mut self, message: &Message) {
        self.send_raw(&message.to_frame().unwrap()).await;
    }

    async fn recv(&mut self) -> Message {
        let line = timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("no frame within 2s")
            .unwrap()
            .expect("relay closed the connection");
        Message::from_frame(&line).unwrap()
    }

    async fn recv_nothing(&mut self, within: Duration) {
        assert!(timeout(within, self.lines.next_line()).await.is_err(), "unexpected frame");
    }
}

async fn relay_with_peers(n: usize) -> (GlobalChannel, Vec<Peer>) {
    init_tracing();
    let relay = GlobalChannel::start("127.0.0.1:0").await.unwrap();
    let mut peers = Vec::new();
    for _ in 0..n {
        peers.push(Peer::connect(relay.local_addr()).await);
    }
    wait_until(Duration::from_secs(2), || relay.client_count() == n).await.unwrap();
    (relay, peers)
}

#[tokio::test]
async fn test_message_reaches_every_client_including_sender() {
    let (_relay, mut peers) = relay_with_peers(3).await;
    let msg = Message::data_from_value("sensor", json!({"value": 10})).unwrap();
    peers[0].send(&msg).await;

    for peer in peers.iter_mut() {
        let got = peer.recv().await;
        assert_eq!(got.sender(), "sensor");
        assert_eq!(got.get("value"), Some(&json!(10)));
    }
}

#[tokio::test]
async fn test_closed_client_does_not_block_the_others() {
    let (relay, mut peers) = relay_with_peers(4).await;
    // Close one socket and broadcast right away, before the relay noticed
    drop(peers.pop());

    let msg = Message::data_from_value("a", json!({"seq": 1})).unwrap();
    peers[0].send(&msg).await;
    for peer in peers.iter_mut() {
        assert_eq!(peer.recv().await.get("seq"), Some(&json!(1)));
    }

    wait_until(Duration::from_secs(2), || relay.client_count() == 3).await.unwrap();

    let msg = Message::data_from_value("b", json!({"seq": 2})).unwrap();
    peers[1].send(&msg).await;
    for peer in peers.iter_mut() {
        assert_eq!(peer.recv().await.get("seq"), Some(&json!(2)));
    }
}

#[tokio::test]
async fn test_malformed_lines_are_not_forwarded() {
    let (relay, mut peers) = relay_with_peers(2).await;
    peers[0].send_raw("this is not json").await;
    peers[0].send_raw(r#"{"sender":"x","content":[1]}"#).await;
    peers[1].recv_nothing(Duration::from_millis(200)).await;

    // The relay and the misbehaving peer keep working
    assert_eq!(relay.client_count(), 2);
    let msg = Message::data_from_value("x", json!({"ok": true})).unwrap();
    peers[0].send(&msg).await;
    assert_eq!(peers[1].recv().await.get("ok"), Some(&json!(true)));
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let (relay, mut peers) = relay_with_peers(1).await;
    relay.shutdown();
    let next = timeout(Duration::from_secs(2), peers[0].lines.next_line())
        .await
        .expect("peer not disconnected");
    assert!(matches!(next, Ok(None) | Err(_)));
    assert_eq!(relay.client_count(), 0);
}
