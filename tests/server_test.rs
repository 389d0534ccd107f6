//! End-to-end tests over a loopback socket pair.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UdpSocket;

use utftpd::{ServerConfig, TftpServer};

const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

fn temp_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("utftpd_e2e_{}_{}", name, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(root: PathBuf) -> ServerConfig {
    ServerConfig {
        root_dir: root,
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> SocketAddr {
    let server = TftpServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    addr
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

fn request(opcode: u16, filename: &str, mode: &str, options: &[(&str, &str)]) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&opcode.to_be_bytes());
    pkt.extend_from_slice(filename.as_bytes());
    pkt.push(0);
    pkt.extend_from_slice(mode.as_bytes());
    pkt.push(0);
    for (name, value) in options {
        pkt.extend_from_slice(name.as_bytes());
        pkt.push(0);
        pkt.extend_from_slice(value.as_bytes());
        pkt.push(0);
    }
    pkt
}

fn ack(block: u16) -> Vec<u8> {
    let mut pkt = vec![0, OP_ACK as u8];
    pkt.extend_from_slice(&block.to_be_bytes());
    pkt
}

fn data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0, OP_DATA as u8];
    pkt.extend_from_slice(&block.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// Receive one datagram or panic after two seconds.
async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 65536];
    let (len, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for server")
        .unwrap();
    buf.truncate(len);
    (buf, from)
}

fn opcode_of(pkt: &[u8]) -> u16 {
    u16::from_be_bytes([pkt[0], pkt[1]])
}

fn block_of(pkt: &[u8]) -> u16 {
    u16::from_be_bytes([pkt[2], pkt[3]])
}

#[tokio::test]
async fn serves_small_file_without_options() {
    let root = temp_root("small");
    std::fs::write(root.join("motd.txt"), b"welcome aboard").unwrap();
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    sock.send_to(&request(1, "motd.txt", "octet", &[]), server)
        .await
        .unwrap();

    let (pkt, session) = recv(&sock).await;
    assert_ne!(session, server, "data must come from an ephemeral socket");
    assert_eq!(opcode_of(&pkt), OP_DATA);
    assert_eq!(block_of(&pkt), 1);
    assert_eq!(&pkt[4..], b"welcome aboard");

    sock.send_to(&ack(1), session).await.unwrap();
}

#[tokio::test]
async fn negotiates_blksize_and_tsize() {
    let root = temp_root("oack");
    std::fs::write(root.join("fw.bin"), vec![0xabu8; 1500]).unwrap();
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    let req = request(1, "fw.bin", "octet", &[("blksize", "1024"), ("tsize", "0")]);
    sock.send_to(&req, server).await.unwrap();

    let (oack, session) = recv(&sock).await;
    assert_eq!(opcode_of(&oack), OP_OACK);
    assert_eq!(&oack[2..], b"blksize\01024\0tsize\01500\0");

    sock.send_to(&ack(0), session).await.unwrap();
    let (data1, _) = recv(&sock).await;
    assert_eq!((opcode_of(&data1), block_of(&data1)), (OP_DATA, 1));
    assert_eq!(data1.len() - 4, 1024);

    sock.send_to(&ack(1), session).await.unwrap();
    let (data2, _) = recv(&sock).await;
    assert_eq!((opcode_of(&data2), block_of(&data2)), (OP_DATA, 2));
    assert_eq!(data2.len() - 4, 476);

    sock.send_to(&ack(2), session).await.unwrap();
}

#[tokio::test]
async fn exact_multiple_ends_with_empty_data() {
    let root = temp_root("exact");
    std::fs::write(root.join("even.bin"), vec![1u8; 1024]).unwrap();
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    sock.send_to(&request(1, "even.bin", "octet", &[]), server)
        .await
        .unwrap();

    let (data1, session) = recv(&sock).await;
    assert_eq!(data1.len() - 4, 512);
    sock.send_to(&ack(1), session).await.unwrap();

    let (data2, _) = recv(&sock).await;
    assert_eq!(data2.len() - 4, 512);
    sock.send_to(&ack(2), session).await.unwrap();

    let (data3, _) = recv(&sock).await;
    assert_eq!((opcode_of(&data3), block_of(&data3)), (OP_DATA, 3));
    assert_eq!(data3.len(), 4, "final block must carry no payload");
    sock.send_to(&ack(3), session).await.unwrap();
}

#[tokio::test]
async fn accepts_write_with_negotiated_blocksize() {
    let root = temp_root("write");
    let server = start_server(test_config(root.clone())).await;

    let sock = client().await;
    let req = request(2, "upload.bin", "octet", &[("blksize", "1024")]);
    sock.send_to(&req, server).await.unwrap();

    let (oack, session) = recv(&sock).await;
    assert_eq!(opcode_of(&oack), OP_OACK);
    assert_eq!(&oack[2..], b"blksize\01024\0");

    sock.send_to(&data(1, &vec![7u8; 1024]), session).await.unwrap();
    let (ack1, _) = recv(&sock).await;
    assert_eq!((opcode_of(&ack1), block_of(&ack1)), (OP_ACK, 1));

    sock.send_to(&data(2, &vec![7u8; 500]), session).await.unwrap();
    let (ack2, _) = recv(&sock).await;
    assert_eq!((opcode_of(&ack2), block_of(&ack2)), (OP_ACK, 2));

    // Short block ends the transfer; the file lands under the root.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let written = std::fs::read(root.join("upload.bin")).unwrap();
    assert_eq!(written.len(), 1524);
}

#[tokio::test]
async fn plain_write_acks_block_zero() {
    let root = temp_root("write_plain");
    let server = start_server(test_config(root.clone())).await;

    let sock = client().await;
    sock.send_to(&request(2, "note.txt", "octet", &[]), server)
        .await
        .unwrap();

    let (ack0, session) = recv(&sock).await;
    assert_eq!((opcode_of(&ack0), block_of(&ack0)), (OP_ACK, 0));

    sock.send_to(&data(1, b"short note"), session).await.unwrap();
    let (ack1, _) = recv(&sock).await;
    assert_eq!((opcode_of(&ack1), block_of(&ack1)), (OP_ACK, 1));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(std::fs::read(root.join("note.txt")).unwrap(), b"short note");
}

#[tokio::test]
async fn refuses_when_session_table_is_full() {
    let root = temp_root("busy");
    std::fs::write(root.join("f.bin"), vec![0u8; 600]).unwrap();
    let mut config = test_config(root);
    config.max_sessions = 1;
    let server = start_server(config).await;

    // First client takes the only slot and withholds its ACK.
    let first = client().await;
    first
        .send_to(&request(1, "f.bin", "octet", &[]), server)
        .await
        .unwrap();
    let (data1, _) = recv(&first).await;
    assert_eq!(opcode_of(&data1), OP_DATA);

    // Second client is turned away on the main socket.
    let second = client().await;
    second
        .send_to(&request(1, "f.bin", "octet", &[]), server)
        .await
        .unwrap();
    let (err, from) = recv(&second).await;
    assert_eq!(from, server, "busy refusal comes from the main socket");
    assert_eq!(opcode_of(&err), OP_ERROR);
    assert_eq!(block_of(&err), 0); // NOT_DEFINED
    assert_eq!(&err[4..], b"Server busy\0");
}

#[tokio::test]
async fn impostor_gets_unknown_tid_error() {
    let root = temp_root("tid");
    std::fs::write(root.join("two.bin"), vec![9u8; 600]).unwrap();
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    sock.send_to(&request(1, "two.bin", "octet", &[]), server)
        .await
        .unwrap();
    let (data1, session) = recv(&sock).await;
    assert_eq!(block_of(&data1), 1);

    // A different socket hits the session's transfer ID.
    let impostor = client().await;
    impostor.send_to(&ack(1), session).await.unwrap();
    let (err, _) = recv(&impostor).await;
    assert_eq!(opcode_of(&err), OP_ERROR);
    assert_eq!(block_of(&err), 5); // UNKNOWN_TID

    // The real client is unaffected.
    sock.send_to(&ack(1), session).await.unwrap();
    let (data2, _) = recv(&sock).await;
    assert_eq!((opcode_of(&data2), block_of(&data2)), (OP_DATA, 2));
    sock.send_to(&ack(2), session).await.unwrap();
}

#[tokio::test]
async fn rejects_unsupported_mode() {
    let root = temp_root("mode");
    std::fs::write(root.join("f.txt"), b"x").unwrap();
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    sock.send_to(&request(1, "f.txt", "mail", &[]), server)
        .await
        .unwrap();
    let (err, _) = recv(&sock).await;
    assert_eq!(opcode_of(&err), OP_ERROR);
    assert_eq!(block_of(&err), 4); // ILLEGAL_OPERATION
}

#[tokio::test]
async fn rejects_path_traversal() {
    let root = temp_root("traversal");
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    sock.send_to(&request(1, "../../etc/passwd", "octet", &[]), server)
        .await
        .unwrap();
    let (err, _) = recv(&sock).await;
    assert_eq!(opcode_of(&err), OP_ERROR);
    assert_eq!(block_of(&err), 2); // ACCESS_VIOLATION
}

#[tokio::test]
async fn missing_file_yields_file_not_found() {
    let root = temp_root("missing");
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    sock.send_to(&request(1, "nope.bin", "octet", &[]), server)
        .await
        .unwrap();
    let (err, _) = recv(&sock).await;
    assert_eq!(opcode_of(&err), OP_ERROR);
    assert_eq!(block_of(&err), 1); // FILE_NOT_FOUND
}

#[tokio::test]
async fn retransmits_after_silence() {
    let root = temp_root("retransmit");
    std::fs::write(root.join("slow.bin"), b"needs patience").unwrap();
    let mut config = test_config(root);
    config.timeout_secs = 1;
    let server = start_server(config).await;

    let sock = client().await;
    sock.send_to(&request(1, "slow.bin", "octet", &[]), server)
        .await
        .unwrap();

    let (data1, session) = recv(&sock).await;
    assert_eq!(block_of(&data1), 1);

    // Withhold the ACK; the same DATA block comes again.
    let (again, _) = recv(&sock).await;
    assert_eq!(again, data1);

    sock.send_to(&ack(1), session).await.unwrap();
}

#[tokio::test]
async fn abandons_session_after_retry_exhaustion() {
    let root = temp_root("abandon");
    std::fs::write(root.join("f.bin"), vec![5u8; 600]).unwrap();
    let mut config = test_config(root);
    config.timeout_secs = 1;
    config.max_sessions = 1;
    let server = start_server(config).await;

    let sock = client().await;
    sock.send_to(&request(1, "f.bin", "octet", &[]), server)
        .await
        .unwrap();
    let (data1, _) = recv(&sock).await;
    assert_eq!(block_of(&data1), 1);

    // One identical retransmission per missed window, three in total.
    for attempt in 1..=3 {
        let (again, _) = recv(&sock).await;
        assert_eq!(again, data1, "retransmission {}", attempt);
    }

    // The fourth missed window abandons the session without a final ERROR.
    let mut buf = vec![0u8; 2048];
    let outcome =
        tokio::time::timeout(Duration::from_millis(2500), sock.recv_from(&mut buf)).await;
    assert!(outcome.is_err(), "abandoned session must go silent");

    // The only slot was released, so the same client can start over.
    sock.send_to(&request(1, "f.bin", "octet", &[]), server)
        .await
        .unwrap();
    let (fresh, session) = recv(&sock).await;
    assert_eq!((opcode_of(&fresh), block_of(&fresh)), (OP_DATA, 1));
    sock.send_to(&ack(1), session).await.unwrap();
}

#[tokio::test]
async fn duplicate_request_from_same_address_is_dropped() {
    let root = temp_root("duplicate");
    std::fs::write(root.join("f.bin"), vec![3u8; 600]).unwrap();
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    sock.send_to(&request(1, "f.bin", "octet", &[]), server)
        .await
        .unwrap();
    let (data1, session) = recv(&sock).await;
    assert_eq!(block_of(&data1), 1);

    // A second request from the same address while the session lives
    // gets no reply at all.
    sock.send_to(&request(1, "f.bin", "octet", &[]), server)
        .await
        .unwrap();
    let mut buf = vec![0u8; 2048];
    let outcome =
        tokio::time::timeout(Duration::from_millis(300), sock.recv_from(&mut buf)).await;
    assert!(outcome.is_err(), "duplicate request must be ignored");

    sock.send_to(&ack(1), session).await.unwrap();
    let (data2, _) = recv(&sock).await;
    assert_eq!(block_of(&data2), 2);
    sock.send_to(&ack(2), session).await.unwrap();
}

#[tokio::test]
async fn non_request_opcode_is_refused() {
    let root = temp_root("badop");
    let server = start_server(test_config(root)).await;

    let sock = client().await;
    sock.send_to(&ack(1), server).await.unwrap();
    let (err, from) = recv(&sock).await;
    assert_ne!(from, server, "refusal comes from an ephemeral socket");
    assert_eq!(opcode_of(&err), OP_ERROR);
    assert_eq!(block_of(&err), 4); // ILLEGAL_OPERATION
}
