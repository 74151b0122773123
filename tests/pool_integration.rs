//! End-to-end tests against a fake CQL server speaking just enough of the protocol
//! (`STARTUP`/`READY`/`QUERY`/`RESULT`/`ERROR`) to exercise the real connection and pool machinery.

use std::time::Duration;

use tassandra::{Cluster, ClusterOptions};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

const HEADER_LEN: usize = 9;
const OPCODE_ERROR: u8 = 0x00;
const OPCODE_STARTUP: u8 = 0x01;
const OPCODE_READY: u8 = 0x02;
const OPCODE_QUERY: u8 = 0x07;
const OPCODE_RESULT: u8 = 0x08;

async fn read_frame(stream: &mut TcpStream) -> (u8, i16, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let stream_id = i16::from_be_bytes([header[2], header[3]]);
    let opcode = header[4];
    let len = i32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    (opcode, stream_id, body)
}

async fn write_frame(stream: &mut TcpStream, stream_id: i16, opcode: u8, body: &[u8]) {
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(4); // version
    frame.push(0); // flags
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.push(opcode);
    frame.extend_from_slice(&(body.len() as i32).to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).await.unwrap();
}

fn void_result_body() -> Vec<u8> {
    1i32.to_be_bytes().to_vec()
}

fn error_body(code: i32, message: &str) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(&(message.len() as u16).to_be_bytes());
    body.extend_from_slice(message.as_bytes());
    body
}

async fn accept_and_handshake(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let (opcode, stream_id, _body) = read_frame(&mut stream).await;
    assert_eq!(opcode, OPCODE_STARTUP);
    write_frame(&mut stream, stream_id, OPCODE_READY, &[]).await;
    stream
}

#[tokio::test]
async fn executes_a_query_and_decodes_a_void_result() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut stream = accept_and_handshake(&listener).await;
        let (opcode, stream_id, _body) = read_frame(&mut stream).await;
        assert_eq!(opcode, OPCODE_QUERY);
        write_frame(&mut stream, stream_id, OPCODE_RESULT, &void_result_body()).await;
    });

    let options = ClusterOptions::builder()
        .contact_points(vec![addr.to_string()])
        .build();
    let cluster = Cluster::init(options).await.unwrap();

    let result = cluster.execute("INSERT INTO t (k) VALUES (1)").await.unwrap();
    assert!(result.rows().is_none());

    cluster.close();
    server.await.unwrap();
}

#[tokio::test]
async fn backend_error_surfaces_as_backend_error_kind() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut stream = accept_and_handshake(&listener).await;
        let (opcode, stream_id, _body) = read_frame(&mut stream).await;
        assert_eq!(opcode, OPCODE_QUERY);
        write_frame(
            &mut stream,
            stream_id,
            OPCODE_ERROR,
            &error_body(0x2200, "invalid query"),
        )
        .await;
    });

    let options = ClusterOptions::builder()
        .contact_points(vec![addr.to_string()])
        .build();
    let cluster = Cluster::init(options).await.unwrap();

    let err = cluster.execute("SELECT * FROM nonexistent").await.unwrap_err();
    assert!(matches!(err.kind.as_ref(), tassandra::ErrorKind::Backend { code, .. } if *code == 0x2200));

    cluster.close();
    server.await.unwrap();
}

#[tokio::test]
async fn request_timeout_is_reported_after_retry_budget_is_exhausted() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // Accept the handshake but never answer the query: every attempt times out.
        let _stream = accept_and_handshake(&listener).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let options = ClusterOptions::builder()
        .contact_points(vec![addr.to_string()])
        .default_timeouts(vec![Duration::from_millis(50), Duration::from_millis(50)])
        .build();
    let cluster = Cluster::init(options).await.unwrap();

    let err = cluster.execute("SELECT * FROM t").await.unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("2 of 2 retries"),
        "expected retry-exhaustion message, got: {message}"
    );

    cluster.close();
    server.abort();
}

#[tokio::test]
async fn a_request_fails_over_to_another_contact_point_when_one_is_down() {
    // One contact point that never accepts a connection, one real server: every request must
    // eventually land on the live one regardless of which connection gets tried first.
    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener); // nothing is listening on this address anymore

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut stream = accept_and_handshake(&listener).await;
        let (opcode, stream_id, _body) = read_frame(&mut stream).await;
        assert_eq!(opcode, OPCODE_QUERY);
        write_frame(&mut stream, stream_id, OPCODE_RESULT, &void_result_body()).await;
    });

    let options = ClusterOptions::builder()
        .contact_points(vec![dead_addr.to_string(), addr.to_string()])
        .default_timeouts(vec![Duration::from_millis(200); 3])
        .build();
    let cluster = Cluster::init(options).await.unwrap();

    let result = cluster.execute("INSERT INTO t (k) VALUES (1)").await.unwrap();
    assert!(result.rows().is_none());

    cluster.close();
    server.await.unwrap();
}
