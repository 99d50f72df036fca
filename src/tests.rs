use crate::compression::{Decoder, Encoder};
use crate::config::{ClientConfig, WebSocketConfig};
use crate::connection::{ConnectionState, WSConnection};
use crate::error::Error;
use crate::extensions::Extensions;
use crate::frame::{apply_mask, CloseCode, ClosePayload, Frame, OpCode};
use crate::handshake::{connect_async, connect_async_with_config, establish};
use crate::message::Message;
use crate::request::{construct_http_request, HttpRequest};
use crate::server::WebSocketServer;
use crate::service::{SessionHandle, WebSocketBehavior};
use crate::session::{Session, SessionManager};
use crate::stream::MeshStream;
use crate::utf8::Utf8Validator;
use crate::utils::generate_websocket_accept_value;
use crate::write::WriterKind;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), server.unwrap().0)
}

fn open_connection(
    stream: TcpStream,
    kind: WriterKind,
    config: WebSocketConfig,
    extensions: Option<Extensions>,
) -> WSConnection {
    let (read_half, write_half) = split(MeshStream::Plain(stream));
    establish(
        BufReader::new(read_half),
        write_half,
        kind,
        config,
        extensions,
        None,
    )
}

// A connected client/server pair with the handshake already behind them.
async fn connected_pair(
    config: WebSocketConfig,
    extensions: Option<Extensions>,
) -> (WSConnection, WSConnection) {
    let (client_tcp, server_tcp) = tcp_pair().await;
    let client = open_connection(
        client_tcp,
        WriterKind::Client,
        config.clone(),
        extensions.clone(),
    );
    let server = open_connection(server_tcp, WriterKind::Server, config, extensions);
    (client, server)
}

// A server-side connection talking to a bare TCP socket, for byte-level
// protocol tests.
async fn server_with_raw_peer(config: WebSocketConfig) -> (WSConnection, TcpStream) {
    let (client_tcp, server_tcp) = tcp_pair().await;
    let server = open_connection(server_tcp, WriterKind::Server, config, None);
    (server, client_tcp)
}

// ---------------------------------------------------------------------------
// codec units
// ---------------------------------------------------------------------------

#[test]
fn test_opcode() {
    let byte = 0x0;
    let res = OpCode::from(byte).unwrap();
    assert_eq!(res, OpCode::Continue);

    let opcode = OpCode::Text;
    let op_byte = opcode.as_u8();
    assert_eq!(op_byte, 0x1);

    assert!(OpCode::Close.is_control());
    assert!(!OpCode::Text.is_control());
    assert!(matches!(OpCode::from(0x3), Err(Error::InvalidOpcode)));
}

#[test]
fn test_masking_involution() {
    let mask = [0x37, 0xFA, 0x21, 0x3D];
    let original: Vec<u8> = (0..=255).collect();
    let mut payload = original.clone();

    apply_mask(&mut payload, mask);
    assert_ne!(payload, original);
    apply_mask(&mut payload, mask);
    assert_eq!(payload, original);
}

#[test]
fn test_accept_key_derivation() {
    // Known vector from RFC 6455 section 1.3
    let accept = generate_websocket_accept_value("dGhlIHNhbXBsZSBub25jZQ==");
    assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

#[test]
fn test_close_payload_parse() {
    let (code, reason) = match ClosePayload::parse(&[0x03, 0xE8, b'o', b'k']).unwrap() {
        Some(payload) => (payload.code, payload.reason),
        None => panic!("expected a payload"),
    };
    assert_eq!(code, 1000);
    assert_eq!(reason, "ok");

    assert!(ClosePayload::parse(&[]).unwrap().is_none());
    assert!(matches!(
        ClosePayload::parse(&[0x03]),
        Err(Error::InvalidPayloadLength)
    ));
    assert!(matches!(
        ClosePayload::parse(&[0x03, 0xE8, 0xFF, 0xFE]),
        Err(Error::FromUtf8Error { .. })
    ));
}

#[test]
fn test_close_payload_truncates_reason() {
    let long_reason = "x".repeat(200);
    let bytes = ClosePayload::new(1000, long_reason).to_bytes();
    assert_eq!(bytes.len(), 125);
    assert_eq!(&bytes[..2], &[0x03, 0xE8]);
}

#[test]
fn test_reserved_close_codes_rejected() {
    for code in [
        CloseCode::NO_STATUS,
        CloseCode::ABNORMAL,
        CloseCode::TLS_HANDSHAKE,
    ] {
        assert!(matches!(
            Frame::close(code, ""),
            Err(Error::InvalidCloseCode(_))
        ));
    }
    assert!(Frame::close(CloseCode::NORMAL, "bye").is_ok());
}

#[test]
fn test_control_frame_payload_cap() {
    assert!(Frame::ping(vec![0; 125]).is_ok());
    assert!(matches!(
        Frame::ping(vec![0; 126]),
        Err(Error::ControlFramePayloadSize)
    ));
    assert!(matches!(
        Frame::pong(vec![0; 126]),
        Err(Error::ControlFramePayloadSize)
    ));
}

// ---------------------------------------------------------------------------
// UTF-8 validation
// ---------------------------------------------------------------------------

#[test]
fn test_utf8_validator_split_code_point() {
    // "é" = 0xC3 0xA9 split across two fragments
    let mut validator = Utf8Validator::new();
    validator.push(b"caf\xC3").unwrap();
    validator.push(b"\xA9 au lait").unwrap();
    validator.finish().unwrap();
}

#[test]
fn test_utf8_validator_rejects_invalid_byte() {
    let mut validator = Utf8Validator::new();
    assert!(validator.push(&[0xFF]).is_err());
}

#[test]
fn test_utf8_validator_rejects_dangling_partial() {
    let mut validator = Utf8Validator::new();
    validator.push(b"ok\xE2\x82").unwrap();
    assert!(matches!(validator.finish(), Err(Error::InvalidUtf8)));
}

// ---------------------------------------------------------------------------
// permessage-deflate
// ---------------------------------------------------------------------------

#[test]
fn test_compression_roundtrip() {
    let mut encoder = Encoder::new(true, None);
    let mut decoder = Decoder::new(true, None);

    let payload = b"the quick brown fox jumps over the lazy dog".repeat(100);
    let compressed = encoder.compress(&payload).unwrap();
    assert!(compressed.len() < payload.len());

    let inflated = decoder.decompress(&compressed).unwrap();
    assert_eq!(inflated, payload);

    // Contexts are stateless per message: a second message round-trips the
    // same way.
    let second = encoder.compress(&payload).unwrap();
    assert_eq!(decoder.decompress(&second).unwrap(), payload);
}

#[test]
fn test_decompression_rejects_garbage() {
    let mut decoder = Decoder::new(true, None);
    assert!(decoder.decompress(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
}

#[test]
fn test_extensions_parse_and_merge() {
    let parsed = Extensions::parse("permessage-deflate; client_max_window_bits=10").unwrap();
    assert!(parsed.permessage_deflate);
    assert_eq!(parsed.client_max_window_bits, Some(10));

    assert!(Extensions::parse("x-webkit-deflate-frame").is_none());

    let local = Extensions {
        permessage_deflate: true,
        client_max_window_bits: Some(12),
        ..Default::default()
    };
    let merged = Extensions::merge(Some(local), Some(parsed)).unwrap();
    assert_eq!(merged.client_max_window_bits, Some(10));

    assert!(Extensions::merge(None, Some(Extensions::deflate())).is_none());
}

#[test]
fn test_extensions_window_bits_validation() {
    let bad = Extensions {
        permessage_deflate: true,
        server_max_window_bits: Some(7),
        ..Default::default()
    };
    assert!(matches!(bad.validate(), Err(Error::InvalidMaxWindowBits)));
    assert!(Extensions::deflate().validate().is_ok());
}

// ---------------------------------------------------------------------------
// handshake plumbing
// ---------------------------------------------------------------------------

#[test]
fn test_construct_http_request_valid() {
    let config = ClientConfig::default();
    let (request, host_with_port, _, use_tls) =
        construct_http_request("ws://localhost:8080", "dGhlIHNhbXBsZSBub25jZQ==", &config).unwrap();
    assert_eq!(host_with_port, "localhost:8080");
    assert!(!use_tls);
    assert!(request.starts_with("GET / HTTP/1.1"));
    assert!(request.contains("Host: localhost:8080"));
    assert!(request.contains("Upgrade: websocket"));
    assert!(request.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ=="));
    assert!(request.ends_with("\r\n\r\n"));
}

#[test]
fn test_construct_http_request_negotiation_headers() {
    let config = ClientConfig {
        subprotocols: vec!["chat".into(), "superchat".into()],
        origin: Some("http://example.com".into()),
        web_socket_config: WebSocketConfig {
            extensions: Some(Extensions::deflate()),
            ..Default::default()
        },
        ..Default::default()
    };
    let (request, _, _, _) =
        construct_http_request("ws://localhost:8080/chat?room=1", "a2V5", &config).unwrap();
    assert!(request.starts_with("GET /chat?room=1 HTTP/1.1"));
    assert!(request.contains("Origin: http://example.com"));
    assert!(request.contains("Sec-WebSocket-Protocol: chat, superchat"));
    assert!(request.contains("Sec-WebSocket-Extensions: permessage-deflate"));
}

#[test]
fn test_construct_http_request_invalid() {
    let config = ClientConfig::default();
    assert!(construct_http_request("ftp://localhost:8080", "a2V5", &config).is_err());
    assert!(construct_http_request("ws://:8080", "a2V5", &config).is_err());
}

#[tokio::test]
async fn test_http_request_parsing() {
    let raw = b"GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: a2V5\r\nSec-WebSocket-Version: 13\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let request = HttpRequest::read_from(&mut reader, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(request.method, "GET");
    assert_eq!(request.uri, "/chat");
    assert!(request.is_websocket_upgrade());
    assert!(request.header_contains("connection", "upgrade"));
    assert_eq!(request.header("sec-websocket-key"), Some("a2V5"));
}

#[tokio::test]
async fn test_http_request_not_an_upgrade() {
    let raw = b"POST /chat HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let request = HttpRequest::read_from(&mut reader, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!request.is_websocket_upgrade());
}

// ---------------------------------------------------------------------------
// connection pairs: data flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_echo_roundtrip() {
    let (mut client, mut server) = connected_pair(WebSocketConfig::default(), None).await;

    client.send_as_text("Hello".to_string()).await.unwrap();
    match server.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, "Hello"),
        other => panic!("unexpected message {:?}", other),
    }

    server.send_as_binary(vec![1, 2, 3]).await.unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Binary(data) => assert_eq!(data, vec![1, 2, 3]),
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_fragmentation_roundtrip() {
    let config = WebSocketConfig {
        fragment_size: Some(16),
        ..Default::default()
    };
    let (mut client, mut server) = connected_pair(config, None).await;

    let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
    client.send_as_binary(payload.clone()).await.unwrap();

    match server.next().await.unwrap().unwrap() {
        Message::Binary(data) => assert_eq!(data, payload),
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_streamed_binary_roundtrip() {
    let config = WebSocketConfig {
        fragment_size: Some(16384),
        ..Default::default()
    };
    let (mut client, mut server) = connected_pair(config, None).await;

    let payload = vec![0x7B_u8; 1_000_000];
    client.send_stream(&payload[..]).await.unwrap();

    match server.next().await.unwrap().unwrap() {
        Message::Binary(data) => {
            assert_eq!(data.len(), 1_000_000);
            assert!(data.iter().all(|byte| *byte == 0x7B));
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_compressed_text_roundtrip() {
    let config = WebSocketConfig {
        fragment_size: Some(1024),
        extensions: Some(Extensions::deflate()),
        ..Default::default()
    };
    let (mut client, mut server) = connected_pair(config, Some(Extensions::deflate())).await;

    // Highly compressible 64 KiB payload, fragmented on the wire.
    let payload = "all work and no play makes jack a dull boy\n".repeat(1600);
    client.send_as_text(payload.clone()).await.unwrap();

    match server.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, payload),
        other => panic!("unexpected message {:?}", other),
    }

    // And back, server to client.
    server.send_as_text(payload.clone()).await.unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, payload),
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let (mut client, _server) = connected_pair(WebSocketConfig::default(), None).await;
    assert!(client.ping(Some(b"hey".to_vec())).await.unwrap());
}

// ---------------------------------------------------------------------------
// connection pairs: close handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_close_handshake() {
    let (mut client, mut server) = connected_pair(WebSocketConfig::default(), None).await;

    client.close(CloseCode::NORMAL, "bye").await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    match server.next().await.unwrap().unwrap() {
        Message::Close(Some(payload)) => {
            assert_eq!(payload.code, CloseCode::NORMAL);
            assert_eq!(payload.reason, "bye");
        }
        other => panic!("unexpected message {:?}", other),
    }

    // No application sends are accepted once the connection is down.
    assert!(matches!(
        client.send_as_text("late".to_string()).await,
        Err(Error::ConnectionClosing) | Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (mut client, _server) = connected_pair(WebSocketConfig::default(), None).await;
    client.close(CloseCode::NORMAL, "").await.unwrap();
    // Second close collapses into a no-op.
    client.close(CloseCode::NORMAL, "").await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_fragments_starting_during_closing_are_discarded() {
    let (server, mut raw) = server_with_raw_peer(WebSocketConfig::default()).await;
    let (mut reader, mut writer) = server.split();

    // The local side initiates the close and waits for the peer's echo.
    let close_task = tokio::spawn(async move {
        writer.close(CloseCode::NORMAL, "").await.unwrap();
        writer
    });

    // The peer sees the close frame first, so everything it sends below
    // arrives while the local state is Closing.
    let mut close_frame = [0u8; 4];
    raw.read_exact(&mut close_frame).await.unwrap();
    assert_eq!(close_frame[0], 0x88);

    // A fragmented message started during Closing: both frames must be
    // discarded without failing the connection, continuation included.
    raw.write_all(&[0x01, 0x82, 0, 0, 0, 0, b'h', b'i'])
        .await
        .unwrap();
    raw.write_all(&[0x80, 0x82, 0, 0, 0, 0, b'y', b'o'])
        .await
        .unwrap();
    // The peer finally echoes the close.
    raw.write_all(&[0x88, 0x82, 0, 0, 0, 0, 0x03, 0xE8])
        .await
        .unwrap();

    let writer = close_task.await.unwrap();
    assert_eq!(writer.state(), ConnectionState::Closed);

    // The reader surfaces only the close; neither the discarded text nor
    // an error ever shows up.
    match reader.next().await.unwrap().unwrap() {
        Message::Close(Some(payload)) => assert_eq!(payload.code, CloseCode::NORMAL),
        other => panic!("unexpected message {:?}", other),
    }
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn test_close_timeout_forces_closed() {
    let (client_tcp, server_tcp) = tcp_pair().await;
    let config = WebSocketConfig {
        close_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let mut client = open_connection(client_tcp, WriterKind::Client, config, None);

    // The peer never answers the close frame.
    let started = Instant::now();
    client.close(CloseCode::NORMAL, "").await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.state(), ConnectionState::Closed);
    drop(server_tcp);
}

// ---------------------------------------------------------------------------
// raw byte-level protocol checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_invalid_opcode_closes_with_1002() {
    let (mut server, mut raw) = server_with_raw_peer(WebSocketConfig::default()).await;

    // fin=1, opcode=0x3 (reserved), masked, empty payload
    raw.write_all(&[0x83, 0x80, 0, 0, 0, 0]).await.unwrap();

    assert!(matches!(
        server.next().await.unwrap(),
        Err(Error::InvalidOpcode)
    ));

    // The failing side reports 1002 Protocol Error on the wire.
    let mut close_frame = [0u8; 4];
    raw.read_exact(&mut close_frame).await.unwrap();
    assert_eq!(close_frame[0], 0x88);
    assert_eq!(close_frame[1], 0x02);
    assert_eq!(u16::from_be_bytes([close_frame[2], close_frame[3]]), 1002);
}

#[tokio::test]
async fn test_rsv_bit_without_extension_is_fatal() {
    let (mut server, mut raw) = server_with_raw_peer(WebSocketConfig::default()).await;

    // fin=1, rsv1=1, opcode=text, masked, empty payload: no extension was
    // negotiated, so rsv1 must fail the connection
    raw.write_all(&[0xC1, 0x80, 0, 0, 0, 0]).await.unwrap();

    assert!(matches!(server.next().await.unwrap(), Err(Error::RSVNotZero)));
}

#[tokio::test]
async fn test_unmasked_client_frame_is_fatal() {
    let (mut server, mut raw) = server_with_raw_peer(WebSocketConfig::default()).await;

    // Client-to-server frames must be masked.
    raw.write_all(&[0x81, 0x00]).await.unwrap();

    assert!(matches!(
        server.next().await.unwrap(),
        Err(Error::InvalidMaskBit)
    ));
}

#[tokio::test]
async fn test_fragmented_control_frame_is_fatal() {
    let (mut server, mut raw) = server_with_raw_peer(WebSocketConfig::default()).await;

    // fin=0 ping
    raw.write_all(&[0x09, 0x80, 0, 0, 0, 0]).await.unwrap();

    assert!(matches!(
        server.next().await.unwrap(),
        Err(Error::ControlFramesFragmented)
    ));
}

#[tokio::test]
async fn test_control_frame_between_fragments() {
    let (mut server, mut raw) = server_with_raw_peer(WebSocketConfig::default()).await;

    // Text "He" fin=0, then a Ping, then the final continuation "llo". A
    // zero masking key leaves payload bytes unchanged on the wire.
    raw.write_all(&[0x01, 0x82, 0, 0, 0, 0, b'H', b'e'])
        .await
        .unwrap();
    raw.write_all(&[0x89, 0x81, 0, 0, 0, 0, b'x']).await.unwrap();
    raw.write_all(&[0x80, 0x83, 0, 0, 0, 0, b'l', b'l', b'o'])
        .await
        .unwrap();

    // The ping is answered inline without disturbing the assembly.
    let mut pong = [0u8; 3];
    raw.read_exact(&mut pong).await.unwrap();
    assert_eq!(pong, [0x8A, 0x01, b'x']);

    match server.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, "Hello"),
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_data_frame_during_assembly_is_fatal() {
    let (mut server, mut raw) = server_with_raw_peer(WebSocketConfig::default()).await;

    raw.write_all(&[0x01, 0x81, 0, 0, 0, 0, b'a']).await.unwrap();
    // A fresh Text frame while a fragmented message is in progress
    raw.write_all(&[0x81, 0x81, 0, 0, 0, 0, b'b']).await.unwrap();

    assert!(matches!(
        server.next().await.unwrap(),
        Err(Error::InvalidFrameFragmentation)
    ));
}

#[tokio::test]
async fn test_invalid_utf8_text_closes_with_1007() {
    let (mut server, mut raw) = server_with_raw_peer(WebSocketConfig::default()).await;

    raw.write_all(&[0x81, 0x82, 0, 0, 0, 0, 0xFF, 0xFE])
        .await
        .unwrap();

    let error = server.next().await.unwrap().unwrap_err();
    assert_eq!(error.close_code(), CloseCode::INVALID_PAYLOAD);
}

// ---------------------------------------------------------------------------
// session manager
// ---------------------------------------------------------------------------

async fn managed_session(manager: &SessionManager) -> (WSConnection, String) {
    let (client_tcp, server_tcp) = tcp_pair().await;
    let client = open_connection(
        client_tcp,
        WriterKind::Client,
        WebSocketConfig::default(),
        None,
    );
    let server = open_connection(
        server_tcp,
        WriterKind::Server,
        WebSocketConfig::default(),
        None,
    );

    let (_reader, writer) = server.split();
    let core = writer.core();
    let id = crate::session::generate_session_id();
    let session = Session::new(id.clone(), Arc::new(Mutex::new(writer)), core);
    manager.add(session).unwrap();
    (client, id)
}

#[tokio::test]
async fn test_session_ids_are_32_hex_chars() {
    let id = crate::session::generate_session_id();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_broadcast_reaches_every_open_session() {
    let manager = SessionManager::new(Duration::from_secs(1));
    manager.start();

    let (mut client_a, _) = managed_session(&manager).await;
    let (mut client_b, _) = managed_session(&manager).await;
    assert_eq!(manager.len(), 2);

    manager.broadcast_text("hi").await;

    for client in [&mut client_a, &mut client_b] {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text, "hi"),
            other => panic!("unexpected message {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_broadping_collects_answers() {
    let manager = SessionManager::new(Duration::from_secs(1));
    manager.start();

    let (_client_a, id_a) = managed_session(&manager).await;
    let (_client_b, id_b) = managed_session(&manager).await;

    let answers = manager.broadping(None).await;
    assert_eq!(answers.len(), 2);
    assert_eq!(answers.get(&id_a), Some(&true));
    assert_eq!(answers.get(&id_b), Some(&true));
}

#[tokio::test]
async fn test_manager_stop_drains_sessions() {
    let manager = SessionManager::new(Duration::from_secs(1));
    manager.start();

    let (mut client, _) = managed_session(&manager).await;

    manager.stop(CloseCode::AWAY, "draining").await;
    assert_eq!(manager.state(), crate::session::ManagerState::Stop);
    assert!(manager.is_empty());

    match client.next().await.unwrap().unwrap() {
        Message::Close(Some(payload)) => {
            assert_eq!(payload.code, CloseCode::AWAY);
            assert_eq!(payload.reason, "draining");
        }
        other => panic!("unexpected message {:?}", other),
    }

    // A drained manager admits nobody.
    let (client_tcp, server_tcp) = tcp_pair().await;
    let server = open_connection(
        server_tcp,
        WriterKind::Server,
        WebSocketConfig::default(),
        None,
    );
    let (_reader, writer) = server.split();
    let core = writer.core();
    let session = Session::new(
        crate::session::generate_session_id(),
        Arc::new(Mutex::new(writer)),
        core,
    );
    assert!(matches!(
        manager.add(session),
        Err(Error::ManagerNotAccepting)
    ));
    drop(client_tcp);
}

// ---------------------------------------------------------------------------
// full server
// ---------------------------------------------------------------------------

struct EchoService;

#[async_trait]
impl WebSocketBehavior for EchoService {
    async fn on_message(&mut self, session: &SessionHandle, message: Message) {
        let _ = session.send_message(message).await;
    }

    fn select_subprotocol(&self, offered: &[&str]) -> Option<String> {
        offered.first().map(|proto| proto.to_string())
    }
}

#[tokio::test]
async fn test_server_echo_end_to_end() {
    let server = WebSocketServer::new(None);
    server.add_service("/echo", || Box::new(EchoService));
    let addr = server.start(0).await.unwrap();

    let url = format!("ws://127.0.0.1:{}/echo", addr.port());
    let mut connection = connect_async(&url).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Open);

    connection.send_as_text("Hello".to_string()).await.unwrap();
    match connection.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, "Hello"),
        other => panic!("unexpected message {:?}", other),
    }

    connection.close(CloseCode::NORMAL, "").await.unwrap();
    server.stop(CloseCode::AWAY, "").await;
}

#[tokio::test]
async fn test_server_unknown_path_is_404() {
    let server = WebSocketServer::new(None);
    server.add_service("/echo", || Box::new(EchoService));
    let addr = server.start(0).await.unwrap();

    let url = format!("ws://127.0.0.1:{}/nope", addr.port());
    assert!(matches!(
        connect_async(&url).await,
        Err(Error::HandshakeFailed(404))
    ));

    server.stop(CloseCode::AWAY, "").await;
}

#[tokio::test]
async fn test_server_trailing_slash_resolves() {
    let server = WebSocketServer::new(None);
    server.add_service("/echo/", || Box::new(EchoService));
    let addr = server.start(0).await.unwrap();

    let url = format!("ws://127.0.0.1:{}/echo", addr.port());
    assert!(connect_async(&url).await.is_ok());

    server.stop(CloseCode::AWAY, "").await;
}

#[tokio::test]
async fn test_subprotocol_negotiation() {
    let server = WebSocketServer::new(None);
    server.add_service("/echo", || Box::new(EchoService));
    let addr = server.start(0).await.unwrap();

    let config = ClientConfig {
        subprotocols: vec!["chat".into(), "superchat".into()],
        ..Default::default()
    };
    let url = format!("ws://127.0.0.1:{}/echo", addr.port());
    let connection = connect_async_with_config(&url, Some(config)).await.unwrap();
    assert_eq!(connection.subprotocol(), Some("chat"));

    server.stop(CloseCode::AWAY, "").await;
}

struct NoStrangers;

#[async_trait]
impl WebSocketBehavior for NoStrangers {
    fn validate_origin(&self, origin: Option<&str>) -> bool {
        origin == Some("http://trusted.example")
    }
}

#[tokio::test]
async fn test_origin_validator_rejects_with_403() {
    let server = WebSocketServer::new(None);
    server.add_service("/guarded", || Box::new(NoStrangers));
    let addr = server.start(0).await.unwrap();
    let url = format!("ws://127.0.0.1:{}/guarded", addr.port());

    let config = ClientConfig {
        origin: Some("http://evil.example".into()),
        ..Default::default()
    };
    assert!(matches!(
        connect_async_with_config(&url, Some(config)).await,
        Err(Error::HandshakeFailed(403))
    ));

    let config = ClientConfig {
        origin: Some("http://trusted.example".into()),
        ..Default::default()
    };
    assert!(connect_async_with_config(&url, Some(config)).await.is_ok());

    server.stop(CloseCode::AWAY, "").await;
}
