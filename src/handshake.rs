use crate::compression::{Decoder, Encoder};
use crate::config::{ClientConfig, WebSocketConfig, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::connection::{ConnectionCore, ConnectionState, WSConnection};
use crate::error::Error;
use crate::extensions::Extensions;
use crate::read::ReadStream;
use crate::request::{construct_http_request, HttpRequest, HttpResponse};
use crate::split::{WSReader, WSWriter};
use crate::stream::MeshStream;
use crate::utils::{generate_websocket_accept_value, generate_websocket_key};
use crate::write::{Writer, WriterKind};
use std::sync::Arc;
use tokio::io::{split, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_rustls::{TlsConnector, TlsStream};

const READ_CHANNEL_CAPACITY: usize = 100;

/// Accepts a plain TCP socket as a WebSocket server connection with the
/// default configuration.
pub async fn accept_async(stream: TcpStream) -> Result<WSConnection, Error> {
    accept_async_with_config(MeshStream::Plain(stream), None).await
}

/// Accepts an already-wrapped byte stream (plain or TLS) as a WebSocket
/// server connection: reads the HTTP request, validates the upgrade,
/// negotiates permessage-deflate, answers 101 and spawns the receive
/// driver.
pub async fn accept_async_with_config(
    stream: MeshStream,
    config: Option<WebSocketConfig>,
) -> Result<WSConnection, Error> {
    let config = config.unwrap_or_default();
    let (read_half, mut write_half) = split(stream);
    let mut buf_reader = BufReader::new(read_half);

    let request = HttpRequest::read_from(&mut buf_reader, DEFAULT_HANDSHAKE_TIMEOUT).await?;

    if let Err(error) = validate_upgrade_request(&request) {
        let status = match error {
            Error::UnsupportedWebsocketVersion(_) => {
                // Advertise the only version this endpoint talks.
                let response =
                    "HTTP/1.1 400 Bad Request\r\nSec-WebSocket-Version: 13\r\nContent-Length: 0\r\n\r\n";
                let _ = write_half.write_all(response.as_bytes()).await;
                return Err(error);
            }
            _ => http_error_response(400, "Bad Request"),
        };
        let _ = write_half.write_all(status.as_bytes()).await;
        return Err(error);
    }

    let key = request
        .header("sec-websocket-key")
        .ok_or(Error::NoSecWebsocketKey)?;
    let accept_value = generate_websocket_accept_value(key);

    let extensions = negotiate_extensions(
        config.extensions.clone(),
        request.header("sec-websocket-extensions"),
    )?;

    let response = build_accept_response(&accept_value, None, extensions.as_ref());
    write_half.write_all(response.as_bytes()).await?;

    Ok(establish(
        buf_reader,
        write_half,
        WriterKind::Server,
        config,
        extensions,
        None,
    ))
}

/// Connects to a ws:// or wss:// URL with the default configuration.
pub async fn connect_async(ws_url: &str) -> Result<WSConnection, Error> {
    connect_async_with_config(ws_url, None).await
}

/// Connects to a ws:// or wss:// URL: sends the upgrade request, verifies
/// the 101 answer (accept key, subprotocol membership, extension echo) and
/// spawns the receive driver.
pub async fn connect_async_with_config(
    ws_url: &str,
    config: Option<ClientConfig>,
) -> Result<WSConnection, Error> {
    let config = config.unwrap_or_default();
    let key = generate_websocket_key();
    let (request, host_with_port, domain, use_tls) =
        construct_http_request(ws_url, &key, &config)?;

    let tcp_stream = TcpStream::connect(&host_with_port).await?;
    let stream = if use_tls {
        wrap_client_tls(tcp_stream, &domain, config.ca_file.as_deref()).await?
    } else {
        MeshStream::Plain(tcp_stream)
    };

    let (read_half, mut write_half) = split(stream);
    let mut buf_reader = BufReader::new(read_half);

    write_half.write_all(request.as_bytes()).await?;

    let response = HttpResponse::read_from(&mut buf_reader, DEFAULT_HANDSHAKE_TIMEOUT).await?;
    let (extensions, subprotocol) = verify_server_response(&response, &key, &config)?;

    Ok(establish(
        buf_reader,
        write_half,
        WriterKind::Client,
        config.web_socket_config,
        extensions,
        subprotocol,
    ))
}

/// Checks the server's 101 answer against what the client offered. Accept
/// key mismatches, subprotocols that were never offered and extensions
/// that were never offered all reject the handshake.
fn verify_server_response(
    response: &HttpResponse,
    key: &str,
    config: &ClientConfig,
) -> Result<(Option<Extensions>, Option<String>), Error> {
    if response.status != 101 {
        return Err(Error::HandshakeFailed(response.status));
    }
    if !response.header_contains("upgrade", "websocket")
        || !response.header_contains("connection", "upgrade")
    {
        return Err(Error::NoUpgrade);
    }

    let expected = generate_websocket_accept_value(key);
    match response.header("sec-websocket-accept") {
        Some(accept) if accept == expected => {}
        _ => return Err(Error::InvalidAcceptKey),
    }

    let subprotocol = match response.header("sec-websocket-protocol") {
        Some(chosen) => {
            let chosen = chosen.trim().to_string();
            if !config
                .subprotocols
                .iter()
                .any(|offered| offered.eq_ignore_ascii_case(&chosen))
            {
                return Err(Error::SubprotocolNotOffered(chosen));
            }
            Some(chosen)
        }
        None => None,
    };

    let extensions = match response.header("sec-websocket-extensions") {
        Some(header) => {
            let offered = config.web_socket_config.extensions.clone();
            if offered.is_none() {
                return Err(Error::ExtensionsNotOffered);
            }
            let negotiated = negotiate_extensions(offered, Some(header))?;
            if negotiated.is_none() {
                return Err(Error::ExtensionsNotOffered);
            }
            negotiated
        }
        None => None,
    };

    Ok((extensions, subprotocol))
}

/// Parses the peer's extension offer and intersects it with the local one.
pub(crate) fn negotiate_extensions(
    local: Option<Extensions>,
    header: Option<&str>,
) -> Result<Option<Extensions>, Error> {
    let peer = header.and_then(Extensions::parse);
    if let Some(peer) = &peer {
        peer.validate()?;
    }
    Ok(Extensions::merge(local, peer))
}

/// The server side of the handshake interception contract: a request
/// qualifies as an upgrade iff every required header is in place.
pub(crate) fn validate_upgrade_request(request: &HttpRequest) -> Result<(), Error> {
    if !request.method.eq_ignore_ascii_case("GET") || request.version < 1 {
        return Err(Error::InvalidHTTPHandshake);
    }
    if !request.header_contains("upgrade", "websocket") {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if !request.header_contains("connection", "upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }
    if request.header("host").is_none() {
        return Err(Error::NoHostHeaderPresent);
    }
    if request.header("sec-websocket-key").is_none() {
        return Err(Error::NoSecWebsocketKey);
    }
    match request.header("sec-websocket-version") {
        None => Err(Error::NoSecWebsocketVersion),
        Some(version) if version.trim() != "13" => {
            Err(Error::UnsupportedWebsocketVersion(version.to_string()))
        }
        Some(_) => Ok(()),
    }
}

pub(crate) fn build_accept_response(
    accept_value: &str,
    subprotocol: Option<&str>,
    extensions: Option<&Extensions>,
) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        accept_value,
    );
    if let Some(subprotocol) = subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", subprotocol));
    }
    if let Some(extensions) = extensions {
        if extensions.permessage_deflate {
            response.push_str(&format!(
                "Sec-WebSocket-Extensions: {}\r\n",
                extensions.header_value()
            ));
        }
    }
    response.push_str("\r\n");
    response
}

pub(crate) fn http_error_response(status: u16, reason: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    )
}

/// Wires a handshaken stream into a live connection: shared writer lock,
/// message channel, per-role deflate contexts, and the spawned receive
/// driver that owns the read half from here on.
pub(crate) fn establish(
    buf_reader: BufReader<ReadHalf<MeshStream>>,
    write_half: WriteHalf<MeshStream>,
    kind: WriterKind,
    config: WebSocketConfig,
    extensions: Option<Extensions>,
    subprotocol: Option<String>,
) -> WSConnection {
    let core = Arc::new(ConnectionCore::new());
    core.set_state(ConnectionState::Open);

    let writer = Arc::new(Mutex::new(Writer::new(write_half, kind)));
    let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);

    // Compression contexts are stateless per message, but the window caps
    // are directional: each side compresses under its own cap and inflates
    // under the peer's.
    let (encoder, decoder) = match &extensions {
        Some(ext) if ext.permessage_deflate => match kind {
            WriterKind::Server => (
                Some(Encoder::new(true, ext.server_max_window_bits)),
                Some(Decoder::new(true, ext.client_max_window_bits)),
            ),
            WriterKind::Client => (
                Some(Encoder::new(true, ext.client_max_window_bits)),
                Some(Decoder::new(true, ext.server_max_window_bits)),
            ),
        },
        _ => (None, None),
    };

    let mut read_stream = ReadStream::new(
        buf_reader,
        read_tx,
        Arc::clone(&writer),
        config.clone(),
        decoder,
        Arc::clone(&core),
        kind,
    );
    let ws_writer = WSWriter::new(writer, config, encoder, core);

    tokio::spawn(async move {
        read_stream.poll_messages().await;
    });

    WSConnection::new(WSReader::new(read_rx), ws_writer, subprotocol)
}

async fn wrap_client_tls(
    stream: TcpStream,
    domain: &str,
    ca_file: Option<&str>,
) -> Result<MeshStream, Error> {
    let mut root_store = rustls::RootCertStore::empty();
    if let Some(path) = ca_file {
        let file = std::fs::File::open(path)?;
        let mut pem_reader = std::io::BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut pem_reader) {
            root_store
                .add(cert?)
                .map_err(|err| Error::Tls(err.to_string()))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = pki_types::ServerName::try_from(domain.to_string())?;

    let tls_stream = connector.connect(server_name, stream).await?;
    Ok(MeshStream::Secure(TlsStream::from(tls_stream)))
}
