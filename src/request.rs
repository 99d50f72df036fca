use crate::config::ClientConfig;
use crate::error::Error;
use std::collections::HashMap;
use tokio::io::AsyncBufReadExt;
use tokio::time::{timeout, Duration};
use url::Url;

const HTTP_REQUEST_DELIMITER: &str = "\r\n\r\n";
// Limit the maximum amount of header data read to prevent a denial of
// service through an endless header section.
const MAX_HEADER_BYTES: usize = 16 * 1024;

// Function used for client connections, parsing the ws/wss URL for
// constructing the handshake request, which includes the sec-websocket-key,
// the URL path, scheme and the negotiation headers. Also returns the
// host:port pair since this is necessary for establishing the TCP socket.
pub(crate) fn construct_http_request(
    ws_url: &str,
    key: &str,
    config: &ClientConfig,
) -> Result<(String, String, String, bool), Error> {
    let parsed_url = Url::parse(ws_url)?;
    let mut use_tls = false;

    // Clause just to validate the user has passed the proper URL scheme.
    // Also, we need the default HTTP port for the case ws_url
    // is a domain instead of an IP
    let http_port: u16 = match parsed_url.scheme() {
        "ws" => 80,
        "wss" => {
            use_tls = true;
            443
        }
        _ => return Err(Error::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?;
    let port = parsed_url.port().unwrap_or(http_port);

    // This will be used in the handshake request.
    // If ws_url carries an explicit port, we echo it in the Host field;
    // for a bare DNS name we don't
    let request_host_field = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => String::from(host),
    };

    // We need the port together with the host for establishing a TCP
    // connection regardless if ws_url is an IP or domain
    let host_with_port = format!("{}:{}", host, port);

    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    // Since we already have all the info, it isn't worth converting
    // everything to an HTTP request type; we simply assemble the string and
    // convert it to bytes when sending to the server
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        request_path, request_host_field, key,
    );

    if let Some(origin) = &config.origin {
        request.push_str(&format!("Origin: {}\r\n", origin));
    }

    if !config.subprotocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            config.subprotocols.join(", ")
        ));
    }

    if let Some(extensions) = &config.web_socket_config.extensions {
        if extensions.permessage_deflate {
            request.push_str(&format!(
                "Sec-WebSocket-Extensions: {}\r\n",
                extensions.header_value()
            ));
        }
    }

    for (name, value) in &config.headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }

    request.push_str("\r\n");

    Ok((request, host_with_port, String::from(host), use_tls))
}

// Reads one HTTP header section (request or response head) off the stream,
// stopping exactly at the blank line so no frame bytes are consumed.
async fn read_header_section<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    read_timeout: Duration,
) -> Result<String, Error> {
    let mut buffer = String::new();

    // Some attackers only open the TCP endpoint and freeze without sending
    // the HTTP handshake; the timeout drops all those cases.
    timeout(read_timeout, async {
        loop {
            let bytes_read = reader.read_line(&mut buffer).await?;
            if bytes_read == 0
                || buffer.ends_with(HTTP_REQUEST_DELIMITER)
                || buffer.len() > MAX_HEADER_BYTES
            {
                break;
            }
        }
        Ok::<(), Error>(())
    })
    .await??;

    if !buffer.ends_with(HTTP_REQUEST_DELIMITER) {
        return Err(Error::IncompleteHTTPRequest);
    }

    Ok(buffer)
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for header in parsed {
        let value = String::from_utf8_lossy(header.value).trim().to_string();
        // Repeated headers fold into one comma-separated value, the same
        // shape a proxy would produce.
        headers
            .entry(header.name.to_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    /// Minor version of HTTP/1.x as reported by httparse (0 or 1).
    pub version: u8,
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    pub(crate) async fn read_from<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        read_timeout: Duration,
    ) -> Result<HttpRequest, Error> {
        let buffer = read_header_section(reader, read_timeout).await?;

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(buffer.as_bytes())? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(Error::IncompleteHTTPRequest),
        }

        Ok(HttpRequest {
            method: request.method.unwrap_or_default().to_string(),
            uri: request.path.unwrap_or_default().to_string(),
            version: request.version.unwrap_or(0),
            headers: collect_headers(request.headers),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// True when `name` holds `token` as one of its comma-separated values,
    /// compared case-insensitively. Upgrade and Connection headers arrive
    /// in every capitalization and ordering browsers can produce.
    pub fn header_contains(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    /// The handshake interception contract: a request is a WebSocket
    /// upgrade iff it is a GET over HTTP/1.1 or later carrying the upgrade
    /// headers, the Host header, a key and a version.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
            && self.version >= 1
            && self.header_contains("upgrade", "websocket")
            && self.header_contains("connection", "upgrade")
            && self.header("host").is_some()
            && self.header("sec-websocket-key").is_some()
            && self.header("sec-websocket-version").is_some()
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub(crate) async fn read_from<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        read_timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        let buffer = read_header_section(reader, read_timeout).await?;

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(buffer.as_bytes())? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(Error::InvalidHTTPResponse),
        }

        Ok(HttpResponse {
            status: response.code.ok_or(Error::InvalidHTTPResponse)?,
            headers: collect_headers(response.headers),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn header_contains(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }
}
