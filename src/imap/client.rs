use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

use crate::config::{NetworkType, TlsFloor};
use crate::context::CheckContext;
use crate::error::{CheckError, ConnectAttempt};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

// ---------- Stream wrapper ----------

/// TLS stream to the IMAP server, usable by `async_imap::Client`.
pub struct ImapStream(TlsStream<TcpStream>);

impl AsyncRead for ImapStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImapStream::Tls")
    }
}

// ---------- Connection ----------

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    pub network_type: NetworkType,
    pub min_tls: TlsFloor,
}

/// An established, not yet authenticated, transport to one server address.
#[derive(Debug)]
pub struct Connection<S = ImapStream> {
    pub(crate) stream: S,
    pub server: String,
    pub peer: SocketAddr,
    pub tls: bool,
}

impl<S> Connection<S> {
    pub fn new(stream: S, server: impl Into<String>, peer: SocketAddr, tls: bool) -> Self {
        Self {
            stream,
            server: server.into(),
            peer,
            tls,
        }
    }

    pub fn into_stream(self) -> S {
        self.stream
    }
}

/// Capabilities advertised by the server before authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities(Vec<String>);

impl ServerCapabilities {
    pub fn parse(response: &str) -> Self {
        let mut caps: Vec<String> = response
            .lines()
            .filter_map(|line| {
                let line = line.trim_end();
                let rest = line.strip_prefix("* ")?;
                let (keyword, list) = rest.split_once(' ')?;
                keyword.eq_ignore_ascii_case("CAPABILITY").then_some(list)
            })
            .flat_map(|list| list.split_whitespace().map(str::to_string))
            .collect();
        caps.sort();
        caps.dedup();
        Self(caps)
    }

    pub fn has(&self, capability: &str) -> bool {
        self.0.iter().any(|c| c.eq_ignore_ascii_case(capability))
    }

    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.has(&format!("AUTH={mechanism}"))
    }

    pub fn login_disabled(&self) -> bool {
        self.has("LOGINDISABLED")
    }

    /// Sorted capability names.
    pub fn names(&self) -> &[String] {
        &self.0
    }
}

// ---------- Public API ----------

/// Resolve `server`, then dial every address of the requested family in
/// resolution order until one completes a TLS handshake.
pub async fn connect(
    ctx: &CheckContext,
    server: &str,
    port: u16,
    options: &ConnectOptions,
) -> Result<Connection, CheckError> {
    let resolved = resolve(ctx, server, port).await?;
    log::debug!("Resolved {server} to {} address(es): {resolved:?}", resolved.len());

    let candidates = filter_addresses(resolved, options.network_type);
    if candidates.is_empty() {
        return Err(CheckError::NoAddresses {
            server: server.to_string(),
            network: options.network_type,
        });
    }

    let native = native_tls::TlsConnector::builder()
        .min_protocol_version(Some(native_protocol(options.min_tls)))
        .build()
        .map_err(|e| CheckError::Tls {
            server: server.to_string(),
            reason: format!("failed to create TLS connector: {e}"),
        })?;
    let connector = tokio_native_tls::TlsConnector::from(native);

    let (stream, peer) = connect_candidates(ctx, server, &candidates, |addr| {
        let connector = connector.clone();
        let server = server.to_string();
        async move { dial_tls(addr, &server, &connector).await }
    })
    .await?;

    log::info!("Connected to {server} via {peer}");
    Ok(Connection::new(stream, server, peer, true))
}

/// Keep only addresses of the requested family, preserving order.
pub fn filter_addresses(
    addrs: impl IntoIterator<Item = SocketAddr>,
    network: NetworkType,
) -> Vec<SocketAddr> {
    addrs
        .into_iter()
        .filter(|addr| match network {
            NetworkType::Auto => true,
            NetworkType::Tcp4 => addr.is_ipv4(),
            NetworkType::Tcp6 => addr.is_ipv6(),
        })
        .collect()
}

/// Read the greeting and issue `CAPABILITY` on the raw stream.
///
/// Leaves the stream positioned right after the tagged response so an IMAP
/// client can take it over.
pub async fn probe_capabilities<S>(
    ctx: &CheckContext,
    conn: &mut Connection<S>,
) -> Result<ServerCapabilities, CheckError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server = conn.server.clone();
    let failed = |reason: String| CheckError::Capability {
        server: server.clone(),
        reason,
    };

    let mut reader = BufReader::new(&mut conn.stream);

    let greeting = ctx
        .bounded("read server greeting", read_response_line(&mut reader))
        .await?
        .map_err(|e| failed(format!("greeting: {e}")))?;
    log::debug!("{server} greeting: {}", greeting.trim_end());
    if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
        return Err(failed(format!("unexpected greeting: {}", greeting.trim_end())));
    }

    let response = ctx
        .bounded(
            "CAPABILITY",
            raw_send_and_wait(&mut reader, b"cm0 CAPABILITY\r\n", "cm0"),
        )
        .await?
        .map_err(failed)?;

    if !reader.buffer().is_empty() {
        return Err(failed("unexpected data after CAPABILITY response".to_string()));
    }

    let caps = ServerCapabilities::parse(&response);
    log::debug!("{server} capabilities: {}", caps.names().join(" "));
    Ok(caps)
}

/// Best-effort `LOGOUT` on a stream that never reached the authenticated
/// state.
pub async fn raw_logout<S>(ctx: &CheckContext, stream: &mut S) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(b"cm1 LOGOUT\r\n")
            .await
            .map_err(|e| format!("cm1 write: {e}"))?;
        reader
            .get_mut()
            .flush()
            .await
            .map_err(|e| format!("cm1 flush: {e}"))?;

        let mut saw_bye = false;
        loop {
            match read_response_line(&mut reader).await {
                Ok(line) if line.starts_with("cm1 OK") => return Ok(()),
                Ok(line) if line.starts_with("cm1 ") => {
                    return Err(format!("LOGOUT failed: {}", line.trim_end()))
                }
                Ok(line) => saw_bye |= line.starts_with("* BYE"),
                Err(_) if saw_bye => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    };

    // Not tied to cancellation: logout is attempted even when the run is
    // being torn down.
    tokio::time::timeout(ctx.timeout(), exchange)
        .await
        .unwrap_or_else(|_| Err(format!("LOGOUT timed out after {}s", ctx.timeout().as_secs())))
}

// ---------- Internal helpers ----------

async fn resolve(ctx: &CheckContext, server: &str, port: u16) -> Result<Vec<SocketAddr>, CheckError> {
    let addrs = ctx
        .bounded("resolve", tokio::net::lookup_host((server, port)))
        .await?
        .map_err(|source| CheckError::Resolution {
            server: server.to_string(),
            source,
        })?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(CheckError::Resolution {
            server: server.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        });
    }
    Ok(addrs)
}

/// Try each candidate in turn; the first successful dial wins.
///
/// Every failure is logged and kept so the final error names all of them.
pub(crate) async fn connect_candidates<S, F, Fut>(
    ctx: &CheckContext,
    server: &str,
    candidates: &[SocketAddr],
    mut dial: F,
) -> Result<(S, SocketAddr), CheckError>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = Result<S, String>>,
{
    let mut attempts = Vec::with_capacity(candidates.len());

    for &addr in candidates {
        log::debug!("Connecting to {server} at {addr}");
        let outcome = match ctx.bounded(&format!("connect to {addr}"), dial(addr)).await {
            Ok(outcome) => outcome,
            Err(err @ CheckError::Cancelled { .. }) => return Err(err),
            Err(err) => Err(err.to_string()),
        };

        match outcome {
            Ok(stream) => return Ok((stream, addr)),
            Err(error) => {
                log::warn!("Failed to connect to {server} at {addr}: {error}");
                attempts.push(ConnectAttempt { addr, error });
            }
        }
    }

    Err(CheckError::Connection {
        server: server.to_string(),
        attempts,
    })
}

async fn dial_tls(
    addr: SocketAddr,
    server: &str,
    connector: &tokio_native_tls::TlsConnector,
) -> Result<ImapStream, String> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("TCP connect failed: {e}"))?;

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
        log::debug!("Unable to enable TCP keepalive for {addr}: {e}");
    }

    let tls = connector
        .connect(server, tcp)
        .await
        .map_err(|e| format!("TLS handshake failed: {e}"))?;
    Ok(ImapStream(tls))
}

fn native_protocol(floor: TlsFloor) -> native_tls::Protocol {
    match floor {
        TlsFloor::Tls10 => native_tls::Protocol::Tlsv10,
        TlsFloor::Tls11 => native_tls::Protocol::Tlsv11,
        TlsFloor::Tls12 => native_tls::Protocol::Tlsv12,
        TlsFloor::Tls13 => {
            log::warn!("TLS 1.3 cannot be enforced as a minimum by the platform TLS library; using TLS 1.2");
            native_tls::Protocol::Tlsv12
        }
    }
}

async fn read_response_line<R>(reader: &mut R) -> Result<String, String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => Err("connection closed".to_string()),
        Ok(_) => Ok(line),
        Err(e) => Err(format!("read: {e}")),
    }
}

/// Send a tagged command and collect response lines up to the tagged status.
async fn raw_send_and_wait<S>(
    reader: &mut BufReader<S>,
    cmd: &[u8],
    tag: &str,
) -> Result<String, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reader
        .get_mut()
        .write_all(cmd)
        .await
        .map_err(|e| format!("{tag} write: {e}"))?;
    reader
        .get_mut()
        .flush()
        .await
        .map_err(|e| format!("{tag} flush: {e}"))?;

    let mut response = String::new();
    let tag_ok = format!("{tag} OK");
    let tag_no = format!("{tag} NO");
    let tag_bad = format!("{tag} BAD");

    loop {
        let line = read_response_line(reader)
            .await
            .map_err(|e| format!("{tag}: {e}"))?;
        response.push_str(&line);
        if line.starts_with(&tag_ok) {
            return Ok(response);
        }
        if line.starts_with(&tag_no) || line.starts_with(&tag_bad) {
            return Err(format!("{tag} failed: {}", line.trim_end()));
        }
    }
}
