use crate::error::io_error;
use crate::imap::session::ImapSession;
use crate::session::{ConnectRequest, Credentials, MailConnector, SessionHandle};
use crate::ConnectionError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use imapviewer_core::{ProxyKind, ProxyUrl};
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

pub(crate) trait ImapIo: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug {}

impl<T> ImapIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug {}

pub(crate) type ImapStream = Box<dyn ImapIo>;

struct XOAuth2 {
    response: String,
    sent: bool,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // a second challenge carries the server's error details; answer empty so it sends NO
        if self.sent {
            return String::new();
        }
        self.sent = true;
        self.response.clone()
    }
}

/// Opens IMAP sessions with `async-imap` over tokio, TLS and optional proxies.
#[derive(Clone)]
pub struct ImapConnector {
    tls: TlsConnector,
    idle_timeout: Duration,
}

impl fmt::Debug for ImapConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConnector")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl ImapConnector {
    pub fn new(idle_timeout: Duration) -> Result<Self, ConnectionError> {
        let mut roots = rustls::RootCertStore::empty();
        let rustls_native_certs::CertificateResult { certs, errors, .. } =
            rustls_native_certs::load_native_certs();
        for err in errors {
            tracing::warn!(error = %err, "skipping unreadable native certificate");
        }
        let (added, ignored) = roots.add_parsable_certificates(certs);
        tracing::debug!(added, ignored, "loaded native root certificates");
        if roots.is_empty() {
            return Err(ConnectionError::Generic(
                "no trusted root certificates available".to_string(),
            ));
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            idle_timeout,
        })
    }

    async fn tls_wrap(&self, host: &str, stream: ImapStream) -> Result<ImapStream, std::io::Error> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid TLS server name: {host}"),
            )
        })?;
        let tls_stream = self.tls.connect(server_name, stream).await?;
        Ok(Box::new(tls_stream))
    }

    /// TCP, optional tunnel and implicit TLS, bounded by the connection timeout.
    async fn open_transport(&self, request: &ConnectRequest) -> Result<ImapStream, ConnectionError> {
        let stream = match &request.proxy {
            Some(proxy) => self.open_tunnel(proxy, &request.host, request.port).await?,
            None => {
                let addrs = resolve(&request.host, request.port)
                    .await
                    .map_err(ConnectionError::HostNotFound)?;
                Box::new(dial(&addrs).await.map_err(io_error)?) as ImapStream
            }
        };

        if request.secure {
            self.tls_wrap(&request.host, stream).await.map_err(io_error)
        } else {
            Ok(stream)
        }
    }

    async fn open_tunnel(
        &self,
        proxy: &ProxyUrl,
        host: &str,
        port: u16,
    ) -> Result<ImapStream, ConnectionError> {
        let proxy_error = |detail: String| ConnectionError::Proxy(format!("{}: {detail}", proxy.redacted()));

        let addrs = resolve(proxy.host(), proxy.port()).await.map_err(proxy_error)?;
        let socket = dial(&addrs).await.map_err(|err| proxy_error(err.to_string()))?;
        let target = (host, port);

        let stream: ImapStream = match (proxy.kind(), proxy.credentials()) {
            (ProxyKind::Socks5, Some((user, pass))) => Box::new(
                Socks5Stream::connect_with_password_and_socket(socket, target, user, pass)
                    .await
                    .map_err(|err| proxy_error(err.to_string()))?
                    .into_inner(),
            ),
            (ProxyKind::Socks5, None) => Box::new(
                Socks5Stream::connect_with_socket(socket, target)
                    .await
                    .map_err(|err| proxy_error(err.to_string()))?
                    .into_inner(),
            ),
            (ProxyKind::Socks4, Some((user, _))) => Box::new(
                Socks4Stream::connect_with_userid_and_socket(socket, target, user)
                    .await
                    .map_err(|err| proxy_error(err.to_string()))?
                    .into_inner(),
            ),
            (ProxyKind::Socks4, None) => Box::new(
                Socks4Stream::connect_with_socket(socket, target)
                    .await
                    .map_err(|err| proxy_error(err.to_string()))?
                    .into_inner(),
            ),
            (ProxyKind::Http, credentials) => {
                let mut socket = socket;
                http_connect(&mut socket, host, port, credentials).await?;
                Box::new(socket)
            }
            (ProxyKind::Https, credentials) => {
                let mut secured = self
                    .tls_wrap(proxy.host(), Box::new(socket))
                    .await
                    .map_err(|err| proxy_error(err.to_string()))?;
                http_connect(&mut secured, host, port, credentials).await?;
                secured
            }
        };

        Ok(stream)
    }
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|err| format!("{host}: {err}"))?
        .collect();
    if addrs.is_empty() {
        return Err(format!("{host}: no addresses"));
    }
    Ok(addrs)
}

async fn dial(addrs: &[SocketAddr]) -> Result<TcpStream, std::io::Error> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                tracing::debug!(%addr, error = %err, "tcp connect failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address to dial")
    }))
}

pub(crate) fn connect_request_line(host: &str, port: u16, credentials: Option<(&str, &str)>) -> String {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((user, pass)) = credentials {
        let token = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

pub(crate) fn connect_status(response: &[u8]) -> Result<(), ConnectionError> {
    let text = String::from_utf8_lossy(response);
    let status_line = text.lines().next().unwrap_or_default().trim();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    match code {
        Some(200..=299) => Ok(()),
        Some(407) => Err(ConnectionError::Proxy(
            "proxy authentication required".to_string(),
        )),
        _ => Err(ConnectionError::Proxy(format!(
            "proxy refused CONNECT: {status_line}"
        ))),
    }
}

async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let proxy_io = |err: std::io::Error| ConnectionError::Proxy(err.to_string());
    stream
        .write_all(connect_request_line(host, port, credentials).as_bytes())
        .await
        .map_err(proxy_io)?;
    stream.flush().await.map_err(proxy_io)?;

    // byte-wise so nothing past the header block is consumed
    let mut response = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_CONNECT_RESPONSE {
            return Err(ConnectionError::Proxy(
                "oversized CONNECT response".to_string(),
            ));
        }
        if stream.read(&mut byte).await.map_err(proxy_io)? == 0 {
            return Err(ConnectionError::Proxy(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        response.push(byte[0]);
    }

    connect_status(&response)
}

fn auth_error(err: async_imap::error::Error) -> ConnectionError {
    match err {
        async_imap::error::Error::No(detail) | async_imap::error::Error::Bad(detail) => {
            ConnectionError::AuthenticationFailed(detail)
        }
        other => ConnectionError::from(other),
    }
}

/// LOGIN or AUTHENTICATE XOAUTH2; a server that stalls past `limit` is a timeout.
async fn authenticate(
    client: async_imap::Client<ImapStream>,
    credentials: &Credentials,
    limit: Duration,
    endpoint: &str,
) -> Result<async_imap::Session<ImapStream>, ConnectionError> {
    let login = async {
        match credentials {
            Credentials::Password { username, password } => client
                .login(username, password)
                .await
                .map_err(|(err, _client)| auth_error(err)),
            Credentials::XOAuth2 { user, access_token } => client
                .authenticate(
                    "XOAUTH2",
                    XOAuth2 {
                        response: Credentials::xoauth2_string(user, access_token),
                        sent: false,
                    },
                )
                .await
                .map_err(|(err, _client)| auth_error(err)),
        }
    };
    timeout(limit, login).await.map_err(|_| {
        ConnectionError::Timeout(format!("{endpoint} did not finish authentication within {limit:?}"))
    })?
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<SessionHandle, ConnectionError> {
        let endpoint = format!("{}:{}", request.host, request.port);

        let stream = timeout(request.timeouts.connection, self.open_transport(&request))
            .await
            .map_err(|_| {
                ConnectionError::Timeout(format!(
                    "{endpoint} not reachable within {:?}",
                    request.timeouts.connection
                ))
            })??;

        let greeting_timeout = request.timeouts.greeting;
        let greeting_elapsed =
            || ConnectionError::Timeout(format!("{endpoint} sent no greeting within {greeting_timeout:?}"));

        let mut client = async_imap::Client::new(stream);
        timeout(greeting_timeout, client.read_response())
            .await
            .map_err(|_| greeting_elapsed())?
            .ok_or_else(|| ConnectionError::Generic(format!("{endpoint} sent no greeting")))?
            .map_err(|err| ConnectionError::Generic(format!("reading greeting: {err}")))?;

        let limit = request.timeouts.connection;
        if !request.secure {
            timeout(limit, client.run_command_and_check_ok("STARTTLS", None))
                .await
                .map_err(|_| ConnectionError::Timeout(format!("{endpoint} did not answer STARTTLS")))?
                .map_err(|err| ConnectionError::Generic(format!("STARTTLS rejected: {err}")))?;
            let plain = client.into_inner();
            let secured = timeout(limit, self.tls_wrap(&request.host, plain))
                .await
                .map_err(|_| ConnectionError::Timeout(format!("{endpoint} TLS handshake")))?
                .map_err(io_error)?;
            client = async_imap::Client::new(secured);
        }

        let session = authenticate(client, &request.credentials, limit, &endpoint).await?;

        tracing::info!(
            account_id = %request.account_id,
            endpoint = %endpoint,
            proxied = request.proxy.is_some(),
            "imap session authenticated"
        );

        Ok(Arc::new(ImapSession::new(
            request.account_id,
            session,
            self.idle_timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_carries_basic_auth() {
        let line = connect_request_line("imap.example.com", 993, Some(("user", "pass")));
        assert!(line.starts_with("CONNECT imap.example.com:993 HTTP/1.1\r\n"));
        assert!(line.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(line.ends_with("\r\n\r\n"));

        let anonymous = connect_request_line("imap.example.com", 143, None);
        assert!(!anonymous.contains("Proxy-Authorization"));
    }

    #[test]
    fn classifies_connect_status() {
        assert!(connect_status(b"HTTP/1.1 200 Connection established\r\n\r\n").is_ok());
        assert!(matches!(
            connect_status(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n"),
            Err(ConnectionError::Proxy(detail)) if detail.contains("authentication")
        ));
        assert!(matches!(
            connect_status(b"HTTP/1.0 403 Forbidden\r\n\r\n"),
            Err(ConnectionError::Proxy(_))
        ));
    }

    #[tokio::test]
    async fn http_tunnel_handshake_over_duplex() {
        let (mut client, mut proxy) = tokio::io::duplex(1024);

        let proxy_side = tokio::spawn(async move {
            let mut buffer = vec![0u8; 512];
            let read = proxy.read(&mut buffer).await.expect("request read");
            let request = String::from_utf8_lossy(&buffer[..read]).to_string();
            proxy
                .write_all(b"HTTP/1.1 200 OK\r\n\r\n* OK greeting")
                .await
                .expect("response written");
            request
        });

        http_connect(&mut client, "imap.example.com", 993, None)
            .await
            .expect("tunnel established");

        let mut rest = [0u8; 13];
        client.read_exact(&mut rest).await.expect("greeting bytes remain");
        assert_eq!(&rest, b"* OK greeting");

        let request = proxy_side.await.expect("proxy task");
        assert!(request.starts_with("CONNECT imap.example.com:993"));
    }

    #[tokio::test]
    async fn stalled_login_times_out() {
        let (client_io, mut server) = tokio::io::duplex(1024);
        let server_side = tokio::spawn(async move {
            server.write_all(b"* OK ready\r\n").await.expect("greeting written");
            let mut buffer = vec![0u8; 256];
            let _ = server.read(&mut buffer).await;
            // hold the connection open without answering
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let stream: ImapStream = Box::new(client_io);
        let mut client = async_imap::Client::new(stream);
        client
            .read_response()
            .await
            .expect("greeting")
            .expect("greeting parsed");

        let credentials = Credentials::Password {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let err = authenticate(client, &credentials, Duration::from_millis(100), "imap.example.com:993")
            .await
            .err()
            .expect("stalled login");
        assert!(matches!(err, ConnectionError::Timeout(_)));
        server_side.abort();
    }

    #[test]
    fn xoauth2_answers_error_challenge_with_empty_response() {
        use async_imap::Authenticator;
        let mut auth = XOAuth2 {
            response: "user=a\x01auth=Bearer t\x01\x01".to_string(),
            sent: false,
        };
        assert_eq!(auth.process(b""), "user=a\x01auth=Bearer t\x01\x01");
        assert_eq!(auth.process(b"{\"status\":\"400\"}"), "");
    }
}
