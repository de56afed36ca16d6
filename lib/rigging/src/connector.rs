//! HTTP/1.1 sessions over rustls.
//!
//! [`HttpConnect`] opens one hyper HTTP/1.1 connection per session, directly
//! or through a proxy: plain HTTP targets are requested in absolute form from
//! the proxy, HTTPS targets go through a `CONNECT` tunnel.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_service::Service;
use tracing::debug;
use url::Url;

use crate::config::PoolOptions;
use crate::pool::{Connect, Endpoint, Session};
use crate::{Error, Request, Response, ResponseTarget, Result};

/// Largest proxy `CONNECT` response head accepted.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Build the rustls client configuration for `options`.
///
/// The Mozilla roots are trusted unless a CA bundle, directory or store is
/// configured, in which case only those are.
pub fn tls_config(options: &PoolOptions) -> Result<ClientConfig> {
    if !options.ssl_verify_peer {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        return Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth());
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store(options)?)
        .with_no_client_auth())
}

fn root_store(options: &PoolOptions) -> Result<RootCertStore> {
    let custom = options.ssl_ca_bundle.is_some()
        || options.ssl_ca_directory.is_some()
        || options.ssl_ca_store.is_some();
    if !custom {
        return Ok(webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect());
    }

    let mut store = options
        .ssl_ca_store
        .as_deref()
        .cloned()
        .unwrap_or_else(RootCertStore::empty);

    if let Some(bundle) = &options.ssl_ca_bundle {
        add_pem_file(&mut store, bundle)?;
    }
    if let Some(directory) = &options.ssl_ca_directory {
        let entries = fs::read_dir(directory).map_err(|err| {
            Error::tls(format!("cannot read CA directory {}: {err}", directory.display()))
        })?;
        for path in entries.flatten().map(|entry| entry.path()) {
            if path
                .extension()
                .is_some_and(|ext| ext == "pem" || ext == "crt")
            {
                add_pem_file(&mut store, &path)?;
            }
        }
    }
    Ok(store)
}

fn add_pem_file(store: &mut RootCertStore, path: &Path) -> Result<()> {
    let certificates = CertificateDer::pem_file_iter(path)
        .map_err(|err| Error::tls(format!("cannot read {}: {err}", path.display())))?;
    for certificate in certificates {
        let certificate = certificate
            .map_err(|err| Error::tls(format!("invalid certificate in {}: {err}", path.display())))?;
        store
            .add(certificate)
            .map_err(|err| Error::tls(format!("rejected certificate in {}: {err}", path.display())))?;
    }
    Ok(())
}

/// Accepts any server certificate; signatures are still checked.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Opens a TCP stream to a proxy and asks it to tunnel to the requested authority.
#[derive(Debug, Clone)]
struct Tunnel {
    proxy: Endpoint,
}

impl Service<http::Uri> for Tunnel {
    type Response = TokioIo<TcpStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: http::Uri) -> Self::Future {
        let proxy = self.proxy.clone();
        Box::pin(async move {
            let host = target
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no host"))?;
            let authority = format!("{host}:{}", target.port_u16().unwrap_or(443));

            let mut stream = TcpStream::connect((proxy.host(), proxy.port())).await?;
            stream
                .write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
                .await?;

            let head = read_response_head(&mut stream).await?;
            let status = head
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1));
            if status != Some("200") {
                return Err(io::Error::other(format!(
                    "proxy {proxy} refused tunnel to {authority}: {}",
                    head.lines().next().unwrap_or_default()
                )));
            }
            debug!(%proxy, authority = %authority, "proxy tunnel established");
            Ok(TokioIo::new(stream))
        })
    }
}

async fn read_response_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut chunk = [0_u8; 256];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        if head.len() > MAX_PROXY_RESPONSE {
            return Err(io::Error::other("proxy response head too large"));
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection",
            ));
        }
        head.extend_from_slice(chunk.get(..read).unwrap_or_default());
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Opens HTTP/1.1 sessions.
#[derive(Clone)]
pub struct HttpConnect {
    https: HttpsConnector<HttpConnector>,
    tunnel: Option<HttpsConnector<Tunnel>>,
    proxy: Option<Endpoint>,
    open_timeout: Duration,
    read_timeout: Duration,
    wire_trace: bool,
}

impl HttpConnect {
    /// Create a connector from pool options.
    pub fn new(options: &PoolOptions) -> Result<Self> {
        let tls = tls_config(options)?;

        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(options.http_open_timeout));
        http.enforce_http(false);

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let proxy = options
            .http_proxy
            .as_ref()
            .map(Endpoint::from_url)
            .transpose()?;
        let tunnel = proxy.clone().map(|proxy| {
            HttpsConnectorBuilder::new()
                .with_tls_config(tls)
                .https_only()
                .enable_http1()
                .wrap_connector(Tunnel { proxy })
        });

        Ok(Self {
            https,
            tunnel,
            proxy,
            open_timeout: options.http_open_timeout,
            read_timeout: options.http_read_timeout,
            wire_trace: options.http_wire_trace,
        })
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<HttpSession> {
        match (&self.proxy, &self.tunnel) {
            (Some(_), Some(tunnel)) if endpoint.is_https() => {
                let io = tunnel
                    .clone()
                    .oneshot(endpoint_uri(endpoint)?)
                    .await
                    .map_err(connect_error)?;
                self.handshake(io, endpoint, false).await
            }
            (Some(proxy), _) => {
                let io = self
                    .https
                    .clone()
                    .oneshot(endpoint_uri(proxy)?)
                    .await
                    .map_err(connect_error)?;
                self.handshake(io, endpoint, true).await
            }
            (None, _) => {
                let io = self
                    .https
                    .clone()
                    .oneshot(endpoint_uri(endpoint)?)
                    .await
                    .map_err(connect_error)?;
                self.handshake(io, endpoint, false).await
            }
        }
    }

    async fn handshake<T>(&self, io: T, endpoint: &Endpoint, absolute_form: bool) -> Result<HttpSession>
    where
        T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (sender, connection) = http1::handshake(io).await.map_err(map_hyper_error)?;

        let name = endpoint.to_string();
        let connection = tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(endpoint = %name, error = %error, "session closed with error");
            }
        });

        Ok(HttpSession {
            sender,
            connection,
            endpoint: endpoint.clone(),
            absolute_form,
            read_timeout: self.read_timeout,
            wire_trace: self.wire_trace,
        })
    }
}

impl Connect for HttpConnect {
    type Session = HttpSession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<HttpSession> {
        tokio::time::timeout(self.open_timeout, self.open(endpoint))
            .await
            .map_err(|_| Error::Timeout)?
    }
}

impl fmt::Debug for HttpConnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnect")
            .field("proxy", &self.proxy)
            .field("open_timeout", &self.open_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("wire_trace", &self.wire_trace)
            .finish_non_exhaustive()
    }
}

fn endpoint_uri(endpoint: &Endpoint) -> Result<http::Uri> {
    endpoint
        .to_string()
        .parse()
        .map_err(|err: http::uri::InvalidUri| Error::invalid_request(err.to_string()))
}

#[allow(clippy::needless_pass_by_value)]
fn connect_error(err: Box<dyn std::error::Error + Send + Sync>) -> Error {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake") {
        Error::tls(message)
    } else {
        Error::networking(message)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn map_hyper_error(err: hyper::Error) -> Error {
    if err.is_timeout() {
        return Error::Timeout;
    }
    let message = match std::error::Error::source(&err) {
        Some(source) => format!("{err}: {source}"),
        None => err.to_string(),
    };
    Error::networking(message)
}

/// One HTTP/1.1 connection.
pub struct HttpSession {
    sender: SendRequest<Full<Bytes>>,
    connection: JoinHandle<()>,
    endpoint: Endpoint,
    absolute_form: bool,
    read_timeout: Duration,
    wire_trace: bool,
}

impl HttpSession {
    /// Send `request` and read the response into `target`.
    ///
    /// Fails with [`Error::TruncatedResponse`] when fewer or more bytes than
    /// the declared `Content-Length` arrive, and with [`Error::Timeout`] when
    /// the peer is silent for longer than the read timeout.
    pub async fn send(&mut self, request: Request, target: &ResponseTarget) -> Result<Response> {
        let bodyless = request.method() == http::Method::HEAD;
        let http_request = self.build_request(request)?;

        if self.wire_trace {
            debug!(
                target: "rigging::wire",
                endpoint = %self.endpoint,
                method = %http_request.method(),
                uri = %http_request.uri(),
                headers = ?http_request.headers(),
                "-> request"
            );
        }

        self.sender.ready().await.map_err(map_hyper_error)?;
        let response = tokio::time::timeout(self.read_timeout, self.sender.send_request(http_request))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(map_hyper_error)?;

        let status = response.status();
        if self.wire_trace {
            debug!(
                target: "rigging::wire",
                endpoint = %self.endpoint,
                status = status.as_u16(),
                headers = ?response.headers(),
                "<- response"
            );
        }

        let expected = if bodyless || status == http::StatusCode::NO_CONTENT || status == http::StatusCode::NOT_MODIFIED {
            None
        } else {
            response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
        };
        let headers = extract_headers(response.headers());

        let mut body = response.into_body();
        let mut buffer = BytesMut::new();
        let mut received = 0_u64;
        while let Some(frame) = tokio::time::timeout(self.read_timeout, body.frame())
            .await
            .map_err(|_| Error::Timeout)?
        {
            let frame = match frame {
                Ok(frame) => frame,
                Err(error) => {
                    if let Some(expected) = expected
                        && received < expected
                    {
                        return Err(Error::TruncatedResponse {
                            expected,
                            actual: received,
                        });
                    }
                    return Err(map_hyper_error(error));
                }
            };
            if let Ok(data) = frame.into_data() {
                received = received.saturating_add(u64::try_from(data.len()).unwrap_or(u64::MAX));
                match target {
                    ResponseTarget::Buffer => buffer.extend_from_slice(&data),
                    ResponseTarget::Sink(sink) => sink(&data),
                }
            }
        }

        if let Some(expected) = expected
            && expected != received
        {
            return Err(Error::TruncatedResponse {
                expected,
                actual: received,
            });
        }

        Ok(Response::new(status.as_u16(), headers, buffer.freeze()))
    }

    fn build_request(&self, request: Request) -> Result<http::Request<Full<Bytes>>> {
        let (method, url, headers, body) = request.into_parts();

        let uri = if self.absolute_form {
            url.as_str().to_string()
        } else {
            origin_form(&url)
        };
        let mut builder = http::Request::builder().method(method).uri(uri);

        if !headers.keys().any(|name| name.eq_ignore_ascii_case("host")) {
            builder = builder.header(HOST, host_header(&url));
        }
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = body.map_or_else(Full::default, Full::new);
        builder
            .body(body)
            .map_err(|err| Error::invalid_request(err.to_string()))
    }
}

impl Session for HttpSession {
    fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.connection.is_finished()
    }

    fn close(self) {
        self.connection.abort();
    }
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("endpoint", &self.endpoint)
            .field("absolute_form", &self.absolute_form)
            .finish_non_exhaustive()
    }
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Extract response headers as a `HashMap`.
fn extract_headers(headers: &http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}
