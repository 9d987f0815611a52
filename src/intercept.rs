//! Man-in-the-middle handling of one CONNECT tunnel.
//!
//! The tunnel walks a fixed sequence of stages. Both sockets are owned by the
//! future running [`Interceptor::run`], so any early return drops them.

use std::{fmt, sync::Arc, time::Duration};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response,
    body::Incoming,
    client::conn::http1::SendRequest,
    header::{self, HeaderValue},
    http::uri::Authority,
    service::service_fn,
    upgrade::OnUpgrade,
};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpStream, sync::Mutex as AsyncMutex};
use tokio_rustls::TlsConnector;

use crate::{
    ca::{CertIssuer, IssuedCert},
    capture::{CapturedRequest, CapturedResponse},
    proxy::{authority_target, bounded},
    recorder::Recorder,
    tls,
};

const HTTPS_DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptStage {
    Tunnel,
    OriginDial,
    Certificate,
    ClientHandshake,
    OriginHandshake,
    Exchange,
}

impl InterceptStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tunnel => "tunnel",
            Self::OriginDial => "origin_dial",
            Self::Certificate => "certificate",
            Self::ClientHandshake => "client_handshake",
            Self::OriginHandshake => "origin_handshake",
            Self::Exchange => "exchange",
        }
    }
}

impl fmt::Display for InterceptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct InterceptError {
    stage: InterceptStage,
    source: anyhow::Error,
}

impl InterceptError {
    fn at(stage: InterceptStage) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self { stage, source }
    }

    pub fn stage(&self) -> InterceptStage {
        self.stage
    }
}

impl fmt::Display for InterceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {:#}", self.stage, self.source)
    }
}

impl std::error::Error for InterceptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

pub struct Interceptor {
    issuer: Arc<CertIssuer>,
    recorder: Recorder,
    origin_tls: TlsConnector,
    upstream_timeout: Option<Duration>,
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("issuer", &self.issuer)
            .field("upstream_timeout", &self.upstream_timeout)
            .finish_non_exhaustive()
    }
}

impl Interceptor {
    pub fn new(
        issuer: Arc<CertIssuer>,
        recorder: Recorder,
        upstream_timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            issuer,
            recorder,
            origin_tls: tls::origin_connector()?,
            upstream_timeout,
        })
    }

    /// Serves one intercepted exchange over the upgraded CONNECT socket.
    pub async fn run(
        &self,
        on_upgrade: OnUpgrade,
        authority: Authority,
    ) -> Result<(), InterceptError> {
        use InterceptStage::*;

        let upgraded = on_upgrade
            .await
            .context("upgrade client CONNECT tunnel")
            .map_err(InterceptError::at(Tunnel))?;

        let target = authority_target(&authority, HTTPS_DEFAULT_PORT);
        let origin_tcp = bounded(self.upstream_timeout, TcpStream::connect(target.as_str()))
            .await
            .with_context(|| format!("connect to origin {target}"))
            .map_err(InterceptError::at(OriginDial))?;

        let host = authority.host().to_owned();
        let issued = self
            .issue_leaf(&host)
            .await
            .map_err(InterceptError::at(Certificate))?;

        let acceptor = tls::leaf_acceptor(&issued).map_err(InterceptError::at(ClientHandshake))?;
        let client_tls = bounded(self.upstream_timeout, acceptor.accept(TokioIo::new(upgraded)))
            .await
            .with_context(|| {
                format!("TLS handshake with client for `{host}`; the client must trust the snoopproxy root CA")
            })
            .map_err(InterceptError::at(ClientHandshake))?;

        let server_name = tls::server_name(&host).map_err(InterceptError::at(OriginHandshake))?;
        let origin_tls = bounded(
            self.upstream_timeout,
            self.origin_tls.connect(server_name, origin_tcp),
        )
        .await
        .with_context(|| format!("TLS handshake with origin {target}"))
        .map_err(InterceptError::at(OriginHandshake))?;

        let (sender, origin_conn) = hyper::client::conn::http1::handshake(TokioIo::new(origin_tls))
            .await
            .context("start HTTP/1 session with origin")
            .map_err(InterceptError::at(Exchange))?;
        let origin_driver = tokio::spawn(async move {
            if let Err(err) = origin_conn.await {
                tracing::debug!("origin connection closed: {err}");
            }
        });

        let exchange = Arc::new(TunnelExchange {
            authority,
            sender: AsyncMutex::new(sender),
            recorder: self.recorder.clone(),
        });
        let service = service_fn(move |req| {
            let exchange = Arc::clone(&exchange);
            async move { exchange.forward(req).await }
        });
        let served = hyper::server::conn::http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(client_tls), service)
            .await
            .context("serve tunneled HTTP/1 exchange")
            .map_err(InterceptError::at(Exchange));

        origin_driver.abort();
        served
    }

    async fn issue_leaf(&self, host: &str) -> anyhow::Result<IssuedCert> {
        let issuer = Arc::clone(&self.issuer);
        let host = host.to_owned();
        tokio::task::spawn_blocking(move || issuer.issue_for(&host))
            .await
            .context("join leaf issuance task")?
    }
}

struct TunnelExchange {
    authority: Authority,
    sender: AsyncMutex<SendRequest<Full<Bytes>>>,
    recorder: Recorder,
}

impl TunnelExchange {
    async fn forward(&self, req: Request<Incoming>) -> anyhow::Result<Response<Full<Bytes>>> {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .context("read tunneled request body")?
            .to_bytes();
        let captured_request = CapturedRequest::from_parts(&parts, &body);

        let mut outbound = Request::new(Full::new(body));
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = parts
            .uri
            .path_and_query()
            .map(|path_and_query| path_and_query.as_str())
            .unwrap_or("/")
            .parse()
            .context("build origin-form request target")?;
        *outbound.headers_mut() = parts.headers;
        if !outbound.headers().contains_key(header::HOST) {
            let host = HeaderValue::from_str(self.authority.as_str())
                .context("build Host header from CONNECT authority")?;
            outbound.headers_mut().insert(header::HOST, host);
        }

        let response = self
            .sender
            .lock()
            .await
            .send_request(outbound)
            .await
            .context("send request to origin")?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .context("read origin response body")?
            .to_bytes();

        let captured_response = CapturedResponse::from_parts(&parts, &body);
        self.recorder
            .save_or_log(captured_request, captured_response)
            .await;

        Ok(Response::from_parts(parts, Full::new(body)))
    }
}
