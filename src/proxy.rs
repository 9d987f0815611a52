use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, ext::ReasonPhrase,
    http::uri::Authority, server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, sync::oneshot};
use tracing::Instrument as _;

use crate::{
    admin::{self, AdminState},
    ca::CertIssuer,
    config::Config,
    intercept::Interceptor,
    recorder::Recorder,
    relay,
    storage::{self, InteractionStore},
    tls,
};

const CONNECT_ESTABLISHED: &[u8] = b"Connection established";

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: Option<SocketAddr>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    admin_shutdown_tx: Option<oneshot::Sender<()>>,
    admin_join: Option<tokio::task::JoinHandle<()>>,
}

impl ProxyHandle {
    /// Stops accepting connections. Tasks already serving a connection run
    /// to completion on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Some(admin_shutdown_tx) = self.admin_shutdown_tx {
            let _ = admin_shutdown_tx.send(());
        }
        let _ = self.join.await;
        if let Some(admin_join) = self.admin_join {
            let _ = admin_join.await;
        }
    }
}

#[derive(Debug)]
struct ProxyState {
    interceptor: Arc<Interceptor>,
    recorder: Recorder,
    upstream_timeout: Option<Duration>,
}

pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    let store = storage::open_store(config)?;
    serve_with_store(config, store).await
}

pub async fn serve_with_store(
    config: &Config,
    store: Arc<dyn InteractionStore>,
) -> anyhow::Result<ProxyHandle> {
    tls::ensure_rustls_crypto_provider()?;
    let issuer = Arc::new(CertIssuer::from_ca_dir(
        &config.ca_dir()?,
        &config.cert_cache_dir()?,
    )?);

    let listener = TcpListener::bind(config.proxy.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.proxy.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;
    let admin_listener = match config.proxy.admin_listen_addr() {
        Some(admin_addr) => Some(
            TcpListener::bind(admin_addr)
                .await
                .map_err(|err| anyhow::anyhow!("bind admin {admin_addr}: {err}"))?,
        ),
        None => None,
    };
    let admin_listen_addr = match admin_listener.as_ref() {
        Some(admin_listener) => Some(
            admin_listener
                .local_addr()
                .map_err(|err| anyhow::anyhow!("get admin local_addr: {err}"))?,
        ),
        None => None,
    };

    let admin_state = match admin_listener.as_ref() {
        Some(_) => Some(Arc::new(AdminState::new(Arc::clone(&store))?)),
        None => None,
    };
    let recorder = Recorder::new(store);
    let upstream_timeout = config.proxy.upstream_timeout();
    let state = Arc::new(ProxyState {
        interceptor: Arc::new(Interceptor::new(
            issuer,
            recorder.clone(),
            upstream_timeout,
        )?),
        recorder,
        upstream_timeout,
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::debug!("accept failed: {err}");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            tracing::debug!(peer = %peer, "connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    let (admin_shutdown_tx, admin_join) = match (admin_listener, admin_state) {
        (Some(admin_listener), Some(admin_state)) => {
            let (admin_shutdown_tx, admin_join) = spawn_admin_listener(admin_listener, admin_state);
            (Some(admin_shutdown_tx), Some(admin_join))
        }
        _ => (None, None),
    };

    Ok(ProxyHandle {
        listen_addr,
        admin_listen_addr,
        shutdown_tx,
        join,
        admin_shutdown_tx,
        admin_join,
    })
}

fn spawn_admin_listener(
    admin_listener: TcpListener,
    admin_state: Arc<AdminState>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let (admin_shutdown_tx, mut admin_shutdown_rx) = oneshot::channel::<()>();
    let admin_join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut admin_shutdown_rx => break,
                accept = admin_listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let admin_state = Arc::clone(&admin_state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            admin::admin_handler(req, Arc::clone(&admin_state))
                        });
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            tracing::debug!("admin connection error: {err}");
                        }
                    });
                }
            }
        }
    });
    (admin_shutdown_tx, admin_join)
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let request_span = tracing::info_span!(
        "proxy.request",
        method = %req.method(),
        url = %req.uri(),
    );

    if req.method() == Method::CONNECT {
        let _request_span_guard = request_span.enter();
        return Ok(start_interception(req, &state, &request_span));
    }

    Ok(relay::relay(req, &state.recorder, state.upstream_timeout)
        .instrument(request_span)
        .await)
}

/// Answers the CONNECT and hands the upgraded socket to a spawned
/// interception task.
fn start_interception(
    mut req: Request<Incoming>,
    state: &ProxyState,
    request_span: &tracing::Span,
) -> Response<Full<Bytes>> {
    let Some(authority) = req.uri().authority().cloned() else {
        return proxy_simple_response(
            StatusCode::BAD_REQUEST,
            "CONNECT request target must include authority",
        );
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let interceptor = Arc::clone(&state.interceptor);
    tokio::spawn(
        async move {
            if let Err(err) = interceptor.run(on_upgrade, authority.clone()).await {
                tracing::debug!(
                    stage = %err.stage(),
                    authority = %authority,
                    "intercept aborted: {err}"
                );
            }
        }
        .instrument(request_span.clone()),
    );

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::OK;
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(CONNECT_ESTABLISHED));
    response
}

pub(crate) fn proxy_simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

/// `host:port` dial target for `authority`, bracketing bare IPv6 literals.
pub(crate) fn authority_target(authority: &Authority, default_port: u16) -> String {
    if authority.port().is_some() {
        return authority.as_str().to_owned();
    }
    let host = authority.host();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{default_port}")
    } else {
        format!("{host}:{default_port}")
    }
}

/// Awaits `operation`, giving up after `limit` when one is configured.
pub(crate) async fn bounded<T>(
    limit: Option<Duration>,
    operation: impl Future<Output = std::io::Result<T>>,
) -> anyhow::Result<T> {
    let Some(limit) = limit else {
        return Ok(operation.await?);
    };
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => Ok(result?),
        Err(_) => anyhow::bail!("timed out after {}ms", limit.as_millis()),
    }
}
