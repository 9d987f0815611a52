use std::{fmt, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, Uri,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use url::Url;

use crate::{
    capture::CapturedRequest,
    storage::{InteractionId, InteractionStore, StoreError},
    tls,
};

type ReplayClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Stored headers that are rebuilt by the transport or from other fields.
const SKIPPED_HEADERS: [&str; 6] = [
    "host",
    "cookie",
    "content-length",
    "transfer-encoding",
    "connection",
    "proxy-connection",
];

#[derive(Debug)]
pub enum ReplayError {
    NotFound(InteractionId),
    Store(StoreError),
    InvalidTarget(String),
    Upstream(String),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "interaction {id} was not found"),
            Self::Store(err) => write!(f, "{err}"),
            Self::InvalidTarget(message) => write!(f, "invalid replay target: {message}"),
            Self::Upstream(message) => write!(f, "replay request failed: {message}"),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<StoreError> for ReplayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            err @ StoreError::Unavailable(_) => Self::Store(err),
        }
    }
}

/// Re-issues stored requests against their origin. Replayed exchanges are
/// returned to the caller and never recorded.
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    store: Arc<dyn InteractionStore>,
    client: ReplayClient,
}

impl ReplayEngine {
    pub fn new(store: Arc<dyn InteractionStore>) -> anyhow::Result<Self> {
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls::insecure_client_config()?)
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self { store, client })
    }

    pub async fn replay(&self, id: InteractionId) -> Result<Response<Incoming>, ReplayError> {
        let interaction = self.store.get(id).await?;
        let request = build_replay_request(&interaction.request)?;
        tracing::debug!(
            interaction_id = id,
            method = %request.method(),
            uri = %request.uri(),
            "replaying interaction"
        );

        self.client
            .request(request)
            .await
            .map_err(|err| ReplayError::Upstream(format!("{err:#}")))
    }
}

pub fn build_replay_request(captured: &CapturedRequest) -> Result<Request<Full<Bytes>>, ReplayError> {
    let method = Method::from_bytes(captured.method.as_bytes()).map_err(|err| {
        ReplayError::InvalidTarget(format!("stored method `{}`: {err}", captured.method))
    })?;
    let target = replay_target(captured)?;
    let uri: Uri = target
        .as_str()
        .parse()
        .map_err(|err| ReplayError::InvalidTarget(format!("`{target}`: {err}")))?;

    let mut request = Request::new(Full::new(Bytes::from(captured.body.clone())));
    *request.method_mut() = method;
    *request.uri_mut() = uri;

    let headers = request.headers_mut();
    for (name, value) in &captured.headers {
        if SKIPPED_HEADERS
            .iter()
            .any(|skipped| name.eq_ignore_ascii_case(skipped))
        {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::debug!(header = %name, "skipping stored header that is not valid HTTP"),
        }
    }

    if let Some(cookie) = cookie_header(captured) {
        headers.insert(header::COOKIE, cookie);
    }
    Ok(request)
}

/// `Referer` scheme and host when usable, otherwise plain HTTP to the stored
/// `Host`, otherwise the stored path read as `host/path`.
pub fn replay_target(captured: &CapturedRequest) -> Result<Url, ReplayError> {
    let mut target = match referer_origin(captured) {
        Some(mut referer) => {
            referer.set_path(&captured.path);
            referer
        }
        None => {
            let raw = match captured.header("host") {
                Some(host) if captured.path.starts_with('/') => {
                    format!("http://{}{}", host.trim(), captured.path)
                }
                _ => format!("http://{}", captured.path),
            };
            Url::parse(&raw).map_err(|err| ReplayError::InvalidTarget(format!("`{raw}`: {err}")))?
        }
    };

    target.set_query(None);
    target.set_fragment(None);
    if !captured.get_params.is_empty() {
        target
            .query_pairs_mut()
            .extend_pairs(captured.get_params.iter());
    }
    Ok(target)
}

fn referer_origin(captured: &CapturedRequest) -> Option<Url> {
    let mut referer = Url::parse(captured.header("referer")?.trim()).ok()?;
    if !matches!(referer.scheme(), "http" | "https") || referer.host_str().is_none() {
        return None;
    }
    referer.set_username("").ok()?;
    referer.set_password(None).ok()?;
    Some(referer)
}

fn cookie_header(captured: &CapturedRequest) -> Option<HeaderValue> {
    if captured.cookies.is_empty() {
        return None;
    }
    let pairs: Vec<String> = captured
        .cookies
        .iter()
        .map(|(name, value)| cookie::Cookie::new(name.as_str(), value.as_str()).to_string())
        .collect();
    HeaderValue::from_str(&pairs.join("; ")).ok()
}
