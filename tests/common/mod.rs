#![allow(dead_code)]

use std::{convert::Infallible, io::Write as _, net::SocketAddr, path::Path, sync::Arc};

use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use http_body_util::{BodyExt as _, Full};
use hyper::{Request, Response, StatusCode, body::Incoming, service::service_fn};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use snoopproxy::config::Config;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

pub const GZIP_PLAINTEXT: &[u8] = b"compressed hello from origin";

#[derive(Debug)]
pub struct SeenRequest {
    pub method: hyper::Method,
    pub uri: hyper::Uri,
    pub headers: hyper::HeaderMap,
    pub body: Bytes,
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// `/gzip` answers with a gzip payload, `/redirect` with a 302, anything
/// else with `hello`.
async fn origin_response(
    req: Request<Incoming>,
    tx: mpsc::UnboundedSender<SeenRequest>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    let path = parts.uri.path().to_owned();
    let _ = tx.send(SeenRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    });

    let response = match path.as_str() {
        "/gzip" => Response::builder()
            .status(StatusCode::OK)
            .header("content-encoding", "gzip")
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(gzip(GZIP_PLAINTEXT)))),
        "/redirect" => Response::builder()
            .status(StatusCode::FOUND)
            .header("location", "/elsewhere")
            .body(Full::new(Bytes::new())),
        _ => Response::builder()
            .status(StatusCode::OK)
            .header("x-origin", "yes")
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .body(Full::new(Bytes::from_static(b"hello"))),
    };
    Ok(response.unwrap())
}

fn serve_origin_connection<I>(io: I, tx: mpsc::UnboundedSender<SeenRequest>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let service = service_fn(move |req| origin_response(req, tx.clone()));
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .await;
    });
}

pub async fn spawn_http_origin() -> (SocketAddr, mpsc::UnboundedReceiver<SeenRequest>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    let join = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            serve_origin_connection(stream, tx.clone());
        }
    });
    (addr, rx, join)
}

/// TLS origin with a self-signed certificate no client would trust.
pub async fn spawn_https_origin() -> (SocketAddr, mpsc::UnboundedReceiver<SeenRequest>, JoinHandle<()>) {
    snoopproxy::tls::ensure_rustls_crypto_provider().unwrap();

    let key_pair = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec!["origin.invalid".to_owned()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    let join = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_origin_connection(tls, tx);
                }
            });
        }
    });
    (addr, rx, join)
}

pub fn proxy_config(scratch: &Path) -> Config {
    let ca_dir = scratch.join("ca");
    snoopproxy::ca::generate_ca(&ca_dir, false).unwrap();
    Config::from_toml_str(&format!(
        r#"
[proxy]
listen = "127.0.0.1:0"
admin_listen = "127.0.0.1:0"
upstream_timeout_ms = 5000

[tls]
ca_dir = "{}"
cert_cache_dir = "{}"
"#,
        ca_dir.display(),
        scratch.join("certs").display()
    ))
    .unwrap()
}

pub async fn admin_get(admin_addr: SocketAddr, path: &str) -> (StatusCode, Bytes) {
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    let uri: hyper::Uri = format!("http://{admin_addr}{path}").parse().unwrap();
    let response = client.get(uri).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

/// Reads an HTTP/1 response head byte by byte so nothing past the blank line
/// is consumed.
pub async fn read_response_head<S>(stream: &mut S) -> String
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let byte = stream.read_u8().await.unwrap();
        head.push(byte);
    }
    String::from_utf8(head).unwrap()
}
