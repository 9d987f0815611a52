use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    http::uri::Authority,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::{
    capture::{CapturedRequest, CapturedResponse},
    proxy::{authority_target, bounded, proxy_simple_response},
    recorder::Recorder,
};

const HTTP_DEFAULT_PORT: u16 = 80;
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Forwards one plain-HTTP request to its origin and records the exchange.
/// The response reaches the client unchanged even when recording fails.
pub async fn relay(
    req: Request<Incoming>,
    recorder: &Recorder,
    upstream_timeout: Option<Duration>,
) -> Response<Full<Bytes>> {
    let Some(authority) = origin_authority(&req) else {
        return proxy_simple_response(
            StatusCode::BAD_REQUEST,
            "request target has no authority and no Host header",
        );
    };
    let target = authority_target(&authority, HTTP_DEFAULT_PORT);

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(body) => body.to_bytes(),
        Err(err) => {
            tracing::debug!("failed to read client request body: {err}");
            return proxy_simple_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };
    let captured_request = CapturedRequest::from_parts(&parts, &body);

    let outbound = match origin_request(parts, body, &target) {
        Ok(outbound) => outbound,
        Err(err) => {
            tracing::debug!(target = %target, "failed to build origin request: {err:#}");
            return proxy_simple_response(StatusCode::BAD_REQUEST, "invalid request target");
        }
    };

    let response = match exchange(outbound, &target, upstream_timeout).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(target = %target, "plain relay failed: {err:#}");
            return proxy_simple_response(StatusCode::BAD_GATEWAY, "origin request failed");
        }
    };

    let (parts, body) = response.into_parts();
    let captured_response = CapturedResponse::from_parts(&parts, &body);
    recorder.save_or_log(captured_request, captured_response).await;

    Response::from_parts(parts, Full::new(body))
}

/// Absolute-form target first, then the `Host` header.
fn origin_authority<B>(req: &Request<B>) -> Option<Authority> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.clone());
    }
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn origin_request(
    parts: hyper::http::request::Parts,
    body: Bytes,
    target: &str,
) -> anyhow::Result<Request<Full<Bytes>>> {
    let sends_body = parts.method == Method::POST || parts.method == Method::PUT;
    let body = if sends_body { body } else { Bytes::new() };

    let mut outbound = Request::new(Full::new(body));
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = parts
        .uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or("/")
        .parse()
        .context("build origin-form request target")?;

    let headers = outbound.headers_mut();
    *headers = parts.headers;
    headers.remove(PROXY_CONNECTION);
    if !sends_body {
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
    }
    headers.insert(
        header::HOST,
        HeaderValue::from_str(target).context("build Host header")?,
    );
    Ok(outbound)
}

async fn exchange(
    outbound: Request<Full<Bytes>>,
    target: &str,
    upstream_timeout: Option<Duration>,
) -> anyhow::Result<Response<Bytes>> {
    let stream = bounded(upstream_timeout, TcpStream::connect(target))
        .await
        .with_context(|| format!("connect to origin {target}"))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("start HTTP/1 session with origin")?;
    let driver = tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!("origin connection closed: {err}");
        }
    });

    let result = async {
        let response = sender
            .send_request(outbound)
            .await
            .context("send request to origin")?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .context("read origin response body")?
            .to_bytes();
        Ok::<_, anyhow::Error>(Response::from_parts(parts, body))
    }
    .await;

    driver.abort();
    result
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use hyper::{Request, header};

    use super::{origin_authority, origin_request};

    #[test]
    fn authority_comes_from_absolute_target_then_host_header() {
        let absolute = Request::get("http://example.com:8081/a?b=1")
            .header("host", "ignored.example")
            .body(())
            .unwrap();
        assert_eq!(
            origin_authority(&absolute).map(|authority| authority.to_string()),
            Some("example.com:8081".to_owned())
        );

        let origin_form = Request::get("/a").header("host", "example.com").body(()).unwrap();
        assert_eq!(
            origin_authority(&origin_form).map(|authority| authority.to_string()),
            Some("example.com".to_owned())
        );

        let missing = Request::get("/a").body(()).unwrap();
        assert!(origin_authority(&missing).is_none());
    }

    #[test]
    fn origin_request_uses_origin_form_and_explicit_host() {
        let (parts, ()) = Request::get("http://example.com/search?q=1")
            .header("proxy-connection", "keep-alive")
            .header("x-custom", "kept")
            .header("content-length", "5")
            .body(())
            .unwrap()
            .into_parts();

        let outbound = origin_request(parts, Bytes::from_static(b"dropp"), "example.com:80").unwrap();
        assert_eq!(outbound.uri().to_string(), "/search?q=1");
        assert_eq!(outbound.headers()[header::HOST], "example.com:80");
        assert_eq!(outbound.headers()["x-custom"], "kept");
        assert!(!outbound.headers().contains_key("proxy-connection"));
        assert!(!outbound.headers().contains_key(header::CONTENT_LENGTH));
    }

    #[test]
    fn origin_request_keeps_body_for_post() {
        let (parts, ()) = Request::post("http://example.com/form")
            .header("content-length", "3")
            .body(())
            .unwrap()
            .into_parts();

        let outbound = origin_request(parts, Bytes::from_static(b"a=1"), "example.com:80").unwrap();
        assert_eq!(outbound.headers()[header::CONTENT_LENGTH], "3");
        assert_eq!(outbound.method(), hyper::Method::POST);
    }
}
