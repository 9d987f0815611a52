//! Text snapshots of one request/response exchange.
//!
//! Multi-valued fields collapse to one string per name: query, form and
//! cookie duplicates keep the first value, repeated headers are joined with
//! `", "` in arrival order. Every string goes through [`sanitize_text`], so a
//! captured record always serializes.

use std::{collections::BTreeMap, io::Read as _};

use flate2::read::GzDecoder;
use hyper::{
    HeaderMap, Method, StatusCode,
    ext::ReasonPhrase,
    header::{self, HeaderName},
    http::{request, response},
};
use serde::{Deserialize, Serialize};

pub type FieldMap = BTreeMap<String, String>;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub get_params: FieldMap,
    pub headers: FieldMap,
    pub cookies: FieldMap,
    pub post_params: FieldMap,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub code: u16,
    pub message: String,
    pub headers: FieldMap,
    pub body: String,
}

impl CapturedRequest {
    pub fn from_parts(parts: &request::Parts, body: &[u8]) -> Self {
        let post_params = if carries_form_body(&parts.method, &parts.headers) {
            first_value_pairs(body)
        } else {
            FieldMap::new()
        };

        Self {
            method: sanitize_text(parts.method.as_str().as_bytes()),
            path: sanitize_text(parts.uri.path().as_bytes()),
            get_params: parts
                .uri
                .query()
                .map(|query| first_value_pairs(query.as_bytes()))
                .unwrap_or_default(),
            headers: collapse_headers(&parts.headers),
            cookies: collect_cookies(&parts.headers),
            post_params,
            body: sanitize_text(body),
        }
    }

    /// Header lookup ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl CapturedResponse {
    /// `body` is the payload as the origin sent it; a gzip payload is
    /// decoded here and only here.
    pub fn from_parts(parts: &response::Parts, body: &[u8]) -> Self {
        let decoded = if is_gzip_encoded(&parts.headers) {
            match decode_gzip(body) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    tracing::debug!("keeping raw body, gzip decode failed: {err}");
                    None
                }
            }
        } else {
            None
        };

        Self {
            code: parts.status.as_u16(),
            message: status_message(parts.status, parts.extensions.get::<ReasonPhrase>()),
            headers: collapse_headers(&parts.headers),
            body: sanitize_text(decoded.as_deref().unwrap_or(body)),
        }
    }
}

/// Replaces ill-formed UTF-8 with U+FFFD. Valid input is returned unchanged,
/// which makes the operation idempotent.
pub fn sanitize_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn collapse_headers(headers: &HeaderMap) -> FieldMap {
    headers
        .keys()
        .map(|name| (sanitize_text(name.as_str().as_bytes()), joined_values(headers, name)))
        .collect()
}

fn joined_values(headers: &HeaderMap, name: &HeaderName) -> String {
    let values: Vec<String> = headers
        .get_all(name)
        .iter()
        .map(|value| sanitize_text(value.as_bytes()))
        .collect();
    values.join(", ")
}

fn first_value_pairs(encoded: &[u8]) -> FieldMap {
    let mut fields = FieldMap::new();
    for (key, value) in url::form_urlencoded::parse(encoded) {
        fields
            .entry(sanitize_text(key.as_bytes()))
            .or_insert_with(|| sanitize_text(value.as_bytes()));
    }
    fields
}

fn collect_cookies(headers: &HeaderMap) -> FieldMap {
    let mut cookies = FieldMap::new();
    for value in headers.get_all(header::COOKIE) {
        let value = sanitize_text(value.as_bytes());
        for cookie in cookie::Cookie::split_parse(value).flatten() {
            cookies
                .entry(cookie.name().to_owned())
                .or_insert_with(|| cookie.value().to_owned());
        }
    }
    cookies
}

fn carries_form_body(method: &Method, headers: &HeaderMap) -> bool {
    if method != Method::POST && method != Method::PUT {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case(FORM_URLENCODED))
}

fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("gzip"))
}

fn decode_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}

fn status_message(status: StatusCode, reason: Option<&ReasonPhrase>) -> String {
    let reason = match reason {
        Some(reason) => sanitize_text(reason.as_bytes()),
        None => status.canonical_reason().unwrap_or_default().to_owned(),
    };
    if reason.is_empty() {
        status.as_str().to_owned()
    } else {
        format!("{} {reason}", status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use flate2::{Compression, write::GzEncoder};
    use hyper::{Request, Response, ext::ReasonPhrase, header::HeaderValue};

    use super::{CapturedRequest, CapturedResponse, sanitize_text};

    fn request_parts(request: Request<()>) -> hyper::http::request::Parts {
        request.into_parts().0
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn repeated_headers_are_joined_in_arrival_order() {
        let parts = request_parts(
            Request::get("/")
                .header("accept", "text/html")
                .header("x-trace", "first")
                .header("X-Trace", "second")
                .header("x-trace", "third")
                .body(())
                .unwrap(),
        );

        let captured = CapturedRequest::from_parts(&parts, b"");
        assert_eq!(captured.headers["x-trace"], "first, second, third");
        assert_eq!(captured.headers["accept"], "text/html");
        assert_eq!(captured.header("X-TRACE"), Some("first, second, third"));
    }

    #[test]
    fn query_and_cookie_duplicates_keep_the_first_value() {
        let parts = request_parts(
            Request::get("/search?q=rust&page=2&q=go&empty=")
                .header("cookie", "session=abc; theme=dark")
                .header("cookie", "session=override; lang=en")
                .body(())
                .unwrap(),
        );

        let captured = CapturedRequest::from_parts(&parts, b"");
        assert_eq!(captured.method, "GET");
        assert_eq!(captured.path, "/search");
        assert_eq!(captured.get_params["q"], "rust");
        assert_eq!(captured.get_params["page"], "2");
        assert_eq!(captured.get_params["empty"], "");
        assert_eq!(captured.cookies["session"], "abc");
        assert_eq!(captured.cookies["theme"], "dark");
        assert_eq!(captured.cookies["lang"], "en");
    }

    #[test]
    fn form_body_is_parsed_for_post_and_put_only() {
        let body = b"user=alice&note=hello+world&user=bob";
        let post = request_parts(
            Request::post("/login")
                .header("content-type", "application/x-www-form-urlencoded; charset=utf-8")
                .body(())
                .unwrap(),
        );
        let captured = CapturedRequest::from_parts(&post, body);
        assert_eq!(captured.post_params["user"], "alice");
        assert_eq!(captured.post_params["note"], "hello world");
        assert_eq!(captured.body, "user=alice&note=hello+world&user=bob");

        let patch = request_parts(
            Request::patch("/login")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(())
                .unwrap(),
        );
        assert!(CapturedRequest::from_parts(&patch, body).post_params.is_empty());

        let json = request_parts(
            Request::post("/login")
                .header("content-type", "application/json")
                .body(())
                .unwrap(),
        );
        assert!(CapturedRequest::from_parts(&json, b"{}").post_params.is_empty());
    }

    #[test]
    fn invalid_utf8_is_replaced_in_every_field() {
        let mut request = Request::post("/upload")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(())
            .unwrap();
        request.headers_mut().insert(
            "x-binary",
            HeaderValue::from_bytes(b"ok\xff\xfe").unwrap(),
        );
        let parts = request_parts(request);

        let captured = CapturedRequest::from_parts(&parts, b"k=%FF&raw=\xc3\x28");
        assert_eq!(captured.headers["x-binary"], "ok\u{fffd}\u{fffd}");
        assert_eq!(captured.post_params["k"], "\u{fffd}");
        assert!(captured.body.contains('\u{fffd}'));
        serde_json::to_string(&captured).expect("sanitized capture should serialize");
    }

    #[test]
    fn sanitize_is_idempotent() {
        assert_eq!(sanitize_text("plain ütf-8".as_bytes()), "plain ütf-8");

        let once = sanitize_text(b"bad \xf0\x28\x8c\x28 bytes \xff");
        let twice = sanitize_text(once.as_bytes());
        assert_eq!(once, twice);
    }

    #[test]
    fn gzip_body_is_decoded_for_capture() {
        let compressed = gzip(b"hello from origin");
        let (parts, ()) = Response::builder()
            .status(200)
            .header("content-encoding", "gzip")
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .body(())
            .unwrap()
            .into_parts();

        let captured = CapturedResponse::from_parts(&parts, &compressed);
        assert_eq!(captured.code, 200);
        assert_eq!(captured.message, "200 OK");
        assert_eq!(captured.body, "hello from origin");
        assert_eq!(captured.headers["set-cookie"], "a=1, b=2");
    }

    #[test]
    fn broken_gzip_keeps_raw_bytes() {
        let (parts, ()) = Response::builder()
            .status(502)
            .header("content-encoding", "gzip")
            .body(())
            .unwrap()
            .into_parts();

        let captured = CapturedResponse::from_parts(&parts, b"not gzip at all");
        assert_eq!(captured.body, "not gzip at all");
        assert_eq!(captured.message, "502 Bad Gateway");
    }

    #[test]
    fn custom_reason_phrase_is_kept() {
        let mut response = Response::builder().status(200).body(()).unwrap();
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Totally Fine"));
        let (parts, ()) = response.into_parts();

        let captured = CapturedResponse::from_parts(&parts, b"");
        assert_eq!(captured.message, "200 Totally Fine");
    }
}
