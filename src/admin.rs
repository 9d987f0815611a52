//! Read-only administrative API over recorded interactions.
//!
//! `GET /requests` lists every captured request, `GET /requests/{id}` returns
//! one, and `GET /repeat/{id}` replays it and streams the origin's answer
//! back verbatim.

use std::{convert::Infallible, error::Error as StdError, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode,
    header::{self, HeaderValue},
};
use serde::Serialize;

use crate::{
    capture::CapturedRequest,
    replay::{ReplayEngine, ReplayError},
    storage::{Interaction, InteractionId, InteractionStore, StoreError},
};

pub type AdminBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;

#[derive(Debug, Clone)]
pub struct AdminState {
    store: Arc<dyn InteractionStore>,
    replay: ReplayEngine,
}

impl AdminState {
    pub fn new(store: Arc<dyn InteractionStore>) -> anyhow::Result<Self> {
        let replay = ReplayEngine::new(Arc::clone(&store))?;
        Ok(Self { store, replay })
    }
}

#[derive(Debug, Serialize)]
struct AdminErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct AdminRequestView<'a> {
    id: InteractionId,
    #[serde(flatten)]
    request: &'a CapturedRequest,
}

impl<'a> From<&'a Interaction> for AdminRequestView<'a> {
    fn from(interaction: &'a Interaction) -> Self {
        Self {
            id: interaction.id,
            request: &interaction.request,
        }
    }
}

enum AdminRoute<'a> {
    ListRequests,
    GetRequest(&'a str),
    Repeat(&'a str),
}

fn route(path: &str) -> Option<AdminRoute<'_>> {
    let path = path.strip_suffix('/').filter(|path| !path.is_empty()).unwrap_or(path);
    if path == "/requests" {
        return Some(AdminRoute::ListRequests);
    }
    if let Some(id) = path.strip_prefix("/requests/") {
        return Some(AdminRoute::GetRequest(id));
    }
    path.strip_prefix("/repeat/").map(AdminRoute::Repeat)
}

pub async fn admin_handler<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<AdminBody>, Infallible> {
    let Some(route) = route(req.uri().path()) else {
        return Ok(admin_error_response(StatusCode::NOT_FOUND, "not found"));
    };
    if req.method() != Method::GET {
        return Ok(admin_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }

    let response = match route {
        AdminRoute::ListRequests => list_requests(&state).await,
        AdminRoute::GetRequest(raw_id) => match parse_id(raw_id) {
            Ok(id) => get_request(&state, id).await,
            Err(response) => response,
        },
        AdminRoute::Repeat(raw_id) => match parse_id(raw_id) {
            Ok(id) => repeat(&state, id).await,
            Err(response) => response,
        },
    };
    Ok(response)
}

fn parse_id(raw: &str) -> Result<InteractionId, Response<AdminBody>> {
    raw.parse::<InteractionId>().map_err(|_| {
        admin_error_response(
            StatusCode::BAD_REQUEST,
            format!("malformed interaction id `{raw}`"),
        )
    })
}

async fn list_requests(state: &AdminState) -> Response<AdminBody> {
    match state.store.list().await {
        Ok(interactions) => {
            let views: Vec<AdminRequestView<'_>> =
                interactions.iter().map(AdminRequestView::from).collect();
            admin_json_response(StatusCode::OK, &views)
        }
        Err(err) => store_error_response(err),
    }
}

async fn get_request(state: &AdminState, id: InteractionId) -> Response<AdminBody> {
    match state.store.get(id).await {
        Ok(interaction) => {
            admin_json_response(StatusCode::OK, &AdminRequestView::from(&interaction))
        }
        Err(err) => store_error_response(err),
    }
}

async fn repeat(state: &AdminState, id: InteractionId) -> Response<AdminBody> {
    match state.replay.replay(id).await {
        Ok(response) => response.map(|body| {
            body.map_err(|err| Box::new(err) as Box<dyn StdError + Send + Sync>)
                .boxed()
        }),
        Err(ReplayError::NotFound(id)) => admin_error_response(
            StatusCode::NOT_FOUND,
            format!("interaction {id} was not found"),
        ),
        Err(err) => {
            tracing::debug!(interaction_id = id, "replay failed: {err}");
            admin_error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn store_error_response(err: StoreError) -> Response<AdminBody> {
    match err {
        StoreError::NotFound(_) => admin_error_response(StatusCode::NOT_FOUND, err.to_string()),
        StoreError::Unavailable(_) => {
            tracing::warn!("admin store lookup failed: {err}");
            admin_error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn full_body(bytes: impl Into<Bytes>) -> AdminBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<AdminBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn admin_error_response(status: StatusCode, message: impl Into<String>) -> Response<AdminBody> {
    let payload = AdminErrorResponse {
        error: message.into(),
    };
    match serde_json::to_vec(&payload) {
        Ok(body) => json_response(status, body),
        Err(err) => {
            tracing::debug!("failed to serialize admin error response: {err}");
            let mut response = Response::new(full_body("failed to serialize admin error response"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn admin_json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<AdminBody> {
    match serde_json::to_vec(payload) {
        Ok(body) => json_response(status, body),
        Err(err) => {
            tracing::debug!("failed to serialize admin JSON response: {err}");
            admin_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize admin response",
            )
        }
    }
}
