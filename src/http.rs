//! HTTP surface: browser endpoints driven by [`LoginFlow`] plus the JSON admin endpoints.

use crate::backend::Stores;
use crate::error::{invalid_request, ErrorKind, IdpError, IdpResult};
use crate::flow::{blocking, Credentials, FlowOutcome, FlowResponse, LoginFlow};
use crate::model::{ServiceProvider, Session, SessionId};
use crate::saml::metadata::{parse_sp_metadata, IdpMetadata};
use crate::saml::request::{Binding, SamlRequestParams};
use crate::saml::{IdentityProvider, SigningCredentials};
use axum::extract::rejection::{FormRejection, JsonRejection, QueryRejection};
use axum::extract::{Form, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_cookies::cookie::time::Duration as CookieDuration;
use tower_cookies::{Cookie, CookieManagerLayer, Cookies};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const SESSION_COOKIE: &str = "session";
const XML_CONTENT_TYPE: &str = "application/xml";

#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<LoginFlow>,
    pub stores: Stores,
    pub idp: Arc<IdentityProvider>,
    pub credentials: Arc<SigningCredentials>,
    pub google_metadata_path: PathBuf,
    /// Fallback for the cookie `Secure` flag when no `X-Forwarded-Proto` header is present.
    pub gateway_is_https: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metadata", get(metadata))
        .route("/metadata/google", get(google_metadata))
        .route("/login", get(login_page).post(login_submit))
        .route("/sso", get(sso_redirect).post(sso_post))
        .route(
            "/services",
            get(list_services)
                .post(register_service)
                .delete(delete_service),
        )
        .route("/sessions", get(list_sessions).delete(delete_session))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: &'a str,
}

impl IntoResponse for IdpError {
    fn into_response(self) -> Response {
        let (status, code) = match self.kind() {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Expired => (StatusCode::NOT_FOUND, "expired"),
            ErrorKind::InvalidRequest => (StatusCode::BAD_REQUEST, "invalid_request"),
            ErrorKind::Internal | ErrorKind::Config => {
                error!(error = %self, "admin request failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "internal",
                        message: "internal server error",
                    }),
                )
                    .into_response();
            }
        };
        (
            status,
            Json(ErrorBody {
                error: code,
                message: self.message(),
            }),
        )
            .into_response()
    }
}

async fn metadata(State(state): State<AppState>) -> Response {
    match IdpMetadata::new(&state.idp, &state.credentials).to_xml() {
        Ok(xml) => ([(header::CONTENT_TYPE, XML_CONTENT_TYPE)], xml).into_response(),
        Err(err) => {
            error!(error = %err, "rendering idp metadata failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn google_metadata(State(state): State<AppState>) -> Response {
    match tokio::fs::read_to_string(&state.google_metadata_path).await {
        Ok(xml) => ([(header::CONTENT_TYPE, XML_CONTENT_TYPE)], xml).into_response(),
        Err(err) => {
            error!(
                path = %state.google_metadata_path.display(),
                error = %err,
                "reading google metadata failed"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoginFields {
    email: Option<String>,
    password: Option<String>,
}

impl From<LoginFields> for Credentials {
    fn from(fields: LoginFields) -> Self {
        Credentials {
            email: fields.email,
            password: fields.password,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SsoForm {
    #[serde(rename = "SAMLRequest")]
    saml_request: Option<String>,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
    email: Option<String>,
    password: Option<String>,
}

async fn login_page(State(state): State<AppState>) -> Response {
    state.flow.login_page().into_response()
}

async fn login_submit(
    State(state): State<AppState>,
    cookies: Cookies,
    headers: HeaderMap,
    fields: Result<Form<LoginFields>, FormRejection>,
) -> Response {
    let Form(fields) = match fields {
        Ok(fields) => fields,
        Err(rejection) => return unreadable(&state, &rejection.body_text()),
    };
    let outcome = state.flow.login(fields.into()).await;
    respond(&state, &cookies, &headers, outcome)
}

async fn sso_redirect(
    State(state): State<AppState>,
    cookies: Cookies,
    headers: HeaderMap,
    params: Result<Query<SamlRequestParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return unreadable(&state, &rejection.body_text()),
    };
    let outcome = state
        .flow
        .sso(Binding::Redirect, params, session_cookie(&cookies))
        .await;
    respond(&state, &cookies, &headers, outcome)
}

async fn sso_post(
    State(state): State<AppState>,
    cookies: Cookies,
    headers: HeaderMap,
    form: Result<Form<SsoForm>, FormRejection>,
) -> Response {
    let Form(form) = match form {
        Ok(form) => form,
        Err(rejection) => return unreadable(&state, &rejection.body_text()),
    };
    let params = SamlRequestParams {
        saml_request: form.saml_request,
        relay_state: form.relay_state,
    };
    let credentials = Credentials {
        email: form.email,
        password: form.password,
    };
    let outcome = state
        .flow
        .sso_post(params, credentials, session_cookie(&cookies))
        .await;
    respond(&state, &cookies, &headers, outcome)
}

/// Browser endpoints answer unreadable input with the bad-request page, never plain text.
fn unreadable(state: &AppState, reason: &str) -> Response {
    info!(reason, "unreadable browser request");
    state.flow.bad_request(reason).into_response()
}

fn session_cookie(cookies: &Cookies) -> Option<SessionId> {
    cookies
        .get(SESSION_COOKIE)
        .map(|cookie| SessionId::new(cookie.value()))
        .filter(|id| !id.as_str().is_empty())
}

/// Sets the session cookie for a freshly started session, then renders the outcome.
fn respond(
    state: &AppState,
    cookies: &Cookies,
    headers: &HeaderMap,
    outcome: FlowOutcome,
) -> Response {
    if let Some(session) = &outcome.new_session {
        let value = session.id.as_str().to_owned();
        let cookie: Cookie<'static> = Cookie::build((SESSION_COOKIE, value))
            .path("/")
            .http_only(true)
            .secure(is_https(headers, state.gateway_is_https))
            .max_age(CookieDuration::seconds(i64::from(
                state.flow.settings().session_lifetime_secs,
            )))
            .build();
        cookies.add(cookie);
    }
    outcome.into_response()
}

fn is_https(headers: &HeaderMap, fallback: bool) -> bool {
    match headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
    {
        Some(proto) => proto
            .split(',')
            .next()
            .is_some_and(|first| first.trim().eq_ignore_ascii_case("https")),
        None => fallback,
    }
}

impl IntoResponse for FlowOutcome {
    fn into_response(self) -> Response {
        match self.response {
            FlowResponse::Html { status, body } => (status, Html(body)).into_response(),
            FlowResponse::Redirect { location } => {
                (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
            }
        }
    }
}

async fn register_service(State(state): State<AppState>, body: String) -> IdpResult<StatusCode> {
    let metadata = parse_sp_metadata(&body)?;
    let name = metadata.entity_id;
    let registry = state.stores.services.clone();
    let sp = ServiceProvider::new(name.clone(), body);
    blocking(move || registry.register(sp)).await?;
    info!(service = %name, "registered service provider");
    Ok(StatusCode::CREATED)
}

fn json_rejection(rejection: JsonRejection) -> IdpError {
    invalid_request(rejection.body_text())
}

async fn list_services(State(state): State<AppState>) -> IdpResult<Json<Vec<ServiceProvider>>> {
    let registry = state.stores.services.clone();
    Ok(Json(blocking(move || registry.list_all()).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteService {
    service_id: String,
}

async fn delete_service(
    State(state): State<AppState>,
    body: Result<Json<DeleteService>, JsonRejection>,
) -> IdpResult<&'static str> {
    let Json(body) = body.map_err(json_rejection)?;
    let registry = state.stores.services.clone();
    let name = body.service_id;
    let target = name.clone();
    blocking(move || registry.delete(&target)).await?;
    info!(service = %name, "deleted service provider");
    Ok("OK")
}

async fn list_sessions(State(state): State<AppState>) -> IdpResult<Json<Vec<Session>>> {
    let sessions = state.stores.sessions.clone();
    Ok(Json(blocking(move || sessions.list_all()).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteSession {
    session_id: String,
}

async fn delete_session(
    State(state): State<AppState>,
    body: Result<Json<DeleteSession>, JsonRejection>,
) -> IdpResult<&'static str> {
    let Json(body) = body.map_err(json_rejection)?;
    if body.session_id.is_empty() {
        return Err(invalid_request("sessionId must not be empty"));
    }
    let sessions = state.stores.sessions.clone();
    let id = SessionId::new(body.session_id);
    let fingerprint = id.fingerprint();
    blocking(move || sessions.delete(&id)).await?;
    info!(session = %fingerprint, "deleted session");
    Ok("OK")
}
