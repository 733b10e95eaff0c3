use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use saml_idp::flow::FlowSettings;
use saml_idp::identity::{IdentityLookup, LookupError, UserRecord};
use saml_idp::model::{Session, SessionId, Subject};
use saml_idp::saml::{IdentityProvider, Pages, RequestWindow, SigningCredentials};
use saml_idp::{router, AppState, LoginFlow, Stores};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;

const IDP_BASE: &str = "http://idp.test:8000/saml/idp";
const SSO_URL: &str = "http://idp.test:8000/saml/idp/sso";
const SP_ENTITY: &str = "https://sp.test/metadata";
const SP_ACS: &str = "https://sp.test/acs";
const LANDING: &str = "https://app.test/home";

/// Identity source answering from a fixed table keyed by email.
struct StubLookup {
    users: HashMap<String, Result<UserRecord, LookupError>>,
}

#[async_trait]
impl IdentityLookup for StubLookup {
    async fn find_user(&self, email: &str, _password: &str) -> Result<UserRecord, LookupError> {
        self.users
            .get(email)
            .cloned()
            .unwrap_or_else(|| Err(LookupError::Rejected("unknown user".into())))
    }
}

fn user(email: &str, active: bool) -> UserRecord {
    UserRecord {
        id: format!("id-{email}"),
        email: email.to_string(),
        username: email.split('@').next().unwrap_or_default().to_string(),
        roles: vec!["staff".to_string()],
        active,
    }
}

struct Harness {
    app: Router,
    stores: Stores,
}

fn harness() -> Harness {
    let credentials =
        Arc::new(SigningCredentials::generate_self_signed("idp.test").expect("credentials"));
    let idp = Arc::new(IdentityProvider::new(IDP_BASE));
    let stores = Stores::in_memory();

    let mut users = HashMap::new();
    users.insert("active@example.com".to_string(), Ok(user("active@example.com", true)));
    // The HTTP lookup turns an inactive record into a rejection before the flow sees it.
    users.insert(
        "inactive@example.com".to_string(),
        Err(LookupError::Rejected("account-not-activated".into())),
    );
    users.insert(
        "down@example.com".to_string(),
        Err(LookupError::Unavailable("circuit open".into())),
    );

    let settings = FlowSettings {
        session_lifetime_secs: 3600,
        redirect_from_login: LANDING.to_string(),
        login_action_url: "http://gateway.test/saml/idp/login".to_string(),
        request_window: RequestWindow::default(),
        assertion_validity_secs: 300,
    };
    let flow = LoginFlow::new(
        idp.clone(),
        credentials.clone(),
        stores.sessions.clone(),
        stores.services.clone(),
        Arc::new(StubLookup { users }),
        Pages::default(),
        settings,
    )
    .expect("flow");

    let app = router(AppState {
        flow: Arc::new(flow),
        stores: stores.clone(),
        idp,
        credentials,
        google_metadata_path: PathBuf::from("/nonexistent/google-metadata.xml"),
        gateway_is_https: false,
    });
    Harness { app, stores }
}

fn sp_metadata() -> String {
    format!(
        r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{SP_ENTITY}"><md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol"><md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{SP_ACS}" index="1" isDefault="true"/></md:SPSSODescriptor></md:EntityDescriptor>"#
    )
}

fn authn_request(id: &str, instant: OffsetDateTime) -> String {
    let instant = instant.format(&Rfc3339).expect("format instant");
    format!(
        r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{SSO_URL}" AssertionConsumerServiceURL="{SP_ACS}"><saml:Issuer>{SP_ENTITY}</saml:Issuer></samlp:AuthnRequest>"#
    )
}

fn redirect_query(xml: &str, relay_state: &str) -> String {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(xml.as_bytes()).expect("deflate");
    let deflated = STANDARD.encode(encoder.finish().expect("finish"));
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("SAMLRequest", &deflated)
        .append_pair("RelayState", relay_state)
        .finish()
}

fn form(pairs: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn post_form(uri: &str, body: String) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .expect("request")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.expect("response")
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

fn set_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn seed_session(stores: &Stores, token: &str, created: OffsetDateTime, lifetime: u32) {
    let session = Session::new(
        SessionId::from(token),
        "index-1",
        Subject {
            user_id: "u-1".into(),
            email: "active@example.com".into(),
            username: "active".into(),
            groups: vec!["staff".into()],
        },
        created,
        lifetime,
    );
    stores.sessions.add(session).expect("seed session");
}

fn hidden_value<'a>(html: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!(r#"name="{name}" value=""#);
    let start = html.find(&marker)? + marker.len();
    let len = html[start..].find('"')?;
    Some(&html[start..start + len])
}

#[tokio::test]
async fn login_with_empty_credentials_asks_again() {
    let h = harness();
    let response = send(&h.app, post_form("/login", form(&[("email", " "), ("password", "")]))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response).is_none());
    assert!(body_text(response).await.contains("Credentials required!"));
}

#[tokio::test]
async fn login_with_inactive_account_is_generic_failure() {
    let h = harness();
    let body = form(&[("email", "inactive@example.com"), ("password", "secret-pw")]);
    let response = send(&h.app, post_form("/login", body)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response).is_none());
    let html = body_text(response).await;
    assert!(html.contains("Wrong email or password!"));
    assert!(!html.contains("account-not-activated"));
    assert!(h.stores.sessions.list_all().is_err());
}

#[tokio::test]
async fn login_with_short_password_fails_locally() {
    let h = harness();
    let body = form(&[("email", "active@example.com"), ("password", "12345")]);
    let html = body_text(send(&h.app, post_form("/login", body)).await).await;
    assert!(html.contains("You have entered invalid password"));
}

#[tokio::test]
async fn login_when_identity_source_is_down_shows_retry_message() {
    let h = harness();
    let body = form(&[("email", "down@example.com"), ("password", "secret-pw")]);
    let html = body_text(send(&h.app, post_form("/login", body)).await).await;
    assert!(html.contains("temporarily unavailable"));
    assert!(!html.contains("circuit open"));
}

#[tokio::test]
async fn login_with_active_account_sets_cookie_and_redirects() {
    let h = harness();
    let body = form(&[("email", " active@example.com "), ("password", "secret-pw")]);
    let response = send(&h.app, post_form("/login", body)).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get(header::LOCATION).expect("location"),
        LANDING
    );
    let cookie = set_cookie(&response).expect("session cookie");
    assert!(cookie.starts_with("session="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Path=/"));
    assert!(cookie.contains("Max-Age=3600"));
    assert!(!cookie.contains("Secure"));

    let sessions = h.stores.sessions.list_all().expect("one session");
    assert_eq!(sessions.len(), 1);
    let token = cookie
        .trim_start_matches("session=")
        .split(';')
        .next()
        .expect("value");
    assert_eq!(sessions[0].id.as_str(), token);
    assert_eq!(sessions[0].subject.email, "active@example.com");
}

#[tokio::test]
async fn cookie_is_secure_behind_https_proxy() {
    let h = harness();
    let request = Request::post("/login")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("x-forwarded-proto", "https")
        .body(Body::from(form(&[
            ("email", "active@example.com"),
            ("password", "secret-pw"),
        ])))
        .expect("request");
    let response = send(&h.app, request).await;
    assert!(set_cookie(&response).expect("cookie").contains("Secure"));
}

#[tokio::test]
async fn login_page_targets_gateway_login() {
    let h = harness();
    let response = send(&h.app, Request::get("/login").body(Body::empty()).expect("req")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response)
        .await
        .contains(r#"action="http://gateway.test/saml/idp/login""#));
}

#[tokio::test]
async fn sso_without_session_echoes_request_in_login_form() {
    let h = harness();
    let xml = authn_request("id-echo", OffsetDateTime::now_utc());
    let uri = format!("/sso?{}", redirect_query(&xml, "relay-42"));
    let response = send(&h.app, Request::get(uri).body(Body::empty()).expect("req")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_text(response).await;
    assert!(html.contains(&format!(r#"action="{SSO_URL}""#)));
    assert_eq!(hidden_value(&html, "RelayState"), Some("relay-42"));
    let echoed = hidden_value(&html, "SAMLRequest").expect("echoed request");
    assert_eq!(STANDARD.decode(echoed).expect("base64"), xml.as_bytes());
}

#[tokio::test]
async fn sso_with_expired_session_shows_login_form() {
    let h = harness();
    seed_session(
        &h.stores,
        "stale-token",
        OffsetDateTime::now_utc() - Duration::hours(3),
        3600,
    );
    let xml = authn_request("id-stale", OffsetDateTime::now_utc());
    let request = Request::get(format!("/sso?{}", redirect_query(&xml, "rs")))
        .header(header::COOKIE, "session=stale-token")
        .body(Body::empty())
        .expect("req");
    let response = send(&h.app, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_text(response).await;
    assert!(html.contains(r#"name="password""#));
    assert!(!html.contains("SAMLResponse"));
}

#[tokio::test]
async fn sso_with_live_session_posts_signed_assertion() {
    let h = harness();
    h.stores
        .services
        .register(saml_idp::ServiceProvider::new(SP_ENTITY, sp_metadata()))
        .expect("register sp");
    seed_session(&h.stores, "live-token", OffsetDateTime::now_utc(), 3600);

    let xml = authn_request("id-live", OffsetDateTime::now_utc());
    let request = Request::get(format!("/sso?{}", redirect_query(&xml, "back-to-app")))
        .header(header::COOKIE, "session=live-token")
        .body(Body::empty())
        .expect("req");
    let response = send(&h.app, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response).is_none());
    let html = body_text(response).await;
    assert!(html.contains(&format!(r#"action="{SP_ACS}""#)));
    assert_eq!(hidden_value(&html, "RelayState"), Some("back-to-app"));

    let encoded = hidden_value(&html, "SAMLResponse").expect("saml response");
    let decoded = String::from_utf8(STANDARD.decode(encoded).expect("base64")).expect("utf-8");
    assert!(decoded.contains(r#"InResponseTo="id-live""#));
    assert!(decoded.contains(&format!(r#"Recipient="{SP_ACS}""#)));
    assert!(decoded.contains(&format!("<saml:Audience>{SP_ENTITY}</saml:Audience>")));
    assert!(decoded.contains("SessionIndex=\"index-1\""));
    assert!(decoded.contains("SignatureValue"));
}

#[tokio::test]
async fn sso_for_unregistered_sp_shows_generic_error() {
    let h = harness();
    seed_session(&h.stores, "live-token", OffsetDateTime::now_utc(), 3600);
    let xml = authn_request("id-unknown", OffsetDateTime::now_utc());
    let request = Request::get(format!("/sso?{}", redirect_query(&xml, "")))
        .header(header::COOKIE, "session=live-token")
        .body(Body::empty())
        .expect("req");
    let response = send(&h.app, request).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let html = body_text(response).await;
    assert!(html.contains(saml_idp::saml::GENERIC_ERROR_MESSAGE));
    assert!(!html.contains(SP_ENTITY));
}

#[tokio::test]
async fn sso_rejects_stale_and_malformed_requests() {
    let h = harness();
    let old = authn_request("id-old", OffsetDateTime::now_utc() - Duration::hours(1));
    let response = send(
        &h.app,
        Request::get(format!("/sso?{}", redirect_query(&old, "")))
            .body(Body::empty())
            .expect("req"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("request expired"));

    let response = send(
        &h.app,
        Request::get("/sso?SAMLRequest=not-base64!!")
            .body(Body::empty())
            .expect("req"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&h.app, Request::get("/sso").body(Body::empty()).expect("req")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sso_post_with_credentials_starts_session_and_asserts() {
    let h = harness();
    h.stores
        .services
        .register(saml_idp::ServiceProvider::new(SP_ENTITY, sp_metadata()))
        .expect("register sp");
    let encoded = STANDARD.encode(authn_request("id-post", OffsetDateTime::now_utc()));
    let body = form(&[
        ("SAMLRequest", &encoded),
        ("RelayState", "rs-post"),
        ("email", "active@example.com"),
        ("password", "secret-pw"),
    ]);
    let response = send(&h.app, post_form("/sso", body)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response).expect("cookie").starts_with("session="));
    let html = body_text(response).await;
    assert!(html.contains(&format!(r#"action="{SP_ACS}""#)));
    assert!(hidden_value(&html, "SAMLResponse").is_some());
    assert_eq!(h.stores.sessions.list_all().expect("session").len(), 1);
}

#[tokio::test]
async fn sso_post_with_bad_credentials_keeps_the_request() {
    let h = harness();
    let encoded = STANDARD.encode(authn_request("id-retry", OffsetDateTime::now_utc()));
    let body = form(&[
        ("SAMLRequest", &encoded),
        ("RelayState", "rs-retry"),
        ("email", "nobody@example.com"),
        ("password", "secret-pw"),
    ]);
    let response = send(&h.app, post_form("/sso", body)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response).is_none());
    let html = body_text(response).await;
    assert!(html.contains("Wrong email or password!"));
    assert_eq!(hidden_value(&html, "SAMLRequest"), Some(encoded.as_str()));
    assert_eq!(hidden_value(&html, "RelayState"), Some("rs-retry"));
}

#[tokio::test]
async fn service_admin_endpoints() {
    let h = harness();

    let response = send(&h.app, Request::get("/services").body(Body::empty()).expect("req")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &h.app,
        Request::post("/services").body(Body::from(sp_metadata())).expect("req"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&h.app, Request::get("/services").body(Body::empty()).expect("req")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let listed: serde_json::Value =
        serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(listed[0]["name"], SP_ENTITY);

    let delete = || {
        Request::delete("/services")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(r#"{{"serviceId":"{SP_ENTITY}"}}"#)))
            .expect("req")
    };
    let response = send(&h.app, delete()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
    assert_eq!(send(&h.app, delete()).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn registering_bad_metadata_is_bad_request() {
    let h = harness();
    for body in ["", "<not-xml", r#"<EntityDescriptor entityID="x"><IDPSSODescriptor/></EntityDescriptor>"#] {
        let response = send(
            &h.app,
            Request::post("/services").body(Body::from(body)).expect("req"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
    }
}

#[tokio::test]
async fn session_admin_endpoints() {
    let h = harness();
    let response = send(&h.app, Request::get("/sessions").body(Body::empty()).expect("req")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    seed_session(&h.stores, "admin-token", OffsetDateTime::now_utc(), 60);
    let response = send(&h.app, Request::get("/sessions").body(Body::empty()).expect("req")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let listed: serde_json::Value =
        serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(listed[0]["id"], "admin-token");

    let delete = || {
        Request::delete("/sessions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"sessionId":"admin-token"}"#))
            .expect("req")
    };
    assert_eq!(send(&h.app, delete()).await.status(), StatusCode::OK);
    assert_eq!(send(&h.app, delete()).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metadata_endpoints() {
    let h = harness();
    let response = send(&h.app, Request::get("/metadata").body(Body::empty()).expect("req")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let xml = body_text(response).await;
    assert!(xml.contains(&format!(r#"entityID="{IDP_BASE}/metadata""#)));
    assert!(xml.contains(SSO_URL));

    let response = send(
        &h.app,
        Request::get("/metadata/google").body(Body::empty()).expect("req"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn admin_deletes_without_an_id_are_json_bad_requests() {
    let h = harness();
    for (uri, body) in [
        ("/services", "{}"),
        ("/sessions", "{}"),
        ("/services", "not json"),
        ("/sessions", r#"{"sessionId":""}"#),
    ] {
        let response = send(
            &h.app,
            Request::delete(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .expect("req"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri} {body}");
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .expect("content type")
            .starts_with("application/json"));
        let error: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json error body");
        assert_eq!(error["error"], "invalid_request");
    }
}

#[tokio::test]
async fn unreadable_browser_posts_get_the_bad_request_page() {
    let h = harness();
    let multipart = Request::post("/sso")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=xyz")
        .body(Body::from("--xyz\r\nContent-Disposition: form-data; name=\"email\"\r\n\r\na@b.c\r\n--xyz--\r\n"))
        .expect("req");
    let json_login = Request::post("/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"email":"active@example.com"}"#))
        .expect("req");

    for request in [multipart, json_login] {
        let response = send(&h.app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .expect("content type")
            .starts_with("text/html"));
        assert!(set_cookie(&response).is_none());
    }
}
