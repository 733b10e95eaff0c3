//! The browser login flow.
//!
//! ```text
//! Unauthenticated --valid request, live session--> Authenticated --issue--> AssertionIssued
//!        |                                              ^
//!        +--no / unknown / expired session--> CredentialsPending --credentials ok--+
//!        |                                        |  (bad credentials loop here)
//!        +--invalid request / failure-----------> Error
//! ```
//!
//! Store calls run on the blocking pool since the store traits are synchronous.

use crate::config::IdpConfig;
use crate::error::{internal, ErrorKind, IdpError, IdpResult};
use crate::identity::{IdentityLookup, LookupError, UserRecord};
use crate::model::{Session, SessionId, Subject};
use crate::saml::assertion::{AssertionIssuer, SignedResponse};
use crate::saml::credentials::SigningCredentials;
use crate::saml::pages::{auto_submit_form, LoginForm, Pages};
use crate::saml::request::{
    AuthnRequest, AuthnRequestValidator, Binding, RequestWindow, SamlRequestParams,
};
use crate::saml::IdentityProvider;
use crate::store::{ServiceProviderRegistry, SessionStore};
use crate::token::{session_index, SessionTokenMinter};
use axum::http::StatusCode;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub const MSG_CREDENTIALS_REQUIRED: &str = "Credentials required!";
pub const MSG_INVALID_EMAIL: &str = "You have entered invalid email";
pub const MSG_INVALID_PASSWORD: &str = "You have entered invalid password";
pub const MSG_WRONG_CREDENTIALS: &str = "Wrong email or password!";
pub const MSG_LOOKUP_UNAVAILABLE: &str = "Sign-in is temporarily unavailable, please try again.";

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginState {
    Unauthenticated,
    CredentialsPending,
    Authenticated,
    AssertionIssued,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowResponse {
    Html { status: StatusCode, body: String },
    Redirect { location: String },
}

/// What the flow decided, in transport-neutral form.
#[derive(Clone, Debug)]
pub struct FlowOutcome {
    pub state: LoginState,
    pub response: FlowResponse,
    /// A session created during this step; the caller sets the cookie.
    pub new_session: Option<Session>,
}

impl FlowOutcome {
    fn html(state: LoginState, status: StatusCode, body: String) -> Self {
        Self {
            state,
            response: FlowResponse::Html { status, body },
            new_session: None,
        }
    }

    fn with_session(mut self, session: Session) -> Self {
        self.new_session = Some(session);
        self
    }
}

/// Posted login form fields.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            password: Some(password.into()),
        }
    }

    /// Whether the form carried credential fields at all, even empty ones.
    pub fn submitted(&self) -> bool {
        self.email.is_some() || self.password.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct FlowSettings {
    pub session_lifetime_secs: u32,
    pub redirect_from_login: String,
    pub login_action_url: String,
    pub request_window: RequestWindow,
    pub assertion_validity_secs: i64,
}

impl FlowSettings {
    pub fn from_config(config: &IdpConfig) -> Self {
        Self {
            session_lifetime_secs: config.idp.session_lifetime_secs,
            redirect_from_login: config.redirect_from_login().to_string(),
            login_action_url: config.login_action_url(),
            request_window: RequestWindow {
                max_age_secs: config.idp.max_request_age_secs,
                clock_skew_secs: config.idp.clock_skew_secs,
            },
            assertion_validity_secs: config.idp.assertion_validity_secs,
        }
    }
}

pub struct LoginFlow {
    idp: Arc<IdentityProvider>,
    sessions: Arc<dyn SessionStore>,
    validator: Arc<AuthnRequestValidator>,
    issuer: AssertionIssuer,
    identity: Arc<dyn IdentityLookup>,
    minter: SessionTokenMinter,
    pages: Pages,
    settings: FlowSettings,
}

impl LoginFlow {
    pub fn new(
        idp: Arc<IdentityProvider>,
        credentials: Arc<SigningCredentials>,
        sessions: Arc<dyn SessionStore>,
        services: Arc<dyn ServiceProviderRegistry>,
        identity: Arc<dyn IdentityLookup>,
        pages: Pages,
        settings: FlowSettings,
    ) -> IdpResult<Self> {
        let minter = SessionTokenMinter::new(&credentials.session_secret()?);
        let validator = Arc::new(AuthnRequestValidator::new(
            idp.clone(),
            services,
            settings.request_window,
        ));
        let issuer = AssertionIssuer::new(
            idp.clone(),
            credentials,
            settings.assertion_validity_secs,
        );
        Ok(Self {
            idp,
            sessions,
            validator,
            issuer,
            identity,
            minter,
            pages,
            settings,
        })
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// SSO entry: a fresh AuthnRequest, possibly accompanied by a session cookie.
    pub async fn sso(
        &self,
        binding: Binding,
        params: SamlRequestParams,
        cookie: Option<SessionId>,
    ) -> FlowOutcome {
        let request = match self.validate(binding, params).await {
            Ok(request) => request,
            Err(outcome) => return outcome,
        };

        let Some(id) = cookie else {
            return self.challenge(&request, "");
        };
        match self.lookup_session(id).await {
            Ok(session) => self.assert(&request, &session),
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::Expired) => {
                debug!(reason = %err, "no usable session, asking for credentials");
                self.challenge(&request, "")
            }
            Err(err) => self.server_error(&err),
        }
    }

    /// POST to the SSO endpoint: a credential submission when the form carries credential
    /// fields, otherwise a POST-binding SSO entry.
    pub async fn sso_post(
        &self,
        params: SamlRequestParams,
        credentials: Credentials,
        cookie: Option<SessionId>,
    ) -> FlowOutcome {
        if !credentials.submitted() {
            return self.sso(Binding::Post, params, cookie).await;
        }

        let request = match self.validate(Binding::Post, params).await {
            Ok(request) => request,
            Err(outcome) => return outcome,
        };
        let user = match self.authenticate(&credentials).await {
            Ok(user) => user,
            Err(message) => return self.challenge(&request, message),
        };
        let session = match self.start_session(&user).await {
            Ok(session) => session,
            Err(err) => return self.server_error(&err),
        };
        self.assert(&request, &session).with_session(session)
    }

    /// Bad-request page for browser input that never reached the flow, such as an unreadable form.
    pub fn bad_request(&self, message: &str) -> FlowOutcome {
        FlowOutcome::html(
            LoginState::Error,
            StatusCode::BAD_REQUEST,
            self.pages.bad_request(message),
        )
    }

    /// Standalone login page, not tied to an AuthnRequest.
    pub fn login_page(&self) -> FlowOutcome {
        self.standalone_form("")
    }

    /// Standalone login submission; success redirects to the configured landing page.
    pub async fn login(&self, credentials: Credentials) -> FlowOutcome {
        let user = match self.authenticate(&credentials).await {
            Ok(user) => user,
            Err(message) => return self.standalone_form(message),
        };
        match self.start_session(&user).await {
            Ok(session) => FlowOutcome {
                state: LoginState::Authenticated,
                response: FlowResponse::Redirect {
                    location: self.settings.redirect_from_login.clone(),
                },
                new_session: Some(session),
            },
            Err(err) => self.server_error(&err),
        }
    }

    async fn validate(
        &self,
        binding: Binding,
        params: SamlRequestParams,
    ) -> Result<AuthnRequest, FlowOutcome> {
        let validator = self.validator.clone();
        match blocking(move || validator.validate(binding, &params)).await {
            Ok(request) => Ok(request),
            Err(err) if err.kind() == ErrorKind::InvalidRequest => {
                info!(error = %err, "rejected authn request");
                Err(self.bad_request(err.message()))
            }
            Err(err) => Err(self.server_error(&err)),
        }
    }

    async fn lookup_session(&self, id: SessionId) -> IdpResult<Session> {
        let sessions = self.sessions.clone();
        blocking(move || sessions.get_by_cookie(&id)).await
    }

    /// Local shape checks, then the identity source. The error is the message to show.
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserRecord, &'static str> {
        let (email, password) = check_credentials(credentials)?;
        match self.identity.find_user(email, password).await {
            Ok(user) => Ok(user),
            Err(LookupError::Rejected(reason)) => {
                info!(%reason, "credentials rejected");
                Err(MSG_WRONG_CREDENTIALS)
            }
            Err(LookupError::Unavailable(reason)) => {
                warn!(%reason, "identity lookup unavailable");
                Err(MSG_LOOKUP_UNAVAILABLE)
            }
        }
    }

    async fn start_session(&self, user: &UserRecord) -> IdpResult<Session> {
        let id = self
            .minter
            .mint(&user.id, &user.username, &user.email, &user.roles)?;
        let session = Session::new(
            id,
            session_index()?,
            Subject {
                user_id: user.id.clone(),
                email: user.email.clone(),
                username: user.username.clone(),
                groups: user.roles.clone(),
            },
            OffsetDateTime::now_utc(),
            self.settings.session_lifetime_secs,
        );
        let sessions = self.sessions.clone();
        let stored = session.clone();
        blocking(move || sessions.add(stored)).await?;
        info!(
            session = %session.id.fingerprint(),
            user_id = %user.id,
            "session started"
        );
        Ok(session)
    }

    fn assert(&self, request: &AuthnRequest, session: &Session) -> FlowOutcome {
        match self.issuer.issue(request, session) {
            Ok(response) => self.posted(&response),
            Err(err) => self.server_error(&err),
        }
    }

    fn posted(&self, response: &SignedResponse) -> FlowOutcome {
        FlowOutcome::html(
            LoginState::AssertionIssued,
            StatusCode::OK,
            auto_submit_form(response),
        )
    }

    fn challenge(&self, request: &AuthnRequest, message: &str) -> FlowOutcome {
        let encoded = request.encoded_request();
        FlowOutcome::html(
            LoginState::CredentialsPending,
            StatusCode::OK,
            self.pages.login(&LoginForm {
                action_url: &self.idp.sso_url,
                message,
                saml_request: &encoded,
                relay_state: &request.relay_state,
            }),
        )
    }

    fn standalone_form(&self, message: &str) -> FlowOutcome {
        FlowOutcome::html(
            LoginState::CredentialsPending,
            StatusCode::OK,
            self.pages.login(&LoginForm {
                action_url: &self.settings.login_action_url,
                message,
                saml_request: "",
                relay_state: "",
            }),
        )
    }

    fn server_error(&self, err: &IdpError) -> FlowOutcome {
        error!(error = %err, "login flow failed");
        FlowOutcome::html(
            LoginState::Error,
            StatusCode::INTERNAL_SERVER_ERROR,
            self.pages.error(),
        )
    }
}

/// Trims and shape-checks the posted fields.
pub fn check_credentials(credentials: &Credentials) -> Result<(&str, &str), &'static str> {
    let email = credentials.email.as_deref().unwrap_or_default().trim();
    let password = credentials.password.as_deref().unwrap_or_default().trim();
    if email.is_empty() || password.is_empty() {
        return Err(MSG_CREDENTIALS_REQUIRED);
    }
    if !looks_like_email(email) {
        return Err(MSG_INVALID_EMAIL);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(MSG_INVALID_PASSWORD);
    }
    Ok((email, password))
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '(' | ')' | ',' | ';'))
}

pub(crate) async fn blocking<T, F>(task: F) -> IdpResult<T>
where
    F: FnOnce() -> IdpResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| internal(format!("store task failed: {err}")))?
}
