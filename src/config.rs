//! Service configuration loaded from a JSON file with environment overrides.

use crate::backend::StoreBackendConfig;
use crate::breaker::BreakerPolicy;
use crate::error::{config_error, IdpResult};
use crate::model::DEFAULT_SESSION_LIFETIME_SECS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

pub const CONFIG_FILE_ENV: &str = "SERVICE_CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "config.json";
const DEFAULT_GATEWAY_URL: &str = "http://localhost:8080";
const USER_SERVICE_KEY: &str = "microservice-user";
const REDIRECT_FROM_LOGIN_KEY: &str = "redirect-from-login";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdpConfig {
    pub gateway_url: String,
    /// PEM RSA key used to sign the system token sent to the user service.
    pub system_key: Option<PathBuf>,
    /// Downstream service base URLs keyed by service name.
    pub services: HashMap<String, String>,
    /// Browser-facing URLs, e.g. `redirect-from-login`.
    pub client: HashMap<String, String>,
    pub idp: IdpSettings,
    pub listen_addr: String,
    pub backend: StoreBackendConfig,
    pub breaker: BreakerPolicy,
    /// Interval of the expired-session purge task; `None` disables it.
    pub purge_interval_secs: Option<u64>,
    pub google_metadata_path: PathBuf,
    pub json_logs: bool,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            system_key: None,
            services: HashMap::new(),
            client: HashMap::new(),
            idp: IdpSettings::default(),
            listen_addr: "0.0.0.0:8080".to_string(),
            backend: StoreBackendConfig::InMemory,
            breaker: BreakerPolicy::default(),
            purge_interval_secs: None,
            google_metadata_path: PathBuf::from("google-metadata.xml"),
            json_logs: false,
        }
    }
}

/// Settings that shape the SAML exchange itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdpSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Overrides the derived `http://<gateway host>:8000/saml/idp` base.
    pub base_url: Option<String>,
    pub session_lifetime_secs: u32,
    pub max_request_age_secs: i64,
    pub clock_skew_secs: i64,
    pub assertion_validity_secs: i64,
    /// Directory holding `login-form.html`, `bad-request.html` and `error.html` overrides.
    pub template_dir: Option<PathBuf>,
}

impl Default for IdpSettings {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("/run/secrets/service.cert"),
            key_path: PathBuf::from("/run/secrets/service.key"),
            base_url: None,
            session_lifetime_secs: DEFAULT_SESSION_LIFETIME_SECS,
            max_request_age_secs: 300,
            clock_skew_secs: 300,
            assertion_validity_secs: 300,
            template_dir: None,
        }
    }
}

impl IdpConfig {
    /// Loads the config from `path`, else `$SERVICE_CONFIG_FILE`, else `config.json`, then
    /// applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> IdpResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => std::env::var(CONFIG_FILE_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE)),
        };
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| config_error(format!("reading {}: {err}", path.display())))?;
        let mut config = Self::from_json(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> IdpResult<Self> {
        serde_json::from_str(raw).map_err(|err| config_error(format!("parsing config: {err}")))
    }

    /// Applies `API_GATEWAY_URL`, `IDP_LISTEN_ADDR` and `REDIS_URL` when `lookup` yields them.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(gateway) = lookup("API_GATEWAY_URL").filter(|v| !v.is_empty()) {
            self.gateway_url = gateway;
        }
        if let Some(listen) = lookup("IDP_LISTEN_ADDR").filter(|v| !v.is_empty()) {
            self.listen_addr = listen;
        }
        if let Some(redis) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            self.backend = StoreBackendConfig::RedisUrl(redis);
        }
    }

    pub fn validate(&self) -> IdpResult<()> {
        let gateway = Url::parse(&self.gateway_url)
            .map_err(|err| config_error(format!("gatewayUrl {}: {err}", self.gateway_url)))?;
        if gateway.host_str().is_none() {
            return Err(config_error("gatewayUrl must include a host"));
        }
        if let Some(base) = &self.idp.base_url {
            Url::parse(base).map_err(|err| config_error(format!("idp.baseUrl {base}: {err}")))?;
        }
        if self.idp.session_lifetime_secs == 0 {
            return Err(config_error("idp.sessionLifetimeSecs must be positive"));
        }
        if self.idp.max_request_age_secs <= 0 || self.idp.clock_skew_secs < 0 {
            return Err(config_error(
                "idp.maxRequestAgeSecs must be positive and idp.clockSkewSecs non-negative",
            ));
        }
        if self.idp.assertion_validity_secs <= 0 {
            return Err(config_error("idp.assertionValiditySecs must be positive"));
        }
        if self.purge_interval_secs == Some(0) {
            return Err(config_error("purgeIntervalSecs must be positive when set"));
        }
        self.backend.validate()?;
        self.breaker.validate()
    }

    /// Base URL every IdP endpoint hangs off.
    pub fn idp_base_url(&self) -> IdpResult<Url> {
        if let Some(base) = &self.idp.base_url {
            return Url::parse(base)
                .map_err(|err| config_error(format!("idp.baseUrl {base}: {err}")));
        }
        let gateway = Url::parse(&self.gateway_url)
            .map_err(|err| config_error(format!("gatewayUrl {}: {err}", self.gateway_url)))?;
        let host = gateway
            .host_str()
            .ok_or_else(|| config_error("gatewayUrl must include a host"))?;
        Url::parse(&format!("http://{host}:8000/saml/idp"))
            .map_err(|err| config_error(format!("idp base url: {err}")))
    }

    /// Absolute URL of the standalone login form action.
    pub fn login_action_url(&self) -> String {
        format!("{}/saml/idp/login", self.gateway_url.trim_end_matches('/'))
    }

    pub fn redirect_from_login(&self) -> &str {
        self.client
            .get(REDIRECT_FROM_LOGIN_KEY)
            .map(String::as_str)
            .unwrap_or("/")
    }

    pub fn user_service_url(&self) -> IdpResult<&str> {
        self.services
            .get(USER_SERVICE_KEY)
            .map(String::as_str)
            .ok_or_else(|| config_error(format!("services.{USER_SERVICE_KEY} is not configured")))
    }

    pub fn gateway_is_https(&self) -> bool {
        self.gateway_url.starts_with("https://")
    }
}
