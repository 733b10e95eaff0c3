//! SAML protocol pieces: signing material, metadata, AuthnRequest validation, assertion issuing
//! and the HTML pages that carry them through the browser.

pub mod assertion;
pub mod credentials;
pub mod metadata;
pub mod pages;
pub mod request;

pub use assertion::{AssertionIssuer, SignedResponse};
pub use credentials::SigningCredentials;
pub use metadata::{parse_sp_metadata, AcsEndpoint, IdpMetadata, SpMetadata};
pub use pages::{auto_submit_form, LoginForm, Pages, GENERIC_ERROR_MESSAGE};
pub use request::{AuthnRequest, AuthnRequestValidator, Binding, RequestWindow, SamlRequestParams};

use crate::config::IdpConfig;
use crate::error::IdpResult;
use time::macros::format_description;
use time::OffsetDateTime;

pub const BINDING_HTTP_REDIRECT: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
pub const BINDING_HTTP_POST: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";

/// Public URLs identifying this IdP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityProvider {
    /// Also the metadata URL.
    pub entity_id: String,
    pub sso_url: String,
}

impl IdentityProvider {
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            entity_id: format!("{base}/metadata"),
            sso_url: format!("{base}/sso"),
        }
    }

    pub fn from_config(config: &IdpConfig) -> IdpResult<Self> {
        Ok(Self::new(config.idp_base_url()?.as_str()))
    }

    pub fn metadata_url(&self) -> &str {
        &self.entity_id
    }
}

/// Formats an instant the way SAML expects: UTC, second precision, `Z` suffix.
pub(crate) fn saml_instant(at: OffsetDateTime) -> String {
    let utc = at.to_offset(time::UtcOffset::UTC);
    utc.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
    ))
    .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}

pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
