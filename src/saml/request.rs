//! Decoding and validation of inbound `AuthnRequest` messages.

use super::metadata::{parse_sp_metadata, SpMetadata};
use super::IdentityProvider;
use crate::error::{invalid_request, IdpResult};
use crate::store::ServiceProviderRegistry;
use crate::ErrorKind;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::DeflateDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use std::io::Read;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Upper bound on inflated request size; guards against deflate bombs.
const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024;
const MAX_ENCODED_SIZE: usize = 256 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    /// `SAMLRequest` in the query string, deflated then base64 encoded.
    Redirect,
    /// `SAMLRequest` in a form body, base64 encoded.
    Post,
}

/// The protocol parameters of a SAML binding as they arrive over HTTP.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SamlRequestParams {
    #[serde(rename = "SAMLRequest", default)]
    pub saml_request: Option<String>,
    #[serde(rename = "RelayState", default)]
    pub relay_state: Option<String>,
}

/// Acceptance window for `IssueInstant`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestWindow {
    pub max_age_secs: i64,
    pub clock_skew_secs: i64,
}

impl Default for RequestWindow {
    fn default() -> Self {
        Self {
            max_age_secs: 300,
            clock_skew_secs: 300,
        }
    }
}

/// A validated AuthnRequest.
#[derive(Clone, Debug)]
pub struct AuthnRequest {
    pub id: String,
    pub issuer: String,
    pub destination: Option<String>,
    pub acs_url: Option<String>,
    pub issue_instant: OffsetDateTime,
    pub relay_state: String,
    pub binding: Binding,
    /// The decoded request XML.
    pub request_buffer: Vec<u8>,
    /// `None` when the issuer is not registered.
    pub service_provider: Option<SpMetadata>,
}

impl AuthnRequest {
    /// The request re-encoded for the POST binding, as echoed by the login form.
    pub fn encoded_request(&self) -> String {
        STANDARD.encode(&self.request_buffer)
    }
}

#[derive(Default)]
struct ParsedFields {
    id: Option<String>,
    issue_instant: Option<String>,
    destination: Option<String>,
    acs_url: Option<String>,
    issuer: Option<String>,
}

pub struct AuthnRequestValidator {
    idp: Arc<IdentityProvider>,
    registry: Arc<dyn ServiceProviderRegistry>,
    window: RequestWindow,
}

impl AuthnRequestValidator {
    pub fn new(
        idp: Arc<IdentityProvider>,
        registry: Arc<dyn ServiceProviderRegistry>,
        window: RequestWindow,
    ) -> Self {
        Self {
            idp,
            registry,
            window,
        }
    }

    pub fn validate(&self, binding: Binding, params: &SamlRequestParams) -> IdpResult<AuthnRequest> {
        self.validate_at(binding, params, OffsetDateTime::now_utc())
    }

    /// Every failure is `InvalidRequest`; registry trouble only leaves the SP unresolved.
    pub fn validate_at(
        &self,
        binding: Binding,
        params: &SamlRequestParams,
        now: OffsetDateTime,
    ) -> IdpResult<AuthnRequest> {
        let encoded = params
            .saml_request
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| invalid_request("SAMLRequest parameter is missing"))?;
        let buffer = decode(binding, encoded)?;
        let xml = std::str::from_utf8(&buffer)
            .map_err(|err| invalid_request(format!("SAMLRequest is not UTF-8: {err}")))?;
        let fields = parse(xml)?;

        let id = fields
            .id
            .ok_or_else(|| invalid_request("AuthnRequest is missing ID"))?;
        let issuer = fields
            .issuer
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| invalid_request("AuthnRequest is missing Issuer"))?;
        let raw_instant = fields
            .issue_instant
            .ok_or_else(|| invalid_request("AuthnRequest is missing IssueInstant"))?;
        let issue_instant = OffsetDateTime::parse(&raw_instant, &Rfc3339)
            .map_err(|err| invalid_request(format!("IssueInstant {raw_instant}: {err}")))?;
        self.check_window(issue_instant, now)?;

        if let Some(destination) = fields.destination.as_deref() {
            if destination != self.idp.sso_url {
                return Err(invalid_request(format!(
                    "expected destination {} not {destination}",
                    self.idp.sso_url
                )));
            }
        }

        let service_provider = self.resolve_sp(&issuer);
        debug!(
            request_id = %id,
            issuer = %issuer,
            known_sp = service_provider.is_some(),
            "authn request validated"
        );

        Ok(AuthnRequest {
            id,
            issuer,
            destination: fields.destination,
            acs_url: fields.acs_url,
            issue_instant,
            relay_state: params.relay_state.clone().unwrap_or_default(),
            binding,
            request_buffer: buffer,
            service_provider,
        })
    }

    fn check_window(&self, issue_instant: OffsetDateTime, now: OffsetDateTime) -> IdpResult<()> {
        if issue_instant > now + Duration::seconds(self.window.clock_skew_secs) {
            return Err(invalid_request("request expired: IssueInstant is in the future"));
        }
        if issue_instant + Duration::seconds(self.window.max_age_secs) < now {
            return Err(invalid_request("request expired"));
        }
        Ok(())
    }

    fn resolve_sp(&self, issuer: &str) -> Option<SpMetadata> {
        let sp = match self.registry.get(issuer) {
            Ok(sp) => sp,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(issuer, error = %err, "service provider lookup failed");
                return None;
            }
        };
        match parse_sp_metadata(&sp.metadata) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                warn!(issuer, error = %err, "stored service provider metadata is unusable");
                None
            }
        }
    }
}

fn decode(binding: Binding, encoded: &str) -> IdpResult<Vec<u8>> {
    if encoded.len() > MAX_ENCODED_SIZE {
        return Err(invalid_request("SAMLRequest is too large"));
    }
    // POST-binding values are often wrapped at 76 columns.
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let raw = STANDARD
        .decode(compact)
        .map_err(|err| invalid_request(format!("cannot decode SAMLRequest: {err}")))?;
    match binding {
        Binding::Post => Ok(raw),
        Binding::Redirect => {
            let mut inflated = Vec::new();
            DeflateDecoder::new(&raw[..])
                .take(MAX_DECOMPRESSED_SIZE)
                .read_to_end(&mut inflated)
                .map_err(|err| invalid_request(format!("cannot inflate SAMLRequest: {err}")))?;
            if inflated.len() as u64 >= MAX_DECOMPRESSED_SIZE {
                return Err(invalid_request("inflated SAMLRequest is too large"));
            }
            Ok(inflated)
        }
    }
}

fn parse(xml: &str) -> IdpResult<ParsedFields> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = ParsedFields::default();
    let mut saw_request = false;
    let mut depth = 0usize;
    let mut in_issuer = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| invalid_request(format!("malformed AuthnRequest: {err}")))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                match e.local_name().as_ref() {
                    b"AuthnRequest" if depth == 0 => {
                        saw_request = true;
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .unescape_value()
                                .map_err(|err| invalid_request(format!("bad attribute: {err}")))?
                                .into_owned();
                            match attr.key.local_name().as_ref() {
                                b"ID" => fields.id = Some(value),
                                b"IssueInstant" => fields.issue_instant = Some(value),
                                b"Destination" => fields.destination = Some(value),
                                b"AssertionConsumerServiceURL" => fields.acs_url = Some(value),
                                _ => {}
                            }
                        }
                    }
                    _ if depth == 0 => {
                        return Err(invalid_request("root element is not an AuthnRequest"));
                    }
                    // Only the request's own Issuer, not one nested in an extension.
                    b"Issuer" if depth == 1 && is_start => in_issuer = true,
                    _ => {}
                }
                if is_start {
                    depth += 1;
                }
            }
            Event::Text(ref t) if in_issuer => {
                let text = t
                    .unescape()
                    .map_err(|err| invalid_request(format!("bad Issuer text: {err}")))?;
                fields.issuer = Some(text.trim().to_string());
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                if e.local_name().as_ref() == b"Issuer" {
                    in_issuer = false;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_request {
        return Err(invalid_request("SAMLRequest carries no AuthnRequest"));
    }
    if depth != 0 {
        return Err(invalid_request("malformed AuthnRequest: unclosed elements"));
    }
    Ok(fields)
}
