//! Builds and signs the SAML `Response` returned to a service provider.

use super::credentials::SigningCredentials;
use super::request::AuthnRequest;
use super::{saml_instant, xml_escape, IdentityProvider};
use crate::error::{internal, IdpResult};
use crate::model::Session;
use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::hash::{hash, MessageDigest};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

const NS_ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const NS_DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
const NAMEID_FORMAT_EMAIL: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
const ATTR_NAME_FORMAT_URI: &str = "urn:oasis:names:tc:SAML:2.0:attrname-format:uri";

/// Everything the browser needs to post the assertion to the SP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedResponse {
    pub acs_url: String,
    /// Base64 of the signed `Response` document.
    pub saml_response: String,
    pub relay_state: String,
}

struct Attribute<'a> {
    name: &'static str,
    friendly_name: &'static str,
    values: Vec<&'a str>,
}

pub struct AssertionIssuer {
    idp: Arc<IdentityProvider>,
    credentials: Arc<SigningCredentials>,
    validity: Duration,
}

impl AssertionIssuer {
    pub fn new(
        idp: Arc<IdentityProvider>,
        credentials: Arc<SigningCredentials>,
        validity_secs: i64,
    ) -> Self {
        Self {
            idp,
            credentials,
            validity: Duration::seconds(validity_secs.max(1)),
        }
    }

    pub fn issue(&self, request: &AuthnRequest, session: &Session) -> IdpResult<SignedResponse> {
        self.issue_at(request, session, OffsetDateTime::now_utc())
    }

    /// Audience is the SP entity id; `Destination` and `Recipient` are the resolved ACS URL.
    pub fn issue_at(
        &self,
        request: &AuthnRequest,
        session: &Session,
        now: OffsetDateTime,
    ) -> IdpResult<SignedResponse> {
        let sp = request.service_provider.as_ref().ok_or_else(|| {
            internal(format!("no registered service provider for {}", request.issuer))
        })?;
        let acs_url = sp
            .resolve_acs(request.acs_url.as_deref())
            .ok_or_else(|| internal(format!("{} lists no assertion consumer", sp.entity_id)))?
            .to_string();

        let response_id = format!("id-{}", Uuid::new_v4().simple());
        let assertion_id = format!("id-{}", Uuid::new_v4().simple());
        let assertion =
            self.build_assertion_xml(&assertion_id, &sp.entity_id, &acs_url, request, session, now);
        let signed_assertion = self.sign_assertion(&assertion, &assertion_id)?;
        let response = self.wrap_in_response(&response_id, &acs_url, request, now, &signed_assertion);
        debug!(
            request_id = %request.id,
            sp = %sp.entity_id,
            session = %session.id.fingerprint(),
            "assertion issued"
        );

        Ok(SignedResponse {
            acs_url,
            saml_response: STANDARD.encode(response),
            relay_state: request.relay_state.clone(),
        })
    }

    /// Emits the assertion directly in exclusive canonical form: the only namespace declaration
    /// sits on the root ahead of the attributes, attributes are sorted, every element has an
    /// explicit end tag and escaping follows the canonical rules. The digest is taken over these
    /// exact bytes.
    fn build_assertion_xml(
        &self,
        assertion_id: &str,
        audience: &str,
        acs_url: &str,
        request: &AuthnRequest,
        session: &Session,
        now: OffsetDateTime,
    ) -> String {
        let issue_instant = saml_instant(now);
        let not_before = saml_instant(now - Duration::seconds(30));
        let not_on_or_after = saml_instant(now + self.validity);
        let in_response_to = c14n_attr(&request.id);
        let acs_url = c14n_attr(acs_url);

        let mut xml = String::new();
        xml.push_str("<saml:Assertion xmlns:saml=\"");
        xml.push_str(NS_ASSERTION);
        xml.push_str("\" ID=\"");
        xml.push_str(&c14n_attr(assertion_id));
        xml.push_str("\" IssueInstant=\"");
        xml.push_str(&issue_instant);
        xml.push_str("\" Version=\"2.0\"><saml:Issuer>");
        xml.push_str(&c14n_text(&self.idp.entity_id));
        xml.push_str("</saml:Issuer><saml:Subject><saml:NameID Format=\"");
        xml.push_str(NAMEID_FORMAT_EMAIL);
        xml.push_str("\">");
        xml.push_str(&c14n_text(&session.subject.email));
        xml.push_str("</saml:NameID><saml:SubjectConfirmation Method=\"urn:oasis:names:tc:SAML:2.0:cm:bearer\">");
        xml.push_str("<saml:SubjectConfirmationData InResponseTo=\"");
        xml.push_str(&in_response_to);
        xml.push_str("\" NotOnOrAfter=\"");
        xml.push_str(&not_on_or_after);
        xml.push_str("\" Recipient=\"");
        xml.push_str(&acs_url);
        xml.push_str("\"></saml:SubjectConfirmationData></saml:SubjectConfirmation></saml:Subject>");

        xml.push_str("<saml:Conditions NotBefore=\"");
        xml.push_str(&not_before);
        xml.push_str("\" NotOnOrAfter=\"");
        xml.push_str(&not_on_or_after);
        xml.push_str("\"><saml:AudienceRestriction><saml:Audience>");
        xml.push_str(&c14n_text(audience));
        xml.push_str("</saml:Audience></saml:AudienceRestriction></saml:Conditions>");

        xml.push_str("<saml:AuthnStatement AuthnInstant=\"");
        xml.push_str(&saml_instant(session.create_time));
        xml.push_str("\" SessionIndex=\"");
        xml.push_str(&c14n_attr(&session.index));
        xml.push_str("\" SessionNotOnOrAfter=\"");
        xml.push_str(&saml_instant(session.expire_time));
        xml.push_str("\"><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>");

        xml.push_str(&attribute_statement(session));
        xml.push_str("</saml:Assertion>");
        xml
    }

    /// Inserts an enveloped signature right after the assertion's `Issuer`.
    fn sign_assertion(&self, assertion: &str, assertion_id: &str) -> IdpResult<String> {
        let after_issuer = assertion
            .find("</saml:Issuer>")
            .map(|pos| pos + "</saml:Issuer>".len())
            .ok_or_else(|| internal("assertion issuer not found"))?;

        let digest = hash(MessageDigest::sha256(), assertion.as_bytes())
            .map_err(|err| internal(format!("digest failed: {err}")))?;
        let signed_info = signed_info(assertion_id, &STANDARD.encode(digest));
        let signature = self.credentials.sign_sha256(signed_info.as_bytes())?;
        let certificate = self.credentials.certificate_base64_der()?;

        let mut signature_xml = String::new();
        signature_xml.push_str("<ds:Signature xmlns:ds=\"");
        signature_xml.push_str(NS_DSIG);
        signature_xml.push_str("\">");
        signature_xml.push_str(&signed_info);
        signature_xml.push_str("<ds:SignatureValue>");
        signature_xml.push_str(&STANDARD.encode(signature));
        signature_xml.push_str("</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>");
        signature_xml.push_str(&certificate);
        signature_xml.push_str("</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>");

        let mut out = String::with_capacity(assertion.len() + signature_xml.len());
        out.push_str(&assertion[..after_issuer]);
        out.push_str(&signature_xml);
        out.push_str(&assertion[after_issuer..]);
        Ok(out)
    }

    fn wrap_in_response(
        &self,
        response_id: &str,
        acs_url: &str,
        request: &AuthnRequest,
        now: OffsetDateTime,
        signed_assertion: &str,
    ) -> String {
        let mut xml = String::new();
        xml.push_str("<samlp:Response xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" xmlns:saml=\"");
        xml.push_str(NS_ASSERTION);
        xml.push_str("\" ID=\"");
        xml.push_str(response_id);
        xml.push_str("\" Version=\"2.0\" IssueInstant=\"");
        xml.push_str(&saml_instant(now));
        xml.push_str("\" Destination=\"");
        xml.push_str(&xml_escape(acs_url));
        xml.push_str("\" InResponseTo=\"");
        xml.push_str(&xml_escape(&request.id));
        xml.push_str("\"><saml:Issuer>");
        xml.push_str(&xml_escape(&self.idp.entity_id));
        xml.push_str("</saml:Issuer><samlp:Status><samlp:StatusCode Value=\"urn:oasis:names:tc:SAML:2.0:status:Success\"/></samlp:Status>");
        xml.push_str(signed_assertion);
        xml.push_str("</samlp:Response>");
        xml
    }
}

fn attribute_statement(session: &Session) -> String {
    let subject = &session.subject;
    let attributes = [
        Attribute {
            name: "urn:oid:0.9.2342.19200300.100.1.1",
            friendly_name: "uid",
            values: vec![subject.user_id.as_str()],
        },
        Attribute {
            name: "urn:oid:0.9.2342.19200300.100.1.3",
            friendly_name: "mail",
            values: vec![subject.email.as_str()],
        },
        Attribute {
            name: "urn:oid:2.5.4.42",
            friendly_name: "givenName",
            values: vec![subject.username.as_str()],
        },
        Attribute {
            name: "urn:oid:1.3.6.1.4.1.5923.1.1.1.1",
            friendly_name: "eduPersonAffiliation",
            values: subject.groups.iter().map(String::as_str).collect(),
        },
    ];

    let mut xml = String::from("<saml:AttributeStatement>");
    for attr in attributes.iter().filter(|a| !a.values.is_empty()) {
        xml.push_str("<saml:Attribute FriendlyName=\"");
        xml.push_str(attr.friendly_name);
        xml.push_str("\" Name=\"");
        xml.push_str(attr.name);
        xml.push_str("\" NameFormat=\"");
        xml.push_str(ATTR_NAME_FORMAT_URI);
        xml.push_str("\">");
        for value in &attr.values {
            xml.push_str("<saml:AttributeValue>");
            xml.push_str(&c14n_text(value));
            xml.push_str("</saml:AttributeValue>");
        }
        xml.push_str("</saml:Attribute>");
    }
    xml.push_str("</saml:AttributeStatement>");
    xml
}

/// `SignedInfo` in exclusive canonical form, which is also how it is embedded.
fn signed_info(assertion_id: &str, digest_b64: &str) -> String {
    let mut xml = String::new();
    xml.push_str("<ds:SignedInfo xmlns:ds=\"");
    xml.push_str(NS_DSIG);
    xml.push_str("\">");
    xml.push_str("<ds:CanonicalizationMethod Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"></ds:CanonicalizationMethod>");
    xml.push_str("<ds:SignatureMethod Algorithm=\"http://www.w3.org/2001/04/xmldsig-more#rsa-sha256\"></ds:SignatureMethod>");
    xml.push_str("<ds:Reference URI=\"#");
    xml.push_str(&c14n_attr(assertion_id));
    xml.push_str("\"><ds:Transforms>");
    xml.push_str("<ds:Transform Algorithm=\"http://www.w3.org/2000/09/xmldsig#enveloped-signature\"></ds:Transform>");
    xml.push_str("<ds:Transform Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"></ds:Transform>");
    xml.push_str("</ds:Transforms><ds:DigestMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#sha256\"></ds:DigestMethod>");
    xml.push_str("<ds:DigestValue>");
    xml.push_str(digest_b64);
    xml.push_str("</ds:DigestValue></ds:Reference></ds:SignedInfo>");
    xml
}

/// Canonical text node escaping.
fn c14n_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

/// Canonical attribute value escaping.
fn c14n_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}
