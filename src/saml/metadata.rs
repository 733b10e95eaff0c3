use super::{xml_escape, IdentityProvider, BINDING_HTTP_POST, BINDING_HTTP_REDIRECT};
use super::credentials::SigningCredentials;
use crate::error::{invalid_request, IdpResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

const NAMEID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";
const NAMEID_FORMAT_EMAIL: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

/// Renders this IdP's `EntityDescriptor`.
pub struct IdpMetadata<'a> {
    idp: &'a IdentityProvider,
    credentials: &'a SigningCredentials,
}

impl<'a> IdpMetadata<'a> {
    pub fn new(idp: &'a IdentityProvider, credentials: &'a SigningCredentials) -> Self {
        Self { idp, credentials }
    }

    pub fn to_xml(&self) -> IdpResult<String> {
        let cert = self.credentials.certificate_base64_der()?;
        let entity_id = xml_escape(&self.idp.entity_id);
        let sso_url = xml_escape(&self.idp.sso_url);

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<md:EntityDescriptor xmlns:md=\"urn:oasis:names:tc:SAML:2.0:metadata\"");
        xml.push_str(" xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\" entityID=\"");
        xml.push_str(&entity_id);
        xml.push_str("\">\n");
        xml.push_str("  <md:IDPSSODescriptor WantAuthnRequestsSigned=\"false\"");
        xml.push_str(" protocolSupportEnumeration=\"urn:oasis:names:tc:SAML:2.0:protocol\">\n");
        for usage in ["signing", "encryption"] {
            xml.push_str("    <md:KeyDescriptor use=\"");
            xml.push_str(usage);
            xml.push_str("\">\n      <ds:KeyInfo>\n        <ds:X509Data>\n");
            xml.push_str("          <ds:X509Certificate>");
            xml.push_str(&cert);
            xml.push_str("</ds:X509Certificate>\n");
            xml.push_str("        </ds:X509Data>\n      </ds:KeyInfo>\n    </md:KeyDescriptor>\n");
        }
        for format in [NAMEID_FORMAT_TRANSIENT, NAMEID_FORMAT_EMAIL] {
            xml.push_str("    <md:NameIDFormat>");
            xml.push_str(format);
            xml.push_str("</md:NameIDFormat>\n");
        }
        for binding in [BINDING_HTTP_REDIRECT, BINDING_HTTP_POST] {
            xml.push_str("    <md:SingleSignOnService Binding=\"");
            xml.push_str(binding);
            xml.push_str("\" Location=\"");
            xml.push_str(&sso_url);
            xml.push_str("\"/>\n");
        }
        xml.push_str("  </md:IDPSSODescriptor>\n</md:EntityDescriptor>\n");
        Ok(xml)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcsEndpoint {
    pub binding: String,
    pub location: String,
    pub index: Option<u32>,
    pub is_default: bool,
}

/// The parts of an SP metadata document the assertion step needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpMetadata {
    pub entity_id: String,
    pub acs_endpoints: Vec<AcsEndpoint>,
}

impl SpMetadata {
    /// Chooses where to post the assertion.
    ///
    /// A requested URL is honored only when the SP lists it; otherwise the SP's default
    /// HTTP-POST endpoint is used (explicit `isDefault`, then lowest `index`, then document order).
    pub fn resolve_acs(&self, requested: Option<&str>) -> Option<&str> {
        if let Some(requested) = requested {
            if let Some(hit) = self.acs_endpoints.iter().find(|e| e.location == requested) {
                return Some(hit.location.as_str());
            }
        }
        let post: Vec<&AcsEndpoint> = self
            .acs_endpoints
            .iter()
            .filter(|e| e.binding == BINDING_HTTP_POST)
            .collect();
        let pool = if post.is_empty() {
            self.acs_endpoints.iter().collect()
        } else {
            post
        };
        let chosen = pool
            .iter()
            .copied()
            .find(|e| e.is_default)
            .or_else(|| {
                pool.iter()
                    .copied()
                    .filter(|e| e.index.is_some())
                    .min_by_key(|e| e.index)
            })
            .or_else(|| pool.first().copied());
        chosen.map(|e| e.location.as_str())
    }
}

#[derive(Default)]
struct Candidate {
    entity_id: String,
    has_sp_descriptor: bool,
    acs_endpoints: Vec<AcsEndpoint>,
}

/// Parses SP metadata: a lone `EntityDescriptor`, or an `EntitiesDescriptor` from which the
/// first entity carrying an `SPSSODescriptor` is taken.
pub fn parse_sp_metadata(xml: &str) -> IdpResult<SpMetadata> {
    if xml.trim().is_empty() {
        return Err(invalid_request("metadata body is empty"));
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root_seen = false;
    let mut current: Option<Candidate> = None;
    let mut in_sp_descriptor = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| invalid_request(format!("metadata is not valid XML: {err}")))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                let name = e.local_name();
                match name.as_ref() {
                    b"EntitiesDescriptor" if !root_seen => {}
                    b"EntityDescriptor" => {
                        current = Some(Candidate {
                            entity_id: attr(e, b"entityID").unwrap_or_default(),
                            ..Candidate::default()
                        });
                        if empty {
                            current = None;
                        }
                    }
                    _ if !root_seen => {
                        return Err(invalid_request(
                            "metadata root must be EntityDescriptor or EntitiesDescriptor",
                        ));
                    }
                    b"SPSSODescriptor" => {
                        if let Some(candidate) = current.as_mut() {
                            candidate.has_sp_descriptor = true;
                        }
                        in_sp_descriptor = !empty;
                    }
                    b"AssertionConsumerService" if in_sp_descriptor => {
                        if let Some(candidate) = current.as_mut() {
                            candidate.acs_endpoints.push(acs_endpoint(e));
                        }
                    }
                    _ => {}
                }
                root_seen = true;
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"SPSSODescriptor" => in_sp_descriptor = false,
                b"EntityDescriptor" => {
                    if let Some(candidate) = current.take() {
                        if candidate.has_sp_descriptor {
                            return finish(candidate);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !root_seen {
        return Err(invalid_request("metadata body is empty"));
    }
    Err(invalid_request(
        "metadata contained no service provider metadata",
    ))
}

fn finish(candidate: Candidate) -> IdpResult<SpMetadata> {
    if candidate.entity_id.trim().is_empty() {
        return Err(invalid_request("EntityDescriptor is missing entityID"));
    }
    Ok(SpMetadata {
        entity_id: candidate.entity_id,
        acs_endpoints: candidate.acs_endpoints,
    })
}

fn acs_endpoint(e: &BytesStart<'_>) -> AcsEndpoint {
    AcsEndpoint {
        binding: attr(e, b"Binding").unwrap_or_default(),
        location: attr(e, b"Location").unwrap_or_default(),
        index: attr(e, b"index").and_then(|v| v.parse().ok()),
        is_default: attr(e, b"isDefault").is_some_and(|v| v == "true"),
    }
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SP: &str = r#"<?xml version="1.0"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://sp.example.com/metadata">
  <md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Artifact" Location="https://sp.example.com/artifact" index="0"/>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://sp.example.com/acs" index="2"/>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://sp.example.com/acs-alt" index="1"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#;

    #[test]
    fn parses_entity_descriptor() {
        let md = parse_sp_metadata(SP).expect("parse");
        assert_eq!(md.entity_id, "https://sp.example.com/metadata");
        assert_eq!(md.acs_endpoints.len(), 3);
        assert_eq!(md.acs_endpoints[1].index, Some(2));
    }

    #[test]
    fn acs_resolution_prefers_listed_request_then_lowest_post_index() {
        let md = parse_sp_metadata(SP).expect("parse");
        assert_eq!(
            md.resolve_acs(Some("https://sp.example.com/acs")),
            Some("https://sp.example.com/acs")
        );
        assert_eq!(
            md.resolve_acs(Some("https://evil.example.com/acs")),
            Some("https://sp.example.com/acs-alt")
        );
        assert_eq!(md.resolve_acs(None), Some("https://sp.example.com/acs-alt"));
    }

    #[test]
    fn picks_first_sp_from_entities_descriptor() {
        let xml = r#"<EntitiesDescriptor xmlns="urn:oasis:names:tc:SAML:2.0:metadata">
  <EntityDescriptor entityID="https://idp.other.com"><IDPSSODescriptor protocolSupportEnumeration="x"/></EntityDescriptor>
  <EntityDescriptor entityID="https://sp.one.com">
    <SPSSODescriptor protocolSupportEnumeration="x">
      <AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://sp.one.com/acs" index="0"/>
    </SPSSODescriptor>
  </EntityDescriptor>
  <EntityDescriptor entityID="https://sp.two.com"><SPSSODescriptor protocolSupportEnumeration="x"/></EntityDescriptor>
</EntitiesDescriptor>"#;
        let md = parse_sp_metadata(xml).expect("parse");
        assert_eq!(md.entity_id, "https://sp.one.com");
    }

    #[test]
    fn rejects_metadata_without_sp_descriptor() {
        let xml = r#"<EntitiesDescriptor><EntityDescriptor entityID="a"><IDPSSODescriptor/></EntityDescriptor></EntitiesDescriptor>"#;
        let err = parse_sp_metadata(xml).unwrap_err();
        assert!(err.message().contains("no service provider"));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(parse_sp_metadata("   ").is_err());
        assert!(parse_sp_metadata("<html><body/></html>").is_err());
        assert!(parse_sp_metadata("<EntityDescriptor entityID=\"x\"><SPSSODescriptor>").is_err());
    }

    #[test]
    fn idp_metadata_lists_both_bindings_and_key_uses() {
        let creds = SigningCredentials::generate_self_signed("idp").expect("creds");
        let idp = IdentityProvider::new("http://gw:8000/saml/idp");
        let xml = IdpMetadata::new(&idp, &creds).to_xml().expect("xml");
        assert!(xml.contains("entityID=\"http://gw:8000/saml/idp/metadata\""));
        assert!(xml.contains(BINDING_HTTP_REDIRECT));
        assert!(xml.contains(BINDING_HTTP_POST));
        assert!(xml.contains("use=\"signing\""));
        assert!(xml.contains("use=\"encryption\""));
        assert!(xml.contains(&creds.certificate_base64_der().expect("der")));
    }
}
