//! Walks an in-memory IdP through registering a service provider and validating a POST-binding
//! AuthnRequest, then issues a signed response for a fresh session.

use base64::{engine::general_purpose::STANDARD, Engine};
use saml_idp::model::{ServiceProvider, Session, Subject};
use saml_idp::saml::metadata::parse_sp_metadata;
use saml_idp::saml::{
    AssertionIssuer, AuthnRequestValidator, Binding, IdentityProvider, IdpMetadata,
    RequestWindow, SamlRequestParams, SigningCredentials,
};
use saml_idp::token::{session_index, SessionTokenMinter};
use saml_idp::{IdpResult, Stores};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const SP_METADATA: &str = r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://sp.demo/metadata">
  <md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://sp.demo/acs" index="0"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#;

fn run_demo() -> IdpResult<()> {
    println!("== In-memory IdP demo ==");
    let credentials = Arc::new(SigningCredentials::generate_self_signed("idp.demo")?);
    let idp = Arc::new(IdentityProvider::new("http://idp.demo:8000/saml/idp"));
    let stores = Stores::in_memory();

    let metadata = IdpMetadata::new(&idp, &credentials).to_xml()?;
    println!("IdP metadata is {} bytes", metadata.len());

    let sp = parse_sp_metadata(SP_METADATA)?;
    stores
        .services
        .register(ServiceProvider::new(sp.entity_id.clone(), SP_METADATA))?;
    println!("Registered {}", sp.entity_id);

    let now = OffsetDateTime::now_utc();
    let instant = now
        .format(&Rfc3339)
        .map_err(|err| saml_idp::error::internal(err.to_string()))?;
    let request_xml = format!(
        r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="demo-1" Version="2.0" IssueInstant="{instant}" Destination="{}"><saml:Issuer>https://sp.demo/metadata</saml:Issuer></samlp:AuthnRequest>"#,
        idp.sso_url
    );
    let validator =
        AuthnRequestValidator::new(idp.clone(), stores.services.clone(), RequestWindow::default());
    let request = validator.validate(
        Binding::Post,
        &SamlRequestParams {
            saml_request: Some(STANDARD.encode(&request_xml)),
            relay_state: Some("demo-relay".into()),
        },
    )?;
    println!("Validated request {} from {}", request.id, request.issuer);

    let minter = SessionTokenMinter::new(&credentials.session_secret()?);
    let subject = Subject {
        user_id: "u-1".into(),
        email: "jane@example.com".into(),
        username: "jane".into(),
        groups: vec!["staff".into()],
    };
    let id = minter.mint(&subject.user_id, &subject.username, &subject.email, &subject.groups)?;
    let session = Session::new(id, session_index()?, subject, now, 3600);
    stores.sessions.add(session.clone())?;
    println!("Started session {}", session.id.fingerprint());

    let issuer = AssertionIssuer::new(idp, credentials, 300);
    let response = issuer.issue(&request, &session)?;
    println!(
        "Signed response for {} ({} base64 bytes)",
        response.acs_url,
        response.saml_response.len()
    );
    Ok(())
}

fn main() -> IdpResult<()> {
    run_demo()
}
