use saml_idp::model::{ServiceProvider, Session, SessionId, Subject};
use saml_idp::{create_stores, ErrorKind, IdpConfig, StoreBackendConfig};
use time::OffsetDateTime;

#[test]
fn factory_returns_working_inmemory_stores() {
    let stores = create_stores(StoreBackendConfig::InMemory).expect("in-memory stores");

    let session = Session::new(
        SessionId::from("tok"),
        "idx",
        Subject::default(),
        OffsetDateTime::now_utc(),
        60,
    );
    stores.sessions.add(session.clone()).expect("add");
    assert_eq!(stores.sessions.get_by_cookie(&session.id).expect("get"), session);

    stores
        .services
        .register(ServiceProvider::new("sp", "<EntityDescriptor/>"))
        .expect("register");
    assert_eq!(stores.services.list_all().expect("list").len(), 1);
}

#[test]
fn backend_is_selected_from_config() {
    let config = IdpConfig::from_json(
        r#"{ "backend": { "kind": "redis-url", "url": "redis://cache:6379/2" } }"#,
    )
    .expect("parse");
    assert_eq!(
        config.backend,
        StoreBackendConfig::RedisUrl("redis://cache:6379/2".to_string())
    );

    let default = IdpConfig::from_json("{}").expect("parse");
    assert_eq!(default.backend, StoreBackendConfig::InMemory);
}

#[test]
fn blank_redis_url_is_rejected() {
    let err = StoreBackendConfig::RedisUrl("  ".to_string())
        .validate()
        .expect_err("blank url");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[cfg(not(feature = "redis"))]
#[test]
fn redis_backend_requires_feature() {
    let err = create_stores(StoreBackendConfig::RedisUrl("redis://localhost".into()))
        .err()
        .expect("feature disabled");
    assert_eq!(err.kind(), ErrorKind::Config);
}
