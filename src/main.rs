//! `saml-idp` server binary.

use anyhow::{Context, Result};
use clap::Parser;
use saml_idp::flow::FlowSettings;
use saml_idp::saml::{IdentityProvider, Pages, SigningCredentials};
use saml_idp::token::SystemTokenSigner;
use saml_idp::{
    create_stores, router, spawn_purge_task, AppState, HttpIdentityLookup, IdpConfig, LoginFlow,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "saml-idp", about = "SAML 2.0 single sign-on identity provider")]
struct Args {
    /// JSON configuration file; defaults to $SERVICE_CONFIG_FILE, then ./config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(long, env = "IDP_LISTEN_ADDR")]
    listen: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = IdpConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    init_tracing(args.json_logs || config.json_logs);

    let credentials = Arc::new(
        SigningCredentials::load(&config.idp.key_path, &config.idp.cert_path)
            .context("loading idp signing credentials")?,
    );
    let idp = Arc::new(IdentityProvider::from_config(&config)?);
    info!(entity_id = %idp.entity_id, sso = %idp.sso_url, "identity provider configured");

    let system_key = match &config.system_key {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("reading system key {}", path.display()))?,
        None => {
            warn!("systemKey not configured, signing user service calls with the idp key");
            credentials.private_key_pem()?
        }
    };
    let signer = SystemTokenSigner::from_rsa_pem(&system_key)?;
    let identity =
        HttpIdentityLookup::new(config.user_service_url()?, signer, config.breaker.clone())
            .map_err(|err| anyhow::anyhow!(err))?;

    let stores = create_stores(config.backend.clone()).context("opening stores")?;
    let pages = Pages::load(config.idp.template_dir.as_deref())?;

    let flow = LoginFlow::new(
        idp.clone(),
        credentials.clone(),
        stores.sessions.clone(),
        stores.services.clone(),
        Arc::new(identity),
        pages,
        FlowSettings::from_config(&config),
    )?;

    let _purge = config.purge_interval_secs.map(|secs| {
        info!(interval_secs = secs, "starting expired-session purge");
        spawn_purge_task(stores.sessions.clone(), Duration::from_secs(secs))
    });

    let app = router(AppState {
        flow: Arc::new(flow),
        stores,
        idp,
        credentials,
        google_metadata_path: config.google_metadata_path.clone(),
        gateway_is_https: config.gateway_is_https(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    info!("shut down");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("saml_idp=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "listening for ctrl-c failed");
    }
}
