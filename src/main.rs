//! kube-identity-proxy entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_identity_proxy::audit::AuditSink;
use kube_identity_proxy::auth::access_review::{ImpersonationAuthorizer, ImpersonationGate};
use kube_identity_proxy::auth::oidc::{
    CaBundleProvider, CaFromFile, OidcAuthenticator, OidcOptions, SystemTrust,
};
use kube_identity_proxy::auth::token_review::{TokenAuthenticator, TokenReviewer};
use kube_identity_proxy::auth::AuthChain;
use kube_identity_proxy::config::{collect_key_values, parse_key_value, ProxyConfig};
use kube_identity_proxy::hooks::PreShutdownHooks;
use kube_identity_proxy::proxy::dispatch::UpstreamDispatcher;
use kube_identity_proxy::proxy::transport::UpstreamTransports;
use kube_identity_proxy::proxy::{router, AppState};
use kube_identity_proxy::server::{serve, ListenerConfig};

/// OIDC-authenticating reverse proxy that impersonates end users to a
/// Kubernetes API server
#[derive(Parser, Debug)]
#[command(name = "kube-identity-proxy", version, about, long_about = None)]
struct Cli {
    /// OIDC issuer URL; tokens must carry this `iss` claim
    #[arg(long, env = "OIDC_ISSUER_URL")]
    oidc_issuer_url: String,

    /// Expected OIDC audience (`aud` claim)
    #[arg(long, env = "OIDC_CLIENT_ID")]
    oidc_client_id: String,

    /// PEM bundle used to trust the issuer endpoint; re-read on rotation
    #[arg(long)]
    oidc_ca_file: Option<PathBuf>,

    /// Claim holding the username
    #[arg(long, default_value = "sub")]
    oidc_username_claim: String,

    /// Prefix prepended to extracted usernames
    #[arg(long)]
    oidc_username_prefix: Option<String>,

    /// Claim holding the group list
    #[arg(long, default_value = "groups")]
    oidc_groups_claim: String,

    /// Prefix prepended to each extracted group
    #[arg(long)]
    oidc_groups_prefix: Option<String>,

    /// Claim that must equal the given value (repeatable, key=value)
    #[arg(long = "oidc-required-claim", value_parser = parse_key_value)]
    oidc_required_claims: Vec<(String, String)>,

    /// Accepted JWT signing algorithms (repeatable)
    #[arg(long = "oidc-signing-algs", default_values_t = [String::from("RS256")])]
    oidc_signing_algs: Vec<String>,

    /// Forward the original bearer token instead of impersonating
    #[arg(long)]
    disable_impersonation: bool,

    /// Fall back to the upstream TokenReview API for non-OIDC tokens
    #[arg(long = "token-passthrough")]
    token_passthrough: bool,

    /// Flush cadence for streamed responses, in milliseconds (0 = every chunk)
    #[arg(long = "flush-interval", value_name = "MILLIS", default_value_t = 0)]
    flush_interval_ms: u64,

    /// Externally reachable address recorded in audit events
    #[arg(long)]
    external_address: Option<String>,

    /// Additional Impersonate-Extra header (repeatable, key=value)
    #[arg(long = "extra-user-header", value_parser = parse_key_value)]
    extra_user_headers: Vec<(String, String)>,

    /// Add Impersonate-Extra-Remote-Client-IP with the client address
    #[arg(long)]
    extra_user_header_client_ip: bool,

    /// Port to serve HTTPS on
    #[arg(long, default_value_t = 8443)]
    secure_port: u16,

    /// PEM serving certificate chain
    #[arg(long)]
    tls_cert_file: PathBuf,

    /// PEM serving private key
    #[arg(long)]
    tls_private_key_file: PathBuf,

    /// Kubeconfig for the upstream API server; in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Write audit events as JSON lines to this file
    #[arg(long)]
    audit_log_path: Option<PathBuf>,
}

struct App {
    listener: ListenerConfig,
    state: AppState,
    hooks: Arc<PreShutdownHooks>,
    audit_writer: tokio::task::JoinHandle<()>,
}

#[tokio::main]
async fn main() -> ExitCode {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Startup failures (configuration, TLS material, upstream config) exit
    // with 1; failures after the listener is up exit with 2.
    let app = match build(cli).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = format!("{:#}", e), "startup failed");
            return ExitCode::from(1);
        }
    };

    match run(app).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = format!("{:#}", e), "unrecoverable runtime failure");
            ExitCode::from(2)
        }
    }
}

async fn build(cli: Cli) -> anyhow::Result<App> {
    let rest_config = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
                .await
                .context("invalid kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("failed to infer upstream rest-config")?,
    };

    let need_anonymous = cli.disable_impersonation || cli.token_passthrough;
    let transports = Arc::new(
        UpstreamTransports::from_config(&rest_config, need_anonymous)
            .context("failed to build upstream transports")?,
    );

    let signing_algs = cli
        .oidc_signing_algs
        .iter()
        .map(|s| {
            s.parse()
                .map_err(|_| anyhow::anyhow!("unsupported signing algorithm {:?}", s))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let ca: Arc<dyn CaBundleProvider> = match &cli.oidc_ca_file {
        Some(path) => Arc::new(CaFromFile::new(path)),
        None => Arc::new(SystemTrust),
    };

    let oidc = Arc::new(
        OidcAuthenticator::new(
            OidcOptions {
                issuer_url: cli.oidc_issuer_url.clone(),
                client_id: cli.oidc_client_id.clone(),
                username_claim: cli.oidc_username_claim.clone(),
                username_prefix: cli.oidc_username_prefix.clone(),
                groups_claim: cli.oidc_groups_claim.clone(),
                groups_prefix: cli.oidc_groups_prefix.clone(),
                required_claims: cli.oidc_required_claims.iter().cloned().collect(),
                signing_algs,
                ..Default::default()
            },
            ca,
        )
        .context("invalid OIDC configuration")?,
    );

    // TokenReview and SubjectAccessReview go through the kube client, which
    // attaches the proxy's own credentials.
    let kube_client = kube::Client::try_from(rest_config.clone())
        .context("failed to build Kubernetes client")?;

    let token_reviewer = cli
        .token_passthrough
        .then(|| Arc::new(TokenReviewer::new(kube_client.clone())) as Arc<dyn TokenAuthenticator>);
    let gate = (!cli.disable_impersonation)
        .then(|| Arc::new(ImpersonationGate::new(kube_client)) as Arc<dyn ImpersonationAuthorizer>);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.secure_port));
    let config = Arc::new(ProxyConfig {
        disable_impersonation: cli.disable_impersonation,
        token_review: cli.token_passthrough,
        flush_interval: Duration::from_millis(cli.flush_interval_ms),
        external_address: cli
            .external_address
            .clone()
            .unwrap_or_else(|| addr.to_string()),
        extra_user_headers: collect_key_values(&cli.extra_user_headers),
        extra_user_header_client_ip: cli.extra_user_header_client_ip,
    });

    let dispatcher = Arc::new(UpstreamDispatcher::new(
        transports.privileged.clone(),
        transports.anonymous.clone(),
        config.flush_interval,
    ));

    let (audit, audit_writer) = AuditSink::start(cli.audit_log_path.clone());

    let hooks = Arc::new(PreShutdownHooks::new());
    // Dropping this clone at shutdown lets the writer task drain once the
    // router's remaining senders go away.
    let audit_for_hook = audit.clone();
    hooks.register("flush-audit-log", move || drop(audit_for_hook));

    info!(
        issuer = %cli.oidc_issuer_url,
        upstream = %transports.base_url,
        impersonation = !cli.disable_impersonation,
        token_review = cli.token_passthrough,
        "configured"
    );

    Ok(App {
        listener: ListenerConfig {
            addr,
            cert_path: cli.tls_cert_file,
            key_path: cli.tls_private_key_file,
        },
        state: AppState {
            auth: Arc::new(AuthChain::new(oidc, token_reviewer)),
            gate,
            dispatcher,
            transports,
            audit,
            config,
        },
        hooks,
        audit_writer,
    })
}

async fn run(app: App) -> anyhow::Result<()> {
    let App {
        listener,
        state,
        hooks,
        audit_writer,
    } = app;

    serve(listener, router(state), hooks)
        .await
        .context("listener failed")?;

    // The router (and with it every audit sender) is gone; give the writer
    // a moment to flush the tail of the log.
    if tokio::time::timeout(Duration::from_secs(5), audit_writer)
        .await
        .is_err()
    {
        error!("audit log writer did not drain in time");
    }

    Ok(())
}
