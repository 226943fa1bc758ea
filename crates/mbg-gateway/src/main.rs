//! mbg: border gateway daemon.
//!
//! Serves the control plane, forwards admitted connections between local
//! services and peer gateways, and announces configured services to peers
//! at startup.

use anyhow::{Context, Result};
use clap::Parser;
use mbg_core::Dataplane;
use mbg_gateway::certs::generate_dev_certificates;
use mbg_gateway::config::{ConfigFile, GatewayConfig, Overrides};
use mbg_gateway::dataplane::MtlsSettings;
use mbg_gateway::policy::{AdmissionGate, RemotePolicyEngine, RulePolicy};
use mbg_gateway::{ConnectionRouter, GatewayServer, GatewayState, PortTracker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// mbg: multi-cluster border gateway
#[derive(Parser, Debug)]
#[command(name = "mbg", version, about = "Multi-cluster border gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.mbg/config.toml")]
    config: String,

    /// Gateway id
    #[arg(long)]
    id: Option<String>,

    /// Address peers use to reach this gateway
    #[arg(long)]
    ip: Option<String>,

    /// Control-plane port
    #[arg(long)]
    cport: Option<u16>,

    /// mTLS data-plane port
    #[arg(long)]
    dport: Option<u16>,

    /// Data plane: tcp or mtls
    #[arg(long)]
    dataplane: Option<String>,

    /// Root CA (PEM)
    #[arg(long)]
    root_ca: Option<String>,

    /// Gateway certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// Gateway private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Write a development CA and gateway certificate into DIR, then exit
    #[arg(long, value_name = "DIR")]
    generate_certs: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            id: self.id.clone(),
            ip: self.ip.clone(),
            control_port: self.cport,
            dataplane_port: self.dport,
            dataplane: self.dataplane.clone(),
            root_ca: self.root_ca.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let overrides = cli.overrides();
    let file = ConfigFile::load(Some(&config_path)).context("failed to read config")?;

    // Runs before validation: an mTLS config without [tls] is still enough
    // to name the certificate.
    if let Some(dir) = &cli.generate_certs {
        let (id, names) = file.certificate_subject(&overrides);
        let paths = generate_dev_certificates(dir, &id, &names)
            .with_context(|| format!("failed to write certificates to {}", dir.display()))?;
        info!(
            root_ca = %paths.root_ca.display(),
            cert = %paths.cert.display(),
            key = %paths.key.display(),
            "generated development certificates"
        );
        return Ok(());
    }

    let config = GatewayConfig::resolve(file, overrides).context("invalid config")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        id = %config.identity.id,
        dataplane = %config.identity.dataplane,
        "starting mbg"
    );
    run(config).await
}

async fn run(config: GatewayConfig) -> Result<()> {
    let mtls = match (&config.tls, config.identity.dataplane) {
        (Some(paths), Dataplane::Mtls) => Some(Arc::new(
            MtlsSettings::load(paths).context("failed to load TLS certificates")?,
        )),
        _ => None,
    };

    let gate: Arc<dyn AdmissionGate> = match &config.policy_engine {
        Some(url) => {
            info!(url = %url, "using external policy engine");
            Arc::new(RemotePolicyEngine::new(url, config.timeouts.admission)?)
        }
        None => Arc::new(RulePolicy::new(config.policy_rules.clone())),
    };

    let state = Arc::new(GatewayState::new(config.identity.clone(), config.tls.clone()));
    for peer in config.peers {
        state.add_peer(peer).await;
    }
    for service in &config.services {
        state
            .catalog()
            .add_local_service(&service.id, &service.ip)
            .await;
    }

    let tracker = Arc::new(PortTracker::new(config.local_ports, config.external_ports));
    let router = Arc::new(ConnectionRouter::new(
        state,
        tracker,
        gate,
        mtls.clone(),
        config.timeouts,
    )?);

    let control_port = config.identity.control_port;
    let control = TcpListener::bind(("0.0.0.0", control_port))
        .await
        .with_context(|| format!("failed to bind control port {control_port}"))?;
    let dataplane = match mtls {
        Some(_) => {
            let port = config.identity.dataplane_port;
            Some(
                TcpListener::bind(("0.0.0.0", port))
                    .await
                    .with_context(|| format!("failed to bind data-plane port {port}"))?,
            )
        }
        None => None,
    };

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(
        GatewayServer::new(router.clone()).serve(control, dataplane, shutdown.clone()),
    );

    for service in config.services {
        let router = router.clone();
        tokio::spawn(async move {
            match router.expose_local_service(&service.id).await {
                Ok(outcome) => info!(
                    service = %service.id,
                    announced = outcome.announced,
                    failed = outcome.failed,
                    "service exposed"
                ),
                Err(e) => warn!(service = %service.id, error = %e, "expose failed"),
            }
        });
    }

    tokio::select! {
        result = server => {
            result.context("server task panicked")??;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            shutdown.cancel();
        }
    }

    info!("mbg stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
