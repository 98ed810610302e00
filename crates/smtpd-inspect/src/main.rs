use anyhow::Context;
use clap::{Parser, ValueEnum};
use peer_resolver::{HickoryResolver, PeerEndpoint};
use smtpd_session::{ResetScope, Session, SmtpdConfig, Transport, XforwardFeatures};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

/// Show how the SMTP server would see a client.
///
/// Builds a session for the given peer using the system resolver,
/// optionally applies XFORWARD attributes as if they had been sent by
/// that peer, and prints the resulting client identity as JSON.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Server configuration file (TOML, or JSON with a .json extension)
    #[arg(long)]
    config: Option<PathBuf>,

    /// The address and port of the client
    #[arg(long, conflicts_with = "local", required_unless_present = "local")]
    peer: Option<SocketAddr>,

    /// Treat the client as a local stream, as when the server
    /// is run by hand
    #[arg(long)]
    local: bool,

    /// The client's HELO/EHLO name
    #[arg(long)]
    helo: Option<String>,

    /// Arguments of an XFORWARD command, eg: "NAME=host.example.com ADDR=192.0.2.1".
    /// May be repeated. Ignored unless the peer is listed in xforward_hosts.
    #[arg(long)]
    xforward: Vec<String>,

    /// The XFORWARD attributes a before-queue proxy advertises,
    /// eg: "NAME ADDR PROTO HELO"
    #[arg(long)]
    proxy_features: Option<String>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

impl Opt {
    fn init_logging(&self) -> anyhow::Result<()> {
        let layer = fmt::layer().with_writer(std::io::stderr);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };
        let env_filter = EnvFilter::try_new(
            std::env::var("SMTPD_INSPECT_LOG")
                .as_deref()
                .unwrap_or("smtpd_session=info,peer_resolver=info"),
        )?;
        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .init();
        Ok(())
    }

    fn load_config(&self) -> anyhow::Result<SmtpdConfig> {
        match &self.config {
            Some(path) => SmtpdConfig::load_from_file(path),
            None => Ok(SmtpdConfig::default()),
        }
    }

    fn transport(&self) -> anyhow::Result<Transport> {
        if self.local {
            return Ok(Transport::local());
        }
        let peer = self
            .peer
            .ok_or_else(|| anyhow::anyhow!("one of --peer or --local is required"))?;
        Ok(Transport {
            peer: PeerEndpoint::Inet(peer),
            local: None,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    opts.init_logging()?;

    let config = opts.load_config()?;
    let transport = opts.transport()?;
    let resolver = HickoryResolver::from_system_conf()?;

    let mut session = Session::init(transport, &config, &resolver)
        .await
        .context("initializing session")?;

    if let Some(helo) = &opts.helo {
        session.helo(helo, true);
    }

    if !opts.xforward.is_empty() {
        if session.is_xforward_peer(&config) {
            for args in &opts.xforward {
                session
                    .xforward_command(args)
                    .with_context(|| format!("XFORWARD {args}"))?;
            }
        } else {
            tracing::warn!(
                "{} is not listed in xforward_hosts; ignoring XFORWARD",
                session.client_addr()
            );
        }
    }

    let mode = session.submission_mode(&config);
    tracing::debug!("submission mode: {mode:?}");

    let proxy_xforward = match &opts.proxy_features {
        Some(features) => {
            session.set_proxy_features(XforwardFeatures::from_ehlo_param(features));
            Some(session.proxy_xforward_attributes())
        }
        None => None,
    };

    let report = serde_json::json!({
        "session": session.summary(),
        "proxy_xforward": proxy_xforward,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    session.reset(ResetScope::Connection);
    Ok(())
}
