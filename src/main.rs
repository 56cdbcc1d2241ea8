use anyhow::Context;
use salvo::catcher::Catcher;
use salvo::conn::Acceptor;
use salvo::conn::rustls::{Keycert, RustlsConfig};
use salvo::prelude::*;
use salvo::server::ServerHandle;
use tokio::signal;
use tracing::info;

use warren::config::{self, Role, ServerConfig, TlsConfig};
use warren::link::{Link, LinkConfig};
use warren::mux::TunnelClient;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    config::init();
    let config = config::get();

    let _guard = config.log.guard();
    tracing::info!("log level: {}", &config.log.filter_level);

    match config.role {
        Role::Egress => serve_egress(config).await,
        Role::Ingress => run_ingress(config).await,
    }
}

async fn serve_egress(config: &'static ServerConfig) {
    warren::server::init(config);
    let service =
        Service::new(warren::server::router(&config.connect_path)).catcher(Catcher::default());
    let addr = format!("{}:{}", config.listen_addr, config.listen_port);

    if let Some(tls) = &config.tls {
        println!(
            "🕳️ Tunnel egress listening on wss://{}{}",
            addr.replace("0.0.0.0", "127.0.0.1"),
            config.connect_path
        );
        let acceptor = match setup_tls_acceptor(&addr, tls).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                eprintln!("TLS setup failed: {e:#}");
                std::process::exit(1);
            }
        };
        let server = Server::new(acceptor);
        tokio::spawn(shutdown_signal(server.handle()));
        server.serve(service).await;
    } else {
        println!(
            "🕳️ Tunnel egress listening on ws://{}{}",
            addr.replace("0.0.0.0", "127.0.0.1"),
            config.connect_path
        );
        let acceptor = TcpListener::new(addr).bind().await;
        let server = Server::new(acceptor);
        tokio::spawn(shutdown_signal(server.handle()));
        server.serve(service).await;
    }
}

async fn setup_tls_acceptor(addr: &str, tls: &TlsConfig) -> anyhow::Result<impl Acceptor> {
    let cert = tokio::fs::read(&tls.cert)
        .await
        .with_context(|| format!("read tls certificate {}", tls.cert))?;
    let key = tokio::fs::read(&tls.key)
        .await
        .with_context(|| format!("read tls key {}", tls.key))?;
    let config = RustlsConfig::new(Keycert::new().cert(cert).key(key));
    Ok(TcpListener::new(addr.to_owned()).rustls(config).bind().await)
}

async fn run_ingress(config: &'static ServerConfig) {
    let link_config = LinkConfig {
        heartbeat_interval: config.heartbeat_interval(),
        heartbeat_timeout: config.heartbeat_timeout(),
        reconnect_grace: config.reconnect_grace(),
        queue_limit: config.send_queue_limit,
    };
    let (link, inbound) = Link::new(link_config);
    let client = TunnelClient::spawn(link, inbound, config.max_pending_requests);
    info!(uuid = client.uuid(), "ingress tunnel starting");

    let server_url = config
        .server_url
        .clone()
        .expect("server_url validated at startup");
    tokio::select! {
        _ = warren::connector::run(client.clone(), server_url, config.connect_path.clone()) => {}
        _ = wait_for_signal() => {
            info!("shutting tunnel down");
            client.close();
        }
    }
}

async fn shutdown_signal(handle: ServerHandle) {
    wait_for_signal().await;
    handle.stop_graceful(std::time::Duration::from_secs(60));
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl_c signal received"),
        _ = terminate => info!("terminate signal received"),
    }
}
