use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::dispatcher::Dispatcher;
use crate::frontend::{build_router, AppState};
use crate::port_allocator::{Accepted, PortAllocator};
use crate::registry::Registry;
use crate::router::Router;

/// 受け付けた接続を溜めておくチャネルの容量
const ACCEPT_BACKLOG: usize = 1024;

/// 起動済みのブローカー
///
/// 各コンポーネントを 1 つずつ作って配線する。
pub struct Broker {
    config: BrokerConfig,
    http_addr: SocketAddr,
    registry: Arc<Registry>,
    ports: Arc<PortAllocator>,
    dispatcher: Arc<Dispatcher>,
    router: Arc<Router>,
    shutdown_tx: broadcast::Sender<()>,
    http_task: JoinHandle<()>,
    accept_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl Broker {
    /// ブローカーを起動
    ///
    /// HTTP ポートにバインドできなければエラー。
    pub async fn start(config: BrokerConfig) -> Result<Broker> {
        config.validate()?;

        let bind_addr = format!("{}:{}", config.host, config.http_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        let http_addr = listener.local_addr()?;
        info!("Server listening on {}", http_addr);

        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let ports = Arc::new(
            PortAllocator::new(
                config.host.clone(),
                config.port_floor,
                config.max_ports,
                accepted_tx,
            )
            .with_reserved([http_addr.port()]),
        );
        info!(
            "Tunnel ports: up to {} from {}",
            config.max_ports, config.port_floor
        );

        let registry = Arc::new(Registry::new(&config, ports.clone()));
        let dispatcher = Arc::new(Dispatcher::new(config.max_workers, config.queue_size));
        dispatcher.start().await;
        let router = Arc::new(Router::new(&config, registry.clone(), dispatcher.clone()));

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let accept_task = tokio::spawn(accept_connections(
            accepted_rx,
            router.clone(),
            ports.clone(),
            shutdown_tx.subscribe(),
        ));
        let monitor_task = registry.spawn_monitor(shutdown_tx.subscribe());

        let app = build_router(AppState {
            registry: registry.clone(),
            router: router.clone(),
            dispatcher: dispatcher.clone(),
            ports: ports.clone(),
        });
        let mut http_shutdown = shutdown_tx.subscribe();
        let http_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        });

        Ok(Broker {
            config,
            http_addr,
            registry,
            ports,
            dispatcher,
            router,
            shutdown_tx,
            http_task,
            accept_task,
            monitor_task,
        })
    }

    /// HTTP フロントの実際のアドレス
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// 停止する
    ///
    /// HTTP と accept を止め、待機中のリクエストを取り消してから
    /// 実行中の Job を待ち、最後にリスナーと接続を閉じる。
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down broker");
        let _ = self.shutdown_tx.send(());

        if let Err(e) = self.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        if let Err(e) = self.monitor_task.await {
            warn!("Heartbeat monitor ended abnormally: {}", e);
        }

        // HTTP ハンドラが待っている応答を先に取り消す
        self.router.shutdown();
        if let Err(e) = self.http_task.await {
            warn!("HTTP server ended abnormally: {}", e);
        }

        self.dispatcher.stop().await;
        self.ports.close_all().await;

        info!("Broker stopped");
        Ok(())
    }
}

/// ブローカーを実行 (シャットダウンまで)
pub async fn run_server(config: BrokerConfig, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let broker = Broker::start(config).await?;

    let _ = shutdown_rx.recv().await;
    info!("Server shutdown requested");

    broker.shutdown().await
}

/// リスナーが受け付けた接続をルーターに渡す
async fn accept_connections(
    mut accepted_rx: mpsc::Receiver<Accepted>,
    router: Arc<Router>,
    ports: Arc<PortAllocator>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = accepted_rx.recv() => {
                let Accepted { stream, peer, port } = match accepted {
                    Some(a) => a,
                    None => break,
                };
                debug!("New connection from {} on port {}", peer, port);

                let router = router.clone();
                let handle = tokio::spawn(async move {
                    if let Err(e) = router.route_connection(stream, peer, port).await {
                        warn!("Connection error from {}: {:#}", peer, e);
                    }
                });
                ports.track_connection(port, handle).await;
            }
            _ = shutdown_rx.recv() => {
                debug!("Accept loop stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn config(floor: u16) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".into(),
            http_port: 0,
            port_floor: floor,
            max_ports: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let broker = Broker::start(config(36400)).await.unwrap();
        let addr = broker.http_addr();
        assert_ne!(addr.port(), 0);

        TcpStream::connect(addr).await.unwrap();
        broker.shutdown().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_tunnel_listeners() {
        let broker = Broker::start(config(36410)).await.unwrap();
        let record = broker
            .registry()
            .register_client(crate::registry::Registration::new(
                vec!["/x".into()],
                crate::registry::ClientKind::Tcp,
            ))
            .await
            .unwrap();
        assert_eq!(broker.ports().listening_ports().await, vec![record.tcp_port]);

        let ports = broker.ports().clone();
        broker.shutdown().await.unwrap();
        assert!(ports.listening_ports().await.is_empty());
        assert!(ports.inventory().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut cfg = config(36420);
        cfg.max_workers = 0;
        assert!(Broker::start(cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_run_server_until_signal() {
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_server(config(36430), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
