use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tunnelbroker::{ClientKind, Config, IdPolicy};

#[derive(Parser)]
#[clap(name = "tunnelbroker")]
#[clap(about = "A reverse-tunnel broker routing HTTP paths and TCP ports to registered clients", long_about = None)]
struct Cli {
    /// 設定ファイル (TOML)。コマンドラインの値が優先される
    #[clap(long, short, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// サーバーモード: クライアントの登録とトラフィックの振り分け
    Server {
        /// バインドするホスト
        #[clap(long)]
        host: Option<String>,

        /// HTTP フロントのポート
        #[clap(long)]
        http_port: Option<u16>,

        /// トンネル用ポートの探索開始位置
        #[clap(long)]
        port_floor: Option<u16>,

        /// 割り当てるポート数の上限
        #[clap(long)]
        max_ports: Option<usize>,

        /// ワーカー数
        #[clap(long)]
        workers: Option<usize>,

        /// ジョブキューの長さ
        #[clap(long)]
        queue_size: Option<usize>,

        /// ハートビート間隔 (秒)
        #[clap(long)]
        heartbeat_interval: Option<u64>,

        /// この秒数ハートビートがなければクライアントを削除
        #[clap(long)]
        stale_timeout: Option<u64>,

        /// 応答待ちのタイムアウト (秒)
        #[clap(long)]
        response_timeout: Option<u64>,

        /// クライアントが送ってきた ID を使う
        #[clap(long)]
        client_supplied_ids: bool,

        /// 削除したクライアントのポートを再利用しない
        #[clap(long)]
        no_reclaim_ports: bool,
    },

    /// クライアントモード: ローカルサービスをブローカーに公開
    Client {
        /// ブローカーの HTTP アドレス (例: broker.example.com:8080)
        #[clap(long)]
        server: Option<String>,

        /// 登録するパス (複数指定可)
        #[clap(long = "path")]
        paths: Vec<String>,

        /// http または tcp
        #[clap(long)]
        protocol: Option<ClientKind>,

        /// 転送先のローカルサービス (例: 127.0.0.1:3000)
        #[clap(long)]
        local_addr: Option<String>,

        /// クライアント ID (ブローカーが許可している場合のみ使われる)
        #[clap(long)]
        client_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    let is_atty = atty::is(atty::Stream::Stdout);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
        )
        .with_ansi(is_atty)
        .init();

    let cli = Cli::parse();

    if let Some(limit) = fdlimit::raise_fd_limit() {
        debug!("File descriptor limit raised to {}", limit);
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };

    // Ctrl+Cハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            panic!("Failed to listen for ctrl-c signal: {:?}", e);
        }
        let _ = shutdown_tx.send(());
    });

    match cli.command {
        Commands::Server {
            host,
            http_port,
            port_floor,
            max_ports,
            workers,
            queue_size,
            heartbeat_interval,
            stale_timeout,
            response_timeout,
            client_supplied_ids,
            no_reclaim_ports,
        } => {
            let server = &mut config.server;
            if let Some(v) = host {
                server.host = v;
            }
            if let Some(v) = http_port {
                server.http_port = v;
            }
            if let Some(v) = port_floor {
                server.port_floor = v;
            }
            if let Some(v) = max_ports {
                server.max_ports = v;
            }
            if let Some(v) = workers {
                server.max_workers = v;
            }
            if let Some(v) = queue_size {
                server.queue_size = v;
            }
            if let Some(v) = heartbeat_interval {
                server.heartbeat_interval = Duration::from_secs(v);
            }
            if let Some(v) = stale_timeout {
                server.stale_timeout = Duration::from_secs(v);
            }
            if let Some(v) = response_timeout {
                server.response_timeout = Duration::from_secs(v);
            }
            if client_supplied_ids {
                server.id_policy = IdPolicy::ClientSupplied;
            }
            if no_reclaim_ports {
                server.reclaim_ports = false;
            }

            info!(
                "Starting server with {} workers and queue size {}",
                config.server.max_workers, config.server.queue_size
            );
            tunnelbroker::run_server(config.server, shutdown_rx).await?;
        }
        Commands::Client {
            server,
            paths,
            protocol,
            local_addr,
            client_id,
        } => {
            let client = &mut config.client;
            if let Some(v) = server {
                client.server = v;
            }
            if !paths.is_empty() {
                client.paths = paths;
            }
            if let Some(v) = protocol {
                client.protocol = v;
            }
            if let Some(v) = local_addr {
                client.local_addr = v;
            }
            if client_id.is_some() {
                client.client_id = client_id;
            }

            let tunnel = tunnelbroker::start_tunnel(config.client).await?;
            println!(
                "Tunnel established! Client ID: {}, {}:{} -> {}",
                tunnel.client_id(),
                tunnel.remote_host(),
                tunnel.remote_port(),
                tunnel.local_addr()
            );
            println!("Press Ctrl+C to stop...");

            // シャットダウン待機
            let mut rx = shutdown_rx;
            let _ = rx.recv().await;

            println!("Shutting down...");
            tunnel.shutdown().await?;
        }
    }

    Ok(())
}
