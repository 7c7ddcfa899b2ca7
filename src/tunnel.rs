use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::client::{Assignment, TunnelClient};
use crate::config::ClientConfig;

/// 確立されたトンネル
pub struct Tunnel {
    assignment: Assignment,
    local_addr: String,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl Tunnel {
    /// 割り当てられたリモートポートを取得
    pub fn remote_port(&self) -> u16 {
        self.assignment.port
    }

    /// ブローカーが発行したクライアント ID
    pub fn client_id(&self) -> &str {
        &self.assignment.client_id
    }

    pub fn remote_host(&self) -> &str {
        &self.assignment.host
    }

    /// 転送先のローカルアドレス
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// トンネルをシャットダウン
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle.await??;
        Ok(())
    }
}

/// トンネルを開始（メインAPI）
///
/// 登録が終わるまで待ち、その後はバックグラウンドでトンネルを維持する。
///
/// # 例
/// ```no_run
/// use tunnelbroker::{start_tunnel, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let tunnel = start_tunnel(ClientConfig {
///         server: "broker.example.com:8080".into(),
///         paths: vec!["/demo".into()],
///         local_addr: "127.0.0.1:3000".into(),
///         ..Default::default()
///     })
///     .await?;
///     println!("Remote port: {}", tunnel.remote_port());
///
///     tokio::signal::ctrl_c().await?;
///
///     tunnel.shutdown().await?;
///     Ok(())
/// }
/// ```
pub async fn start_tunnel(config: ClientConfig) -> Result<Tunnel> {
    let local_addr = config.local_addr.clone();
    let client = TunnelClient::new(config)?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let assignment = client.register_with_retry(shutdown_rx.resubscribe()).await?;

    // バックグラウンドでクライアントを実行
    let first = assignment.clone();
    let handle = tokio::spawn(async move { client.run(Some(first), shutdown_rx).await });

    Ok(Tunnel {
        assignment,
        local_addr,
        shutdown_tx,
        handle,
    })
}
