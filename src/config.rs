use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::registry::ClientKind;

/// クライアント ID の決め方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPolicy {
    /// ブローカーが毎回新しい ID を発行する
    BrokerGenerated,
    /// クライアントが送ってきた ID をそのまま使う
    ClientSupplied,
}

impl Default for IdPolicy {
    fn default() -> Self {
        IdPolicy::BrokerGenerated
    }
}

/// ブローカー設定
///
/// コアは起動時にこの値を受け取るだけで、ファイルや環境変数は読まない。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// リスナーをバインドするホスト
    pub host: String,
    /// HTTP フロントのポート
    pub http_port: u16,
    /// トンネル用ポートの探索下限
    pub port_floor: u16,
    /// 管理下に置けるポート数の上限
    pub max_ports: usize,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// これを超えてハートビートがないクライアントは削除
    #[serde(with = "duration_secs")]
    pub stale_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    pub max_workers: usize,
    pub queue_size: usize,
    pub id_policy: IdPolicy,
    /// クライアント削除時にポートをインベントリへ返す
    pub reclaim_ports: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            port_floor: 10000,
            max_ports: 10,
            heartbeat_interval: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(90),
            response_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_workers: 10,
            queue_size: 100,
            id_policy: IdPolicy::BrokerGenerated,
            reclaim_ports: true,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        if self.queue_size == 0 {
            anyhow::bail!("queue_size must be at least 1");
        }
        if self.stale_timeout <= self.heartbeat_interval * 2 {
            anyhow::bail!(
                "stale_timeout ({:?}) must exceed twice the heartbeat interval ({:?})",
                self.stale_timeout,
                self.heartbeat_interval
            );
        }
        Ok(())
    }
}

/// トンネルクライアント設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// ブローカーの HTTP アドレス (例: broker.example.com:8080)
    pub server: String,
    pub client_id: Option<String>,
    pub paths: Vec<String>,
    pub protocol: ClientKind,
    /// 転送先のローカルサービス
    pub local_addr: String,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "localhost:8080".to_string(),
            client_id: None,
            paths: Vec::new(),
            protocol: ClientKind::Http,
            local_addr: "127.0.0.1:3000".to_string(),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// 設定ファイル全体 (`[server]` と `[client]`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: BrokerConfig,
    pub client: ClientConfig,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).context("Failed to parse config")
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&s)
    }
}

/// 秒数 (小数可) と Duration の相互変換
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
