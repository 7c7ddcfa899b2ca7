use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, IdPolicy};
use crate::error::BrokerError;
use crate::port_allocator::PortAllocator;

/// クライアントの種類 (プロキシ方法が変わる)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Http,
    Tcp,
}

impl FromStr for ClientKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ClientKind::Http),
            "tcp" => Ok(ClientKind::Tcp),
            other => Err(BrokerError::validation(format!(
                "invalid protocol '{}', must be 'http' or 'tcp'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Connecting,
    Active,
    Inactive,
}

/// クライアント情報のスナップショット
#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ClientKind,
    pub paths: Vec<String>,
    pub tcp_port: u16,
    pub active_connections: u32,
    pub status: ClientStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// 登録リクエスト
#[derive(Debug, Clone)]
pub struct Registration {
    pub client_id: Option<String>,
    pub paths: Vec<String>,
    pub kind: ClientKind,
    pub metadata: HashMap<String, String>,
}

impl Registration {
    pub fn new(paths: Vec<String>, kind: ClientKind) -> Self {
        Self {
            client_id: None,
            paths,
            kind,
            metadata: HashMap::new(),
        }
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }
}

/// ハートビートと接続数 (クライアントごとのロック)
struct ClientState {
    status: ClientStatus,
    last_heartbeat: Instant,
    last_seen_at: DateTime<Utc>,
    active_connections: u32,
}

struct ClientEntry {
    id: String,
    kind: ClientKind,
    paths: Vec<String>,
    tcp_port: u16,
    metadata: HashMap<String, String>,
    state: Mutex<ClientState>,
}

impl ClientEntry {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ClientRecord {
        let state = self.state();
        ClientRecord {
            id: self.id.clone(),
            kind: self.kind,
            paths: self.paths.clone(),
            tcp_port: self.tcp_port,
            active_connections: state.active_connections,
            status: state.status,
            last_heartbeat: state.last_seen_at,
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Default)]
struct Tables {
    clients: HashMap<String, Arc<ClientEntry>>,
    /// 正規化済みパス -> クライアント ID (登録順)
    paths: HashMap<String, Vec<String>>,
}

impl Tables {
    /// クライアントとパスの対応を削除 (空になったパスも消す)
    fn remove(&mut self, client_id: &str) -> Option<Arc<ClientEntry>> {
        let entry = self.clients.remove(client_id)?;
        for path in &entry.paths {
            if let Some(ids) = self.paths.get_mut(path) {
                ids.retain(|id| id != client_id);
                if ids.is_empty() {
                    self.paths.remove(path);
                }
            }
        }
        Some(entry)
    }

    fn lookup(&self, query: &str) -> Option<&Vec<String>> {
        if let Some(ids) = self.paths.get(query) {
            return Some(ids);
        }
        // 前方一致は最も長いパターンを優先
        self.paths
            .iter()
            .filter(|(pattern, _)| path_matches(pattern, query))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, ids)| ids)
    }
}

/// クライアント登録管理
///
/// クライアント表とパスインデックスを持ち、ハートビートで状態を更新する。
pub struct Registry {
    tables: RwLock<Tables>,
    ports: Arc<PortAllocator>,
    id_policy: IdPolicy,
    port_floor: u16,
    heartbeat_interval: Duration,
    stale_timeout: Duration,
    reclaim_ports: bool,
}

impl Registry {
    pub fn new(config: &BrokerConfig, ports: Arc<PortAllocator>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            ports,
            id_policy: config.id_policy,
            port_floor: config.port_floor,
            heartbeat_interval: config.heartbeat_interval,
            stale_timeout: config.stale_timeout,
            reclaim_ports: config.reclaim_ports,
        }
    }

    /// クライアントを登録してポートを割り当てる
    pub async fn register_client(&self, req: Registration) -> Result<ClientRecord, BrokerError> {
        let mut paths: Vec<String> = Vec::new();
        for raw in req.paths.iter().filter(|p| !p.trim().is_empty()) {
            let path = normalize_path(raw);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(BrokerError::validation("at least one path is required"));
        }

        let client_id = match self.id_policy {
            IdPolicy::ClientSupplied => {
                let id = req
                    .client_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| BrokerError::validation("client ID is required"))?
                    .to_string();
                if id.contains('|') || id.chars().any(char::is_whitespace) {
                    return Err(BrokerError::validation(
                        "client ID must not contain '|' or whitespace",
                    ));
                }
                // 同じ ID の古い登録は置き換える
                if self.remove_client(&id).await.is_some() {
                    warn!(client_id = %id, "Replacing existing registration");
                }
                id
            }
            IdPolicy::BrokerGenerated => self.generate_id().await,
        };

        let allocated = self.ports.allocate(self.port_floor).await?;
        let port = self.ports.start_or_reuse_listener(allocated).await?;

        let now = Instant::now();
        let entry = Arc::new(ClientEntry {
            id: client_id.clone(),
            kind: req.kind,
            paths: paths.clone(),
            tcp_port: port,
            metadata: req.metadata,
            state: Mutex::new(ClientState {
                status: ClientStatus::Connecting,
                last_heartbeat: now,
                last_seen_at: Utc::now(),
                active_connections: 0,
            }),
        });
        let record = entry.snapshot();

        let replaced = {
            let mut tables = self.tables.write().await;
            let replaced = tables.remove(&client_id);
            tables.clients.insert(client_id.clone(), entry);
            for path in &paths {
                tables
                    .paths
                    .entry(path.clone())
                    .or_default()
                    .push(client_id.clone());
            }
            info!(
                client_id = %client_id,
                kind = ?req.kind,
                paths = ?paths,
                port,
                total = tables.clients.len(),
                "Registered client"
            );
            replaced
        };
        if let Some(old) = replaced {
            self.reclaim(old.tcp_port).await;
        }

        Ok(record)
    }

    async fn generate_id(&self) -> String {
        let tables = self.tables.read().await;
        loop {
            let id = hex::encode(rand::random::<[u8; 16]>());
            if !tables.clients.contains_key(&id) {
                return id;
            }
        }
    }

    /// パスに登録されたクライアントを探す (登録順)
    ///
    /// 完全一致がなければ、パス区切りで前方一致する最長のパターンを使う。
    pub async fn find_clients_for_path(&self, path: &str) -> Result<Vec<ClientRecord>, BrokerError> {
        let query = normalize_path(path);
        let tables = self.tables.read().await;

        let clients: Vec<ClientRecord> = tables
            .lookup(&query)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.clients.get(id))
                    .map(|entry| entry.snapshot())
                    .collect()
            })
            .unwrap_or_default();

        if clients.is_empty() {
            debug!("No client found for path {}", query);
            return Err(BrokerError::not_found(format!(
                "no clients found for path: {}",
                query
            )));
        }
        Ok(clients)
    }

    pub async fn find_client_by_port(&self, port: u16) -> Option<ClientRecord> {
        let tables = self.tables.read().await;
        tables
            .clients
            .values()
            .find(|entry| entry.tcp_port == port)
            .map(|entry| entry.snapshot())
    }

    pub async fn get_client(&self, client_id: &str) -> Option<ClientRecord> {
        let tables = self.tables.read().await;
        tables.clients.get(client_id).map(|entry| entry.snapshot())
    }

    pub async fn list_clients(&self) -> Vec<ClientRecord> {
        let tables = self.tables.read().await;
        let mut clients: Vec<ClientRecord> =
            tables.clients.values().map(|entry| entry.snapshot()).collect();
        clients.sort_by(|a, b| a.tcp_port.cmp(&b.tcp_port).then(a.id.cmp(&b.id)));
        clients
    }

    pub async fn client_count(&self) -> usize {
        self.tables.read().await.clients.len()
    }

    /// パスインデックスのスナップショット
    pub async fn path_index(&self) -> BTreeMap<String, Vec<String>> {
        let tables = self.tables.read().await;
        tables
            .paths
            .iter()
            .map(|(path, ids)| (path.clone(), ids.clone()))
            .collect()
    }

    /// ハートビートを記録して active にする
    pub async fn update_heartbeat(&self, client_id: &str) -> Result<(), BrokerError> {
        let tables = self.tables.read().await;
        let entry = tables
            .clients
            .get(client_id)
            .ok_or_else(|| BrokerError::not_found(format!("client not found: {}", client_id)))?;

        let mut state = entry.state();
        if state.status == ClientStatus::Inactive {
            info!(client_id = %client_id, "Client resumed heartbeating");
        }
        state.last_heartbeat = Instant::now();
        state.last_seen_at = Utc::now();
        state.status = ClientStatus::Active;

        debug!(
            client_id = %client_id,
            connections = state.active_connections,
            "Heartbeat"
        );
        Ok(())
    }

    /// トンネル接続のハンドシェイクを確認する
    pub async fn confirm_tunnel(&self, client_id: &str, path: &str) -> Result<ClientRecord, BrokerError> {
        let tables = self.tables.read().await;
        let entry = tables
            .clients
            .get(client_id)
            .ok_or_else(|| BrokerError::not_found(format!("client not found: {}", client_id)))?;

        let path = normalize_path(path);
        if !entry.paths.contains(&path) {
            return Err(BrokerError::validation(format!(
                "path {} is not registered for client {}",
                path, client_id
            )));
        }

        {
            let mut state = entry.state();
            state.last_heartbeat = Instant::now();
            state.last_seen_at = Utc::now();
            state.status = ClientStatus::Active;
        }
        Ok(entry.snapshot())
    }

    pub async fn increment_connections(&self, client_id: &str) -> Result<u32, BrokerError> {
        let tables = self.tables.read().await;
        let entry = tables
            .clients
            .get(client_id)
            .ok_or_else(|| BrokerError::not_found(format!("client not found: {}", client_id)))?;

        let mut state = entry.state();
        state.active_connections = state.active_connections.saturating_add(1);
        debug!(client_id = %client_id, connections = state.active_connections, "Connection opened");
        Ok(state.active_connections)
    }

    /// 接続数を減らす (0 未満にはならない)
    pub async fn decrement_connections(&self, client_id: &str) -> Result<u32, BrokerError> {
        let tables = self.tables.read().await;
        let entry = tables
            .clients
            .get(client_id)
            .ok_or_else(|| BrokerError::not_found(format!("client not found: {}", client_id)))?;

        let mut state = entry.state();
        state.active_connections = state.active_connections.saturating_sub(1);
        debug!(client_id = %client_id, connections = state.active_connections, "Connection closed");
        Ok(state.active_connections)
    }

    /// クライアントを削除 (存在しなくてもエラーにしない)
    pub async fn remove_client(&self, client_id: &str) -> Option<ClientRecord> {
        let removed = self.tables.write().await.remove(client_id)?;
        info!(client_id = %client_id, port = removed.tcp_port, "Removed client");

        self.reclaim(removed.tcp_port).await;
        Some(removed.snapshot())
    }

    async fn reclaim(&self, port: u16) {
        if self.reclaim_ports {
            self.ports.release(port).await;
        }
    }

    /// 監視 1 回分: 応答のないクライアントを inactive にし、古いものを削除
    ///
    /// 削除したクライアント ID を返す。
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let inactive_after = self.heartbeat_interval * 2;

        let removed: Vec<Arc<ClientEntry>> = {
            let mut tables = self.tables.write().await;
            let mut stale = Vec::new();

            for (id, entry) in &tables.clients {
                let mut state = entry.state();
                let silent = now.saturating_duration_since(state.last_heartbeat);

                if silent > self.stale_timeout {
                    stale.push(id.clone());
                } else if silent > inactive_after && state.status != ClientStatus::Inactive {
                    warn!(client_id = %id, silent = ?silent, "Client hasn't sent heartbeat, marking inactive");
                    state.status = ClientStatus::Inactive;
                }
            }

            stale.iter().filter_map(|id| tables.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(removed.len());
        for entry in removed {
            info!(client_id = %entry.id, port = entry.tcp_port, "Removed stale client");
            self.reclaim(entry.tcp_port).await;
            ids.push(entry.id.clone());
        }
        ids
    }

    /// ハートビート監視タスクを起動
    pub fn spawn_monitor(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            info!("Started heartbeat monitor with {:?} interval", period);
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.sweep(Instant::now()).await;
                        if !removed.is_empty() {
                            info!("Cleaned up {} stale clients", removed.len());
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Heartbeat monitor stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// 末尾のスラッシュを除き、先頭にスラッシュを付ける
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// パス区切り単位の前方一致
fn path_matches(pattern: &str, query: &str) -> bool {
    if pattern == "/" {
        return true;
    }
    match query.strip_prefix(pattern) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config(floor: u16) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".into(),
            port_floor: floor,
            max_ports: 4,
            heartbeat_interval: Duration::from_secs(10),
            stale_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    fn registry(cfg: &BrokerConfig) -> Registry {
        let (tx, _rx) = mpsc::channel(8);
        let ports = Arc::new(PortAllocator::new(
            cfg.host.clone(),
            cfg.port_floor,
            cfg.max_ports,
            tx,
        ));
        Registry::new(cfg, ports)
    }

    fn reg(paths: &[&str]) -> Registration {
        Registration::new(paths.iter().map(|p| p.to_string()).collect(), ClientKind::Http)
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("demo"), "/demo");
        assert_eq!(normalize_path("/demo/"), "/demo");
        assert_eq!(normalize_path("/demo//"), "/demo");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("api/v1/"), "/api/v1");
    }

    #[test]
    fn test_path_matches_on_segment_boundary() {
        assert!(path_matches("/api", "/api/users"));
        assert!(path_matches("/api", "/api"));
        assert!(!path_matches("/api", "/apix"));
        assert!(path_matches("/", "/anything"));
    }

    #[tokio::test]
    async fn test_register_requires_path() {
        let cfg = config(36000);
        let registry = registry(&cfg);

        let result = registry.register_client(reg(&["", "  "])).await;
        assert!(matches!(result, Err(BrokerError::Validation(_))));
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_demo_scenario() {
        let cfg = config(36010);
        let registry = registry(&cfg);

        let a = registry.register_client(reg(&["/demo"])).await.unwrap();
        assert!(a.tcp_port >= 36010);
        assert_eq!(a.status, ClientStatus::Connecting);

        // 末尾スラッシュは正規化される
        let found = registry.find_clients_for_path("/demo/").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);

        // 2つ目のクライアントは後ろに追加
        let b = registry.register_client(reg(&["demo"])).await.unwrap();
        assert_ne!(a.tcp_port, b.tcp_port);
        let found = registry.find_clients_for_path("/demo").await.unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

        // A を消すと B だけ残る
        registry.remove_client(&a.id).await.unwrap();
        let found = registry.find_clients_for_path("/demo").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b.id);
    }

    #[tokio::test]
    async fn test_path_index_consistency() {
        let cfg = config(36020);
        let registry = registry(&cfg);

        let a = registry.register_client(reg(&["/a", "/shared/"])).await.unwrap();
        let b = registry.register_client(reg(&["/b", "shared"])).await.unwrap();

        let index = registry.path_index().await;
        for client in [&a, &b] {
            for (path, ids) in &index {
                let listed = ids.iter().filter(|id| **id == client.id).count();
                let expected = usize::from(client.paths.contains(path));
                assert_eq!(listed, expected, "client {} path {}", client.id, path);
            }
        }

        // 削除後に空のパスは残らない
        registry.remove_client(&a.id).await;
        registry.remove_client(&b.id).await;
        assert!(registry.path_index().await.is_empty());

        // 2回目の削除もエラーにならない
        assert!(registry.remove_client(&a.id).await.is_none());
    }

    #[tokio::test]
    async fn test_prefix_fallback_prefers_longest_pattern() {
        let cfg = config(36030);
        let registry = registry(&cfg);

        let api = registry.register_client(reg(&["/api"])).await.unwrap();
        let users = registry.register_client(reg(&["/api/users"])).await.unwrap();

        let found = registry.find_clients_for_path("/api/users/42").await.unwrap();
        assert_eq!(found[0].id, users.id);

        let found = registry.find_clients_for_path("/api/orders").await.unwrap();
        assert_eq!(found[0].id, api.id);

        let missing = registry.find_clients_for_path("/apix").await;
        assert!(matches!(missing, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_connections_never_negative() {
        let cfg = config(36040);
        let registry = registry(&cfg);
        let a = registry.register_client(reg(&["/c"])).await.unwrap();

        assert_eq!(registry.decrement_connections(&a.id).await.unwrap(), 0);
        assert_eq!(registry.increment_connections(&a.id).await.unwrap(), 1);
        assert_eq!(registry.decrement_connections(&a.id).await.unwrap(), 0);
        assert_eq!(registry.decrement_connections(&a.id).await.unwrap(), 0);

        registry.remove_client(&a.id).await;
        assert!(matches!(
            registry.decrement_connections(&a.id).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_state_machine() {
        let cfg = config(36050);
        let registry = registry(&cfg);
        let a = registry.register_client(reg(&["/hb"])).await.unwrap();

        registry.update_heartbeat(&a.id).await.unwrap();
        assert_eq!(
            registry.get_client(&a.id).await.unwrap().status,
            ClientStatus::Active
        );

        // 2×interval を超えたら inactive
        let removed = registry.sweep(Instant::now() + Duration::from_secs(21)).await;
        assert!(removed.is_empty());
        assert_eq!(
            registry.get_client(&a.id).await.unwrap().status,
            ClientStatus::Inactive
        );

        // stale timeout を超えたら削除
        let removed = registry.sweep(Instant::now() + Duration::from_secs(61)).await;
        assert_eq!(removed, vec![a.id.clone()]);
        assert!(registry.get_client(&a.id).await.is_none());
        assert!(registry.find_clients_for_path("/hb").await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_revives_inactive_client() {
        let cfg = config(36060);
        let registry = registry(&cfg);
        let a = registry.register_client(reg(&["/revive"])).await.unwrap();

        registry.sweep(Instant::now() + Duration::from_secs(25)).await;
        assert_eq!(
            registry.get_client(&a.id).await.unwrap().status,
            ClientStatus::Inactive
        );

        registry.update_heartbeat(&a.id).await.unwrap();
        assert_eq!(
            registry.get_client(&a.id).await.unwrap().status,
            ClientStatus::Active
        );
        assert!(registry.update_heartbeat("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_confirm_tunnel() {
        let cfg = config(36070);
        let registry = registry(&cfg);
        let a = registry.register_client(reg(&["/t"])).await.unwrap();

        assert!(matches!(
            registry.confirm_tunnel(&a.id, "/other").await,
            Err(BrokerError::Validation(_))
        ));
        let record = registry.confirm_tunnel(&a.id, "t/").await.unwrap();
        assert_eq!(record.status, ClientStatus::Active);
        assert!(matches!(
            registry.confirm_tunnel("nope", "/t").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_client_supplied_ids() {
        let mut cfg = config(36080);
        cfg.id_policy = IdPolicy::ClientSupplied;
        let registry = registry(&cfg);

        let missing = registry.register_client(reg(&["/x"])).await;
        assert!(matches!(missing, Err(BrokerError::Validation(_))));

        let first = registry
            .register_client(reg(&["/x"]).with_client_id("agent-1"))
            .await
            .unwrap();
        assert_eq!(first.id, "agent-1");

        // 同じ ID で再登録すると置き換え
        let second = registry
            .register_client(reg(&["/y"]).with_client_id("agent-1"))
            .await
            .unwrap();
        assert_eq!(registry.client_count().await, 1);
        assert_eq!(second.paths, vec!["/y".to_string()]);
        assert!(registry.find_clients_for_path("/x").await.is_err());
    }

    #[tokio::test]
    async fn test_port_exhaustion_and_reclaim() {
        let cfg = config(36090);
        let registry = registry(&cfg);

        let mut clients = Vec::new();
        for i in 0..cfg.max_ports {
            clients.push(
                registry
                    .register_client(reg(&[&format!("/p{}", i)]))
                    .await
                    .unwrap(),
            );
        }

        let result = registry.register_client(reg(&["/overflow"])).await;
        assert!(matches!(result, Err(BrokerError::PortExhausted { .. })));

        // 削除したクライアントのポートは再利用できる
        registry.remove_client(&clients[0].id).await;
        let again = registry.register_client(reg(&["/overflow"])).await.unwrap();
        assert!(clients[1..].iter().all(|c| c.tcp_port != again.tcp_port));
    }
}
