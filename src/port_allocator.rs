use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;

/// 1 回の割り当てで試すポート数の上限
pub const MAX_PORT_ATTEMPTS: u32 = 1000;

/// リスナーが受け付けた接続
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// 受け付けたリスナーのポート
    pub port: u16,
}

struct ListenerEntry {
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    /// 管理下のポート (割り当て順)
    inventory: Vec<u16>,
    listeners: HashMap<u16, ListenerEntry>,
    connections: HashMap<u64, (u16, JoinHandle<()>)>,
}

/// ポート割り当て管理
///
/// 上限付きのインベントリと、ポートごとのリスナーを持つ。
/// 受け付けた接続はすべて `accepted_tx` に流す。
pub struct PortAllocator {
    host: String,
    floor: u16,
    max_ports: usize,
    reserved: HashSet<u16>,
    accepted_tx: mpsc::Sender<Accepted>,
    inner: RwLock<Inner>,
    next_conn_id: AtomicU64,
}

impl PortAllocator {
    /// 新しいポートアロケーターを作成
    pub fn new(
        host: impl Into<String>,
        floor: u16,
        max_ports: usize,
        accepted_tx: mpsc::Sender<Accepted>,
    ) -> Self {
        Self {
            host: host.into(),
            floor,
            max_ports,
            reserved: HashSet::new(),
            accepted_tx,
            inner: RwLock::new(Inner::default()),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// 割り当て対象から外すポート (HTTP フロントなど)
    pub fn with_reserved(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.reserved.extend(ports);
        self
    }

    /// 利用可能なポートを割り当て
    ///
    /// `preferred` を最初に試し、だめなら上に向かって探す。
    /// 返り値が `preferred` と異なることがある。
    pub async fn allocate(&self, preferred: u16) -> Result<u16, BrokerError> {
        let mut inner = self.inner.write().await;
        self.allocate_locked(&mut inner, preferred)
    }

    fn allocate_locked(&self, inner: &mut Inner, preferred: u16) -> Result<u16, BrokerError> {
        if inner.inventory.len() >= self.max_ports {
            return Err(BrokerError::PortExhausted {
                max: self.max_ports,
            });
        }

        if preferred > 0 && self.is_candidate(inner, preferred) && self.probe(preferred) {
            inner.inventory.push(preferred);
            debug!("Allocated preferred port {}", preferred);
            return Ok(preferred);
        }

        let start = if preferred == 0 {
            self.floor
        } else {
            preferred.max(self.floor)
        };

        let mut port = start;
        for _ in 0..MAX_PORT_ATTEMPTS {
            if self.is_candidate(inner, port) && self.probe(port) {
                inner.inventory.push(port);
                debug!("Allocated port {} (scan from {})", port, start);
                return Ok(port);
            }
            port = match port.checked_add(1) {
                Some(p) => p,
                None => break,
            };
        }

        Err(BrokerError::PortUnavailable {
            start,
            attempts: MAX_PORT_ATTEMPTS,
        })
    }

    fn is_candidate(&self, inner: &Inner, port: u16) -> bool {
        port != 0 && !self.reserved.contains(&port) && !inner.inventory.contains(&port)
    }

    /// ポートが実際にバインド可能か確認
    ///
    /// プローブ用ソケットはすぐに閉じる。
    fn probe(&self, port: u16) -> bool {
        self.bind_std(port).is_ok()
    }

    fn bind_std(&self, port: u16) -> std::io::Result<std::net::TcpListener> {
        let addr = (self.host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}", self.host),
                )
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    /// リスナーを起動、既にあればそれを再利用
    ///
    /// `port` にバインドできない場合は代わりのポートを割り当てる。
    /// 実際にリッスンしているポートを返す。
    pub async fn start_or_reuse_listener(&self, port: u16) -> Result<u16, BrokerError> {
        let mut inner = self.inner.write().await;

        if inner.listeners.contains_key(&port) {
            debug!("Reusing listener on port {}", port);
            return Ok(port);
        }

        let in_inventory = inner.inventory.contains(&port);
        if !in_inventory && inner.inventory.len() >= self.max_ports {
            return Err(BrokerError::PortExhausted {
                max: self.max_ports,
            });
        }

        let (port, std_listener) = match self.bind_std(port) {
            Ok(l) => {
                if !in_inventory {
                    inner.inventory.push(port);
                }
                (port, l)
            }
            Err(e) => {
                warn!("Failed to bind port {}: {}, allocating substitute", port, e);
                inner.inventory.retain(|p| *p != port);
                let substitute = self.allocate_locked(&mut inner, port.saturating_add(1))?;
                match self.bind_std(substitute) {
                    Ok(l) => (substitute, l),
                    Err(e) => {
                        inner.inventory.retain(|p| *p != substitute);
                        return Err(BrokerError::Io(e));
                    }
                }
            }
        };

        let listener = TcpListener::from_std(std_listener)?;
        let tx = self.accepted_tx.clone();
        let task = tokio::spawn(accept_loop(listener, port, tx));
        inner.listeners.insert(port, ListenerEntry { task });

        info!("TCP listener started on port {}", port);
        Ok(port)
    }

    /// 接続タスクを登録 (`close_all` / `release` で止める)
    pub async fn track_connection(&self, port: u16, handle: JoinHandle<()>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        inner.connections.retain(|_, (_, h)| !h.is_finished());
        inner.connections.insert(id, (port, handle));
    }

    /// ポートを解放 (リスナーと接続を閉じてインベントリから外す)
    pub async fn release(&self, port: u16) {
        let mut inner = self.inner.write().await;

        if let Some(entry) = inner.listeners.remove(&port) {
            entry.task.abort();
        }
        inner.connections.retain(|_, (p, h)| {
            if *p == port {
                h.abort();
                false
            } else {
                true
            }
        });
        inner.inventory.retain(|p| *p != port);

        info!("Released port {}", port);
    }

    /// すべての接続とリスナーを閉じる (シャットダウン時のみ)
    pub async fn close_all(&self) {
        let mut inner = self.inner.write().await;

        info!(
            "Closing {} connections and {} listeners",
            inner.connections.len(),
            inner.listeners.len()
        );

        for (_, (_, handle)) in inner.connections.drain() {
            handle.abort();
        }
        for (port, entry) in inner.listeners.drain() {
            debug!("Closing listener on port {}", port);
            entry.task.abort();
        }
        inner.inventory.clear();
    }

    pub async fn inventory(&self) -> Vec<u16> {
        self.inner.read().await.inventory.clone()
    }

    pub async fn listening_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.inner.read().await.listeners.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn max_ports(&self) -> usize {
        self.max_ports
    }
}

/// リスナーごとの accept ループ
///
/// エラーはこのリスナーだけを止める。
async fn accept_loop(listener: TcpListener, port: u16, tx: mpsc::Sender<Accepted>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("New connection on port {} from {}", port, peer);
                if tx.send(Accepted { stream, peer, port }).await.is_err() {
                    debug!("Router gone, stopping listener on port {}", port);
                    break;
                }
            }
            Err(e) => {
                error!("Error accepting connection on port {}: {}", port, e);
                break;
            }
        }
    }
    info!("Listener for port {} stopped", port);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(floor: u16, max: usize) -> (PortAllocator, mpsc::Receiver<Accepted>) {
        let (tx, rx) = mpsc::channel(8);
        (PortAllocator::new("127.0.0.1", floor, max, tx), rx)
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let (allocator, _rx) = allocator(35100, 10);

        // ポートを割り当て
        let port1 = allocator.allocate(35100).await.unwrap();
        assert!(port1 >= 35100);

        // 別のポートを割り当て (同じ希望でもインベントリにあるものは返さない)
        let port2 = allocator.allocate(35100).await.unwrap();
        assert!(port2 > port1);

        // ポートを解放
        allocator.release(port1).await;
        assert_eq!(allocator.inventory().await, vec![port2]);

        // 再度割り当て可能
        let port3 = allocator.allocate(port1).await.unwrap();
        assert_eq!(port3, port1);
    }

    #[tokio::test]
    async fn test_port_exhaustion() {
        // 小さな上限でテスト
        let (allocator, _rx) = allocator(35120, 2);

        let port1 = allocator.allocate(0).await.unwrap();
        let port2 = allocator.allocate(0).await.unwrap();
        assert_ne!(port1, port2);

        // 3つ目はエラー (上限は2つのみ)
        let result = allocator.allocate(0).await;
        assert!(matches!(result, Err(BrokerError::PortExhausted { max: 2 })));

        // 解放すれば再度割り当て可能
        allocator.release(port1).await;
        assert!(allocator.allocate(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_skips_busy_and_reserved_ports() {
        let busy = std::net::TcpListener::bind("127.0.0.1:35140").unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let allocator = PortAllocator::new("127.0.0.1", 35140, 10, tx).with_reserved([35141]);

        let port = allocator.allocate(35140).await.unwrap();
        assert_eq!(port, 35142);
        drop(busy);
    }

    #[tokio::test]
    async fn test_listener_is_reused_and_forwards_connections() {
        let (allocator, mut rx) = allocator(35160, 10);

        let port = allocator.allocate(35160).await.unwrap();
        let bound = allocator.start_or_reuse_listener(port).await.unwrap();
        assert_eq!(bound, port);

        // 2回目は同じリスナー
        let again = allocator.start_or_reuse_listener(port).await.unwrap();
        assert_eq!(again, port);
        assert_eq!(allocator.listening_ports().await, vec![port]);
        assert_eq!(allocator.inventory().await, vec![port]);

        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.port, port);
    }

    #[tokio::test]
    async fn test_listener_substitutes_busy_port() {
        let busy = std::net::TcpListener::bind("127.0.0.1:35180").unwrap();
        let (allocator, _rx) = allocator(35180, 10);

        let bound = allocator.start_or_reuse_listener(35180).await.unwrap();
        assert_ne!(bound, 35180);
        assert_eq!(allocator.inventory().await, vec![bound]);
        drop(busy);
    }

    #[tokio::test]
    async fn test_close_all_clears_everything() {
        let (allocator, _rx) = allocator(35200, 10);
        let port = allocator.start_or_reuse_listener(35200).await.unwrap();

        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        allocator.track_connection(port, handle).await;

        allocator.close_all().await;
        assert!(allocator.inventory().await.is_empty());
        assert!(allocator.listening_ports().await.is_empty());

        // リスナーが閉じたので新しくバインドできる
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}
