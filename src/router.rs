use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::correlator::Correlator;
use crate::dispatcher::{Dispatcher, Job};
use crate::error::BrokerError;
use crate::protocol::{
    read_line, write_line, Frame, HttpRequestFrame, HttpResponseFrame, Line, Preamble,
    HEARTBEAT_ACK, REGISTERED,
};
use crate::registry::{ClientRecord, Registry};

/// 最初の行を読んだ後の接続 (読み残しを含む)
pub type Conn = BufReader<TcpStream>;

/// トンネルへの送信
#[derive(Debug)]
enum Outbound {
    Line(&'static str),
    Frame(Frame),
}

struct Session {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

impl Session {
    /// ポート解放でタスクごと止められたセッションは受信側が閉じている
    fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// 受け付けた接続と HTTP リクエストを振り分ける
pub struct Router {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    responses: Correlator<HttpResponseFrame>,
    data_channels: Correlator<Conn>,
    sessions: RwLock<HashMap<String, Session>>,
    next_session_id: AtomicU64,
    handshake_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl Router {
    pub fn new(config: &BrokerConfig, registry: Arc<Registry>, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            dispatcher,
            responses: Correlator::new(config.response_timeout),
            data_channels: Correlator::new(config.handshake_timeout),
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
            handshake_timeout: config.handshake_timeout,
            shutdown_tx,
        }
    }

    /// リスナーが受け付けた接続を処理
    ///
    /// 最初の行で、トンネル・データチャネル・利用者接続を見分ける。
    pub async fn route_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        port: u16,
    ) -> Result<()> {
        let mut conn = BufReader::new(stream);

        let line = timeout(self.handshake_timeout, read_line(&mut conn))
            .await
            .with_context(|| format!("Timeout waiting for first line from {}", peer))??;
        let line = match line {
            Some(line) => line,
            None => {
                debug!("{} closed before sending anything", peer);
                return Ok(());
            }
        };

        let preamble = match Preamble::parse(&line) {
            Ok(p) => p,
            Err(e) => {
                let _ = write_line(&mut conn, &format!("error {}", e)).await;
                return Err(e);
            }
        };

        match preamble {
            Preamble::Tunnel { client_id, path } => {
                self.run_tunnel(conn, peer, port, client_id, path).await
            }
            Preamble::DataChannel {
                client_id,
                request_id,
            } => {
                debug!(client_id = %client_id, request_id = %request_id, "Data channel from {}", peer);
                self.data_channels
                    .deliver(&data_channel_key(&client_id, &request_id), conn)
                    .with_context(|| format!("Unexpected data channel from {}", peer))?;
                Ok(())
            }
            Preamble::Command { routing_key, raw } => {
                self.route_command(conn, peer, port, routing_key, raw).await
            }
        }
    }

    /// クライアント自身のトンネル接続
    async fn run_tunnel(
        &self,
        mut conn: Conn,
        peer: SocketAddr,
        port: u16,
        client_id: String,
        path: String,
    ) -> Result<()> {
        let confirmed = self
            .registry
            .confirm_tunnel(&client_id, &path)
            .await
            .and_then(|record| {
                if record.tcp_port == port {
                    Ok(record)
                } else {
                    Err(BrokerError::validation(format!(
                        "client {} is not bound to port {}",
                        client_id, port
                    )))
                }
            });
        if let Err(e) = confirmed {
            let _ = write_line(&mut conn, &format!("error {}", e)).await;
            return Err(e).context("Tunnel handshake rejected");
        }
        write_line(&mut conn, REGISTERED).await?;

        let (tx, rx) = mpsc::channel(64);
        let session_id = self.install_session(&client_id, tx).await;
        info!(client_id = %client_id, path = %path, port, "Tunnel established from {}", peer);

        let (reader, writer) = tokio::io::split(conn);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::select! {
            res = self.read_tunnel(BufReader::new(reader), &client_id) => {
                if let Err(e) = res {
                    info!(client_id = %client_id, "Tunnel closed: {:#}", e);
                }
            }
            res = write_tunnel(writer, rx) => {
                if let Err(e) = res {
                    warn!(client_id = %client_id, "Failed to write to tunnel: {:#}", e);
                }
            }
            _ = shutdown.changed() => {
                debug!(client_id = %client_id, "Tunnel closing for shutdown");
            }
        }

        let mut sessions = self.sessions.write().await;
        if matches!(sessions.get(&client_id), Some(s) if s.id == session_id) {
            sessions.remove(&client_id);
        }
        info!(client_id = %client_id, "Tunnel session ended");
        Ok(())
    }

    /// 既存のセッションは置き換える (古い方は送信側が閉じて終了する)
    async fn install_session(&self, client_id: &str, tx: mpsc::Sender<Outbound>) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| s.is_live());
        let old = sessions.insert(client_id.to_string(), Session { id, tx });
        if old.is_some() {
            info!(client_id = %client_id, "Replacing existing tunnel session");
        }
        id
    }

    /// トンネルから届いた行を処理
    async fn read_tunnel<R>(&self, mut reader: BufReader<R>, client_id: &str) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let line = match read_line(&mut reader).await? {
                Some(line) => line,
                None => anyhow::bail!("connection closed by client"),
            };
            if line.trim().is_empty() {
                continue;
            }

            match Line::parse(&line) {
                Ok(Line::Heartbeat) => {
                    self.registry
                        .update_heartbeat(client_id)
                        .await
                        .context("Heartbeat from unregistered client")?;
                    self.send(client_id, Outbound::Line(HEARTBEAT_ACK)).await?;
                }
                Ok(Line::Frame(Frame::HttpResponse(resp))) => {
                    let request_id = resp.request_id.clone();
                    if self.responses.deliver(&request_id, resp).is_err() {
                        debug!(client_id, request_id = %request_id, "Late response discarded");
                    }
                }
                Ok(Line::Error(msg)) => {
                    warn!(client_id, "Client reported error: {}", msg);
                }
                Ok(other) => {
                    warn!(client_id, "Unexpected message from client: {:?}", other);
                }
                Err(e) => {
                    warn!(client_id, "Ignoring malformed line: {:#}", e);
                }
            }
        }
    }

    /// 利用者の TCP 接続をクライアントに転送する
    async fn route_command(
        self: Arc<Self>,
        conn: Conn,
        peer: SocketAddr,
        port: u16,
        routing_key: String,
        raw: String,
    ) -> Result<()> {
        let target = match self.registry.find_client_by_port(port).await {
            Some(record) => record,
            None => self.select_client(&routing_key).await?,
        };
        debug!(
            client_id = %target.id,
            routing_key = %routing_key,
            "Routing connection from {}",
            peer
        );

        let guard = ConnectionGuard::acquire(self.registry.clone(), &target.id).await?;
        let job = TcpProxyJob {
            router: self.clone(),
            client_id: target.id,
            preamble: raw,
            conn,
            guard,
        };
        self.dispatcher
            .submit(Box::new(job))
            .with_context(|| format!("Dropping connection from {}", peer))?;
        Ok(())
    }

    /// HTTP リクエストをクライアントに転送して応答を待つ
    pub async fn route_http(
        self: Arc<Self>,
        request: HttpRequestFrame,
    ) -> Result<HttpResponseFrame, BrokerError> {
        let path = request.path.clone();
        let target = self.select_client(&path).await?;
        let guard = ConnectionGuard::acquire(self.registry.clone(), &target.id).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = HttpProxyJob {
            router: self.clone(),
            client_id: target.id,
            request,
            reply: reply_tx,
            guard,
        };
        self.dispatcher.submit(Box::new(job))?;

        // キューで待っている時間も含めて応答タイムアウトを適用する
        let limit = self.responses.timeout();
        match timeout(limit, reply_rx).await {
            Ok(reply) => reply.map_err(|_| BrokerError::Cancelled)?,
            Err(_) => {
                warn!(path = %path, "No worker picked up the request in time");
                Err(BrokerError::Timeout(limit))
            }
        }
    }

    /// パスに一致するクライアントから、トンネルが接続済みのものを優先して選ぶ
    async fn select_client(&self, path: &str) -> Result<ClientRecord, BrokerError> {
        let candidates = self.registry.find_clients_for_path(path).await?;
        let sessions = self.sessions.read().await;
        let connected = candidates
            .iter()
            .position(|c| sessions.get(&c.id).map_or(false, Session::is_live))
            .unwrap_or(0);
        candidates
            .into_iter()
            .nth(connected)
            .ok_or_else(|| BrokerError::not_found(format!("no clients found for path: {}", path)))
    }

    async fn send(&self, client_id: &str, msg: Outbound) -> Result<(), BrokerError> {
        let tx = self
            .sessions
            .read()
            .await
            .get(client_id)
            .map(|s| s.tx.clone())
            .ok_or_else(|| {
                BrokerError::Connection(format!("tunnel for client {} is not connected", client_id))
            })?;
        tx.send(msg).await.map_err(|_| {
            BrokerError::Connection(format!("tunnel for client {} is closed", client_id))
        })
    }

    /// トンネル経由でフレームを送る
    pub async fn send_frame(&self, client_id: &str, frame: Frame) -> Result<(), BrokerError> {
        self.send(client_id, Outbound::Frame(frame)).await
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(client_id)
            .map_or(false, Session::is_live)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.values().filter(|s| s.is_live()).count()
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.pending()
    }

    /// 待機中の Job・トンネルを止める
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let responses = self.responses.cancel_all();
        let channels = self.data_channels.cancel_all();
        if responses + channels > 0 {
            info!(
                "Cancelled {} pending responses and {} data channels",
                responses, channels
            );
        }
    }

    /// シャットダウンで完了する future
    fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_tx.subscribe();
        async move {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_tunnel<W>(mut writer: W, mut rx: mpsc::Receiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Line(line) => write_line(&mut writer, line).await?,
            Outbound::Frame(frame) => frame.write_to(&mut writer).await?,
        }
    }
    // 新しいセッションに置き換えられた
    Ok(())
}

fn data_channel_key(client_id: &str, request_id: &str) -> String {
    format!("{}|{}", client_id, request_id)
}

pub fn new_request_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// クライアントの接続数を数える
///
/// `release` されずに drop された場合もカウンタを戻す。
struct ConnectionGuard {
    registry: Arc<Registry>,
    client_id: String,
    released: bool,
}

impl ConnectionGuard {
    async fn acquire(registry: Arc<Registry>, client_id: &str) -> Result<Self, BrokerError> {
        registry.increment_connections(client_id).await?;
        Ok(Self {
            registry,
            client_id: client_id.to_string(),
            released: false,
        })
    }

    async fn release(mut self) {
        self.released = true;
        // クライアントが削除済みなら何もしない
        let _ = self.registry.decrement_connections(&self.client_id).await;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            let client_id = std::mem::take(&mut self.client_id);
            handle.spawn(async move {
                let _ = registry.decrement_connections(&client_id).await;
            });
        }
    }
}

/// 利用者の TCP 接続をデータチャネル経由でクライアントにつなぐ
struct TcpProxyJob {
    router: Arc<Router>,
    client_id: String,
    preamble: String,
    conn: Conn,
    guard: ConnectionGuard,
}

impl TcpProxyJob {
    async fn proxy(router: &Router, client_id: &str, preamble: &str, conn: Conn) -> Result<()> {
        let request_id = new_request_id();
        let waiter = router
            .data_channels
            .register(data_channel_key(client_id, &request_id))?;

        router
            .send_frame(
                client_id,
                Frame::OpenDataChannel {
                    request_id: request_id.clone(),
                },
            )
            .await?;

        let mut data = waiter
            .wait(router.shutdown_signal())
            .await
            .with_context(|| format!("No data channel for request {}", request_id))?;

        // 最初の行をそのまま渡す
        data.write_all(format!("{}\n", preamble).as_bytes())
            .await
            .context("Failed to replay first line")?;

        tokio::select! {
            res = forward_traffic(conn, data) => res,
            _ = router.shutdown_signal() => Ok(()),
        }
    }
}

#[async_trait]
impl Job for TcpProxyJob {
    fn name(&self) -> &str {
        "tcp_proxy"
    }

    async fn execute(self: Box<Self>) -> Result<()> {
        let TcpProxyJob {
            router,
            client_id,
            preamble,
            conn,
            guard,
        } = *self;

        let result = Self::proxy(&router, &client_id, &preamble, conn).await;
        guard.release().await;
        result.with_context(|| format!("TCP proxy to client {} failed", client_id))
    }
}

/// HTTP リクエストをトンネルに送り、応答を呼び出し側に返す
struct HttpProxyJob {
    router: Arc<Router>,
    client_id: String,
    request: HttpRequestFrame,
    reply: oneshot::Sender<Result<HttpResponseFrame, BrokerError>>,
    guard: ConnectionGuard,
}

impl HttpProxyJob {
    async fn forward(
        router: &Router,
        client_id: &str,
        request: HttpRequestFrame,
    ) -> Result<HttpResponseFrame, BrokerError> {
        let waiter = router.responses.register(request.request_id.clone())?;
        router
            .send_frame(client_id, Frame::HttpRequest(request))
            .await?;
        waiter.wait(router.shutdown_signal()).await
    }
}

#[async_trait]
impl Job for HttpProxyJob {
    fn name(&self) -> &str {
        "http_proxy"
    }

    async fn execute(self: Box<Self>) -> Result<()> {
        let HttpProxyJob {
            router,
            client_id,
            request,
            mut reply,
            guard,
        } = *self;
        let request_id = request.request_id.clone();

        // キューで待つ間に呼び出し側がタイムアウトした
        if reply.is_closed() {
            guard.release().await;
            debug!(request_id = %request_id, client_id = %client_id, "Dropping abandoned request");
            return Ok(());
        }

        let result = tokio::select! {
            res = Self::forward(&router, &client_id, request) => res,
            // 呼び出し側が待つのをやめた
            _ = reply.closed() => Err(BrokerError::Cancelled),
        };
        guard.release().await;

        let failure = result.as_ref().err().map(|e| e.to_string());
        let _ = reply.send(result);
        match failure {
            None => Ok(()),
            Some(e) => anyhow::bail!("HTTP request {} to client {}: {}", request_id, client_id, e),
        }
    }
}

/// 双方向にコピーし、どちらかが閉じたら終了
async fn forward_traffic<A, B>(visitor: A, data: B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut visitor_read, mut visitor_write) = tokio::io::split(visitor);
    let (mut data_read, mut data_write) = tokio::io::split(data);

    let visitor_to_data = tokio::io::copy(&mut visitor_read, &mut data_write);
    let data_to_visitor = tokio::io::copy(&mut data_read, &mut visitor_write);

    tokio::select! {
        result = visitor_to_data => {
            match result {
                Ok(bytes) => debug!("Visitor -> Data: {} bytes", bytes),
                Err(e) => debug!("Visitor -> Data error: {}", e),
            }
        }
        result = data_to_visitor => {
            match result {
                Ok(bytes) => debug!("Data -> Visitor: {} bytes", bytes),
                Err(e) => debug!("Data -> Visitor error: {}", e),
            }
        }
    }

    Ok(())
}
