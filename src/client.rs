use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::protocol::{
    read_line, write_line, Frame, HttpRequestFrame, HttpResponseFrame, Line, HEARTBEAT,
};
use crate::registry::ClientKind;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Error)]
enum AgentError {
    /// 4xx: 再試行しても通らない
    #[error("registration rejected with status {status}: {body}")]
    RegistrationRejected { status: u16, body: String },

    #[error("broker rejected tunnel handshake: {0}")]
    HandshakeRejected(String),
}

/// ブローカーから割り当てられたトンネル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub client_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    client_id: String,
    port: u16,
}

/// トンネルクライアント
///
/// HTTP で登録し、割り当てられたポートにトンネル接続を張る。
#[derive(Clone)]
pub struct TunnelClient {
    config: Arc<ClientConfig>,
    server_url: Url,
    http: reqwest::Client,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.paths.iter().all(|p| p.trim().is_empty()) {
            anyhow::bail!("At least one path is required");
        }
        let server_url = server_url(&config.server)?;
        let http = reqwest::Client::builder()
            .timeout(LOCAL_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            server_url,
            http,
        })
    }

    fn tunnel_path(&self) -> &str {
        self.config
            .paths
            .iter()
            .map(String::as_str)
            .find(|p| !p.trim().is_empty())
            .unwrap_or("/")
    }

    /// `POST /register` でポートを割り当ててもらう
    pub async fn register(&self) -> Result<Assignment> {
        let url = self
            .server_url
            .join("register")
            .context("Failed to build registration URL")?;
        let protocol = match self.config.protocol {
            ClientKind::Http => "http",
            ClientKind::Tcp => "tcp",
        };
        let body = serde_json::json!({
            "client_id": self.config.client_id,
            "paths": self.config.paths,
            "protocol": protocol,
        });

        debug!("Registering with {}", url);
        let resp = self
            .http
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to send registration request to {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_client_error() {
                return Err(AgentError::RegistrationRejected {
                    status: status.as_u16(),
                    body,
                }
                .into());
            }
            anyhow::bail!("Registration failed with status {}: {}", status, body);
        }

        let reg: RegisterResponse = resp
            .json()
            .await
            .context("Failed to decode registration response")?;
        let host = self
            .server_url
            .host_str()
            .context("Server URL has no host")?
            .to_string();

        info!(client_id = %reg.client_id, "Registered, tunnel port {}", reg.port);
        Ok(Assignment {
            client_id: reg.client_id,
            host,
            port: reg.port,
        })
    }

    /// 登録できるまで再試行する
    pub async fn register_with_retry(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Assignment> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: None,
            ..Default::default()
        };
        let op = || async {
            self.register().await.map_err(|e| {
                if e.downcast_ref::<AgentError>().is_some() {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        };

        tokio::select! {
            res = backoff::future::retry_notify(backoff, op, |e, d| {
                warn!("Registration failed: {:#}, retrying in {:?}...", e, d);
            }) => res,
            _ = shutdown_rx.recv() => Err(anyhow::anyhow!("Shutdown requested")),
        }
    }

    /// トンネルを維持する (切れたら張り直す)
    ///
    /// ブローカーに忘れられていたら登録からやり直す。
    pub async fn run(
        &self,
        assignment: Option<Assignment>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut assignment = assignment;
        let mut backoff = ExponentialBackoff {
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            let current = match assignment.clone() {
                Some(a) => a,
                None => self.register_with_retry(shutdown_rx.resubscribe()).await?,
            };
            assignment = Some(current.clone());

            tokio::select! {
                result = self.run_session(&current, &mut backoff) => {
                    match result {
                        Ok(_) => {
                            info!("Tunnel closed by broker");
                        }
                        Err(e) => {
                            if e.downcast_ref::<AgentError>().is_some() {
                                assignment = None;
                            }
                            error!("Tunnel error: {:#}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Client shutdown requested");
                    return Ok(());
                }
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_secs(60));
            warn!("Reconnecting in {:?}...", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    info!("Client shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// 1 回分のトンネル接続
    async fn run_session(&self, assignment: &Assignment, backoff: &mut ExponentialBackoff) -> Result<()> {
        let addr = format!("{}:{}", assignment.host, assignment.port);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_line(
            &mut writer,
            &format!("{}|{}", assignment.client_id, self.tunnel_path()),
        )
        .await
        .context("Failed to send handshake")?;

        let reply = timeout(HANDSHAKE_TIMEOUT, read_line(&mut reader))
            .await
            .context("Timeout waiting for registration confirmation")??
            .context("Connection closed during handshake")?;
        match Line::parse(&reply)? {
            Line::Registered => {}
            Line::Error(msg) => return Err(AgentError::HandshakeRejected(msg).into()),
            other => anyhow::bail!("Unexpected handshake response: {:?}", other),
        }

        info!("Tunnel established! Remote port: {}", assignment.port);
        backoff.reset();

        let (tx, rx) = mpsc::channel::<Frame>(64);
        tokio::select! {
            res = self.read_control(reader, assignment, tx) => res,
            res = self.write_control(writer, rx) => res,
        }
    }

    /// ブローカーからの行を処理
    async fn read_control<R>(
        &self,
        mut reader: BufReader<R>,
        assignment: &Assignment,
        tx: mpsc::Sender<Frame>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let read_timeout = self.config.heartbeat_interval * 3;
        loop {
            let line = match timeout(read_timeout, read_line(&mut reader)).await {
                Ok(line) => line.context("Failed to read from tunnel")?,
                Err(_) => anyhow::bail!("Heartbeat timeout"),
            };
            let line = match line {
                Some(line) => line,
                None => return Ok(()),
            };

            match Line::parse(&line) {
                Ok(Line::HeartbeatAck) => debug!("Received heartbeat-ack"),
                Ok(Line::Frame(Frame::HttpRequest(req))) => {
                    let http = self.http.clone();
                    let local_addr = self.config.local_addr.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let resp = forward_http(&http, &local_addr, req).await;
                        if tx.send(Frame::HttpResponse(resp)).await.is_err() {
                            debug!("Tunnel closed before response was sent");
                        }
                    });
                }
                Ok(Line::Frame(Frame::OpenDataChannel { request_id })) => {
                    debug!(request_id = %request_id, "Received open_data_channel request");
                    let tunnel_addr = format!("{}:{}", assignment.host, assignment.port);
                    let local_addr = self.config.local_addr.clone();
                    let client_id = assignment.client_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            create_data_channel(tunnel_addr, local_addr, client_id, request_id).await
                        {
                            error!("Data channel error: {:#}", e);
                        }
                    });
                }
                Ok(Line::Error(msg)) => {
                    return Err(AgentError::HandshakeRejected(msg).into());
                }
                Ok(other) => warn!("Unexpected message: {:?}", other),
                Err(e) => warn!("Ignoring malformed line: {:#}", e),
            }
        }
    }

    /// ハートビートと応答フレームを送る
    async fn write_control(
        &self,
        mut writer: tokio::net::tcp::OwnedWriteHalf,
        mut rx: mpsc::Receiver<Frame>,
    ) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    debug!("Sending heartbeat");
                    write_line(&mut writer, HEARTBEAT)
                        .await
                        .context("Failed to send heartbeat")?;
                }
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => frame.write_to(&mut writer).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// `host:port` または URL を登録先の URL にする
fn server_url(server: &str) -> Result<Url> {
    let raw = if server.contains("://") {
        server.to_string()
    } else {
        format!("http://{}", server)
    };
    let mut url = Url::parse(&raw).with_context(|| format!("Invalid server address {}", server))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// ローカルの HTTP サービスにリクエストを送る
///
/// 失敗しても 502 の応答を返す。
async fn forward_http(
    http: &reqwest::Client,
    local_addr: &str,
    req: HttpRequestFrame,
) -> HttpResponseFrame {
    let request_id = req.request_id.clone();
    match call_local(http, local_addr, req).await {
        Ok(mut resp) => {
            resp.request_id = request_id;
            resp
        }
        Err(e) => {
            warn!(request_id = %request_id, "Local service error: {:#}", e);
            HttpResponseFrame {
                request_id,
                status: 502,
                headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
                body: format!("local service error: {:#}", e).into(),
            }
        }
    }
}

async fn call_local(
    http: &reqwest::Client,
    local_addr: &str,
    req: HttpRequestFrame,
) -> Result<HttpResponseFrame> {
    let mut url = format!("http://{}{}", local_addr, req.path);
    if let Some(query) = req.query.as_deref().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    let method = reqwest::Method::from_bytes(req.method.as_bytes())
        .with_context(|| format!("Invalid method {}", req.method))?;

    let mut builder = http.request(method, &url);
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    let resp = builder
        .body(req.body)
        .send()
        .await
        .with_context(|| format!("Failed to call {}", url))?;

    let status = resp.status().as_u16();
    let headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let body = resp.bytes().await.context("Failed to read local response")?;

    Ok(HttpResponseFrame {
        request_id: req.request_id,
        status,
        headers,
        body,
    })
}

/// データチャネルを作成
async fn create_data_channel(
    tunnel_addr: String,
    local_addr: String,
    client_id: String,
    request_id: String,
) -> Result<()> {
    // ローカルサービスに接続
    let local_stream = TcpStream::connect(&local_addr)
        .await
        .with_context(|| format!("Failed to connect to local service at {}", local_addr))?;

    // サーバーに接続
    let mut server_stream = TcpStream::connect(&tunnel_addr)
        .await
        .with_context(|| format!("Failed to connect to server at {}", tunnel_addr))?;
    write_line(
        &mut server_stream,
        &format!("{}|data|{}", client_id, request_id),
    )
    .await?;

    debug!("Data channel established, starting bidirectional copy");

    let (mut server_read, mut server_write) = tokio::io::split(server_stream);
    let (mut local_read, mut local_write) = tokio::io::split(local_stream);

    let client_to_server = tokio::io::copy(&mut local_read, &mut server_write);
    let server_to_client = tokio::io::copy(&mut server_read, &mut local_write);

    tokio::select! {
        result = client_to_server => {
            match result {
                Ok(bytes) => debug!("Client -> Server: {} bytes", bytes),
                Err(e) => debug!("Client -> Server error: {}", e),
            }
        }
        result = server_to_client => {
            match result {
                Ok(bytes) => debug!("Server -> Client: {} bytes", bytes),
                Err(e) => debug!("Server -> Client error: {}", e),
            }
        }
    }

    debug!("Data channel closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use bytes::Bytes;

    #[test]
    fn test_server_url() {
        assert_eq!(
            server_url("broker.local:8080").unwrap().as_str(),
            "http://broker.local:8080/"
        );
        assert_eq!(
            server_url("https://broker.local/api").unwrap().join("register").unwrap().as_str(),
            "https://broker.local/api/register"
        );
    }

    #[test]
    fn test_requires_path() {
        let config = ClientConfig {
            paths: vec!["".into()],
            ..Default::default()
        };
        assert!(TunnelClient::new(config).is_err());
    }

    fn request(path: &str, query: Option<&str>) -> HttpRequestFrame {
        HttpRequestFrame {
            request_id: "r1".into(),
            method: "GET".into(),
            path: path.into(),
            query: query.map(str::to_string),
            headers: HashMap::from([("host".to_string(), "public.example".to_string())]),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn test_forward_http_to_local_service() {
        let app = axum::Router::new().route(
            "/hello",
            get(|q: axum::extract::RawQuery| async move {
                format!("hello {}", q.0.unwrap_or_default())
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let http = reqwest::Client::new();
        let resp = forward_http(&http, &addr.to_string(), request("/hello", Some("name=x"))).await;
        assert_eq!(resp.request_id, "r1");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Bytes::from("hello name=x"));
    }

    #[tokio::test]
    async fn test_forward_http_local_service_down() {
        // 空いているポートを取ってすぐ閉じる
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let http = reqwest::Client::new();
        let resp = forward_http(&http, &addr.to_string(), request("/", None)).await;
        assert_eq!(resp.status, 502);
        assert_eq!(resp.request_id, "r1");
    }
}
