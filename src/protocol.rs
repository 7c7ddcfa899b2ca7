use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 1 行の最大長 (DoS対策)
pub const MAX_LINE_LEN: usize = 1024 * 1024;

pub const REGISTERED: &str = "registered";
pub const HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_ACK: &str = "heartbeat-ack";

/// プロキシ対象の HTTP リクエスト
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HttpRequestFrame {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Bytes,
}

/// クライアントからの HTTP レスポンス
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HttpResponseFrame {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Bytes,
}

/// トンネル上の JSON フレーム (1 行 1 オブジェクト)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// ブローカー → クライアント: HTTP リクエストを処理して
    HttpRequest(HttpRequestFrame),

    /// クライアント → ブローカー: HTTP リクエストへの応答
    HttpResponse(HttpResponseFrame),

    /// ブローカー → クライアント: データチャネルを作成して
    OpenDataChannel { request_id: String },
}

/// 接続の最初の行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    /// `clientID|path`: クライアント自身のトンネル接続
    Tunnel { client_id: String, path: String },
    /// `clientID|data|requestID`: TCP プロキシ用のデータチャネル
    DataChannel { client_id: String, request_id: String },
    /// それ以外: 先頭の単語をルーティングキーとして使う
    Command { routing_key: String, raw: String },
}

impl Preamble {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let first = line.split_whitespace().next().unwrap_or("");

        // ハンドシェイクかどうかは先頭のトークンだけで判断する
        if first.contains('|') {
            let parts: Vec<&str> = first.split('|').collect();
            return match parts.as_slice() {
                [client_id, "data", request_id]
                    if !client_id.is_empty() && !request_id.is_empty() =>
                {
                    Ok(Preamble::DataChannel {
                        client_id: client_id.to_string(),
                        request_id: request_id.to_string(),
                    })
                }
                [client_id, path] if !client_id.is_empty() && !path.is_empty() => {
                    Ok(Preamble::Tunnel {
                        client_id: client_id.to_string(),
                        path: path.to_string(),
                    })
                }
                _ => anyhow::bail!(
                    "Invalid handshake, expected 'clientID|path', got: {}",
                    line
                ),
            };
        }

        Ok(Preamble::Command {
            routing_key: extract_routing_key(line),
            raw: line.to_string(),
        })
    }
}

/// 先頭の単語を小文字にしてルーティングキーにする
pub fn extract_routing_key(request: &str) -> String {
    request
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase()
}

/// トンネルから読み込んだ 1 行
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Heartbeat,
    HeartbeatAck,
    Registered,
    Frame(Frame),
    Error(String),
}

impl Line {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        match line {
            HEARTBEAT => Ok(Line::Heartbeat),
            HEARTBEAT_ACK => Ok(Line::HeartbeatAck),
            REGISTERED => Ok(Line::Registered),
            _ if line.starts_with("error") => {
                Ok(Line::Error(line.trim_start_matches("error").trim().to_string()))
            }
            _ => {
                let frame = serde_json::from_str(line)
                    .with_context(|| format!("Failed to deserialize frame: {}", line))?;
                Ok(Line::Frame(frame))
            }
        }
    }
}

impl Frame {
    /// フレームを 1 行の JSON として送信
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut json = serde_json::to_vec(self)
            .with_context(|| format!("Failed to serialize frame: {:?}", self))?;
        if json.len() > MAX_LINE_LEN {
            anyhow::bail!("Frame too large: {} bytes", json.len());
        }
        json.push(b'\n');

        writer
            .write_all(&json)
            .await
            .with_context(|| "Failed to write frame")?;
        writer.flush().await?;

        Ok(())
    }
}

/// テキスト行を送信 (`registered`, `heartbeat` など)
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .with_context(|| format!("Failed to write '{}'", line))?;
    writer.flush().await?;
    Ok(())
}

/// 1 行読み込む。EOF なら `None`
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await
        .with_context(|| "Failed to read line")?;

    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_LINE_LEN {
        anyhow::bail!("Line too large: more than {} bytes", MAX_LINE_LEN);
    }

    let line =
        String::from_utf8(buf).with_context(|| "Failed to convert line to UTF-8")?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_preamble() {
        assert_eq!(
            Preamble::parse("abc123|/demo\n").unwrap(),
            Preamble::Tunnel {
                client_id: "abc123".into(),
                path: "/demo".into()
            }
        );
        assert_eq!(
            Preamble::parse("abc123|data|req-1").unwrap(),
            Preamble::DataChannel {
                client_id: "abc123".into(),
                request_id: "req-1".into()
            }
        );
        assert_eq!(
            Preamble::parse("GET /demo/x HTTP/1.1").unwrap(),
            Preamble::Command {
                routing_key: "get".into(),
                raw: "GET /demo/x HTTP/1.1".into()
            }
        );
    }

    #[test]
    fn test_parse_command_with_pipe_later() {
        assert_eq!(
            Preamble::parse("SET key a|b\n").unwrap(),
            Preamble::Command {
                routing_key: "set".into(),
                raw: "SET key a|b".into()
            }
        );
        assert_eq!(
            Preamble::parse("GET /q?x=a|b HTTP/1.1").unwrap(),
            Preamble::Command {
                routing_key: "get".into(),
                raw: "GET /q?x=a|b HTTP/1.1".into()
            }
        );
    }

    #[test]
    fn test_parse_invalid_handshake() {
        assert!(Preamble::parse("|/demo").is_err());
        assert!(Preamble::parse("abc|").is_err());
        assert!(Preamble::parse("a|b|c|d").is_err());
    }

    #[test]
    fn test_json_format() {
        // 外部クライアントが読めるフォーマットか確認
        let frame = Frame::OpenDataChannel {
            request_id: "r1".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "open_data_channel");
        assert_eq!(json["request_id"], "r1");

        let line = r#"{"type":"http_response","request_id":"r2","status":201}"#;
        match Line::parse(line).unwrap() {
            Line::Frame(Frame::HttpResponse(resp)) => {
                assert_eq!(resp.request_id, "r2");
                assert_eq!(resp.status, 201);
                assert!(resp.body.is_empty());
            }
            other => panic!("unexpected line: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lines_over_stream() {
        let mut buf = Vec::new();
        write_line(&mut buf, HEARTBEAT).await.unwrap();
        Frame::OpenDataChannel {
            request_id: "r1".into(),
        }
        .write_to(&mut buf)
        .await
        .unwrap();

        let mut reader = BufReader::new(std::io::Cursor::new(buf));
        let first = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(Line::parse(&first).unwrap(), Line::Heartbeat);

        let second = read_line(&mut reader).await.unwrap().unwrap();
        assert!(matches!(
            Line::parse(&second).unwrap(),
            Line::Frame(Frame::OpenDataChannel { .. })
        ));

        assert!(read_line(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_error_line() {
        assert_eq!(
            Line::parse("error unknown client").unwrap(),
            Line::Error("unknown client".into())
        );
    }
}
