use thiserror::Error;

/// ブローカーのコアが返すエラー
///
/// 接続単位の失敗はここで止め、プロセス全体には伝播させない。
#[derive(Debug, Error)]
pub enum BrokerError {
    /// 呼び出し側の入力不備 (パス・ID・プロトコルの欠落など)
    #[error("validation error: {0}")]
    Validation(String),

    /// リクエストボディが上限を超えた
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// ポートインベントリが上限に達している
    #[error("port inventory is full (max {max} ports)")]
    PortExhausted { max: usize },

    /// 探索範囲内にバインド可能なポートがない
    #[error("could not find available port after {attempts} attempts from {start}")]
    PortUnavailable { start: u16, attempts: u32 },

    /// 未知のクライアント、またはパスに一致するクライアントがない
    #[error("not found: {0}")]
    NotFound(String),

    /// ジョブキューが満杯、またはディスパッチャ停止済み
    #[error("job rejected: {0}")]
    Rejected(String),

    /// 相関ウィンドウ内に応答が来なかった
    #[error("timed out after {0:?} waiting for response")]
    Timeout(std::time::Duration),

    /// 待機が呼び出し側またはシャットダウンにより取り消された
    #[error("request cancelled")]
    Cancelled,

    /// トンネルまたはクライアントソケットの I/O 失敗
    #[error("connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// HTTP フロントに返すステータスコード
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::Validation(_) => 400,
            BrokerError::PayloadTooLarge { .. } => 413,
            BrokerError::NotFound(_) => 404,
            BrokerError::PortExhausted { .. }
            | BrokerError::PortUnavailable { .. }
            | BrokerError::Rejected(_)
            | BrokerError::Cancelled => 503,
            BrokerError::Timeout(_) => 504,
            BrokerError::Connection(_) => 502,
            BrokerError::Io(_) => 500,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        BrokerError::NotFound(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        BrokerError::Validation(what.into())
    }
}
