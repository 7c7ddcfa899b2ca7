use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::BrokerError;

type Table<T> = HashMap<String, (u64, oneshot::Sender<T>)>;

/// リクエスト ID で非同期の応答を待ち合わせる
///
/// 1 つの ID に待機者は高々 1 つ。配送・タイムアウト・キャンセル・drop の
/// いずれかでエントリは消える。
pub struct Correlator<T> {
    pending: Arc<Mutex<Table<T>>>,
    timeout: Duration,
    next_generation: AtomicU64,
}

impl<T: Send + 'static> Correlator<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            next_generation: AtomicU64::new(0),
        }
    }

    /// 待機者を登録。同じ ID が待機中ならエラー
    pub fn register(&self, request_id: impl Into<String>) -> Result<Waiter<T>, BrokerError> {
        let request_id = request_id.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut table = lock(&self.pending);
        if table.contains_key(&request_id) {
            return Err(BrokerError::validation(format!(
                "request {} is already waiting for a response",
                request_id
            )));
        }
        table.insert(request_id.clone(), (generation, tx));

        Ok(Waiter {
            request_id,
            generation,
            rx,
            pending: self.pending.clone(),
            timeout: self.timeout,
        })
    }

    /// 応答を待機者に渡す。待機者がいなければ捨てる
    pub fn deliver(&self, request_id: &str, value: T) -> Result<(), BrokerError> {
        let entry = lock(&self.pending).remove(request_id);
        match entry {
            Some((_, tx)) => tx.send(value).map_err(|_| {
                BrokerError::not_found(format!("waiter for request {} is gone", request_id))
            }),
            None => {
                debug!(request_id, "No waiter for response, discarding");
                Err(BrokerError::not_found(format!(
                    "no pending request {}",
                    request_id
                )))
            }
        }
    }

    /// すべての待機をキャンセル (シャットダウン時)
    pub fn cancel_all(&self) -> usize {
        let mut table = lock(&self.pending);
        let n = table.len();
        table.clear();
        n
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn lock<T>(table: &Mutex<Table<T>>) -> MutexGuard<'_, Table<T>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 1 つのリクエストに対する待機
pub struct Waiter<T> {
    request_id: String,
    generation: u64,
    rx: oneshot::Receiver<T>,
    pending: Arc<Mutex<Table<T>>>,
    timeout: Duration,
}

impl<T> Waiter<T> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// 応答・キャンセル・タイムアウトのどれかまで待つ
    pub async fn wait<F>(mut self, cancel: F) -> Result<T, BrokerError>
    where
        F: Future<Output = ()>,
    {
        let timeout = self.timeout;
        tokio::select! {
            res = &mut self.rx => res.map_err(|_| BrokerError::Cancelled),
            _ = cancel => {
                debug!(request_id = %self.request_id, "Wait cancelled");
                Err(BrokerError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                debug!(request_id = %self.request_id, "Timed out waiting for response");
                Err(BrokerError::Timeout(timeout))
            }
        }
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        // 同じ ID で再登録されたエントリは消さない
        if matches!(table.get(&self.request_id), Some((g, _)) if *g == self.generation) {
            table.remove(&self.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[tokio::test]
    async fn test_deliver_resolves_waiter() {
        let correlator = Arc::new(Correlator::<String>::new(Duration::from_secs(5)));
        let waiter = correlator.register("r1").unwrap();
        assert_eq!(correlator.pending(), 1);

        let c = correlator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c.deliver("r1", "pong".to_string()).unwrap();
        });

        assert_eq!(waiter.wait(pending()).await.unwrap(), "pong");
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_deliver_before_wait() {
        let correlator = Correlator::<u32>::new(Duration::from_secs(5));
        let waiter = correlator.register("r1").unwrap();
        correlator.deliver("r1", 7).unwrap();
        assert_eq!(waiter.wait(pending()).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_timeout_then_late_delivery_is_noop() {
        let correlator = Correlator::<u32>::new(Duration::from_millis(20));
        let waiter = correlator.register("slow").unwrap();

        let err = waiter.wait(pending()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
        assert_eq!(correlator.pending(), 0);

        assert!(matches!(
            correlator.deliver("slow", 1),
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_request_id() {
        let correlator = Correlator::<u32>::new(Duration::from_secs(5));
        let _waiter = correlator.register("dup").unwrap();
        assert!(matches!(
            correlator.register("dup"),
            Err(BrokerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_removes_entry() {
        let correlator = Correlator::<u32>::new(Duration::from_secs(5));
        let waiter = correlator.register("c1").unwrap();

        let err = waiter
            .wait(tokio::time::sleep(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled));
        assert_eq!(correlator.pending(), 0);
        assert!(correlator.deliver("c1", 1).is_err());
    }

    #[tokio::test]
    async fn test_drop_and_reregister() {
        let correlator = Correlator::<u32>::new(Duration::from_secs(5));
        let first = correlator.register("id").unwrap();
        correlator.deliver("id", 1).unwrap();

        // 配送済みの ID は再登録できる
        let second = correlator.register("id").unwrap();
        drop(first);
        assert_eq!(correlator.pending(), 1);

        drop(second);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let correlator = Correlator::<u32>::new(Duration::from_secs(5));
        let a = correlator.register("a").unwrap();
        let b = correlator.register("b").unwrap();

        assert_eq!(correlator.cancel_all(), 2);
        assert!(matches!(a.wait(pending()).await, Err(BrokerError::Cancelled)));
        assert!(matches!(b.wait(pending()).await, Err(BrokerError::Cancelled)));
    }
}
