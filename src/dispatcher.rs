use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;

/// ワーカーが実行する仕事の単位
#[async_trait]
pub trait Job: Send + 'static {
    /// ログ用の名前
    fn name(&self) -> &str {
        "job"
    }

    async fn execute(self: Box<Self>) -> anyhow::Result<()>;
}

type BoxedJob = Box<dyn Job>;
/// 空いているワーカーがプールに置く受け口
type Slot = oneshot::Sender<BoxedJob>;

/// 固定数のワーカーで Job を実行する
///
/// キューは上限付きで、満杯なら `submit` は待たずに `Rejected` を返す。
pub struct Dispatcher {
    max_workers: usize,
    queue_size: usize,
    job_tx: Mutex<Option<mpsc::Sender<BoxedJob>>>,
    job_rx: Mutex<Option<mpsc::Receiver<BoxedJob>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(max_workers: usize, queue_size: usize) -> Self {
        let max_workers = max_workers.max(1);
        let queue_size = queue_size.max(1);
        let (job_tx, job_rx) = mpsc::channel(queue_size);

        Self {
            max_workers,
            queue_size,
            job_tx: Mutex::new(Some(job_tx)),
            job_rx: Mutex::new(Some(job_rx)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            running: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// ワーカーとディスパッチループを起動
    pub async fn start(&self) {
        let job_rx = match self
            .job_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(rx) => rx,
            None => {
                warn!("Dispatcher already started");
                return;
            }
        };

        let (pool_tx, pool_rx) = mpsc::channel::<Slot>(self.max_workers);
        let mut tasks = self.tasks.lock().await;

        for id in 0..self.max_workers {
            tasks.push(tokio::spawn(worker(id, pool_tx.clone(), self.running.clone())));
        }
        tasks.push(tokio::spawn(dispatch(job_rx, pool_rx, self.queued.clone())));

        info!(
            "Started dispatcher with {} workers and queue size {}",
            self.max_workers, self.queue_size
        );
    }

    /// Job をキューに入れる (ブロックしない)
    pub fn submit(&self, job: BoxedJob) -> Result<(), BrokerError> {
        let guard = self.job_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard
            .as_ref()
            .ok_or_else(|| BrokerError::Rejected("dispatcher is stopped".into()))?;

        // ディスパッチループより先に数える
        self.queued.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                warn!(job = job.name(), "Job queue is full, rejecting job");
                Err(BrokerError::Rejected("job queue is full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Err(BrokerError::Rejected("dispatcher is stopped".into()))
            }
        }
    }

    /// 新しい Job を受け付けなくし、キューと実行中の Job が終わるまで待つ
    pub async fn stop(&self) {
        let tx = self
            .job_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        // start されていなければキューの Job は実行されずに捨てられる
        let unstarted = self
            .job_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = unstarted {
            drop(rx);
            self.queued.store(0, Ordering::SeqCst);
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        info!("Stopping dispatcher, waiting for {} tasks", tasks.len());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Dispatcher task failed: {}", e);
            }
        }
        info!("Dispatcher stopped");
    }

    pub fn workers(&self) -> usize {
        self.max_workers
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// 実行中の Job 数
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// キューで待っている Job 数
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

/// キューから Job を取り出し、空いているワーカーに渡す
async fn dispatch(
    mut job_rx: mpsc::Receiver<BoxedJob>,
    mut pool_rx: mpsc::Receiver<Slot>,
    queued: Arc<AtomicUsize>,
) {
    while let Some(mut job) = job_rx.recv().await {
        loop {
            let slot = match pool_rx.recv().await {
                Some(slot) => slot,
                None => {
                    error!(job = job.name(), "No workers left, dropping job");
                    queued.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };
            match slot.send(job) {
                Ok(()) => {
                    queued.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
                // ワーカーが終了していたら次を待つ
                Err(returned) => job = returned,
            }
        }
    }
    debug!("Dispatch loop exited");
    // pool_rx を落とすと待機中のワーカーが終了する
}

async fn worker(id: usize, pool_tx: mpsc::Sender<Slot>, running: Arc<AtomicUsize>) {
    loop {
        let (slot_tx, slot_rx) = oneshot::channel();
        if pool_tx.send(slot_tx).await.is_err() {
            break;
        }
        let job = match slot_rx.await {
            Ok(job) => job,
            Err(_) => break,
        };

        let name = job.name().to_string();
        running.fetch_add(1, Ordering::SeqCst);
        debug!(worker = id, job = %name, "Executing job");
        if let Err(e) = job.execute().await {
            error!(worker = id, job = %name, "Job failed: {:#}", e);
        }
        running.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(worker = id, "Worker exited");
}
