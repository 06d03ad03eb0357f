use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::actions::Action;
use crate::error::Error;
use crate::offline::TransferDirection;

/// 每个订阅者自己的队列容量。
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    sender: mpsc::Sender<T>,
    filter: Option<Filter<T>>,
}

/// 单一事件类别的发布/订阅通道。
///
/// 订阅者只会收到订阅之后发布的事件；队列满时丢弃该订阅者的新事件，发布方从不阻塞。
pub struct Channel<T> {
    name: &'static str,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T: Clone + Send + 'static> Channel<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        self.attach(None)
    }

    /// 订阅时给定过滤条件，只投递满足条件的事件。
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Subscription<T> {
        self.attach(Some(Box::new(filter)))
    }

    /// 订阅并预先放入一批当前状态快照，之后再接收新事件。
    pub fn subscribe_with_replay(&self, snapshot: Vec<T>) -> Subscription<T> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY.max(snapshot.len()));
        for event in snapshot {
            if sender.try_send(event).is_err() {
                break;
            }
        }
        self.lock().push(Subscriber {
            sender,
            filter: None,
        });
        Subscription { receiver }
    }

    fn attach(&self, filter: Option<Filter<T>>) -> Subscription<T> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.lock().push(Subscriber { sender, filter });
        Subscription { receiver }
    }

    /// 投递给所有匹配的订阅者，返回成功入队的数量。已关闭的订阅在此顺带清理。
    pub fn publish(&self, event: T) -> usize {
        let mut delivered = 0;
        self.lock().retain(|subscriber| {
            if subscriber.sender.is_closed() {
                return false;
            }
            if let Some(filter) = &subscriber.filter {
                if !filter(&event) {
                    return true;
                }
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(channel = self.name, "subscriber queue full, dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        debug!(channel = self.name, delivered, "published event");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber<T>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// 订阅句柄。丢弃或调用 `close` 后不再接收事件。
pub struct Subscription<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// 一次取出队列中已有的全部事件。
    pub fn drain(&mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

/// 传输进度快照。
#[derive(Clone, Debug, PartialEq)]
pub struct TransferProgress {
    pub entry_id: String,
    pub direction: TransferDirection,
    pub bytes_transferred: u64,
    pub expected_size: Option<u64>,
    pub speed_bps: Option<f64>,
    pub timestamp_millis: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransferEvent {
    Queued {
        entry_id: String,
        direction: TransferDirection,
    },
    Started {
        entry_id: String,
        direction: TransferDirection,
    },
    Progress(TransferProgress),
    Completed {
        entry_id: String,
        direction: TransferDirection,
        bytes: u64,
    },
    Retrying {
        entry_id: String,
        retry_count: u32,
        delay: Duration,
    },
    Failed {
        entry_id: String,
        error: Error,
        /// 重试预算已用尽或错误不可重试，需要提示用户。
        terminal: bool,
    },
    Cancelled {
        entry_id: String,
    },
    /// 总传输大小，每次从存储重新计算后发布。
    TotalSize {
        direction: TransferDirection,
        bytes: u64,
    },
}

impl TransferEvent {
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            TransferEvent::Queued { entry_id, .. }
            | TransferEvent::Started { entry_id, .. }
            | TransferEvent::Completed { entry_id, .. }
            | TransferEvent::Retrying { entry_id, .. }
            | TransferEvent::Failed { entry_id, .. }
            | TransferEvent::Cancelled { entry_id } => Some(entry_id),
            TransferEvent::Progress(progress) => Some(&progress.entry_id),
            TransferEvent::TotalSize { .. } => None,
        }
    }
}

/// 进程内事件总线：每个事件类别一条独立的类型化通道。
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusChannels>,
}

struct BusChannels {
    actions: Channel<Action>,
    transfers: Channel<TransferEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusChannels {
                actions: Channel::new("actions"),
                transfers: Channel::new("transfers"),
            }),
        }
    }

    /// 已完成的动作，携带更新后的目标条目。
    pub fn actions(&self) -> &Channel<Action> {
        &self.inner.actions
    }

    pub fn transfers(&self) -> &Channel<TransferEvent> {
        &self.inner.transfers
    }
}
