use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ConsumerConfig;
use crate::conn::{ConnHandle, Connection};
use crate::lookup::query_lookupd;
use crate::message::Message;
use crate::protocol::is_valid_name;
use crate::{HandlerError, NsqError};

// ═══════════════════════════════════════════════════════════════
//  Handler
// ═══════════════════════════════════════════════════════════════

/// Обработчик доставленных сообщений. Вызывается из нескольких
/// воркеров одновременно, на blocking пуле tokio.
///
/// `Ok`: FIN, `Err`: REQ с задержкой по числу попыток.
pub trait Handler: Send + Sync + 'static {
    fn handle_message(&self, message: &Message) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle_message(&self, message: &Message) -> Result<(), HandlerError> {
        self(message)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Stats
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub connections: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    finished: AtomicU64,
    requeued: AtomicU64,
}

// ═══════════════════════════════════════════════════════════════
//  Consumer
// ═══════════════════════════════════════════════════════════════

/// Подписчик на topic/channel. Держит соединения с nsqd (напрямую
/// или найденные через lookupd) и пул воркеров обработчика.
///
/// Все соединения пишут в один bounded канал ёмкостью `max_in_flight`,
/// воркеры разбирают его конкурентно. Порядок между соединениями
/// не гарантируется.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

struct Inner {
    topic: String,
    channel: String,
    cfg: Arc<ConsumerConfig>,
    http: reqwest::Client,

    /// Отправитель в канал воркеров; забирается при stop().
    incoming: Mutex<Option<mpsc::Sender<Message>>>,
    incoming_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    handlers: AtomicUsize,

    conns: Mutex<HashMap<String, ConnHandle>>,
    /// nsqd, заданные напрямую: переподключаемся при обрыве.
    direct: Mutex<HashSet<String>>,
    lookupds: Mutex<Vec<String>>,

    counters: Counters,
    tracker: TaskTracker,
    /// Запрошена остановка.
    stopping: CancellationToken,
    /// Все соединения и воркеры завершены.
    stopped: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Consumer {
    pub fn new(topic: &str, channel: &str, cfg: ConsumerConfig) -> Result<Self, NsqError> {
        if !is_valid_name(topic) {
            return Err(NsqError::InvalidName { kind: "topic", name: topic.to_string() });
        }
        if !is_valid_name(channel) {
            return Err(NsqError::InvalidName { kind: "channel", name: channel.to_string() });
        }
        cfg.validate()?;

        let http = reqwest::Client::builder()
            .connect_timeout(cfg.dial_timeout)
            .timeout(cfg.read_timeout)
            .user_agent(cfg.user_agent.clone())
            .build()?;

        let capacity = usize::try_from(cfg.max_in_flight).unwrap_or(usize::MAX).min(1 << 16);
        let (tx, rx) = mpsc::channel(capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                topic: topic.to_string(),
                channel: channel.to_string(),
                cfg: Arc::new(cfg),
                http,
                incoming: Mutex::new(Some(tx)),
                incoming_rx: Arc::new(tokio::sync::Mutex::new(rx)),
                handlers: AtomicUsize::new(0),
                conns: Mutex::new(HashMap::new()),
                direct: Mutex::new(HashSet::new()),
                lookupds: Mutex::new(Vec::new()),
                counters: Counters::default(),
                tracker: TaskTracker::new(),
                stopping: CancellationToken::new(),
                stopped: CancellationToken::new(),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn add_handler<H: Handler>(&self, handler: H) {
        self.add_concurrent_handlers(handler, 1);
    }

    /// Запустить `concurrency` воркеров, разделяющих один обработчик.
    pub fn add_concurrent_handlers<H: Handler>(&self, handler: H, concurrency: usize) {
        let handler = Arc::new(handler);
        for worker in 0..concurrency.max(1) {
            self.inner.handlers.fetch_add(1, Ordering::AcqRel);
            let inner = self.inner.clone();
            let handler = handler.clone();
            self.inner.tracker.spawn(async move {
                handler_loop(worker, inner, handler).await;
            });
        }
    }

    pub async fn connect_to_nsqds(&self, addrs: &[String]) -> Result<(), NsqError> {
        for addr in addrs {
            self.connect_to_nsqd(addr).await?;
        }
        Ok(())
    }

    /// Подключиться к nsqd напрямую. При обрыве соединение
    /// восстанавливается каждые `reconnect_interval`.
    pub async fn connect_to_nsqd(&self, addr: &str) -> Result<(), NsqError> {
        self.inner.ensure_ready()?;
        self.inner.connect_nsqd(addr).await?;
        lock(&self.inner.direct).insert(addr.to_string());
        Ok(())
    }

    pub async fn connect_to_lookupds(&self, addrs: &[String]) -> Result<(), NsqError> {
        for addr in addrs {
            self.connect_to_lookupd(addr).await?;
        }
        Ok(())
    }

    /// Добавить lookupd: сразу запросить producers и подключиться к ним,
    /// дальше опрашивать каждые `lookupd_poll_interval`.
    ///
    /// Ошибка первого запроса к lookupd возвращается; ошибки
    /// подключения к отдельным producers только логируются.
    pub async fn connect_to_lookupd(&self, addr: &str) -> Result<(), NsqError> {
        self.inner.ensure_ready()?;
        let first = {
            let mut lookupds = lock(&self.inner.lookupds);
            if lookupds.iter().any(|a| a == addr) {
                return Ok(());
            }
            lookupds.push(addr.to_string());
            lookupds.len() == 1
        };

        let producers = match query_lookupd(&self.inner.http, addr, &self.inner.topic).await {
            Ok(p) => p,
            Err(e) => {
                lock(&self.inner.lookupds).retain(|a| a != addr);
                return Err(e);
            }
        };
        tracing::info!(lookupd = %addr, producers = producers.len(), "lookupd queried");
        self.inner.connect_producers(producers).await;

        if first {
            let inner = self.inner.clone();
            self.inner.tracker.spawn(async move { lookupd_loop(inner).await });
        }
        Ok(())
    }

    /// Запросить мягкую остановку: CLS во все соединения, воркеры
    /// дорабатывают уже полученные сообщения. Повторный вызов: no-op.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return;
        }
        tracing::info!(topic = %inner.topic, channel = %inner.channel, "stopping consumer");
        inner.stopping.cancel();
        lock(&inner.incoming).take();
        for conn in lock(&inner.conns).values() {
            conn.close();
        }

        inner.tracker.close();
        let tracker = inner.tracker.clone();
        let stopped = inner.stopped.clone();
        tokio::spawn(async move {
            tracker.wait().await;
            stopped.cancel();
        });
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.is_cancelled()
    }

    /// Завершается, когда после stop() закрыты все соединения и воркеры.
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    pub fn stats(&self) -> ConsumerStats {
        let c = &self.inner.counters;
        ConsumerStats {
            messages_received: c.received.load(Ordering::Relaxed),
            messages_finished: c.finished.load(Ordering::Relaxed),
            messages_requeued: c.requeued.load(Ordering::Relaxed),
            connections: lock(&self.inner.conns).len(),
        }
    }
}

impl Inner {
    fn ensure_ready(&self) -> Result<(), NsqError> {
        if self.stopping.is_cancelled() {
            return Err(NsqError::Stopping);
        }
        if self.handlers.load(Ordering::Acquire) == 0 {
            return Err(NsqError::NoHandlers);
        }
        Ok(())
    }

    async fn connect_nsqd(self: &Arc<Self>, addr: &str) -> Result<(), NsqError> {
        if lock(&self.conns).contains_key(addr) {
            return Err(NsqError::AlreadyConnected(addr.to_string()));
        }

        let conn = Connection::connect(addr, &self.topic, &self.channel, &self.cfg).await?;

        let incoming = lock(&self.incoming).clone().ok_or(NsqError::Stopping)?;
        let close = self.stopping.child_token();
        let (handle, run) = conn.run(incoming, close, self.cfg.clone());
        {
            let mut conns = lock(&self.conns);
            if conns.contains_key(addr) {
                handle.close();
                return Err(NsqError::AlreadyConnected(addr.to_string()));
            }
            conns.insert(addr.to_string(), handle);
        }
        self.update_rdy();

        let inner = self.clone();
        let addr = addr.to_string();
        self.tracker.spawn(async move {
            run.await;
            inner.on_conn_closed(&addr);
        });
        Ok(())
    }

    async fn connect_producers(self: &Arc<Self>, producers: Vec<String>) {
        for addr in producers {
            if lock(&self.conns).contains_key(&addr) {
                continue;
            }
            match self.connect_nsqd(&addr).await {
                Ok(()) | Err(NsqError::AlreadyConnected(_)) => {}
                Err(e) => tracing::warn!(nsqd = %addr, error = %e, "connect to producer failed"),
            }
        }
    }

    /// Раздать RDY: `max(1, max_in_flight / connections)` на соединение.
    fn update_rdy(&self) {
        if self.stopping.is_cancelled() {
            return;
        }
        let conns = lock(&self.conns);
        if conns.is_empty() {
            return;
        }
        let per_conn = (self.cfg.max_in_flight / conns.len() as u64).max(1);
        for handle in conns.values() {
            handle.set_rdy(per_conn);
        }
    }

    fn on_conn_closed(self: &Arc<Self>, addr: &str) {
        lock(&self.conns).remove(addr);
        if self.stopping.is_cancelled() {
            return;
        }
        tracing::warn!(nsqd = %addr, "connection lost");
        self.update_rdy();

        if lock(&self.direct).contains(addr) {
            let inner = self.clone();
            let addr = addr.to_string();
            self.tracker.spawn(async move { reconnect_loop(inner, addr).await });
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Background loops
// ═══════════════════════════════════════════════════════════════

async fn handler_loop<H: Handler>(worker: usize, inner: Arc<Inner>, handler: Arc<H>) {
    let rx = inner.incoming_rx.clone();
    loop {
        let msg = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(msg) = msg else { break };
        inner.counters.received.fetch_add(1, Ordering::Relaxed);

        let max_attempts = inner.cfg.max_attempts;
        if max_attempts > 0 && msg.attempts > max_attempts {
            tracing::warn!(
                id = %msg.id,
                attempts = msg.attempts,
                max_attempts,
                "giving up on message"
            );
            inner.counters.finished.fetch_add(1, Ordering::Relaxed);
            msg.finish();
            continue;
        }

        let h = handler.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = h.handle_message(&msg);
            (msg, result)
        })
        .await;

        match joined {
            Ok((msg, Ok(()))) => {
                inner.counters.finished.fetch_add(1, Ordering::Relaxed);
                msg.finish();
            }
            Ok((msg, Err(e))) => {
                let delay = inner.cfg.requeue_delay(msg.attempts);
                tracing::warn!(id = %msg.id, attempts = msg.attempts, ?delay, error = %e, "handler failed, requeueing");
                inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
                msg.requeue(delay);
            }
            Err(e) => {
                // сообщение дропнуто внутри паникующей задачи: Drop отправил REQ
                tracing::error!(worker, error = %e, "handler panicked");
                inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    tracing::debug!(worker, "handler worker finished");
}

async fn lookupd_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.cfg.lookupd_poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // первый tick срабатывает сразу, а первый запрос уже сделан
    interval.tick().await;
    let mut next = 0usize;

    loop {
        tokio::select! {
            _ = inner.stopping.cancelled() => break,
            _ = interval.tick() => {}
        }

        let addr = {
            let lookupds = lock(&inner.lookupds);
            if lookupds.is_empty() {
                continue;
            }
            next = (next + 1) % lookupds.len();
            lookupds[next].clone()
        };

        match query_lookupd(&inner.http, &addr, &inner.topic).await {
            Ok(producers) => inner.connect_producers(producers).await,
            Err(e) => tracing::warn!(lookupd = %addr, error = %e, "lookupd query failed"),
        }
    }
    tracing::debug!("lookupd poll loop finished");
}

async fn reconnect_loop(inner: Arc<Inner>, addr: String) {
    loop {
        tokio::select! {
            _ = inner.stopping.cancelled() => return,
            _ = tokio::time::sleep(inner.cfg.reconnect_interval) => {}
        }
        match inner.connect_nsqd(&addr).await {
            Ok(()) => {
                tracing::info!(nsqd = %addr, "reconnected");
                return;
            }
            Err(NsqError::AlreadyConnected(_)) | Err(NsqError::Stopping) => return,
            Err(e) => tracing::warn!(nsqd = %addr, error = %e, "reconnect failed"),
        }
    }
}
