use std::sync::Arc;
use std::time::Duration;

use nsq_client::{Consumer, NsqError};

use super::config::Effective;
use super::error::TailError;
use super::handler::{TailHandler, exit_on_limit};
use super::sink::Sink;

// ═══════════════════════════════════════════════════════════════
//  Bus: то, что lifecycle нужно от consumer'а
// ═══════════════════════════════════════════════════════════════

pub trait Bus {
    fn connect_nsqds(&self, addrs: &[String]) -> impl Future<Output = Result<(), NsqError>> + Send;
    fn connect_lookupds(&self, addrs: &[String]) -> impl Future<Output = Result<(), NsqError>> + Send;
    /// Запросить остановку. Идемпотентно.
    fn stop(&self);
    /// Завершается, когда все соединения и воркеры остановлены.
    fn stopped(&self) -> impl Future<Output = ()> + Send;
}

impl Bus for Consumer {
    fn connect_nsqds(&self, addrs: &[String]) -> impl Future<Output = Result<(), NsqError>> + Send {
        self.connect_to_nsqds(addrs)
    }

    fn connect_lookupds(&self, addrs: &[String]) -> impl Future<Output = Result<(), NsqError>> + Send {
        self.connect_to_lookupds(addrs)
    }

    fn stop(&self) {
        Consumer::stop(self)
    }

    fn stopped(&self) -> impl Future<Output = ()> + Send {
        Consumer::stopped(self)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Streaming,
    Terminated,
}

/// Почему сессия закончилась.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Consumer остановился сам.
    BusStopped,
    /// SIGINT/SIGTERM, consumer остановлен в пределах grace.
    Interrupted,
    /// SIGINT/SIGTERM, consumer не успел остановиться.
    GraceExpired,
}

pub struct Lifecycle {
    state: LifecycleState,
    grace: Duration,
}

impl Lifecycle {
    pub fn new(grace: Duration) -> Self {
        Self { state: LifecycleState::Idle, grace }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, next: LifecycleState) {
        tracing::info!(from = ?self.state, to = ?next, "lifecycle");
        self.state = next;
    }

    /// Подключиться (сначала nsqd, затем lookupd) и стримить до остановки
    /// consumer'а или до `shutdown`. Ошибка подключения фатальна.
    pub async fn run<B: Bus>(
        &mut self,
        bus: &B,
        nsqds: &[String],
        lookupds: &[String],
        shutdown: impl Future<Output = ()>,
    ) -> Result<Termination, TailError> {
        self.transition(LifecycleState::Connecting);
        let connected = async {
            bus.connect_nsqds(nsqds).await?;
            bus.connect_lookupds(lookupds).await
        };
        if let Err(e) = connected.await {
            bus.stop();
            self.transition(LifecycleState::Terminated);
            return Err(e.into());
        }

        self.transition(LifecycleState::Streaming);
        let termination = tokio::select! {
            _ = bus.stopped() => Termination::BusStopped,
            _ = shutdown => {
                tracing::info!(grace = ?self.grace, "stopping consumer");
                bus.stop();
                match tokio::time::timeout(self.grace, bus.stopped()).await {
                    Ok(()) => Termination::Interrupted,
                    Err(_) => {
                        tracing::warn!(grace = ?self.grace, "consumer did not stop in time, exiting anyway");
                        Termination::GraceExpired
                    }
                }
            }
        };
        self.transition(LifecycleState::Terminated);
        Ok(termination)
    }
}

// ═══════════════════════════════════════════════════════════════
//  run: точка входа команды
// ═══════════════════════════════════════════════════════════════

pub async fn run(eff: &Effective) -> Result<(), TailError> {
    let sink = Arc::new(match &eff.output_file {
        Some(path) => Sink::append_file(path)?,
        None => Sink::stdout(),
    });

    let consumer = Consumer::new(&eff.topic, &eff.channel, eff.consumer_config())?;
    let handler = TailHandler::new(eff.message_limit, eff.mode, sink.clone(), exit_on_limit(sink.clone()));
    consumer.add_concurrent_handlers(handler, eff.concurrency);

    // До подключения, чтобы ранний SIGINT не убил процесс
    let shutdown = shutdown_signal()?;

    tracing::info!(
        topic = %eff.topic,
        channel = %eff.channel,
        mode = ?eff.mode,
        limit = eff.message_limit,
        sink = sink.name(),
        "tailn starting"
    );

    let mut lifecycle = Lifecycle::new(eff.shutdown_grace);
    let termination =
        lifecycle.run(&consumer, &eff.nsqd_tcp_addresses, &eff.lookupd_http_addresses, shutdown).await?;

    if let Err(e) = sink.flush() {
        tracing::error!(sink = sink.name(), error = %e, "flush failed");
    }
    let stats = consumer.stats();
    tracing::info!(
        ?termination,
        received = stats.messages_received,
        finished = stats.messages_finished,
        requeued = stats.messages_requeued,
        "tailn finished"
    );
    Ok(())
}

/// SIGINT или SIGTERM. Обработчики регистрируются сразу.
fn shutdown_signal() -> Result<impl Future<Output = ()> + Send, TailError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        Ok(async move {
            tokio::select! {
                _ = interrupt.recv() => tracing::info!("SIGINT received"),
                _ = terminate.recv() => tracing::info!("SIGTERM received"),
            }
        })
    }
    #[cfg(not(unix))]
    {
        Ok(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received");
            }
        })
    }
}
