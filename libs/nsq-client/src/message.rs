use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

use crate::protocol::{Command, MessageId, RawMessage};

// ═══════════════════════════════════════════════════════════════
//  InFlight: счётчик неподтверждённых сообщений соединения
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    pub(crate) fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Дождаться, пока все сообщения получат FIN/REQ.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
pub(crate) struct Responder {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) in_flight: Arc<InFlight>,
}

// ═══════════════════════════════════════════════════════════════
//  Message
// ═══════════════════════════════════════════════════════════════

/// Доставленное сообщение. Ответ (FIN/REQ) отправляется ровно один раз:
/// воркером по результату обработчика или, если сообщение потеряно,
/// из `Drop` как REQ без задержки.
pub struct Message {
    pub id: MessageId,
    /// Наносекунды Unix epoch, когда nsqd принял сообщение.
    pub timestamp: i64,
    pub attempts: u16,
    pub body: Bytes,
    /// Адрес nsqd, от которого пришло сообщение.
    pub nsqd_address: Arc<str>,
    responded: AtomicBool,
    responder: Option<Responder>,
}

impl Message {
    /// Сообщение вне соединения: ответы никуда не уходят.
    pub fn new(id: MessageId, body: impl Into<Bytes>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Self {
            id,
            timestamp,
            attempts: 1,
            body: body.into(),
            nsqd_address: Arc::from(""),
            responded: AtomicBool::new(false),
            responder: None,
        }
    }

    pub(crate) fn from_wire(raw: RawMessage, nsqd_address: Arc<str>, responder: Responder) -> Self {
        responder.in_flight.acquire();
        Self {
            id: raw.id,
            timestamp: raw.timestamp,
            attempts: raw.attempts,
            body: raw.body,
            nsqd_address,
            responded: AtomicBool::new(false),
            responder: Some(responder),
        }
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Продлить таймаут сообщения на стороне nsqd.
    pub fn touch(&self) {
        if self.has_responded() {
            return;
        }
        if let Some(r) = &self.responder {
            let _ = r.commands.send(Command::Touch(self.id));
        }
    }

    pub(crate) fn finish(&self) {
        self.respond(Command::Fin(self.id));
    }

    pub(crate) fn requeue(&self, delay: Duration) {
        self.respond(Command::Req { id: self.id, delay });
    }

    fn respond(&self, cmd: Command) {
        if self.responded.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(r) = &self.responder {
            if r.commands.send(cmd).is_err() {
                tracing::debug!(id = %self.id, nsqd = %self.nsqd_address, "connection gone, response dropped");
            }
            r.in_flight.release();
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if !self.has_responded() {
            self.requeue(Duration::ZERO);
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("nsqd_address", &self.nsqd_address)
            .field("body_len", &self.body.len())
            .finish()
    }
}
