use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log_record::{OutputMode, format_line};
use nsq_client::{Handler, HandlerError, Message};

use super::sink::Sink;

// ═══════════════════════════════════════════════════════════════
//  TailHandler: сообщение → строка в sink
// ═══════════════════════════════════════════════════════════════

/// Обработчик доставок. Вызывается конкурентно из воркеров consumer'а.
///
/// Каждая доставка получает номер через один `fetch_add`: номера с 1 по
/// `message_limit` выводятся, номер `message_limit + 1` ровно один раз
/// вызывает `on_limit`, остальные ничего не выводят.
pub struct TailHandler {
    messages_shown: AtomicU64,
    message_limit: u64,
    mode: OutputMode,
    sink: Arc<Sink>,
    on_limit: Box<dyn Fn() + Send + Sync>,
}

impl TailHandler {
    pub fn new(
        message_limit: u64,
        mode: OutputMode,
        sink: Arc<Sink>,
        on_limit: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            messages_shown: AtomicU64::new(0),
            message_limit,
            mode,
            sink,
            on_limit: Box::new(on_limit),
        }
    }

    /// Сколько доставок получило номер (включая сверх лимита).
    pub fn messages_shown(&self) -> u64 {
        self.messages_shown.load(Ordering::Acquire)
    }

    fn handle_body(&self, body: &[u8]) -> Result<(), HandlerError> {
        let ticket = self.messages_shown.fetch_add(1, Ordering::AcqRel) + 1;
        if self.message_limit > 0 && ticket > self.message_limit {
            if ticket == self.message_limit + 1 {
                tracing::info!(limit = self.message_limit, "message limit reached");
                (self.on_limit)();
            }
            // Не показано, значит не потреблено: пусть nsqd отдаст его другим
            return Err(HandlerError::new("message limit reached"));
        }

        let line = match format_line(body, self.mode) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, body_len = body.len(), "cannot decode log record, skipping");
                return Ok(());
            }
        };

        self.sink.write_line(&line).map_err(|e| {
            tracing::error!(sink = self.sink.name(), error = %e, "write failed");
            HandlerError::from(e)
        })
    }
}

impl Handler for TailHandler {
    fn handle_message(&self, message: &Message) -> Result<(), HandlerError> {
        self.handle_body(&message.body)
    }
}

/// Триггер лимита для бинаря: сбросить sink и завершить процесс,
/// не дожидаясь остальных обработчиков.
pub fn exit_on_limit(sink: Arc<Sink>) -> impl Fn() + Send + Sync + 'static {
    move || {
        if let Err(e) = sink.flush() {
            tracing::error!(sink = sink.name(), error = %e, "flush failed");
        }
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use nsq_client::MessageId;
    use pretty_assertions::assert_eq;

    use super::super::sink::testing::{BrokenPipe, SharedBuf};
    use super::*;

    const INFO: &str = r#"{"prefix":"svc","time":"2024-05-01T09:02:03Z","host":"h1","level":4,"msg":"started","caller":"main.go","line":10}"#;
    const ERROR: &str = r#"{"prefix":"svc","time":"2024-05-01T09:02:04Z","host":"h1","level":"ERROR","msg":"failed","caller":"db.go","line":77}"#;

    struct Harness {
        handler: TailHandler,
        out: SharedBuf,
        fired: Arc<AtomicUsize>,
    }

    fn harness(limit: u64, mode: OutputMode) -> Harness {
        let out = SharedBuf::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let handler = TailHandler::new(limit, mode, Arc::new(Sink::from_writer("mem", out.clone())), {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        Harness { handler, out, fired }
    }

    fn deliver(h: &TailHandler, body: &str) -> Result<(), HandlerError> {
        h.handle_message(&Message::new(MessageId::default(), body.to_string()))
    }

    #[test]
    fn limit_three_shows_three_and_fires_once() {
        let h = harness(3, OutputMode::Plain);
        for _ in 0..3 {
            deliver(&h.handler, INFO).unwrap();
        }
        assert_eq!(h.out.lines().len(), 3);
        assert_eq!(h.fired.load(Ordering::SeqCst), 0);

        assert!(deliver(&h.handler, INFO).is_err());
        assert_eq!(h.fired.load(Ordering::SeqCst), 1);
        assert!(deliver(&h.handler, INFO).is_err());
        assert_eq!(h.fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.out.lines().len(), 3);
    }

    #[test]
    fn concurrent_deliveries_respect_limit() {
        let h = harness(50, OutputMode::Plain);
        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let _ = deliver(&h.handler, INFO);
                    }
                });
            }
        });
        assert_eq!(h.out.lines().len(), 50);
        assert_eq!(h.fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.handler.messages_shown(), 320);
    }

    #[test]
    fn zero_limit_never_fires() {
        let h = harness(0, OutputMode::Raw);
        for i in 0..1000 {
            deliver(&h.handler, &format!("line {i}")).unwrap();
        }
        assert_eq!(h.out.lines().len(), 1000);
        assert_eq!(h.fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_record_is_skipped_and_finished() {
        let h = harness(0, OutputMode::Plain);
        deliver(&h.handler, INFO).unwrap();
        deliver(&h.handler, "{not json").unwrap();
        deliver(&h.handler, ERROR).unwrap();
        assert_eq!(
            h.out.lines(),
            vec![
                "2024/5/1 09:02:03 [INFO] svc h1 started main.go 10",
                "2024/5/1 09:02:04 [ERROR] svc h1 failed db.go 77",
            ]
        );
        assert_eq!(h.handler.messages_shown(), 3);
    }

    #[test]
    fn colorized_wraps_line_in_level_style() {
        let h = harness(0, OutputMode::Colorized);
        deliver(&h.handler, ERROR).unwrap();
        assert_eq!(
            h.out.lines(),
            vec!["\x1b[0;31m2024/5/1 09:02:04 [ERROR] svc h1 failed db.go 77 \x1b[0m"]
        );
    }

    #[test]
    fn raw_mode_never_decodes() {
        let h = harness(0, OutputMode::Raw);
        deliver(&h.handler, "plain text, not a record").unwrap();
        deliver(&h.handler, INFO).unwrap();
        assert_eq!(h.out.lines(), vec!["plain text, not a record", INFO]);
    }

    #[test]
    fn write_failure_is_reported() {
        let handler = TailHandler::new(0, OutputMode::Raw, Arc::new(Sink::from_writer("broken", BrokenPipe)), || {});
        let err = deliver(&handler, "x").unwrap_err();
        assert!(err.message().contains("pipe closed"), "{}", err.message());
    }

    #[test]
    fn file_destination_gets_plain_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.log");
        let mode = OutputMode::resolve("NSQLOG", true);
        let handler = TailHandler::new(0, mode, Arc::new(Sink::append_file(&path).unwrap()), || {});
        deliver(&handler, INFO).unwrap();
        deliver(&handler, ERROR).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "2024/5/1 09:02:03 [INFO] svc h1 started main.go 10\n\
             2024/5/1 09:02:04 [ERROR] svc h1 failed db.go 77\n"
        );
    }
}
