use std::time::Duration;

use crate::NsqError;

/// Настройки consumer'а. Значения по умолчанию совпадают с тем,
/// что ожидает nsqd от обычного клиента.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Таймаут TCP connect к nsqd и HTTP connect к lookupd.
    pub dial_timeout: Duration,
    /// Если за это время не пришло ни одного фрейма: соединение мёртвое.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Интервал heartbeat, запрашиваемый в IDENTIFY.
    pub heartbeat_interval: Duration,
    /// Таймаут сообщения на стороне nsqd. `None`: значение сервера.
    pub msg_timeout: Option<Duration>,
    /// Суммарный RDY по всем соединениям.
    pub max_in_flight: u64,
    /// Сообщения с большим числом попыток подтверждаются без обработки (0 = без лимита).
    pub max_attempts: u16,
    pub default_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    pub lookupd_poll_interval: Duration,
    /// Пауза перед переподключением к напрямую заданному nsqd.
    pub reconnect_interval: Duration,
    /// Сколько ждать ответов на in-flight сообщения при закрытии соединения.
    pub drain_timeout: Duration,
    pub max_frame_size: usize,
    pub user_agent: String,
    pub client_id: String,
    pub hostname: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        let hostname = local_hostname();
        Self {
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            msg_timeout: None,
            max_in_flight: 1,
            max_attempts: 5,
            default_requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            lookupd_poll_interval: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(5),
            max_frame_size: 4 * 1024 * 1024,
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            client_id: hostname.split('.').next().unwrap_or_default().to_string(),
            hostname,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), NsqError> {
        if self.max_in_flight == 0 {
            return Err(NsqError::Config("max_in_flight must be at least 1".into()));
        }
        if self.dial_timeout.is_zero() {
            return Err(NsqError::Config("dial_timeout must be positive".into()));
        }
        if self.heartbeat_interval >= self.read_timeout {
            return Err(NsqError::Config(format!(
                "heartbeat_interval ({:?}) must be less than read_timeout ({:?})",
                self.heartbeat_interval, self.read_timeout
            )));
        }
        if self.max_frame_size < 64 {
            return Err(NsqError::Config("max_frame_size is too small".into()));
        }
        Ok(())
    }

    /// Задержка REQ для сообщения с `attempts` попытками.
    pub fn requeue_delay(&self, attempts: u16) -> Duration {
        self.default_requeue_delay
            .saturating_mul(u32::from(attempts.max(1)))
            .min(self.max_requeue_delay)
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
