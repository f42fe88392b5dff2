use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

use crate::{DecodeError, Level};

/// Структурированная лог-запись, как её публикует логгер сервисов.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub level: Level,
    pub prefix: String,
    pub host: String,
    pub message: String,
    pub caller: String,
    pub line: u32,
}

/// Уровень на проводе: порядковый номер или имя.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireLevel {
    Ordinal(u64),
    Name(String),
}

#[derive(Deserialize)]
struct WireRecord {
    #[serde(default)]
    prefix: String,
    time: DateTime<FixedOffset>,
    #[serde(default)]
    host: String,
    level: WireLevel,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    caller: String,
    #[serde(default, rename = "line")]
    line_no: u32,
}

impl LogRecord {
    /// Разобрать тело сообщения. Не JSON, нет `time`/`level` или
    /// неизвестный уровень: `DecodeError`.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireRecord = serde_json::from_slice(body)?;
        let level = match wire.level {
            WireLevel::Ordinal(n) => {
                Level::from_ordinal(n).ok_or_else(|| DecodeError::UnknownLevel(n.to_string()))?
            }
            WireLevel::Name(name) => name.parse()?,
        };
        Ok(Self {
            timestamp: wire.time,
            level,
            prefix: wire.prefix,
            host: wire.host,
            message: wire.msg,
            caller: wire.caller,
            line: wire.line_no,
        })
    }
}
