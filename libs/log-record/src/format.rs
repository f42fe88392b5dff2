use std::io::Write;

use crate::{DecodeError, LogRecord};

/// Формат времени в выводе: `2024/5/1 10:02:03`.
pub const TIME_LAYOUT: &str = "%Y/%-m/%-d %H:%M:%S";

/// Режим вывода. Выбирается один раз при старте.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Тело сообщения как есть, без разбора.
    Raw,
    /// Разбор записи, строка окрашена по уровню.
    Colorized,
    /// Разбор записи без цвета, уровень как `[LEVEL]`. Для файлов.
    Plain,
}

impl OutputMode {
    /// `type == "NSQLOG"`: структурный вывод, иначе raw.
    /// Файловый вывод всегда Plain.
    pub fn resolve(tail_type: &str, to_file: bool) -> Self {
        if to_file {
            OutputMode::Plain
        } else if tail_type == "NSQLOG" {
            OutputMode::Colorized
        } else {
            OutputMode::Raw
        }
    }
}

/// Превратить тело сообщения в одну строку вывода (без `\n`).
pub fn format_line(body: &[u8], mode: OutputMode) -> Result<Vec<u8>, DecodeError> {
    match mode {
        OutputMode::Raw => Ok(body.to_vec()),
        OutputMode::Colorized => Ok(render_colorized(&LogRecord::decode(body)?)),
        OutputMode::Plain => Ok(render_plain(&LogRecord::decode(body)?)),
    }
}

fn render_colorized(rec: &LogRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + rec.message.len());
    let _ = write!(
        out,
        "\x1b[{}m{} [{}] {} {} {} {} {} \x1b[0m",
        rec.level.style(),
        rec.timestamp.format(TIME_LAYOUT),
        rec.level,
        rec.prefix,
        rec.host,
        rec.message,
        rec.caller,
        rec.line,
    );
    out
}

fn render_plain(rec: &LogRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + rec.message.len());
    let _ = write!(
        out,
        "{} [{}] {} {} {} {} {}",
        rec.timestamp.format(TIME_LAYOUT),
        rec.level,
        rec.prefix,
        rec.host,
        rec.message,
        rec.caller,
        rec.line,
    );
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Level;

    fn body(level: u8) -> Vec<u8> {
        format!(
            r#"{{"prefix":"svc","time":"2024-05-01T09:02:03+02:00","host":"h1","level":{level},"msg":"started","caller":"main.go","line":10}}"#
        )
        .into_bytes()
    }

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn plain_renders_fields_in_order() {
        let line = text(format_line(&body(4), OutputMode::Plain).unwrap());
        assert_eq!(line, "2024/5/1 09:02:03 [INFO] svc h1 started main.go 10");
    }

    #[test]
    fn colorized_wraps_line_in_level_style() {
        let line = text(format_line(&body(6), OutputMode::Colorized).unwrap());
        assert_eq!(line, "\x1b[0;31m2024/5/1 09:02:03 [ERROR] svc h1 started main.go 10 \x1b[0m");
    }

    #[test]
    fn colorized_uses_each_level_style() {
        for level in Level::ALL {
            let line = text(format_line(&body(level as u8), OutputMode::Colorized).unwrap());
            assert!(line.starts_with(&format!("\x1b[{}m", level.style())), "{line}");
            assert!(line.contains(&format!("[{}]", level.name())), "{line}");
            assert!(line.ends_with("\x1b[0m"));
        }
    }

    #[test]
    fn raw_passes_body_through() {
        let raw = b"not json at all {".to_vec();
        assert_eq!(format_line(&raw, OutputMode::Raw).unwrap(), raw);
    }

    #[test]
    fn structured_modes_reject_malformed_body() {
        assert!(format_line(b"oops", OutputMode::Plain).is_err());
        assert!(format_line(b"oops", OutputMode::Colorized).is_err());
    }

    #[test]
    fn mode_resolution() {
        assert_eq!(OutputMode::resolve("NSQLOG", false), OutputMode::Colorized);
        assert_eq!(OutputMode::resolve("json", false), OutputMode::Raw);
        assert_eq!(OutputMode::resolve("json", true), OutputMode::Plain);
        assert_eq!(OutputMode::resolve("NSQLOG", true), OutputMode::Plain);
    }
}
