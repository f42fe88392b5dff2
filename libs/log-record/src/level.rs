use std::str::FromStr;

use crate::DecodeError;

/// Уровень важности записи. Порядковые номера совпадают с тем,
/// что логгер кладёт в поле `level` на проводе.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Finest = 0,
    Fine = 1,
    Debug = 2,
    Trace = 3,
    Info = 4,
    Warning = 5,
    Error = 6,
    Critical = 7,
}

impl Level {
    pub const ALL: [Level; 8] = [
        Level::Finest,
        Level::Fine,
        Level::Debug,
        Level::Trace,
        Level::Info,
        Level::Warning,
        Level::Error,
        Level::Critical,
    ];

    pub fn from_ordinal(n: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(n).ok()?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Level::Finest => "FINEST",
            Level::Fine => "FINE",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// SGR-параметры ANSI escape для цветного вывода.
    pub fn style(self) -> &'static str {
        match self {
            Level::Finest => "1;34",
            Level::Fine => "0;34",
            Level::Debug => "1;32",
            Level::Trace => "0;37",
            Level::Info => "0;32",
            Level::Warning => "0;33",
            Level::Error => "0;31",
            Level::Critical => "7;31",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Level {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DecodeError::UnknownLevel(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_wire_order() {
        for (i, level) in Level::ALL.iter().enumerate() {
            assert_eq!(Level::from_ordinal(i as u64), Some(*level));
            assert_eq!(*level as usize, i);
        }
        assert_eq!(Level::from_ordinal(8), None);
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("CRITICAL".parse::<Level>().unwrap(), Level::Critical);
        assert!(matches!("verbose".parse::<Level>(), Err(DecodeError::UnknownLevel(s)) if s == "verbose"));
    }

    #[test]
    fn every_level_has_a_distinct_style() {
        let mut styles: Vec<_> = Level::ALL.iter().map(|l| l.style()).collect();
        styles.sort();
        styles.dedup();
        assert_eq!(styles.len(), Level::ALL.len());
    }
}
