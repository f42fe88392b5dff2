use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::error::TailError;

/// Куда пишутся строки: stdout или файл в режиме append.
///
/// Строка и `\n` пишутся одним вызовом под мьютексом, поэтому строки
/// конкурентных обработчиков не перемешиваются.
pub struct Sink {
    name: String,
    out: Mutex<Box<dyn Write + Send>>,
}

impl Sink {
    pub fn stdout() -> Self {
        Self::from_writer("stdout", io::stdout())
    }

    /// Файл открывается один раз на всю сессию.
    pub fn append_file(path: &Path) -> Result<Self, TailError> {
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o644);
        }
        let file = opts.open(path).map_err(|e| TailError::Io { path: path.display().to_string(), source: e })?;
        Ok(Self::from_writer(path.display().to_string(), LineWriter::new(file)))
    }

    pub fn from_writer(name: impl Into<String>, w: impl Write + Send + 'static) -> Self {
        Self { name: name.into(), out: Mutex::new(Box::new(w)) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');
        self.lock().write_all(&buf)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        // Паника другого обработчика не должна останавливать вывод
        self.out.lock().unwrap_or_else(|e| e.into_inner())
    }
}
