use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use log_record::OutputMode;
use nsq_client::ConsumerConfig;
use serde::Deserialize;

use super::error::TailError;

pub const DEFAULT_CONFIG: &str = "tailn.toml";

const DEFAULT_TOPIC: &str = "LOG";
const DEFAULT_CHANNEL: &str = "tailn";
const DEFAULT_NSQD: &str = "localhost:4150";
const DEFAULT_LOOKUPD: &str = "localhost:4161";
const DEFAULT_TYPE: &str = "NSQLOG";

// ═══════════════════════════════════════════════════════════════
//  Config file (TOML)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub topic: Option<String>,
    pub channel: Option<String>,
    pub number: Option<u64>,
    pub nsqd_tcp_address: Option<AddressList>,
    pub lookupd_http_address: Option<AddressList>,
    pub timeout: Option<u64>,
    #[serde(rename = "type")]
    pub tail_type: Option<String>,
    pub log: Option<bool>,
    pub tofile: Option<String>,
    pub max_in_flight: Option<u64>,
    pub concurrency: Option<usize>,
    /// Секунды ожидания остановки consumer'а после SIGINT/SIGTERM.
    pub shutdown_grace: Option<u64>,
}

/// Адреса в файле: строка через запятую или массив.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AddressList {
    One(String),
    Many(Vec<String>),
}

impl AddressList {
    fn into_vec(self) -> Vec<String> {
        match self {
            AddressList::One(s) => split_addresses(&s),
            AddressList::Many(v) => v.iter().flat_map(|s| split_addresses(s)).collect(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config, TailError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| TailError::Config(format!("cannot read config {}: {e}", path.display())))?;
    toml::from_str(&content).map_err(|e| TailError::Config(format!("bad config {}: {e}", path.display())))
}

// ═══════════════════════════════════════════════════════════════
//  CLI args
// ═══════════════════════════════════════════════════════════════

#[derive(Args, Clone, Debug, Default)]
pub struct TailArgs {
    /// Путь к tailn.toml (по умолчанию tailn.toml, если есть)
    #[arg(long, env = "TAILN_CONFIG")]
    pub config: Option<String>,

    /// NSQ topic (по умолчанию LOG)
    #[arg(short = 't', long, env = "TAILN_TOPIC")]
    pub topic: Option<String>,

    /// NSQ channel (по умолчанию tailn)
    #[arg(short = 'c', long, env = "TAILN_CHANNEL")]
    pub channel: Option<String>,

    /// Сколько сообщений показать (0 = без ограничения)
    #[arg(short = 'n', long)]
    pub number: Option<u64>,

    /// Адреса nsqd через запятую (по умолчанию localhost:4150)
    #[arg(short = 'a', long = "nsqd-tcp-address", env = "TAILN_NSQD")]
    pub nsqd_tcp_address: Option<String>,

    /// Адреса nsqlookupd через запятую (по умолчанию localhost:4161)
    #[arg(short = 'l', long = "lookupd-http-address", env = "TAILN_LOOKUPD")]
    pub lookupd_http_address: Option<String>,

    /// Таймаут подключения в секундах (по умолчанию 5)
    #[arg(short = 'o', long)]
    pub timeout: Option<u64>,

    /// NSQLOG включает разбор лог-записей, иначе тело выводится как есть
    #[arg(long = "type")]
    pub tail_type: Option<String>,

    /// Включить диагностику nsq-клиента
    #[arg(long)]
    pub log: bool,

    /// Дописывать в файл вместо stdout (всегда без цвета)
    #[arg(short = 'f', long)]
    pub tofile: Option<String>,

    /// Суммарный RDY по всем nsqd (по умолчанию 128)
    #[arg(long)]
    pub max_in_flight: Option<u64>,

    /// Число воркеров обработчика (по умолчанию 1)
    #[arg(long)]
    pub concurrency: Option<usize>,
}

// ═══════════════════════════════════════════════════════════════
//  Effective: merged config
// ═══════════════════════════════════════════════════════════════

/// Итоговая конфигурация после мержа: defaults < tailn.toml < env/CLI
#[derive(Debug)]
pub struct Effective {
    pub topic: String,
    pub channel: String,
    /// 0: без ограничения.
    pub message_limit: u64,
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub dial_timeout: Duration,
    pub mode: OutputMode,
    pub output_file: Option<PathBuf>,
    pub bus_log: bool,
    pub max_in_flight: u64,
    pub concurrency: usize,
    pub shutdown_grace: Duration,
}

impl Effective {
    pub fn new(args: &TailArgs) -> Result<Self, TailError> {
        let cfg = match &args.config {
            Some(path) => load_config(Path::new(path))?,
            None if Path::new(DEFAULT_CONFIG).exists() => load_config(Path::new(DEFAULT_CONFIG))?,
            None => Config::default(),
        };

        let topic = args.topic.clone().or(cfg.topic).unwrap_or_else(|| DEFAULT_TOPIC.into());
        let channel = args.channel.clone().or(cfg.channel).unwrap_or_else(|| DEFAULT_CHANNEL.into());
        if topic.trim().is_empty() {
            return Err(TailError::Usage("topic is required".into()));
        }
        if channel.trim().is_empty() {
            return Err(TailError::Usage("channel is required".into()));
        }

        let nsqd_tcp_addresses = match &args.nsqd_tcp_address {
            Some(s) => split_addresses(s),
            None => cfg.nsqd_tcp_address.map(AddressList::into_vec).unwrap_or_else(|| vec![DEFAULT_NSQD.into()]),
        };
        let lookupd_http_addresses = match &args.lookupd_http_address {
            Some(s) => split_addresses(s),
            None => cfg
                .lookupd_http_address
                .map(AddressList::into_vec)
                .unwrap_or_else(|| vec![DEFAULT_LOOKUPD.into()]),
        };
        if nsqd_tcp_addresses.is_empty() && lookupd_http_addresses.is_empty() {
            return Err(TailError::Usage("at least one nsqd or lookupd address is required".into()));
        }

        let timeout = args.timeout.or(cfg.timeout).unwrap_or(5);
        if timeout == 0 {
            return Err(TailError::Usage("timeout must be at least 1 second".into()));
        }
        let max_in_flight = args.max_in_flight.or(cfg.max_in_flight).unwrap_or(128);
        if max_in_flight == 0 {
            return Err(TailError::Usage("max-in-flight must be at least 1".into()));
        }
        let concurrency = args.concurrency.or(cfg.concurrency).unwrap_or(1);
        if concurrency == 0 {
            return Err(TailError::Usage("concurrency must be at least 1".into()));
        }

        let output_file = args.tofile.clone().or(cfg.tofile).filter(|p| !p.is_empty()).map(PathBuf::from);
        let tail_type = args.tail_type.clone().or(cfg.tail_type).unwrap_or_else(|| DEFAULT_TYPE.into());

        Ok(Self {
            topic,
            channel,
            message_limit: args.number.or(cfg.number).unwrap_or(0),
            nsqd_tcp_addresses,
            lookupd_http_addresses,
            dial_timeout: Duration::from_secs(timeout),
            mode: OutputMode::resolve(&tail_type, output_file.is_some()),
            output_file,
            bus_log: args.log || cfg.log.unwrap_or(false),
            max_in_flight,
            concurrency,
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace.unwrap_or(5)),
        })
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            dial_timeout: self.dial_timeout,
            max_in_flight: self.max_in_flight,
            user_agent: format!("tailn/{}", env!("CARGO_PKG_VERSION")),
            ..ConsumerConfig::default()
        }
    }
}

/// `"a:1, b:2,,"` → `["a:1", "b:2"]`
pub fn split_addresses(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|a| !a.is_empty()).map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: TailArgs,
    }

    fn parse(argv: &[&str]) -> TailArgs {
        TestCli::try_parse_from(std::iter::once("tailn").chain(argv.iter().copied())).unwrap().args
    }

    fn config_file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults() {
        let eff = Effective::new(&TailArgs::default()).unwrap();
        assert_eq!(eff.topic, "LOG");
        assert_eq!(eff.channel, "tailn");
        assert_eq!(eff.message_limit, 0);
        assert_eq!(eff.nsqd_tcp_addresses, vec!["localhost:4150"]);
        assert_eq!(eff.lookupd_http_addresses, vec!["localhost:4161"]);
        assert_eq!(eff.dial_timeout, Duration::from_secs(5));
        assert_eq!(eff.mode, OutputMode::Colorized);
        assert_eq!(eff.output_file, None);
        assert!(!eff.bus_log);
        assert_eq!(eff.max_in_flight, 128);
        assert_eq!(eff.concurrency, 1);
        assert_eq!(eff.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn parses_short_flags() {
        let args = parse(&["-t", "app", "-c", "ops", "-n", "3", "-a", "n1:4150,n2:4150", "-l", "", "-o", "2"]);
        let eff = Effective::new(&args).unwrap();
        assert_eq!(eff.topic, "app");
        assert_eq!(eff.channel, "ops");
        assert_eq!(eff.message_limit, 3);
        assert_eq!(eff.nsqd_tcp_addresses, vec!["n1:4150", "n2:4150"]);
        assert!(eff.lookupd_http_addresses.is_empty());
        assert_eq!(eff.dial_timeout, Duration::from_secs(2));
    }

    #[test]
    fn file_fills_gaps_and_cli_wins() {
        let file = config_file(
            r#"
            topic = "from-file"
            channel = "file-chan"
            number = 10
            nsqd_tcp_address = ["a:4150", "b:4150, c:4150"]
            log = true
            shutdown_grace = 1
            "#,
        );
        let args = parse(&["--config", file.path().to_str().unwrap(), "--topic", "from-cli"]);
        let eff = Effective::new(&args).unwrap();
        assert_eq!(eff.topic, "from-cli");
        assert_eq!(eff.channel, "file-chan");
        assert_eq!(eff.message_limit, 10);
        assert_eq!(eff.nsqd_tcp_addresses, vec!["a:4150", "b:4150", "c:4150"]);
        assert!(eff.bus_log);
        assert_eq!(eff.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn empty_topic_is_usage_error() {
        let err = Effective::new(&parse(&["--topic", ""])).unwrap_err();
        assert!(matches!(err, TailError::Usage(_)));
        assert_eq!(err.exit_code(), 2);

        let err = Effective::new(&parse(&["-c", " "])).unwrap_err();
        assert!(matches!(err, TailError::Usage(_)));
    }

    #[test]
    fn no_addresses_is_usage_error() {
        let err = Effective::new(&parse(&["-a", "", "-l", " , "])).unwrap_err();
        assert!(matches!(err, TailError::Usage(_)));
    }

    #[test]
    fn zero_limits_rejected() {
        for argv in [&["-o", "0"][..], &["--max-in-flight", "0"][..], &["--concurrency", "0"][..]] {
            assert!(matches!(Effective::new(&parse(argv)), Err(TailError::Usage(_))), "{argv:?}");
        }
    }

    #[test]
    fn explicit_missing_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = Effective::new(&parse(&["--config", path.to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, TailError::Config(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn invalid_config_is_error() {
        let file = config_file("number = \"many\"");
        let err = Effective::new(&parse(&["--config", file.path().to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, TailError::Config(_)));
    }

    #[test]
    fn output_mode_resolution() {
        assert_eq!(Effective::new(&parse(&["--type", "RAW"])).unwrap().mode, OutputMode::Raw);

        let eff = Effective::new(&parse(&["--type", "RAW", "-f", "/tmp/tailn.log"])).unwrap();
        assert_eq!(eff.mode, OutputMode::Plain);
        assert_eq!(eff.output_file, Some(PathBuf::from("/tmp/tailn.log")));
    }

    #[test]
    fn consumer_config_carries_overrides() {
        let eff = Effective::new(&parse(&["-o", "3", "--max-in-flight", "16"])).unwrap();
        let cfg = eff.consumer_config();
        assert_eq!(cfg.dial_timeout, Duration::from_secs(3));
        assert_eq!(cfg.max_in_flight, 16);
        assert!(cfg.user_agent.starts_with("tailn/"));
        cfg.validate().unwrap();
    }

    #[test]
    fn splits_addresses() {
        assert_eq!(split_addresses(" a:1 ,, b:2 ,"), vec!["a:1", "b:2"]);
        assert!(split_addresses("").is_empty());
    }
}
