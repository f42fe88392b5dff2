mod cmd;

use clap::{CommandFactory, Parser};
use cmd::config::{Effective, TailArgs};
use cmd::error::TailError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tailn", version, about = "Tail log from nsq")]
struct Cli {
    #[command(flatten)]
    args: TailArgs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let eff = match Effective::new(&cli.args) {
        Ok(e) => e,
        Err(TailError::Usage(msg)) => {
            eprintln!("Error: {msg}\n");
            let _ = Cli::command().print_help();
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    init_tracing(eff.bus_log);

    if let Err(e) = cmd::tail::run(&eff).await {
        tracing::error!(error = %e, "tailn failed");
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

/// Диагностика в stderr, чтобы не смешиваться с выводом tail.
/// Лог nsq-клиента выключен, пока не задан `--log`.
fn init_tracing(bus_log: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if !bus_log {
        if let Ok(directive) = "nsq_client=off".parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
