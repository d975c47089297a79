use tracing_subscriber::EnvFilter;
use ydsyncd::daemon::{DaemonConfig, DaemonRuntime, RunMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ydsyncd=info")),
        )
        .init();

    let run_mode = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: ydsyncd [--once]");
            println!("  --once     Run one reconciliation pass and exit");
            println!();
            println!("Environment: YADISK_TOKEN (required), YDSYNC_DIR, YDSYNC_WORK_DIR,");
            println!("  YDSYNC_EXCLUDE, YDSYNC_WORKERS, YDSYNC_PAGE_SIZE, YDSYNC_MOVE_WINDOW_MS,");
            println!("  YDSYNC_POLL_MS, YDSYNC_CONFLICT_POLICY, RUST_LOG");
            return Ok(());
        }
        CliMode::Once => RunMode::Once,
        CliMode::Run => RunMode::Watch,
    };
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run(run_mode).await
}
