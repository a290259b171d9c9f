use clap::Parser;
use std::process::ExitCode;
use tracemem::cli::{Cli, Command};
use tracemem::config::{load_config, load_config_from};
use tracemem::manager::DatabaseManager;
use tracemem::{maintain, status, MemError};

async fn run(cli: Cli) -> Result<(), MemError> {
    let mut config = match &cli.config {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    if let Some(db) = cli.db {
        config.storage.path = Some(db);
    }

    let meter = tracemem::metrics::init_meter_provider(&config.metrics);

    let mut manager = DatabaseManager::new(config);
    manager.initialize().await?;

    let result = match cli.command {
        Command::Status => status::handle_status(&manager).await,
        Command::Queue(args) => status::handle_queue(&manager, args.json).await,
        Command::Retry(args) => maintain::handle_retry(&manager, args.id).await,
        Command::Abort(args) => maintain::handle_abort(&manager, args.id).await,
        Command::Recover(args) => maintain::handle_recover(&manager, args.threshold_secs).await,
        Command::Cleanup(args) => maintain::handle_cleanup(&manager, args.keep).await,
        Command::Export(args) => {
            maintain::handle_export(&manager, args.project.as_deref(), &args.file).await
        }
        Command::Import(args) => maintain::handle_import(&manager, &args.file).await,
    };

    manager.shutdown().await;
    if let Some(provider) = meter
        && let Err(e) = provider.shutdown()
    {
        log::warn!("metrics shutdown: {e}");
    }
    result
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("tracemem: runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tracemem: {e}");
            ExitCode::from(1)
        }
    }
}
