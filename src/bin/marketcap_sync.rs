use std::process::ExitCode;
use std::time::Instant;

use coingecko_marketcap::{
    downloader_config_from_env, elapsed_minutes, init_logging, log_app_exit, log_app_start,
    logging_config_from_env, CancellationFlag, DaysWindow, Downloader,
};
use tracing::{error, warn};

const ONLY_TODAY_FLAG: &str = "--process-only-today";

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let window = match parse_window(std::env::args().skip(1)) {
        Ok(window) => window,
        Err(usage) => {
            eprintln!("{usage}");
            return Ok(ExitCode::from(2));
        }
    };

    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(&logging, window);

    let started = Instant::now();
    let config = downloader_config_from_env()?;
    let cancel = CancellationFlag::new();
    install_ctrl_c_handler(cancel.clone())?;

    let outcome = Downloader::from_config(config).and_then(|downloader| downloader.run(window, &cancel));
    let elapsed = started.elapsed();

    let summary = match outcome {
        Ok(summary) => summary,
        Err(err) => {
            error!(
                component = "marketcap_sync",
                event = "run.aborted",
                error = %err
            );
            log_app_exit(None, elapsed);
            println!("Total time taken to run in minutes : {}", elapsed_minutes(elapsed));
            return Err(err.into());
        }
    };

    log_app_exit(Some(&summary), elapsed);
    if !summary.failed.is_empty() {
        println!("Failed coins: {}", summary.failed_coin_ids().join(", "));
    }
    println!("Total time taken to run in minutes : {}", elapsed_minutes(elapsed));

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn parse_window(mut args: impl Iterator<Item = String>) -> Result<DaysWindow, String> {
    match (args.next(), args.next()) {
        (None, _) => Ok(DaysWindow::EntireHistory),
        (Some(flag), None) if flag == ONLY_TODAY_FLAG => Ok(DaysWindow::MostRecentDay),
        _ => Err(format!("usage: marketcap_sync [{ONLY_TODAY_FLAG}]")),
    }
}

fn install_ctrl_c_handler(cancel: CancellationFlag) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::spawn(move || {
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(
                    component = "marketcap_sync",
                    event = "app.cancel_requested"
                );
                cancel.cancel();
            }
        });
    });
    Ok(())
}
