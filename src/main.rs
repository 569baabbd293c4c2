use std::process::ExitCode;

use twamp_suite::{
    client::run_test,
    configuration::{Configuration, Parser},
    server::Server,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        log::error!("Configuration is broken: {}", e);
        return ExitCode::FAILURE;
    }

    log::info!("Configuration valid. Starting up...");

    match conf.client_config() {
        Some(client) => match run_test(&client).await {
            Ok(summary) => {
                summary.print(conf.output_format);
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("Test against {} failed: {}", client.remote_addr, e);
                ExitCode::FAILURE
            }
        },
        None => run_server(&conf).await,
    }
}

async fn run_server(conf: &Configuration) -> ExitCode {
    let mut server = Server::new();
    if let Err(e) = server.start(&conf.server_config()).await {
        log::error!("Failed to start server: {}", e);
        return ExitCode::FAILURE;
    }

    let shutdown = server.shutdown_token();
    tokio::spawn(forward_signals(shutdown.clone()));
    shutdown.cancelled().await;

    server.stop().await;
    server.stats().print(conf.output_format);
    ExitCode::SUCCESS
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn forward_signals(shutdown: tokio_util::sync::CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    log::info!("Shutdown requested");
    shutdown.cancel();
}
