use taberna_server::maintenance::{Maintenance, TaskOutcome};
use taberna_server::server::{self, events::LogSink, mail, push::PushSender};
use taberna_server::storage;
mod cli;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    use clap::Parser;
    let args = cli::Cli::parse();

    // Console-only logging with env-driven level
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = match server::AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error=%e, "Failed to load config");
            std::process::exit(2);
        }
    };

    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "data/app.db".into());
    // Ensure data dir exists when using default
    if let Some(parent) = std::path::Path::new(&db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        let _ = std::fs::create_dir_all(parent);
    }
    let store = match storage::Store::connect_sqlite(&db_path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error=%e, path=%db_path, "Failed to connect DB");
            std::process::exit(3);
        }
    };

    let (mailer, mail_worker) = match mail::from_config(&config.mail) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error=%e, "Failed to set up mail transport");
            std::process::exit(2);
        }
    };
    let push = match PushSender::from_config(config.push.as_ref(), store.clone()) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error=%e, "Failed to set up push sender");
            std::process::exit(2);
        }
    };
    if push.is_none() {
        tracing::info!("push: disabled");
    }

    let maintenance = match Maintenance::from_config(
        &config,
        store,
        Arc::new(mockable::DefaultClock),
        Arc::new(LogSink),
        mailer,
        push,
    ) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::error!(error=%e, "Invalid schedule");
            std::process::exit(2);
        }
    };

    match args.command {
        Some(cli::Command::Run { task }) => {
            let code = match maintenance.run_task(task).await {
                Ok(TaskOutcome::Completed(summary)) => {
                    println!("{task}: {summary}");
                    0
                }
                Ok(TaskOutcome::Skipped(reason)) => {
                    println!("{task}: skipped ({reason:?})");
                    0
                }
                Err(e) => {
                    tracing::error!(task=%task, error=%e, "Task failed");
                    1
                }
            };
            // Dropping the transports closes the mail queue so the worker drains.
            drop(maintenance);
            if let Some(worker) = mail_worker {
                let _ = worker.await;
            }
            std::process::exit(code);
        }
        Some(cli::Command::Heartbeat) => match maintenance.last_heartbeat().await {
            Ok(Some(at)) => println!("{at}"),
            Ok(None) => {
                eprintln!("no heartbeat within TTL");
                std::process::exit(1);
            }
            Err(e) => {
                tracing::error!(error=%e, "Failed to read heartbeat");
                std::process::exit(3);
            }
        },
        None => serve(config.listen_port, maintenance).await,
    }
}

async fn serve(listen_port: Option<u16>, maintenance: Arc<Maintenance>) {
    // Decide listen port: env PORT overrides config.listen_port, default 5151
    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .or(listen_port)
        .unwrap_or(5151);

    let shutdown_token = CancellationToken::new();
    let app = server::router(server::AppState::new(maintenance.clone()));

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    tracing::info!(%addr, "Starting server");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error=%e, %addr, "Failed to bind listener");
            std::process::exit(4);
        }
    };

    let mut scheduler_task = tokio::spawn(maintenance.run(shutdown_token.clone()));
    let server_token = shutdown_token.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown: initiating graceful stop");
    shutdown_token.cancel();
    match tokio::time::timeout(std::time::Duration::from_secs(3), &mut server_task).await {
        Ok(join_res) => match join_res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(%err, "server error"),
            Err(e) => tracing::error!(error=%e, "server task join error"),
        },
        Err(_) => {
            tracing::warn!("shutdown: forcing server abort due to timeout");
            server_task.abort();
        }
    }
    // In-flight maintenance runs get longer; their locks expire on their own.
    if tokio::time::timeout(std::time::Duration::from_secs(30), &mut scheduler_task)
        .await
        .is_err()
    {
        tracing::warn!("shutdown: abandoning in-flight maintenance runs");
        scheduler_task.abort();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(i), Ok(t)) => (i, t),
            _ => {
                tracing::warn!("shutdown: unix signals unavailable, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("shutdown: received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("shutdown: received SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown: received Ctrl+C");
    }
}
