mod bitrix;
mod connector;
mod error;
mod rate_limit;
mod reconcile;
mod retry;
mod scheduler;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay_config::{init_tracing, AppConfig};
use relay_db::customers::mssql_repository::MssqlCustomerFeed;
use relay_db::sync::pg_repository::PgSyncRepository;
use relay_db::sync::repositories::SyncWatermarkRepository;

use crate::bitrix::{BitrixClient, BitrixClientConfig};
use crate::connector::TargetError;
use crate::reconcile::Reconciler;
use crate::scheduler::{SchedulerConfig, SyncScheduler};

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env().expect("failed to load configuration");
    init_tracing(&config.log_level);

    tracing::info!(service = "relay-sync", "starting");

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "refusing to start");
        std::process::exit(1);
    }

    tracing::info!(
        client_code = %config.bitrix.client_code,
        companies = config.companies.len(),
        interval_minutes = config.sync.interval_minutes,
        "configuration loaded"
    );

    let state_pool = relay_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to state database");
    let state_repo = PgSyncRepository::new(state_pool);
    state_repo
        .ensure_schema()
        .await
        .expect("failed to prepare sync_watermarks table");

    let io_timeout = Duration::from_secs(config.sync.io_timeout_secs);

    let bitrix = Arc::new(
        BitrixClient::new(BitrixClientConfig::from(&config.bitrix))
            .expect("failed to create bitrix24 client"),
    );
    match bitrix.check_connection().await {
        Ok(()) => {}
        Err(TargetError::AuthFailure(message)) => {
            tracing::error!(alert = true, error = %message, "bitrix24 rejected the webhook credentials");
        }
        Err(e) => tracing::warn!(error = %e, "bitrix24 not reachable yet"),
    }

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    for mapping in &config.companies {
        let feed = MssqlCustomerFeed::new(&config.source_db, mapping.source_company.clone(), io_timeout);
        match feed.count_customers().await {
            Ok(total) => tracing::info!(company = %feed.company(), total, "source database reachable"),
            Err(e) => tracing::warn!(company = %feed.company(), error = %e, "source database not reachable yet"),
        }

        let reconciler = Reconciler::new(
            bitrix.clone(),
            &mapping.source_company,
            config.sync.source_label.clone(),
        );
        let scheduler_config =
            SchedulerConfig::for_mapping(&config.sync, reconciler.integration_name(), mapping);

        match state_repo
            .get(&scheduler_config.entity_type, &scheduler_config.integration)
            .await
        {
            Ok(Some(row)) => tracing::info!(
                integration = %row.integration,
                last_modified_at = ?row.last_modified_at,
                cursor = ?row.cursor_value,
                last_status = %row.status,
                "resuming from stored watermark"
            ),
            Ok(None) => tracing::info!(
                integration = %scheduler_config.integration,
                lookback_hours = config.sync.lookback_hours,
                "no stored watermark, starting from lookback window"
            ),
            Err(e) => tracing::warn!(error = %e, "could not read stored watermark"),
        }

        let scheduler = SyncScheduler::new(scheduler_config, feed, state_repo.clone(), reconciler);
        let integration = scheduler.config().integration.clone();
        let (handle, task) = scheduler.spawn(shutdown.child_token());
        workers.push((integration, handle, task));
    }

    #[cfg(unix)]
    {
        let handles: Vec<_> = workers.iter().map(|(_, handle, _)| handle.clone()).collect();
        tokio::spawn(control_on_signals(handles));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested, waiting for running cycles to stop");
    shutdown.cancel();

    for (integration, handle, task) in workers {
        if let Err(e) = task.await {
            tracing::error!(integration = %integration, error = %e, "scheduler task panicked");
        }
        let status = handle.status();
        tracing::info!(
            integration = %integration,
            state = ?status.state,
            cycles = status.cycles_completed,
            next_run_at = ?status.next_run_at,
            last_watermark = ?status.last_result.and_then(|r| r.watermark),
            "scheduler stopped"
        );
    }
}

/// `kill -USR1` runs a cycle for every mapping right away. `kill -USR2` stops
/// every mapping, or starts them again when they are stopped.
#[cfg(unix)]
async fn control_on_signals(handles: Vec<crate::scheduler::SchedulerHandle>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut usr1, mut usr2) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(usr1), Ok(usr2)) => (usr1, usr2),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "signal control unavailable");
            return;
        }
    };

    loop {
        tokio::select! {
            received = usr1.recv() => {
                if received.is_none() {
                    break;
                }
                tracing::info!("SIGUSR1 received, triggering sync");
                for handle in &handles {
                    handle.trigger();
                }
            }
            received = usr2.recv() => {
                if received.is_none() {
                    break;
                }
                for handle in &handles {
                    if handle.is_started() {
                        handle.stop();
                    } else {
                        handle.start();
                    }
                }
                tracing::info!(
                    started = handles.iter().filter(|h| h.is_started()).count(),
                    stopped = handles.iter().filter(|h| !h.is_started()).count(),
                    "SIGUSR2 received, toggled schedulers"
                );
            }
        }
    }
}
