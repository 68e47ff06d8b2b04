use anyhow::Context;
use fleetsync_core::config::SyncConfig;
use fleetsync_core::coordination::{
    ForeignKeyServiceDependencyMap, OrchestratorReadiness, PrerequisiteCoordinator,
    ServiceAwaiter, ServicePauseRegistry,
};
use fleetsync_core::entities::{Device, Diagnostic, FaultData, LogRecord, StatusData};
use fleetsync_core::environment::{EnvironmentIdentity, EnvironmentValidator};
use fleetsync_core::ingest::{
    DatabaseMaintenanceService, FactIngestService, Orchestrator, PipelineFactory,
};
use fleetsync_core::models::ServiceKind;
use fleetsync_core::pipeline::{
    DeviceFilterer, DiagnosticFilterer, fault_data_pipeline, log_record_pipeline,
    status_data_pipeline,
};
use fleetsync_core::reference::{ReferenceCacheService, ReferenceObjectCacher};
use fleetsync_core::state::{ConnectivityMonitor, StateMachine};
use fleetsync_core::store::SqliteSyncStore;
use fleetsync_core::traits::{FeedSource, LivenessProbe, ReferenceSource, ServiceTracker};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Upstream collaborators for every feed.
pub struct Upstream {
    pub probe: Arc<dyn LivenessProbe>,
    pub devices: Arc<dyn ReferenceSource<Device>>,
    pub diagnostics: Arc<dyn ReferenceSource<Diagnostic>>,
    pub log_records: Arc<dyn FeedSource<LogRecord>>,
    pub status_data: Arc<dyn FeedSource<StatusData>>,
    pub fault_data: Arc<dyn FeedSource<FaultData>>,
}

type TaskResult = (&'static str, fleetsync_core::Result<()>);

/// Wire the services `config` hosts against `store` and `upstream`, then run until `cancel`
/// fires or a service fails fatally. A fatal failure cancels every other task and is returned.
///
/// Reference caches are always kept in memory for the fact pipelines. Their service loop,
/// which propagates to the database, only runs where the cache service is hosted.
#[tracing::instrument(level = "info", skip_all)]
pub async fn run(
    config: SyncConfig,
    store: Arc<SqliteSyncStore>,
    upstream: Upstream,
    identity: EnvironmentIdentity,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let tracker: Arc<dyn ServiceTracker> = store.clone();
    let state = Arc::new(StateMachine::new(store.clone(), upstream.probe.clone()));
    let identity = Arc::new(identity);
    let readiness = OrchestratorReadiness::new();
    let coordinator = Arc::new(PrerequisiteCoordinator::new(
        tracker.clone(),
        readiness.clone(),
        config.coordination.clone(),
    ));
    let pauses = Arc::new(ServicePauseRegistry::new());
    let fk_map = Arc::new(
        ForeignKeyServiceDependencyMap::new(config.foreign_key_dependencies.clone())
            .context("foreign key dependency map")?,
    );
    let awaiter = |service: ServiceKind| {
        Arc::new(ServiceAwaiter::new(
            service,
            state.clone(),
            pauses.clone(),
            coordinator.clone(),
            config.pauses_for_maintenance(service),
        ))
    };

    let orchestrator = Orchestrator::new(
        identity.clone(),
        tracker.clone(),
        state.clone(),
        readiness,
        config.hosted_services.iter().copied(),
        config.disable_machine_name_validation,
    );
    orchestrator
        .initialize(&cancel)
        .await
        .context("orchestrator initialization")?;

    let device_cacher = Arc::new(ReferenceObjectCacher::new(
        ServiceKind::DeviceCache,
        upstream.devices,
        config.device_cache.clone(),
    ));
    let diagnostic_cacher = Arc::new(ReferenceObjectCacher::new(
        ServiceKind::DiagnosticCache,
        upstream.diagnostics,
        config.diagnostic_cache.clone(),
    ));

    let mut tasks: JoinSet<TaskResult> = JoinSet::new();

    {
        let cancel = cancel.clone();
        tasks.spawn(async move { ("orchestrator", orchestrator.run(cancel).await) });
    }
    {
        let monitor = ConnectivityMonitor::new(state.clone());
        let cancel = cancel.clone();
        tasks.spawn(async move {
            monitor.run(cancel).await;
            ("connectivity_monitor", Ok(()))
        });
    }
    for service in config.hosted_services.iter().copied() {
        let validator = EnvironmentValidator::new(
            identity.clone(),
            tracker.clone(),
            service,
            config.disable_machine_name_validation,
        );
        let interval = config.validation_interval;
        let cancel = cancel.clone();
        tasks.spawn(async move {
            (
                "environment_validator",
                validator.run_periodic(interval, cancel).await,
            )
        });
    }

    if config.hosts(ServiceKind::DeviceCache) {
        let svc = ReferenceCacheService::new(
            device_cacher.clone(),
            store.clone(),
            tracker.clone(),
            awaiter(ServiceKind::DeviceCache),
        );
        let cancel = cancel.clone();
        tasks.spawn(async move { ("device_cache", svc.run(cancel).await) });
    }
    if config.hosts(ServiceKind::DiagnosticCache) {
        let svc = ReferenceCacheService::new(
            diagnostic_cacher.clone(),
            store.clone(),
            tracker.clone(),
            awaiter(ServiceKind::DiagnosticCache),
        );
        let cancel = cancel.clone();
        tasks.spawn(async move { ("diagnostic_cache", svc.run(cancel).await) });
    }

    if config.hosts(ServiceKind::LogRecordFeed) {
        let devices = device_cacher.clone();
        let filters = config.filters.clone();
        let sampling = config.log_record_sampling.clone();
        let factory: PipelineFactory<LogRecord> = Box::new(move || {
            log_record_pipeline(
                DeviceFilterer::build(&filters.devices_to_track, &devices),
                &sampling,
            )
        });
        let mut svc = FactIngestService::new(
            ServiceKind::LogRecordFeed,
            upstream.log_records,
            config.log_record_feed.clone(),
            store.clone(),
            tracker.clone(),
            awaiter(ServiceKind::LogRecordFeed),
        )
        .with_fk_map(fk_map.clone())
        .with_prerequisites(vec![ServiceKind::DeviceCache])
        .with_pipeline(factory);
        let cancel = cancel.clone();
        tasks.spawn(async move { ("log_record_feed", svc.run(cancel).await) });
    }
    if config.hosts(ServiceKind::StatusDataFeed) {
        let devices = device_cacher.clone();
        let diagnostics = diagnostic_cacher.clone();
        let filters = config.filters.clone();
        let sampling = config.status_data_sampling.clone();
        let factory: PipelineFactory<StatusData> = Box::new(move || {
            status_data_pipeline(
                DeviceFilterer::build(&filters.devices_to_track, &devices),
                DiagnosticFilterer::build(
                    &filters.diagnostics_to_track,
                    filters.exclude_diagnostics_to_track,
                    &diagnostics,
                ),
                &sampling,
            )
        });
        let mut svc = FactIngestService::new(
            ServiceKind::StatusDataFeed,
            upstream.status_data,
            config.status_data_feed.clone(),
            store.clone(),
            tracker.clone(),
            awaiter(ServiceKind::StatusDataFeed),
        )
        .with_fk_map(fk_map.clone())
        .with_prerequisites(vec![ServiceKind::DeviceCache, ServiceKind::DiagnosticCache])
        .with_pipeline(factory);
        let cancel = cancel.clone();
        tasks.spawn(async move { ("status_data_feed", svc.run(cancel).await) });
    }
    if config.hosts(ServiceKind::FaultDataFeed) {
        let devices = device_cacher.clone();
        let diagnostics = diagnostic_cacher.clone();
        let filters = config.filters.clone();
        let factory: PipelineFactory<FaultData> = Box::new(move || {
            fault_data_pipeline(
                DeviceFilterer::build(&filters.devices_to_track, &devices),
                DiagnosticFilterer::build(
                    &filters.diagnostics_to_track,
                    filters.exclude_diagnostics_to_track,
                    &diagnostics,
                ),
            )
        });
        let mut svc = FactIngestService::new(
            ServiceKind::FaultDataFeed,
            upstream.fault_data,
            config.fault_data_feed.clone(),
            store.clone(),
            tracker.clone(),
            awaiter(ServiceKind::FaultDataFeed),
        )
        .with_fk_map(fk_map.clone())
        .with_prerequisites(vec![ServiceKind::DeviceCache, ServiceKind::DiagnosticCache])
        .with_pipeline(factory);
        let cancel = cancel.clone();
        tasks.spawn(async move { ("fault_data_feed", svc.run(cancel).await) });
    }

    if config.hosts(ServiceKind::DatabaseMaintenance) {
        let pausing: Vec<ServiceKind> = config
            .pause_for_maintenance
            .iter()
            .copied()
            .filter(|s| config.hosts(*s))
            .collect();
        let svc = DatabaseMaintenanceService::new(
            state.clone(),
            store.clone(),
            tracker.clone(),
            pauses.clone(),
            pausing,
            config.maintenance_interval,
        );
        let cancel = cancel.clone();
        tasks.spawn(async move { ("database_maintenance", svc.run(cancel).await) });
    }

    tracing::info!(tasks = tasks.len(), "fleetsync services started");
    supervise(tasks, cancel).await
}

/// Join every task. The first fatal error cancels the rest and is returned once all exit.
async fn supervise(
    mut tasks: JoinSet<TaskResult>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut first_error: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((task, Err(e))) => {
                tracing::error!(
                    task,
                    error = %e,
                    fatal = e.is_fatal(),
                    "service stopped with an error"
                );
                cancel.cancel();
                first_error.get_or_insert_with(|| anyhow::Error::new(e).context(task));
            }
            Err(e) => {
                tracing::error!(error = %e, "service task panicked");
                cancel.cancel();
                first_error.get_or_insert_with(|| anyhow::Error::new(e).context("task join"));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => {
            tracing::info!("fleetsync services stopped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev_backends::SimulatedFleet;
    use chrono::Utc;
    use fleetsync_core::config::FeedStartOption;
    use fleetsync_core::environment::AdapterVersion;
    use fleetsync_core::models::ServiceTrackingRecord;
    use std::time::Duration;

    fn identity(machine: &str) -> EnvironmentIdentity {
        EnvironmentIdentity::new("fleetsync", machine, AdapterVersion::new(0, 3, 0))
    }

    #[tokio::test]
    async fn syncs_simulated_fleet_and_stops_on_cancel() {
        let store = Arc::new(SqliteSyncStore::in_memory().await.unwrap());
        let fleet = SimulatedFleet::new(2, Utc::now());
        fleet.emit(0, Utc::now()).await;
        fleet.emit(1, Utc::now()).await;

        let mut config = SyncConfig::default();
        for feed in [
            &mut config.log_record_feed,
            &mut config.status_data_feed,
            &mut config.fault_data_feed,
        ] {
            feed.polling_interval_seconds = 1;
            feed.start_option = FeedStartOption::FeedVersion;
        }
        config.coordination.prerequisite_check_interval = Duration::from_millis(50);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            config,
            store.clone(),
            fleet.upstream(),
            identity("host-a"),
            cancel.clone(),
        ));

        let mut synced = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if store.count("log_records").await.unwrap() == 4
                && store.count("status_data").await.unwrap() == 12
            {
                synced = true;
                break;
            }
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(synced);
        assert_eq!(store.count("devices").await.unwrap(), 2);
        let records = store.tracking_records().await.unwrap();
        assert_eq!(records.len(), 7);
        assert!(
            records
                .iter()
                .all(|r| r.adapter_machine_name.as_deref() == Some("host-a"))
        );
    }

    #[tokio::test]
    async fn runs_only_hosted_services() {
        let store = Arc::new(SqliteSyncStore::in_memory().await.unwrap());
        // The feeds belong to another machine.
        for service in [ServiceKind::LogRecordFeed, ServiceKind::StatusDataFeed] {
            store.register_service(service, Utc::now()).await.unwrap();
            store
                .stamp_identity(service, &AdapterVersion::new(0, 3, 0), "host-b")
                .await
                .unwrap();
        }
        let fleet = SimulatedFleet::new(2, Utc::now());
        fleet.emit(0, Utc::now()).await;

        let mut config = SyncConfig::default();
        config.hosted_services = [
            ServiceKind::Orchestrator,
            ServiceKind::DeviceCache,
            ServiceKind::DiagnosticCache,
        ]
        .into_iter()
        .collect();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            config,
            store.clone(),
            fleet.upstream(),
            identity("host-a"),
            cancel.clone(),
        ));
        let mut cached = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if store.count("devices").await.unwrap() == 2
                && store.count("diagnostics").await.unwrap() == 3
            {
                cached = true;
                break;
            }
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(cached);
        assert_eq!(store.count("log_records").await.unwrap(), 0);
        let records = store.tracking_records().await.unwrap();
        assert_eq!(records.len(), 5);
        let machine = |service: ServiceKind| {
            records
                .iter()
                .find(|r| r.service == service)
                .and_then(|r| r.adapter_machine_name.clone())
        };
        assert_eq!(machine(ServiceKind::DeviceCache).as_deref(), Some("host-a"));
        assert_eq!(machine(ServiceKind::LogRecordFeed).as_deref(), Some("host-b"));
        assert_eq!(machine(ServiceKind::FaultDataFeed), None);
    }

    #[tokio::test]
    async fn newer_logged_version_is_fatal() {
        let store = Arc::new(SqliteSyncStore::in_memory().await.unwrap());
        store
            .register_service(ServiceKind::LogRecordFeed, Utc::now())
            .await
            .unwrap();
        store
            .stamp_identity(ServiceKind::LogRecordFeed, &AdapterVersion::new(9, 0, 0), "host-z")
            .await
            .unwrap();
        let fleet = SimulatedFleet::new(1, Utc::now());

        let err = run(
            SyncConfig::default(),
            store.clone(),
            fleet.upstream(),
            identity("host-a"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        let core = err
            .downcast_ref::<fleetsync_core::Error>()
            .expect("core error");
        assert!(core.is_fatal());

        let record: ServiceTrackingRecord = store
            .tracking_record(ServiceKind::LogRecordFeed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.adapter_machine_name.as_deref(), Some("host-z"));
    }
}
