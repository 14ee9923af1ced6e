//! Shared application state for the control plane (C8).

use std::path::PathBuf;
use std::sync::Arc;

use core_engine::eventlog::EventLog;
use core_engine::executor::ExecutionController;
use core_engine::history::HistoryStore;
use core_engine::notify::SinkRegistry;
use core_engine::path_policy::PathPolicy;
use core_engine::registry::RunRegistry;
use core_engine::scheduler::Scheduler;
use core_engine::alerts::AlertEvaluator;
use core_engine::config::RunnerConfig;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RunRegistry>,
    pub history: Arc<HistoryStore>,
    pub events: Arc<EventLog>,
    pub scheduler: Arc<Scheduler>,
    pub controller: Arc<ExecutionController>,
    pub alert_evaluator: Arc<AlertEvaluator>,
    pub config: Arc<RunnerConfig>,
    pub path_policy: PathPolicy,
    pub uploads_dir: PathBuf,
}

impl AppState {
    pub fn new(
        registry: RunRegistry,
        history: HistoryStore,
        path_policy: PathPolicy,
        config: RunnerConfig,
        uploads_dir: PathBuf,
    ) -> Self {
        let mut sinks = SinkRegistry::new();
        sinks.register(Box::new(core_engine::notify::StdoutSink));
        if let Some(slack) = &config.notifications.slack {
            sinks.register(Box::new(core_engine::notify::WebhookSink::new(
                "slack",
                slack.webhook_url.clone(),
            )));
        }

        Self {
            registry: Arc::new(registry),
            history: Arc::new(history),
            events: Arc::new(EventLog::new()),
            scheduler: Arc::new(Scheduler::new()),
            controller: Arc::new(ExecutionController::new(path_policy.clone())),
            alert_evaluator: Arc::new(AlertEvaluator::new(sinks)),
            config: Arc::new(config),
            path_policy,
            uploads_dir,
        }
    }
}
