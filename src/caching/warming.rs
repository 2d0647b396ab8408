//! # Cache Warming
//!
//! Background scheduler that re-populates hot keys on a fixed interval:
//! feature flags, the global system config and per-workspace settings. Each
//! key is warmed independently, so one failing source or write never stops
//! the rest of the run. Runs are idempotent: the same source data always
//! produces the same cache state.
//!
//! Key layout:
//! - `feature_flags:flag:{name}` and `feature_flags:all`
//! - `workspace_settings:system:config`
//! - `workspace_settings:workspace:{id}`

use super::{CacheManager, CacheNamespace};
use crate::core::config::WarmingConfig;
use crate::core::error::{EdgeError, EdgeResult};
use crate::observability::metrics as metric_names;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ALL_FLAGS_KEY: &str = "all";
pub const SYSTEM_CONFIG_KEY: &str = "system:config";

pub fn flag_key(name: &str) -> String {
    format!("flag:{}", name)
}

pub fn workspace_key(workspace_id: &str) -> String {
    format!("workspace:{}", workspace_id)
}

/// Where warmed values come from
#[async_trait]
pub trait WarmSource: Send + Sync {
    async fn feature_flags(&self) -> EdgeResult<BTreeMap<String, Value>>;

    async fn system_config(&self) -> EdgeResult<BTreeMap<String, Value>>;

    /// Workspaces warmed on every scheduled run
    async fn workspace_ids(&self) -> EdgeResult<Vec<String>>;

    async fn workspace_settings(&self, workspace_id: &str) -> EdgeResult<Option<Value>>;
}

/// Warm source backed by the `warming` config section
#[derive(Debug, Clone, Default)]
pub struct StaticWarmSource {
    feature_flags: BTreeMap<String, Value>,
    system_config: BTreeMap<String, Value>,
    workspaces: BTreeMap<String, Value>,
}

impl StaticWarmSource {
    pub fn from_config(config: &WarmingConfig) -> Self {
        Self {
            feature_flags: config.feature_flags.clone(),
            system_config: config.system_config.clone(),
            workspaces: config.workspaces.clone(),
        }
    }
}

#[async_trait]
impl WarmSource for StaticWarmSource {
    async fn feature_flags(&self) -> EdgeResult<BTreeMap<String, Value>> {
        Ok(self.feature_flags.clone())
    }

    async fn system_config(&self) -> EdgeResult<BTreeMap<String, Value>> {
        Ok(self.system_config.clone())
    }

    async fn workspace_ids(&self) -> EdgeResult<Vec<String>> {
        Ok(self.workspaces.keys().cloned().collect())
    }

    async fn workspace_settings(&self, workspace_id: &str) -> EdgeResult<Option<Value>> {
        Ok(self.workspaces.get(workspace_id).cloned())
    }
}

/// Outcome of one warming run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub keys_warmed: u64,

    /// One entry per failed step, e.g. `feature_flags:flag:beta`
    pub failures: Vec<String>,
}

impl WarmReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic cache warmer
pub struct CacheWarmer {
    cache: Arc<CacheManager>,
    source: Arc<dyn WarmSource>,
    interval: Duration,
    task: Mutex<Option<RunningTask>>,
    last_report: RwLock<Option<WarmReport>>,
}

impl CacheWarmer {
    pub fn new(cache: Arc<CacheManager>, source: Arc<dyn WarmSource>, interval: Duration) -> Self {
        Self {
            cache,
            source,
            interval,
            task: Mutex::new(None),
            last_report: RwLock::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.handle.is_finished())
    }

    pub fn last_report(&self) -> Option<WarmReport> {
        self.last_report.read().clone()
    }

    /// Start the background loop. Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().map_or(false, |t| !t.handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let warmer = Arc::clone(self);
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(warmer.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        warmer.run_once().await;
                    }
                }
            }
            debug!("Cache warming loop exited");
        });

        *task = Some(RunningTask { token, handle });
        info!(interval_secs = self.interval.as_secs(), "Cache warming scheduler started");
        true
    }

    /// Stop the background loop and wait for it to exit. Returns `false` if
    /// it was not running.
    pub async fn stop(&self) -> bool {
        let running = self.task.lock().take();
        match running {
            Some(RunningTask { token, handle }) => {
                token.cancel();
                if let Err(e) = handle.await {
                    warn!(error = %e, "Cache warming task ended abnormally");
                }
                info!("Cache warming scheduler stopped");
                true
            }
            None => false,
        }
    }

    async fn warm_key(
        &self,
        namespace: CacheNamespace,
        key: &str,
        value: &Value,
        report: &mut WarmReport,
    ) {
        match self.cache.set(key, value, None, namespace).await {
            Ok(true) => report.keys_warmed += 1,
            Ok(false) => report.failures.push(format!("{}:{}", namespace, key)),
            Err(e) => {
                warn!(namespace = namespace.as_str(), key, error = %e, "Warming step failed");
                report.failures.push(format!("{}:{}", namespace, key));
            }
        }
    }

    /// Warm every hot key once
    pub async fn run_once(&self) -> WarmReport {
        let started = Instant::now();
        let mut report = WarmReport {
            started_at: Some(self.cache.clock().now()),
            ..Default::default()
        };

        match self.source.feature_flags().await {
            Ok(flags) => {
                for (name, value) in &flags {
                    self.warm_key(CacheNamespace::FeatureFlags, &flag_key(name), value, &mut report)
                        .await;
                }
                let all = Value::Object(flags.into_iter().collect());
                self.warm_key(CacheNamespace::FeatureFlags, ALL_FLAGS_KEY, &all, &mut report)
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Could not load feature flags for warming");
                report.failures.push("source:feature_flags".to_string());
            }
        }

        match self.source.system_config().await {
            Ok(system) => {
                let value = Value::Object(system.into_iter().collect());
                self.warm_key(CacheNamespace::WorkspaceSettings, SYSTEM_CONFIG_KEY, &value, &mut report)
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Could not load system config for warming");
                report.failures.push("source:system_config".to_string());
            }
        }

        match self.source.workspace_ids().await {
            Ok(ids) => {
                for id in ids {
                    match self.source.workspace_settings(&id).await {
                        Ok(Some(settings)) => {
                            self.warm_key(CacheNamespace::WorkspaceSettings, &workspace_key(&id), &settings, &mut report)
                                .await;
                        }
                        Ok(None) => debug!(workspace_id = %id, "No settings to warm"),
                        Err(e) => {
                            warn!(workspace_id = %id, error = %e, "Could not load workspace settings for warming");
                            report.failures.push(format!("source:workspace:{}", id));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not list workspaces for warming");
                report.failures.push("source:workspaces".to_string());
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        counter!(metric_names::CACHE_WARMING_RUNS_TOTAL).increment(1);
        if !report.is_clean() {
            counter!(metric_names::CACHE_WARMING_FAILURES_TOTAL).increment(report.failures.len() as u64);
        }
        info!(
            keys_warmed = report.keys_warmed,
            failures = report.failures.len(),
            duration_ms = report.duration_ms,
            "Cache warming run finished"
        );

        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Warm one workspace's settings on demand
    pub async fn warm_workspace(&self, workspace_id: &str) -> EdgeResult<WarmReport> {
        let started = Instant::now();
        let settings = self
            .source
            .workspace_settings(workspace_id)
            .await?
            .ok_or_else(|| EdgeError::not_found(format!("workspace settings for '{}'", workspace_id)))?;

        let mut report = WarmReport {
            started_at: Some(self.cache.clock().now()),
            ..Default::default()
        };
        self.warm_key(
            CacheNamespace::WorkspaceSettings,
            &workspace_key(workspace_id),
            &settings,
            &mut report,
        )
        .await;
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(workspace_id, warmed = report.keys_warmed, "On-demand workspace warming finished");
        Ok(report)
    }
}
