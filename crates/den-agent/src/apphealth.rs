//! Workspace app health reporter
//!
//! Probes each app's healthcheck URL at its configured interval and posts
//! transitions to the control plane. One reporter runs per supervisor
//! iteration, scoped to that iteration's cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use den_core::client::ControlPlane;
use den_core::types::{AppHealth, PostAppHealthsRequest, WorkspaceApp};

/// Cap on a single healthcheck probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often accumulated transitions are flushed to the control plane.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Health after one more probe result.
fn next_health(ok: bool, failures: u32, threshold: u32) -> AppHealth {
    if ok {
        AppHealth::Healthy
    } else if failures >= threshold.max(1) {
        AppHealth::Unhealthy
    } else {
        AppHealth::Initializing
    }
}

pub(crate) async fn run(
    scope: CancellationToken,
    apps: Vec<WorkspaceApp>,
    client: Arc<dyn ControlPlane>,
    tracker: TaskTracker,
) {
    let monitored: Vec<WorkspaceApp> = apps
        .into_iter()
        .filter(|app| app.health != AppHealth::Disabled && app.healthcheck.is_some())
        .collect();
    if monitored.is_empty() {
        return;
    }

    let healths: Arc<Mutex<HashMap<String, AppHealth>>> = Arc::new(Mutex::new(
        monitored
            .iter()
            .map(|app| (app.name.clone(), app.health))
            .collect(),
    ));
    let dirty = Arc::new(tokio::sync::Notify::new());

    let http = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(http) => http,
        Err(err) => {
            tracing::error!(error = %err, "build app health client");
            return;
        }
    };

    for app in monitored {
        let Some(healthcheck) = app.healthcheck.clone() else {
            continue;
        };
        let healths = Arc::clone(&healths);
        let dirty = Arc::clone(&dirty);
        let http = http.clone();
        let scope = scope.clone();

        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(healthcheck.interval.max(Duration::from_secs(1)));
            let mut failures: u32 = 0;
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let ok = match http.get(&healthcheck.url).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(_) => false,
                };
                failures = if ok { 0 } else { failures + 1 };

                let health = next_health(ok, failures, healthcheck.threshold);
                if health == AppHealth::Initializing {
                    continue;
                }
                let mut healths = healths.lock().await;
                if healths.get(&app.name) != Some(&health) {
                    tracing::debug!(app = %app.name, health = ?health, "app health changed");
                    healths.insert(app.name.clone(), health);
                    dirty.notify_one();
                }
            }
        });
    }

    // Flush loop: batch transitions so a flapping app doesn't hammer the
    // control plane.
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            _ = dirty.notified() => {}
        }
        flush.tick().await;

        let snapshot = healths.lock().await.clone();
        let request = PostAppHealthsRequest { healths: snapshot };
        if let Err(err) = client.post_app_health(request).await {
            tracing::error!(error = %err, "post app health");
        }
    }
}
