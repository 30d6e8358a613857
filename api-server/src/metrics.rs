//! Line-oriented metric exposition.

use axum::extract::State;
use engram_resilience::DegradationLevel;

use crate::state::AppState;

fn metric(
    lines: &mut Vec<String>,
    name: &str,
    value: impl std::fmt::Display,
    help: &str,
    kind: &str,
    labels: Option<(&str, &str)>,
) {
    lines.push(format!("# HELP {name} {help}"));
    lines.push(format!("# TYPE {name} {kind}"));
    match labels {
        Some((key, label)) => lines.push(format!("{name}{{{key}=\"{label}\"}} {value}")),
        None => lines.push(format!("{name} {value}")),
    }
}

pub async fn metrics(State(state): State<AppState>) -> String {
    let mut lines = Vec::new();

    metric(
        &mut lines,
        "engram_uptime_seconds",
        format!("{:.1}", state.uptime_seconds()),
        "Seconds since the service started",
        "gauge",
        None,
    );

    let (total, processed, unprocessed) = state.sessions.counts();
    metric(&mut lines, "engram_sessions_total", total, "Total sessions saved", "counter", None);
    metric(
        &mut lines,
        "engram_sessions_processed",
        processed,
        "Sessions processed by the worker",
        "counter",
        None,
    );
    metric(
        &mut lines,
        "engram_sessions_unprocessed",
        unprocessed,
        "Sessions awaiting processing",
        "gauge",
        None,
    );

    let worker = state.worker.status();
    metric(
        &mut lines,
        "engram_worker_queue_depth",
        worker.queue_depth,
        "Worker queue depth",
        "gauge",
        None,
    );
    metric(
        &mut lines,
        "engram_worker_processed_total",
        worker.processed,
        "Sessions processed",
        "counter",
        None,
    );
    metric(
        &mut lines,
        "engram_worker_failed_total",
        worker.failed,
        "Sessions failed",
        "counter",
        None,
    );
    metric(
        &mut lines,
        "engram_worker_skipped_total",
        worker.skipped,
        "Sessions skipped",
        "counter",
        None,
    );

    if state.archive.is_connected().await {
        for (collection, count) in state.archive.collection_stats().await {
            metric(
                &mut lines,
                "engram_archive_documents",
                count,
                "Documents in an archive collection",
                "gauge",
                Some(("collection", &collection)),
            );
        }
    }

    metric(
        &mut lines,
        "engram_llm_calls_total",
        state.model.call_count(),
        "Total model API calls",
        "counter",
        None,
    );

    let level = state.degradation.level();
    let level_value = match level {
        DegradationLevel::Full => 0,
        DegradationLevel::Partial => 1,
        DegradationLevel::Minimal => 2,
        DegradationLevel::Offline => 3,
    };
    metric(
        &mut lines,
        "engram_degradation_level",
        level_value,
        "Degradation level (0=full, 1=partial, 2=minimal, 3=offline)",
        "gauge",
        None,
    );

    if let Some(watcher) = &state.watcher {
        let stats = watcher.stats();
        metric(
            &mut lines,
            "engram_watcher_commits_total",
            stats.commits,
            "Commits created by the file watcher",
            "counter",
            None,
        );
        metric(
            &mut lines,
            "engram_watcher_files_tracked_total",
            stats.files_tracked,
            "Files committed by the file watcher",
            "counter",
            None,
        );
    }

    metric(
        &mut lines,
        "engram_learning_mode",
        if state.learning_mode() { 1 } else { 0 },
        "Learning mode enabled (1=yes)",
        "gauge",
        None,
    );
    metric(
        &mut lines,
        "engram_context_accessible",
        if state.context.accessible() { 1 } else { 0 },
        "Master-context store reachable (1=yes)",
        "gauge",
        None,
    );

    lines.join("\n") + "\n"
}
