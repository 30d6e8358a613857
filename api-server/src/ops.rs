//! Core ingest operations shared by the HTTP handlers and the watcher's
//! checkpoint sink.

use async_trait::async_trait;
use chrono::Utc;
use engram_archive::relevance;
use engram_config::resolve_collection_name;
use engram_model_client::ExtractedFields;
use engram_stores::{
    generate_session_id, truncate_for_model, SessionRecord, Significance,
};
use engram_watcher::{CheckpointSink, TranscriptCheckpoint};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::*;
use crate::state::AppState;

/// Thresholds for distance-gated retrieval.
const LOAD_THRESHOLD: f64 = 1.5;
const FAILURE_THRESHOLD: f64 = 1.2;
const SEARCH_THRESHOLD: f64 = 1.8;
const CORRECTION_THRESHOLD: f64 = 0.5;

const MASTER_UNAVAILABLE: &str = "[Context unavailable]";

fn clip_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn meta_value(metadata: &engram_archive::types::Metadata) -> Value {
    json!(metadata)
}

// --- load ---

pub async fn perform_load(state: &AppState, request: LoadRequest) -> LoadResponse {
    let session_id = generate_session_id();
    info!("load: session={session_id}, topic={:?}", request.topic);

    let (master_context, degraded, degraded_reason) = match state.context.read_master() {
        Some(master) => (master, false, None),
        None => (
            MASTER_UNAVAILABLE.to_string(),
            true,
            Some("master context not accessible".to_string()),
        ),
    };

    let mut archive_hits = Vec::new();
    let mut failure_warnings = Vec::new();
    let mut nudges = Vec::new();
    let mut conflicts = Vec::new();

    if state.archive.is_connected().await {
        if let Some(topic) = request.topic.as_deref().filter(|t| !t.is_empty()) {
            archive_hits = search_archive(state, topic, 5).await;
            failure_warnings = failure_warnings_for(state, topic, 3).await;
        }
        nudges = promotion_nudges(state, &master_context, 3).await;
        if !state.learning_mode() {
            nudges.extend(state.nudges.active_messages(5));
            conflicts = state
                .anomalies
                .get_active()
                .into_iter()
                .take(3)
                .map(|a| a.description)
                .collect();
        }
    }

    let archive_hits = enforce_budget(
        archive_hits,
        master_context.len(),
        state.config.budgets.max_load_response_chars,
        state.config.budgets.min_chars_per_hit,
    );

    LoadResponse {
        session_id,
        master_context,
        archive_hits,
        failure_warnings,
        nudges,
        conflicts,
        degraded,
        degraded_reason,
    }
}

async fn search_archive(state: &AppState, topic: &str, limit: usize) -> Vec<ArchiveHit> {
    let mut results = Vec::new();
    for collection in ["project_archive", "decisions", "sessions"] {
        match state.archive.search(collection, topic, limit, None).await {
            Ok(hits) => {
                for hit in hits {
                    let Some(distance) = hit.distance else { continue };
                    if distance < LOAD_THRESHOLD {
                        results.push(ArchiveHit {
                            collection: collection.to_string(),
                            content: clip_chars(&hit.content, 500),
                            metadata: meta_value(&hit.metadata),
                            relevance: (relevance(distance) * 1000.0).round() / 1000.0,
                        });
                    }
                }
            }
            Err(e) => warn!("load: archive search failed for {collection}: {e}"),
        }
    }
    results.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    results
}

async fn failure_warnings_for(state: &AppState, topic: &str, limit: usize) -> Vec<String> {
    match state.archive.search("failures", topic, limit, None).await {
        Ok(hits) => hits
            .into_iter()
            .filter(|h| h.distance.map(|d| d < FAILURE_THRESHOLD).unwrap_or(false))
            .map(|h| {
                let session = h.meta_str("session_id").unwrap_or("unknown").to_string();
                format!("[{session}] {}", clip_chars(&h.content, 200))
            })
            .collect(),
        Err(e) => {
            warn!("load: failure warning lookup failed: {e}");
            Vec::new()
        }
    }
}

/// Rule-based promotion: topics seen in >=3 of the last 10 sessions that
/// the master context does not mention.
async fn promotion_nudges(state: &AppState, master: &str, limit: usize) -> Vec<String> {
    let recent = state.archive.get_recent_sessions(10).await;
    if recent.len() < 3 {
        return Vec::new();
    }
    let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
    for session in &recent {
        let Some(topics) = session.metadata.get("topics").and_then(Value::as_str) else {
            continue;
        };
        for topic in topics.split(',') {
            let topic = topic.trim().to_lowercase();
            if !topic.is_empty() {
                *counts.entry(topic).or_insert(0) += 1;
            }
        }
    }
    let master_lower = master.to_lowercase();
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let mut nudges = Vec::new();
    for (topic, count) in ranked {
        if count >= 3 && !master_lower.contains(&topic) {
            nudges.push(format!(
                "Topic '{topic}' appeared in {count}/10 recent sessions but isn't in master context. Consider promoting."
            ));
            if nudges.len() >= limit {
                break;
            }
        }
    }
    nudges
}

/// Trim archive hits until master + hits fit the response budget. Hits
/// that cannot keep at least `min_per_hit` characters are dropped.
fn enforce_budget(
    hits: Vec<ArchiveHit>,
    master_len: usize,
    max_chars: usize,
    min_per_hit: usize,
) -> Vec<ArchiveHit> {
    let total: usize = master_len + hits.iter().map(|h| h.content.len()).sum::<usize>();
    if total <= max_chars {
        return hits;
    }
    let mut budget = max_chars.saturating_sub(master_len);
    let mut trimmed = Vec::new();
    for mut hit in hits {
        if budget <= min_per_hit {
            break;
        }
        if hit.content.len() > budget {
            // The ellipsis counts against the budget too.
            hit.content = clip_chars(&hit.content, budget.saturating_sub(3));
            hit.content.push_str("...");
        }
        budget = budget.saturating_sub(hit.content.len());
        trimmed.push(hit);
    }
    trimmed
}

// --- save ---

pub async fn perform_save(state: &AppState, request: SaveRequest) -> SaveResponse {
    let now = Utc::now();
    let mut transcript_action = None;
    let mut transcript_size_kb = None;

    if let Some(text) = request.transcript_text.as_deref() {
        match state.transcripts.store(&request.session_id, text) {
            Ok(written) => {
                transcript_action = Some(written.action);
                transcript_size_kb = Some(written.size_kb);
            }
            Err(e) => warn!("save: transcript store failed: {e}"),
        }
    }

    let is_lite = request.decisions.as_deref().map_or(true, |v| v.is_empty())
        && request.failures.as_deref().map_or(true, |v| v.is_empty())
        && request.files_changed.as_deref().map_or(true, |v| v.is_empty())
        && request.next_steps.as_deref().map_or(true, |v| v.is_empty())
        && request.tags.as_deref().map_or(true, |v| v.is_empty());

    let mut summary = request.summary.clone();
    let mut decisions = request.decisions.clone().unwrap_or_default();
    let mut failures = request.failures.clone().unwrap_or_default();
    let mut files_changed = request.files_changed.clone().unwrap_or_default();
    let mut next_steps = request.next_steps.clone().unwrap_or_default();
    let mut tags = request.tags.clone().unwrap_or_default();
    let mut significance = request
        .significance
        .as_deref()
        .and_then(Significance::parse)
        .unwrap_or_default();

    let extracted = if let Some(text) = request.transcript_text.as_deref() {
        let truncated = truncate_for_model(text, state.config.budgets.max_transcript_chars);
        match state.model.extract_from_transcript(&truncated, &request.summary).await {
            Ok(extracted) => Some(extracted),
            Err(e) => {
                warn!("save: transcript extraction failed: {e}");
                None
            }
        }
    } else if is_lite {
        match state.model.extract_session_fields(&request.summary).await {
            Ok(extracted) => Some(extracted),
            Err(e) => {
                warn!("save: note extraction failed: {e}");
                None
            }
        }
    } else {
        None
    };

    if let Some(extracted) = extracted {
        // Transcript- or note-derived values fill gaps; explicit user
        // fields are never overridden.
        if is_lite {
            if !extracted.summary.is_empty() {
                summary = extracted.summary.clone();
            }
            decisions = extracted.decisions.clone();
            failures = extracted.failures.clone();
            files_changed = extracted.files_changed.clone();
            next_steps = extracted.next_steps.clone();
            tags = extracted.tags.clone();
        } else {
            fill_if_empty(&mut decisions, &extracted.decisions);
            fill_if_empty(&mut failures, &extracted.failures);
            fill_if_empty(&mut files_changed, &extracted.files_changed);
            fill_if_empty(&mut next_steps, &extracted.next_steps);
            fill_if_empty(&mut tags, &extracted.tags);
        }
        if let Some(sig) = extracted.significance.as_deref().and_then(Significance::parse) {
            significance = sig;
        }
    }

    let mut record = SessionRecord::new(request.session_id.clone(), summary);
    record.created_at = now.to_rfc3339();
    record.significance = significance;
    record.decisions = decisions;
    record.failures = failures;
    record.files_changed = files_changed;
    record.next_steps = next_steps;
    record.tags = tags;
    record.project_states = request.project_states.clone().unwrap_or_default();
    if let Some(source) = request.source.clone().filter(|s| !s.is_empty()) {
        record.source = source;
    }

    let (session_file, worker_queued) = persist_and_enqueue(state, &record);

    let mut parts = vec![format!("Session saved ({}).", significance.as_str())];
    match transcript_action {
        Some("created") => parts.push(format!(
            "Transcript stored ({} KB).",
            transcript_size_kb.unwrap_or_default()
        )),
        Some("updated") => parts.push(format!(
            "Transcript updated ({} KB).",
            transcript_size_kb.unwrap_or_default()
        )),
        _ => {}
    }
    parts.push(format!("Worker queued (depth: {}).", state.queue.len()));

    SaveResponse {
        session_id: request.session_id,
        saved_at: now.to_rfc3339(),
        session_file,
        worker_queued,
        message: parts.join(" "),
    }
}

fn fill_if_empty(target: &mut Vec<String>, fallback: &[String]) {
    if target.is_empty() {
        *target = fallback.to_vec();
    }
}

fn persist_and_enqueue(state: &AppState, record: &SessionRecord) -> (String, bool) {
    match state.sessions.write(record) {
        Ok(path) => {
            state.queue.enqueue(record.session_id.clone(), path.clone());
            (path.display().to_string(), true)
        }
        Err(e) => {
            warn!("ingest: session write failed: {e}");
            (String::new(), false)
        }
    }
}

// --- checkpoint ---

pub async fn perform_checkpoint(state: &AppState, request: CheckpointRequest) -> CheckpointResponse {
    let now = Utc::now();

    let transcript = request.transcript_text.clone().or_else(|| {
        request
            .transcript_path
            .as_deref()
            .and_then(|path| std::fs::read_to_string(path).ok())
    });

    let mut transcript_stored = false;
    let mut transcript_size_kb = None;
    if let Some(text) = transcript.as_deref() {
        match state.transcripts.store(&request.session_id, text) {
            Ok(written) => {
                transcript_stored = written.stored || written.action == "skipped";
                transcript_size_kb = Some(written.size_kb);
            }
            Err(e) => warn!("checkpoint: transcript store failed: {e}"),
        }
    }

    let extracted = match transcript.as_deref() {
        Some(text) => {
            let truncated = truncate_for_model(text, state.config.budgets.max_transcript_chars);
            state.model.extract_from_transcript(&truncated, &request.note).await
        }
        None => state.model.extract_session_fields(&request.note).await,
    }
    .unwrap_or_else(|e| {
        warn!("checkpoint: extraction failed: {e}");
        ExtractedFields::default()
    });

    let significance = extracted
        .significance
        .as_deref()
        .and_then(Significance::parse)
        .or_else(|| request.significance.as_deref().and_then(Significance::parse))
        .unwrap_or_default();

    let summary = if extracted.summary.is_empty() {
        request.note.clone()
    } else {
        extracted.summary.clone()
    };
    let mut record = SessionRecord::new(request.session_id.clone(), summary);
    record.created_at = now.to_rfc3339();
    record.significance = significance;
    record.decisions = extracted.decisions;
    record.failures = extracted.failures;
    record.files_changed = extracted.files_changed;
    record.next_steps = extracted.next_steps;
    record.tags = extracted.tags;
    if let Some(extra) = request.tags.clone() {
        for tag in extra {
            if !record.tags.contains(&tag) {
                record.tags.push(tag);
            }
        }
    }

    let (session_file, worker_queued) = persist_and_enqueue(state, &record);

    let mut parts = vec![format!("Checkpoint saved ({}).", significance.as_str())];
    if let Some(size) = transcript_size_kb {
        parts.push(format!("Transcript archived ({size} KB)."));
    }
    parts.push("Worker queued.".to_string());

    CheckpointResponse {
        session_id: request.session_id,
        saved_at: now.to_rfc3339(),
        session_file,
        transcript_stored,
        transcript_size_kb,
        worker_queued,
        message: parts.join(" "),
    }
}

// --- search ---

pub async fn perform_search(state: &AppState, request: SearchRequest) -> SearchResponse {
    let target_collections: Vec<&'static str> = match &request.collections {
        Some(names) => {
            let mut seen = Vec::new();
            for name in names {
                let resolved = resolve_collection_name(name);
                if !seen.contains(&resolved) {
                    seen.push(resolved);
                }
            }
            seen
        }
        None => vec!["project_archive", "decisions", "failures", "entities", "sessions"],
    };

    if !state.archive.is_connected().await {
        return SearchResponse {
            query: request.query,
            results: Vec::new(),
            total_results: 0,
            collections_searched: Vec::new(),
        };
    }

    let mut all_results = Vec::new();
    for collection in &target_collections {
        let hits = match state.archive.search(collection, &request.query, request.limit, None).await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("search: failed for '{collection}': {e}");
                continue;
            }
        };
        for hit in hits {
            let Some(distance) = hit.distance else { continue };
            if distance >= SEARCH_THRESHOLD {
                continue;
            }
            let timestamp = hit
                .meta_str("timestamp")
                .or_else(|| hit.meta_str("created_at"))
                .unwrap_or("");
            if let Some(after) = request.date_after.as_deref() {
                if !timestamp.is_empty() && timestamp < after {
                    continue;
                }
            }
            if let Some(before) = request.date_before.as_deref() {
                if !timestamp.is_empty() && timestamp > before {
                    continue;
                }
            }
            if let Some(wanted) = &request.tags {
                let item_tags: Vec<String> = hit
                    .meta_str("tags")
                    .map(|raw| {
                        raw.split(',')
                            .map(|t| t.trim().trim_matches(['[', ']', '"']).to_string())
                            .filter(|t| !t.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                if !wanted.iter().any(|t| item_tags.contains(t)) {
                    continue;
                }
            }
            all_results.push(SearchResult {
                collection: collection.to_string(),
                id: hit.id.clone(),
                content: hit.content.clone(),
                metadata: meta_value(&hit.metadata),
                distance: Some(distance),
                relevance: (relevance(distance) * 1000.0).round() / 1000.0,
            });
        }
    }

    all_results.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    all_results.truncate(request.limit);

    SearchResponse {
        query: request.query,
        total_results: all_results.len(),
        results: all_results,
        collections_searched: target_collections.iter().map(|c| c.to_string()).collect(),
    }
}

// --- correct ---

pub async fn perform_correct(state: &AppState, request: CorrectRequest) -> CorrectResponse {
    let mut hot_updated = false;
    let mut records_affected = 0;

    if matches!(request.scope, CorrectionScope::Hot | CorrectionScope::Both) {
        hot_updated = correct_hot(state, &request.item, &request.correction).await;
    }
    if matches!(request.scope, CorrectionScope::Archive | CorrectionScope::Both) {
        records_affected = correct_archive(state, &request.item, &request.correction).await;
    }

    let mut parts = Vec::new();
    if hot_updated {
        parts.push("master context updated".to_string());
    }
    if records_affected > 0 {
        parts.push(format!("{records_affected} archive record(s) corrected"));
    }
    if parts.is_empty() {
        parts.push("no matching content found".to_string());
    }

    CorrectResponse {
        item: request.item,
        correction: request.correction,
        hot_updated,
        archive_updated: records_affected > 0,
        records_affected,
        message: format!("Correction: {}", parts.join("; ")),
    }
}

/// Replace the first exact occurrence in the master context, falling
/// back to the first case-insensitive one.
async fn correct_hot(state: &AppState, item: &str, correction: &str) -> bool {
    let Some(content) = state.context.read_master() else {
        return false;
    };
    let updated = if content.contains(item) {
        content.replacen(item, correction, 1)
    } else {
        let Some(range) = find_case_insensitive(&content, item) else {
            return false;
        };
        format!("{}{correction}{}", &content[..range.start], &content[range.end..])
    };
    state
        .context
        .write_master(&updated, "engram: correction applied")
        .await
        .is_ok()
}

/// Byte range in `content` of the first case-insensitive occurrence of
/// `item`. The range is found by lowercasing windows of `content`
/// itself; offsets into a separately lowercased copy would drift when
/// case folding changes a character's UTF-8 length.
fn find_case_insensitive(content: &str, item: &str) -> Option<std::ops::Range<usize>> {
    let needle = item.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    for (start, _) in content.char_indices() {
        let mut lowered = String::with_capacity(needle.len());
        let mut end = start;
        for (offset, ch) in content[start..].char_indices() {
            for folded in ch.to_lowercase() {
                lowered.push(folded);
            }
            end = start + offset + ch.len_utf8();
            if lowered.len() >= needle.len() {
                break;
            }
        }
        if lowered == needle {
            return Some(start..end);
        }
    }
    None
}

async fn correct_archive(state: &AppState, item: &str, correction: &str) -> usize {
    let mut affected = 0;
    for collection in ["project_archive", "decisions", "failures", "sessions", "entities"] {
        let hits = match state.archive.search(collection, item, 5, None).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("correct: archive search failed for {collection}: {e}");
                continue;
            }
        };
        for hit in hits {
            if hit.distance.map(|d| d > CORRECTION_THRESHOLD).unwrap_or(true) {
                continue;
            }
            if let Err(e) = state.archive.take_snapshot(collection, &hit.id).await {
                warn!("correct: snapshot failed: {e}");
            }
            let new_content = if hit.content.contains(item) {
                hit.content.replace(item, correction)
            } else {
                format!("{}\n[CORRECTION: {correction}]", hit.content)
            };
            let mut metadata = hit.metadata.clone();
            metadata.insert("corrected".to_string(), json!("true"));
            if state
                .archive
                .upsert_document(collection, &hit.id, &new_content, metadata)
                .await
                .is_ok()
            {
                affected += 1;
            }
        }
    }
    affected
}

// --- webhook ingest ---

pub fn perform_ingest(state: &AppState, payload: IngestPayload) -> (String, bool) {
    let session_id = format!(
        "{}-{}-{}",
        payload.source,
        Utc::now().format("%Y%m%d-%H%M%S"),
        &Uuid::new_v4().simple().to_string()[..6]
    );
    let mut record = SessionRecord::new(session_id.clone(), payload.summary);
    record.source = payload.source;
    record.source_id = payload.source_id;
    record.tags = payload.tags;
    record.significance = Significance::parse(&payload.significance).unwrap_or_default();
    record.decisions = payload.decisions;
    record.failures = payload.failures;
    record.files_changed = payload.files_changed;
    record.next_steps = payload.next_steps;
    record.metadata = payload.metadata;
    record.ingested_via = Some("webhook".to_string());

    let (_, queued) = persist_and_enqueue(state, &record);
    info!("ingest: {session_id} from {} queued={queued}", record.source);
    (session_id, queued)
}

pub fn perform_ingest_raw(state: &AppState, payload: RawIngestPayload) -> (String, usize, bool) {
    let session_id = format!(
        "{}-raw-{}-{}",
        payload.source,
        Utc::now().format("%Y%m%d-%H%M%S"),
        &Uuid::new_v4().simple().to_string()[..6]
    );
    let text_length = payload.text.len();
    let mut record = SessionRecord::new(session_id.clone(), payload.text);
    record.source = payload.source;
    record.tags = payload.tags;
    record.significance = Significance::parse(&payload.significance).unwrap_or(Significance::Low);
    record.ingested_via = Some("webhook-raw".to_string());

    let (_, queued) = persist_and_enqueue(state, &record);
    (session_id, text_length, queued)
}

/// Adapter delivering drop-zone transcripts into the checkpoint flow.
pub struct TranscriptSink {
    pub state: AppState,
}

#[async_trait]
impl CheckpointSink for TranscriptSink {
    async fn transcript_checkpoint(&self, checkpoint: TranscriptCheckpoint) {
        let request = CheckpointRequest {
            session_id: checkpoint.session_id,
            note: checkpoint.note,
            significance: Some("medium".to_string()),
            transcript_path: Some(checkpoint.transcript_path.display().to_string()),
            transcript_text: None,
            tags: Some(checkpoint.tags),
        };
        let response = perform_checkpoint(&self.state, request).await;
        info!("watcher: transcript processed: {}", response.session_id);
    }
}
