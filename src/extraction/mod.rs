//! Memory extraction: read a user's unextracted messages, derive facts,
//! reconcile them against nearby existing memories, and apply the result in
//! one transaction.
//!
//! The pipeline is idempotent in outcome: the only mutating steps are the
//! final memory transaction and the message marking that strictly follows
//! it, so a retried run sees either the old state or the fully-new one.

pub mod parse;
pub mod queue;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Tuning;
use crate::error::MaisonError;
use crate::llm::LlmGateway;
use crate::store::{now_ms, MemoryWrite};
use crate::util::normalize;
use crate::{db_call, prompts, SharedStore};
use parse::{MemoryAction, MemoryEvent};

#[derive(Debug, Default, Clone, Serialize)]
pub struct ExtractionStats {
    pub pending_messages: usize,
    pub facts: usize,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub messages_marked: usize,
}

/// Queue adapter that runs the real pipeline.
pub struct PipelineRunner {
    pub store: SharedStore,
    pub gateway: Arc<dyn LlmGateway>,
    pub tuning: Arc<Tuning>,
}

#[async_trait]
impl queue::ExtractionRunner for PipelineRunner {
    async fn run(&self, user_id: &str) -> Result<ExtractionStats, MaisonError> {
        run_extraction(&self.store, &self.gateway, &self.tuning, user_id).await
    }
}

pub async fn run_extraction(
    store: &SharedStore,
    gateway: &Arc<dyn LlmGateway>,
    tuning: &Tuning,
    user_id: &str,
) -> Result<ExtractionStats, MaisonError> {
    let mut stats = ExtractionStats::default();

    // 1. Snapshot pending messages.
    let user = user_id.to_string();
    let snapshot = db_call(store, move |s| s.list_pending_messages(&user)).await??;
    if snapshot.is_empty() {
        return Ok(stats);
    }
    stats.pending_messages = snapshot.len();
    let snapshot_ids: Vec<i64> = snapshot.iter().map(|m| m.id).collect();

    // 2. Derive facts from the transcript.
    let transcript = snapshot
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let raw = gateway.generate_structured(&prompts::fact_prompt(&transcript)).await?;
    let facts = parse::parse_facts(&raw);
    if facts.is_empty() {
        let ids = snapshot_ids.clone();
        let ts = now_ms();
        stats.messages_marked =
            db_call(store, move |s| s.mark_messages_extracted(&ids, ts)).await??;
        debug!(user_id, "no facts extracted, messages marked");
        return Ok(stats);
    }
    stats.facts = facts.len();

    // 3. Embed every fact in one batch.
    let vectors = gateway.embed(&facts).await?;
    let mut fact_vectors: HashMap<String, Vec<f32>> = HashMap::new();
    for (fact, vec) in facts.iter().zip(vectors) {
        fact_vectors.insert(fact.clone(), vec);
    }

    // 4. Union of nearby memories per fact — the reconciliation pool.
    let d_max = 1.0 - tuning.extraction_threshold;
    let top_k = tuning.extraction_top_k;
    let mut pool = BTreeMap::new();
    for fact in &facts {
        let embedding = fact_vectors[fact].clone();
        let user = user_id.to_string();
        let nearby = db_call(store, move |s| {
            s.find_nearby_memories(&user, &embedding, d_max, top_k)
        })
        .await??;
        for hit in nearby {
            pool.insert(hit.memory.id, hit.memory);
        }
    }

    // 5. Temp ids: the LLM sees "0","1",... — never real database ids.
    let mut existing: Vec<(String, String)> = Vec::with_capacity(pool.len());
    let mut temp_to_real: HashMap<String, i64> = HashMap::new();
    for (i, mem) in pool.values().enumerate() {
        let temp = i.to_string();
        existing.push((temp.clone(), mem.content.clone()));
        temp_to_real.insert(temp, mem.id);
    }

    // 6+7. Ask for actions; repair invalid id references, retrying while any
    // UPDATE/DELETE still points at an unknown id.
    let mut actions = Vec::new();
    for attempt in 1..=tuning.extraction_retries.max(1) {
        let raw = gateway
            .generate_structured(&prompts::reconcile_prompt(&existing, &facts))
            .await?;
        let parsed = parse::parse_actions(&raw);
        let (repaired, unresolved) = repair_actions(parsed, &temp_to_real);
        actions = repaired;
        if unresolved == 0 {
            break;
        }
        warn!(user_id, attempt, unresolved, "actions reference unknown ids");
    }

    // 8. Backfill ADDs for facts the final memory set would not cover.
    backfill_adds(&mut actions, &existing, &facts);

    // 9. One transaction for every mutation. Embeddings for texts that are
    // not verbatim facts are fetched in one batch beforehand.
    let mut need_embed: Vec<String> = Vec::new();
    for a in &actions {
        if matches!(a.event, MemoryEvent::Add | MemoryEvent::Update)
            && !fact_vectors.contains_key(&a.text)
            && !need_embed.contains(&a.text)
        {
            need_embed.push(a.text.clone());
        }
    }
    if !need_embed.is_empty() {
        let vecs = gateway.embed(&need_embed).await?;
        for (text, vec) in need_embed.into_iter().zip(vecs) {
            fact_vectors.insert(text, vec);
        }
    }

    let now = now_ms();
    let mut writes = Vec::new();
    for a in &actions {
        match a.event {
            MemoryEvent::None => stats.unchanged += 1,
            MemoryEvent::Delete => match temp_to_real.get(&a.id) {
                Some(&id) => writes.push(MemoryWrite::Delete { id }),
                None => warn!(user_id, temp_id = %a.id, "skipping DELETE with unknown id"),
            },
            MemoryEvent::Add => match fact_vectors.get(&a.text) {
                Some(embedding) => writes.push(MemoryWrite::Insert {
                    content: a.text.clone(),
                    embedding: embedding.clone(),
                }),
                None => warn!(user_id, "skipping ADD with no embedding"),
            },
            MemoryEvent::Update => match (temp_to_real.get(&a.id), fact_vectors.get(&a.text)) {
                (Some(&id), Some(embedding)) => writes.push(MemoryWrite::Update {
                    id,
                    content: a.text.clone(),
                    embedding: embedding.clone(),
                    updated_at: now,
                }),
                (None, _) => warn!(user_id, temp_id = %a.id, "skipping UPDATE with unknown id"),
                (_, None) => warn!(user_id, "skipping UPDATE with no embedding"),
            },
        }
    }

    let user = user_id.to_string();
    let counts = db_call(store, move |s| s.apply_memory_writes(&user, &writes)).await??;
    stats.added = counts.added;
    stats.updated = counts.updated;
    stats.deleted = counts.deleted;

    // 10. Mark the snapshot extracted only after the transaction committed.
    // A failure here leaves the messages pending: at-least-once.
    let ts = now_ms();
    stats.messages_marked =
        db_call(store, move |s| s.mark_messages_extracted(&snapshot_ids, ts)).await??;

    Ok(stats)
}

/// Reattach UPDATE/DELETE actions whose temp id is unknown: if a NONE action
/// carries the invalid action's `old_memory` text, the event (and text, for
/// UPDATE) transplants onto it and the invalid action is dropped. Returns
/// the surviving actions and how many invalid references remain.
fn repair_actions(
    actions: Vec<MemoryAction>,
    temp_to_real: &HashMap<String, i64>,
) -> (Vec<MemoryAction>, usize) {
    let mut kept: Vec<MemoryAction> = Vec::with_capacity(actions.len());
    let mut invalid: Vec<MemoryAction> = Vec::new();
    for a in actions {
        let needs_real_id = matches!(a.event, MemoryEvent::Update | MemoryEvent::Delete);
        if needs_real_id && !temp_to_real.contains_key(&a.id) {
            invalid.push(a);
        } else {
            kept.push(a);
        }
    }

    let mut unresolved = 0;
    for bad in invalid {
        let target = bad.old_memory.as_ref().and_then(|old| {
            kept.iter().position(|k| k.event == MemoryEvent::None && k.text == *old)
        });
        match target {
            Some(i) => {
                let original = kept[i].text.clone();
                kept[i].event = bad.event;
                if bad.event == MemoryEvent::Update {
                    kept[i].old_memory = Some(original);
                    kept[i].text = bad.text;
                }
            }
            None => unresolved += 1,
        }
    }
    (kept, unresolved)
}

/// Simulate the final memory texts and append an ADD for every fact whose
/// normalized form is not a substring (either direction) of any final text.
fn backfill_adds(actions: &mut Vec<MemoryAction>, existing: &[(String, String)], facts: &[String]) {
    let mut finals: HashMap<String, String> =
        existing.iter().map(|(id, text)| (id.clone(), text.clone())).collect();
    let mut added: Vec<String> = Vec::new();
    for a in actions.iter() {
        match a.event {
            MemoryEvent::Update => {
                finals.insert(a.id.clone(), a.text.clone());
            }
            MemoryEvent::Delete => {
                finals.remove(&a.id);
            }
            MemoryEvent::Add => added.push(a.text.clone()),
            MemoryEvent::None => {}
        }
    }
    let final_norms: Vec<String> = finals
        .values()
        .chain(added.iter())
        .map(|t| normalize(t))
        .filter(|t| !t.is_empty())
        .collect();

    let mut next_temp = actions
        .iter()
        .map(|a| a.id.as_str())
        .chain(existing.iter().map(|(id, _)| id.as_str()))
        .filter_map(|id| id.parse::<u64>().ok())
        .max()
        .map(|m| m + 1)
        .unwrap_or(0);

    for fact in facts {
        let nf = normalize(fact);
        if nf.is_empty() {
            continue;
        }
        let covered = final_norms
            .iter()
            .any(|ft| ft.contains(nf.as_str()) || nf.contains(ft.as_str()));
        if !covered {
            actions.push(MemoryAction {
                id: next_temp.to_string(),
                text: fact.clone(),
                event: MemoryEvent::Add,
                old_memory: None,
            });
            next_temp += 1;
        }
    }
}
