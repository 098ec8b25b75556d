//! Observational memory: chunk buffering, activation, and reflection
//!
//! Agent telemetry arrives as immutable chunks appended to a per-scope
//! buffer. Activation periodically promotes a leading, contiguous run of
//! chunks into the durable `active_observations` text using a token-budget
//! boundary search; reflection periodically compacts the durable text into a
//! new generation. Chunk appends and flag flips are single auto-committed
//! statements so no unrelated row is ever locked; activation and reflection
//! are read-merge-writes of one row and run in a transaction holding
//! `FOR UPDATE` on that row only.

use crate::error::{EngramError, Result};
use crate::store::{now_micros, ts_pair, PgStore};
use crate::types::{BufferedObservationChunk, MemoryScope, ObservationalMemoryRecord};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tokens of raw messages that must remain unpromoted regardless of the
/// retention floor, so tiny floors cannot drain the buffer completely
const MIN_REMAINING_TOKENS: i64 = 1000;

/// Fraction of the retention floor an overshoot may consume before the
/// boundary search falls back to the under-target prefix
const OVERSHOOT_LIMIT_RATIO: f64 = 0.95;

/// Inputs to the activation boundary search
#[derive(Debug, Clone, Copy)]
pub struct ActivationParams {
    /// Raw message tokens currently pending (observed but unpromoted)
    pub current_pending_tokens: i64,
    /// Configured buffering threshold for raw message tokens
    pub message_tokens_threshold: i64,
    /// Fraction of the threshold to promote when activating (0..=1)
    pub activation_ratio: f64,
    /// Prefer the over-target prefix whenever the minimum-remaining floor
    /// still holds, accepting large overshoots
    pub force_max_activation: bool,
}

/// Result of the boundary search over a chunk buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationDecision {
    /// How many leading chunks to promote
    pub boundary: usize,
    /// Message-token total of the promoted prefix
    pub promoted_message_tokens: i64,
    pub retention_floor: i64,
    pub target_message_tokens: i64,
}

/// Select how many leading chunks to promote.
///
/// `retention_floor` is the raw-message token budget that must stay
/// unpromoted; `target` is what should go. The walk tracks the smallest
/// prefix meeting the target (`best_over`) and the largest strictly below it
/// (`best_under`). `best_over` wins unless its overshoot exceeds 95% of the
/// retention floor or it would leave fewer than `min(1000, retention_floor)`
/// raw tokens behind; then `best_under` wins. When nothing qualifies, one
/// chunk is promoted anyway — a single oversized chunk must never stall the
/// buffer indefinitely.
pub fn select_activation_boundary(
    chunks: &[BufferedObservationChunk],
    params: ActivationParams,
) -> ActivationDecision {
    let retention_floor =
        (params.message_tokens_threshold as f64 * (1.0 - params.activation_ratio)).round() as i64;
    let target = (params.current_pending_tokens - retention_floor).max(0);

    let mut decision = ActivationDecision {
        boundary: 0,
        promoted_message_tokens: 0,
        retention_floor,
        target_message_tokens: target,
    };
    if chunks.is_empty() {
        return decision;
    }

    let min_remaining = MIN_REMAINING_TOKENS.min(retention_floor);
    let mut best_over: Option<(usize, i64)> = None;
    let mut best_under: Option<(usize, i64)> = None;
    let mut sum = 0i64;
    for (i, chunk) in chunks.iter().enumerate() {
        sum += chunk.message_tokens;
        if sum >= target {
            best_over = Some((i + 1, sum));
            break;
        }
        best_under = Some((i + 1, sum));
    }

    let choose_over = |over_sum: i64| -> bool {
        let remaining = params.current_pending_tokens - over_sum;
        if remaining < min_remaining {
            return false;
        }
        if params.force_max_activation {
            return true;
        }
        let overshoot = over_sum - target;
        (overshoot as f64) <= OVERSHOOT_LIMIT_RATIO * (retention_floor as f64)
    };

    let chosen = match best_over {
        Some((count, over_sum)) if choose_over(over_sum) => Some((count, over_sum)),
        Some(_) => best_under,
        None => best_under,
    };

    match chosen {
        Some((count, chosen_sum)) => {
            decision.boundary = count;
            decision.promoted_message_tokens = chosen_sum;
        }
        None => {
            // nothing qualified; promote the first chunk anyway
            decision.boundary = 1;
            decision.promoted_message_tokens = chunks[0].message_tokens;
        }
    }
    decision
}

/// Audit detail for one promoted chunk
#[derive(Debug, Clone)]
pub struct PromotedChunk {
    pub id: Uuid,
    pub cycle_id: String,
    pub token_count: i64,
    pub message_tokens: i64,
    pub message_ids: Vec<String>,
}

/// Result of one activation pass
#[derive(Debug, Clone)]
pub struct ActivationOutcome {
    pub decision: ActivationDecision,
    pub promoted: Vec<PromotedChunk>,
    /// Advisory hints from the newest promoted chunk only; older chunks'
    /// hints are stale and discarded
    pub suggested_continuation: Option<String>,
    pub current_task: Option<String>,
}

const RECORD_COLUMNS: &str =
    "id, lookup_key, scope_type, scope_id, active_observations, generation_count, \
     buffered_chunks, is_buffering, reflection_pending, buffered_reflection, \
     reflection_line_offset, pending_message_tokens, observation_token_count, \
     total_tokens_observed, \
     COALESCE(last_observed_at_z, last_observed_at) AS last_observed_at, \
     COALESCE(last_buffered_at_z, last_buffered_at) AS last_buffered_at, \
     COALESCE(created_at_z, created_at) AS created_at, \
     COALESCE(updated_at_z, updated_at) AS updated_at";

fn row_to_record(row: &PgRow) -> Result<ObservationalMemoryRecord> {
    let scope_type: String = row
        .try_get("scope_type")
        .map_err(EngramError::db("observations.decode"))?;
    let scope_id: String = row
        .try_get("scope_id")
        .map_err(EngramError::db("observations.decode"))?;
    let scope = match scope_type.as_str() {
        "thread" => MemoryScope::Thread(scope_id),
        "resource" => MemoryScope::Resource(scope_id),
        other => {
            return Err(EngramError::Invariant(format!(
                "unknown memory scope type '{other}'"
            )))
        }
    };
    let chunks_raw: Value = row
        .try_get("buffered_chunks")
        .map_err(EngramError::db("observations.decode"))?;
    let buffered_chunks: Vec<BufferedObservationChunk> = serde_json::from_value(chunks_raw)?;

    Ok(ObservationalMemoryRecord {
        id: row.try_get("id").map_err(EngramError::db("observations.decode"))?,
        lookup_key: row
            .try_get("lookup_key")
            .map_err(EngramError::db("observations.decode"))?,
        scope,
        active_observations: row
            .try_get("active_observations")
            .map_err(EngramError::db("observations.decode"))?,
        generation_count: row
            .try_get("generation_count")
            .map_err(EngramError::db("observations.decode"))?,
        buffered_chunks,
        is_buffering: row
            .try_get("is_buffering")
            .map_err(EngramError::db("observations.decode"))?,
        reflection_pending: row
            .try_get("reflection_pending")
            .map_err(EngramError::db("observations.decode"))?,
        buffered_reflection: row
            .try_get("buffered_reflection")
            .map_err(EngramError::db("observations.decode"))?,
        reflection_line_offset: row
            .try_get("reflection_line_offset")
            .map_err(EngramError::db("observations.decode"))?,
        pending_message_tokens: row
            .try_get("pending_message_tokens")
            .map_err(EngramError::db("observations.decode"))?,
        observation_token_count: row
            .try_get("observation_token_count")
            .map_err(EngramError::db("observations.decode"))?,
        total_tokens_observed: row
            .try_get("total_tokens_observed")
            .map_err(EngramError::db("observations.decode"))?,
        last_observed_at: row
            .try_get("last_observed_at")
            .map_err(EngramError::db("observations.decode"))?,
        last_buffered_at: row
            .try_get("last_buffered_at")
            .map_err(EngramError::db("observations.decode"))?,
        created_at: row
            .try_get("created_at")
            .map_err(EngramError::db("observations.decode"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(EngramError::db("observations.decode"))?,
    })
}

fn count_lines(text: &str) -> i64 {
    if text.is_empty() {
        0
    } else {
        text.lines().count() as i64
    }
}

/// Store for observational-memory records
pub struct ObservationStore {
    store: PgStore,
}

impl ObservationStore {
    pub(crate) fn new(store: PgStore) -> Self {
        ObservationStore { store }
    }

    fn table(&self) -> String {
        self.store.table("engram_observational_memory")
    }

    /// Fetch the record for a scope, creating an empty one if absent.
    ///
    /// The insert is race-safe: concurrent callers hit the unique
    /// `lookup_key` constraint and everyone reads the single surviving row.
    pub async fn get_or_create(&self, scope: &MemoryScope) -> Result<ObservationalMemoryRecord> {
        let table = self.table();
        let key = scope.lookup_key();
        let (scope_type, scope_id) = match scope {
            MemoryScope::Thread(id) => ("thread", id.as_str()),
            MemoryScope::Resource(id) => ("resource", id.as_str()),
        };
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let insert = format!(
            "INSERT INTO {table} \
             (id, lookup_key, scope_type, scope_id, active_observations, generation_count, \
              buffered_chunks, is_buffering, reflection_pending, pending_message_tokens, \
              observation_token_count, total_tokens_observed, created_at, created_at_z, updated_at, updated_at_z) \
             VALUES ($1, $2, $3, $4, '', 0, '[]'::jsonb, FALSE, FALSE, 0, 0, 0, $5, $6, $5, $6) \
             ON CONFLICT (lookup_key) DO NOTHING"
        );
        sqlx::query(&insert)
            .bind(Uuid::new_v4())
            .bind(&key)
            .bind(scope_type)
            .bind(scope_id)
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("observations.get_or_create", key.clone()))?;

        self.get_by_key(&key).await?.ok_or_else(|| {
            EngramError::Invariant(format!(
                "observational memory record missing after insert for '{key}'"
            ))
        })
    }

    pub async fn get(&self, scope: &MemoryScope) -> Result<Option<ObservationalMemoryRecord>> {
        self.get_by_key(&scope.lookup_key()).await
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<ObservationalMemoryRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE lookup_key = $1",
            self.table()
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(self.store.pool())
            .await
            .map_err(EngramError::db_with("observations.get", key))?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Append one chunk to the buffer.
    ///
    /// A single auto-committed statement: the chunk concatenates onto the
    /// JSON array, pending and lifetime token counters advance, and
    /// `last_buffered_at` moves forward. Existing chunks are never touched,
    /// and no surrounding transaction means no other row is ever locked from
    /// this path.
    pub async fn append_chunk(
        &self,
        record_id: Uuid,
        chunk: &BufferedObservationChunk,
    ) -> Result<()> {
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let sql = format!(
            "UPDATE {} SET \
             buffered_chunks = buffered_chunks || $2::jsonb, \
             pending_message_tokens = pending_message_tokens + $3, \
             total_tokens_observed = total_tokens_observed + $3, \
             is_buffering = TRUE, \
             last_buffered_at = $4, last_buffered_at_z = $5, \
             updated_at = $4, updated_at_z = $5 \
             WHERE id = $1",
            self.table()
        );
        let appended = Value::Array(vec![serde_json::to_value(chunk)?]);
        let result = sqlx::query(&sql)
            .bind(record_id)
            .bind(appended)
            .bind(chunk.message_tokens)
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("observations.append_chunk", record_id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound {
                entity: "observational memory record",
                id: record_id.to_string(),
            });
        }
        debug!(record_id = %record_id, cycle_id = %chunk.cycle_id, tokens = chunk.message_tokens, "chunk buffered");
        Ok(())
    }

    /// Promote a leading run of buffered chunks into durable state.
    ///
    /// One transaction locking only this record's row: promoted text appends
    /// to `active_observations`, token counters move, the unpromoted suffix
    /// replaces the buffer, and `last_observed_at` becomes the newest
    /// promoted chunk's timestamp — never wall-clock time, so telemetry that
    /// arrived after buffering is still re-observed later.
    pub async fn activate(
        &self,
        record_id: Uuid,
        params: ActivationParams,
    ) -> Result<ActivationOutcome> {
        let table = self.table();
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("observations.activate"))?;

        let select = format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(record_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("observations.activate", record_id.to_string()))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "observational memory record",
                id: record_id.to_string(),
            })?;
        let record = row_to_record(&row)?;

        let decision = select_activation_boundary(&record.buffered_chunks, params);
        if decision.boundary == 0 {
            return Ok(ActivationOutcome {
                decision,
                promoted: Vec::new(),
                suggested_continuation: None,
                current_task: None,
            });
        }

        let (promoted, remainder) = record.buffered_chunks.split_at(decision.boundary);
        let promoted_text: Vec<&str> = promoted
            .iter()
            .map(|c| c.observations.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        let mut active = record.active_observations.clone();
        if !promoted_text.is_empty() {
            if !active.is_empty() {
                active.push('\n');
            }
            active.push_str(&promoted_text.join("\n"));
        }

        let promoted_observation_tokens: i64 = promoted.iter().map(|c| c.token_count).sum();
        let promoted_message_tokens: i64 = promoted.iter().map(|c| c.message_tokens).sum();
        let new_pending = (record.pending_message_tokens - promoted_message_tokens).max(0);
        let last = promoted.last().expect("boundary > 0 implies promoted chunks");
        // the chunk's own timestamp, never the activation wall clock
        let (observed_naive, observed_aware) = ts_pair(last.last_observed_at);

        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let update = format!(
            "UPDATE {table} SET \
             active_observations = $2, \
             observation_token_count = observation_token_count + $3, \
             pending_message_tokens = $4, \
             buffered_chunks = $5, \
             is_buffering = $6, \
             last_observed_at = $7, last_observed_at_z = $8, \
             updated_at = $9, updated_at_z = $10 \
             WHERE id = $1"
        );
        sqlx::query(&update)
            .bind(record_id)
            .bind(&active)
            .bind(promoted_observation_tokens)
            .bind(new_pending)
            .bind(serde_json::to_value(remainder)?)
            .bind(!remainder.is_empty())
            .bind(observed_naive)
            .bind(observed_aware)
            .bind(naive)
            .bind(aware)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("observations.activate", record_id.to_string()))?;

        tx.commit()
            .await
            .map_err(EngramError::db("observations.activate"))?;

        debug!(
            record_id = %record_id,
            promoted = decision.boundary,
            remaining = remainder.len(),
            "chunks activated"
        );
        Ok(ActivationOutcome {
            decision,
            promoted: promoted
                .iter()
                .map(|c| PromotedChunk {
                    id: c.id,
                    cycle_id: c.cycle_id.clone(),
                    token_count: c.token_count,
                    message_tokens: c.message_tokens,
                    message_ids: c.message_ids.clone(),
                })
                .collect(),
            suggested_continuation: last.suggested_continuation.clone(),
            current_task: last.current_task.clone(),
        })
    }

    /// Append reflection text to the reflection buffer (auto-committed)
    pub async fn buffer_reflection(&self, record_id: Uuid, fragment: &str) -> Result<()> {
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let sql = format!(
            "UPDATE {} SET \
             buffered_reflection = COALESCE(buffered_reflection, '') || $2, \
             updated_at = $3, updated_at_z = $4 \
             WHERE id = $1",
            self.table()
        );
        let result = sqlx::query(&sql)
            .bind(record_id)
            .bind(fragment)
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("observations.buffer_reflection", record_id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound {
                entity: "observational memory record",
                id: record_id.to_string(),
            });
        }
        Ok(())
    }

    /// Mark a reflection pass as started, recording the line-count boundary.
    ///
    /// The boundary is a count into the observation *text*, not a timestamp:
    /// reflection spans a range of the text, and new observation lines can
    /// keep arriving while the multi-step reflection is pending.
    pub async fn begin_reflection(&self, record_id: Uuid) -> Result<i64> {
        let table = self.table();
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("observations.begin_reflection"))?;

        let active: Option<String> = sqlx::query_scalar(&format!(
            "SELECT active_observations FROM {table} WHERE id = $1 FOR UPDATE"
        ))
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(EngramError::db_with("observations.begin_reflection", record_id.to_string()))?;
        let Some(active) = active else {
            return Err(EngramError::NotFound {
                entity: "observational memory record",
                id: record_id.to_string(),
            });
        };
        let boundary = count_lines(&active);

        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        sqlx::query(&format!(
            "UPDATE {table} SET reflection_pending = TRUE, reflection_line_offset = $2, \
             updated_at = $3, updated_at_z = $4 WHERE id = $1"
        ))
        .bind(record_id)
        .bind(boundary)
        .bind(naive)
        .bind(aware)
        .execute(&mut *tx)
        .await
        .map_err(EngramError::db_with("observations.begin_reflection", record_id.to_string()))?;

        tx.commit()
            .await
            .map_err(EngramError::db("observations.begin_reflection"))?;
        Ok(boundary)
    }

    /// Finish a reflection pass: a brand-new generation whose content is the
    /// buffered reflection plus every observation line added past the
    /// recorded boundary while reflection was pending.
    ///
    /// `reflected_token_count` is the token cost of the new content; the
    /// caller computes it because tokenization lives outside this layer.
    pub async fn promote_reflection(
        &self,
        record_id: Uuid,
        reflected_token_count: i64,
    ) -> Result<ObservationalMemoryRecord> {
        let table = self.table();
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("observations.promote_reflection"))?;

        let select = format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(record_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("observations.promote_reflection", record_id.to_string()))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "observational memory record",
                id: record_id.to_string(),
            })?;
        let record = row_to_record(&row)?;

        let reflection = record.buffered_reflection.clone().unwrap_or_default();
        let total_lines = count_lines(&record.active_observations);
        let boundary = record.reflection_line_offset.unwrap_or(total_lines);
        if boundary > total_lines {
            // the boundary outran the text; only appends are expected here,
            // so this indicates some path rewrote active_observations
            warn!(
                record_id = %record_id,
                boundary,
                total_lines,
                "reflection boundary exceeds observation text; treating all lines as reflected"
            );
        }
        let tail: Vec<&str> = record
            .active_observations
            .lines()
            .skip(boundary.max(0) as usize)
            .collect();

        let mut content = reflection;
        if !tail.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&tail.join("\n"));
        }

        let generation = record.generation_count + 1;
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        sqlx::query(&format!(
            "UPDATE {table} SET \
             active_observations = $2, \
             generation_count = $3, \
             observation_token_count = $4, \
             buffered_reflection = NULL, \
             reflection_pending = FALSE, \
             reflection_line_offset = NULL, \
             updated_at = $5, updated_at_z = $6 \
             WHERE id = $1"
        ))
        .bind(record_id)
        .bind(&content)
        .bind(generation)
        .bind(reflected_token_count)
        .bind(naive)
        .bind(aware)
        .execute(&mut *tx)
        .await
        .map_err(EngramError::db_with("observations.promote_reflection", record_id.to_string()))?;

        tx.commit()
            .await
            .map_err(EngramError::db("observations.promote_reflection"))?;

        debug!(record_id = %record_id, generation, "reflection promoted");
        Ok(ObservationalMemoryRecord {
            active_observations: content,
            generation_count: generation,
            observation_token_count: reflected_token_count,
            buffered_reflection: None,
            reflection_pending: false,
            reflection_line_offset: None,
            updated_at: now,
            ..record
        })
    }

    /// Flip the buffering flag (auto-committed single-row update)
    pub async fn set_buffering(&self, record_id: Uuid, buffering: bool) -> Result<()> {
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let sql = format!(
            "UPDATE {} SET is_buffering = $2, updated_at = $3, updated_at_z = $4 WHERE id = $1",
            self.table()
        );
        let result = sqlx::query(&sql)
            .bind(record_id)
            .bind(buffering)
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("observations.set_buffering", record_id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound {
                entity: "observational memory record",
                id: record_id.to_string(),
            });
        }
        Ok(())
    }

    /// Delete the record for a scope, returning whether one existed
    pub async fn delete(&self, scope: &MemoryScope) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE lookup_key = $1", self.table());
        let key = scope.lookup_key();
        let result = sqlx::query(&sql)
            .bind(&key)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("observations.delete", key))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(message_tokens: i64) -> BufferedObservationChunk {
        BufferedObservationChunk {
            id: Uuid::new_v4(),
            cycle_id: "cycle".into(),
            observations: "obs".into(),
            token_count: 10,
            message_ids: vec![],
            message_tokens,
            last_observed_at: Utc::now(),
            created_at: Utc::now(),
            suggested_continuation: None,
            current_task: None,
        }
    }

    fn params(pending: i64, threshold: i64, ratio: f64) -> ActivationParams {
        ActivationParams {
            current_pending_tokens: pending,
            message_tokens_threshold: threshold,
            activation_ratio: ratio,
            force_max_activation: false,
        }
    }

    #[test]
    fn test_boundary_reference_case_selects_best_over() {
        // retention_floor = 8000 * 0.5 = 4000, target = 10000 - 4000 = 6000
        // prefix sums 2000 / 4500 / 7500; best_over = 3 chunks at 7500,
        // overshoot 1500 <= 3800 and remaining 2500 >= 1000
        let chunks = vec![chunk(2000), chunk(2500), chunk(3000)];
        let decision = select_activation_boundary(&chunks, params(10_000, 8_000, 0.5));
        assert_eq!(decision.retention_floor, 4_000);
        assert_eq!(decision.target_message_tokens, 6_000);
        assert_eq!(decision.boundary, 3);
        assert_eq!(decision.promoted_message_tokens, 7_500);
    }

    #[test]
    fn test_boundary_falls_back_to_best_under_on_overshoot() {
        // floor = 30000, target = 30000; prefix sums 10000 / 58800.
        // best_over leaves 1200 >= 1000 raw tokens, but its overshoot of
        // 28800 exceeds 0.95 * 30000 = 28500, so the under-target prefix
        // (1 chunk, 10000) wins.
        let chunks = vec![chunk(10_000), chunk(48_800)];
        let decision = select_activation_boundary(&chunks, params(60_000, 60_000, 0.5));
        assert_eq!(decision.boundary, 1);
        assert_eq!(decision.promoted_message_tokens, 10_000);
    }

    #[test]
    fn test_boundary_respects_minimum_remaining_floor() {
        // floor = 4000, target = 6000; a single prefix of 9500 would leave
        // only 500 < min(1000, 4000) raw tokens, so best_under (none) makes
        // the search promote one chunk anyway.
        let chunks = vec![chunk(9_500)];
        let decision = select_activation_boundary(&chunks, params(10_000, 8_000, 0.5));
        assert_eq!(decision.boundary, 1);
        assert_eq!(decision.promoted_message_tokens, 9_500);
    }

    #[test]
    fn test_oversized_chunk_with_followers_falls_back_to_under() {
        // sums 3000 / 12500: best_over leaves 10000 - 12500 < 0 remaining,
        // so the under prefix (1 chunk) wins.
        let chunks = vec![chunk(3_000), chunk(9_500)];
        let decision = select_activation_boundary(&chunks, params(10_000, 8_000, 0.5));
        assert_eq!(decision.boundary, 1);
        assert_eq!(decision.promoted_message_tokens, 3_000);
    }

    #[test]
    fn test_force_max_prefers_over_despite_overshoot() {
        // same shape as the overshoot fallback case, but forcing activation
        // accepts the overshoot because remaining 4000 >= 1000
        let chunks = vec![chunk(5_000), chunk(1_000)];
        let mut p = params(10_000, 8_000, 0.5);
        p.force_max_activation = true;
        let decision = select_activation_boundary(&chunks, p);
        // prefix sums 5000 / 6000; best_over = 2 at 6000 meets target exactly
        assert_eq!(decision.boundary, 2);
        assert_eq!(decision.promoted_message_tokens, 6_000);
    }

    #[test]
    fn test_force_max_still_honors_remaining_floor() {
        let chunks = vec![chunk(9_800)];
        let mut p = params(10_000, 8_000, 0.5);
        p.force_max_activation = true;
        // remaining would be 200 < 1000; nothing qualifies, promote one
        let decision = select_activation_boundary(&chunks, p);
        assert_eq!(decision.boundary, 1);
    }

    #[test]
    fn test_all_chunks_below_target_promotes_everything() {
        // total 3000 < target 6000; best_over never fires and best_under is
        // the full prefix
        let chunks = vec![chunk(1_000), chunk(1_000), chunk(1_000)];
        let decision = select_activation_boundary(&chunks, params(10_000, 8_000, 0.5));
        assert_eq!(decision.boundary, 3);
        assert_eq!(decision.promoted_message_tokens, 3_000);
    }

    #[test]
    fn test_empty_buffer_promotes_nothing() {
        let decision = select_activation_boundary(&[], params(10_000, 8_000, 0.5));
        assert_eq!(decision.boundary, 0);
        assert_eq!(decision.promoted_message_tokens, 0);
    }

    #[test]
    fn test_zero_pending_still_promotes_one_chunk() {
        // target clamps to 0; the first prefix always meets it, and the
        // buffer must never stall
        let chunks = vec![chunk(0), chunk(0)];
        let decision = select_activation_boundary(&chunks, params(0, 8_000, 0.5));
        assert_eq!(decision.target_message_tokens, 0);
        assert_eq!(decision.boundary, 1);
    }

    #[test]
    fn test_count_lines() {
        assert_eq!(count_lines(""), 0);
        assert_eq!(count_lines("one"), 1);
        assert_eq!(count_lines("one\ntwo"), 2);
        assert_eq!(count_lines("one\ntwo\n"), 2);
    }
}
