// ── Merchant Memory: Deduplicator ──────────────────────────────────────────
//
// Decides whether a candidate memory restates something the user already
// has. Four layers, strict order, first hit wins:
//
//   1. exact       SHA-256 of the lower-cased, whitespace-normalized text
//   2. fuzzy       Ratcliff/Obershelp ratio ≥ 0.95 over the window
//   3. key_phrase  Jaccard of ≥4-char token sets ≥ 0.80 over the window
//   4. semantic    cosine of embeddings ≥ 0.85 over the window
//
// The window is the user's N most recent active memories of the same
// category. A hit is recorded (provenance row + access bump) atomically.

use crate::atoms::constants::KEY_PHRASE_MIN_LEN;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::{DedupType, DuplicateRecord, Memory, MemoryCategory, MemoryId};
use crate::engine::config::DedupConfig;
use crate::engine::store::vector::cosine_similarity;
use crate::engine::store::MemoryStore;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

// ═══════════════════════════════════════════════════════════════════════════
// Normalization & similarity primitives
// ═══════════════════════════════════════════════════════════════════════════

/// Trim and collapse internal whitespace. This is the form that gets stored.
pub fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The comparison form: normalized and lower-cased.
pub fn dedup_key(content: &str) -> String {
    normalize_content(content).to_lowercase()
}

/// Hex SHA-256 of the comparison form.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(dedup_key(content).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Ratcliff/Obershelp similarity: 2·M / (|a| + |b|), where M is the number
/// of characters in recursively found longest common blocks.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched = BlockMatcher::new(&a, &b).matching_chars(0).unwrap_or(0);
    2.0 * matched as f64 / total as f64
}

/// `sequence_ratio` when it reaches `threshold`, `None` otherwise. Cheap
/// upper bounds reject most pairs before any block search, and the block
/// search stops as soon as the threshold is out of reach.
pub fn sequence_ratio_at_least(a: &str, b: &str, threshold: f64) -> Option<f64> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return (threshold <= 1.0).then_some(1.0);
    }
    if real_quick_ratio(&a, &b) < threshold || quick_ratio(&a, &b) < threshold {
        return None;
    }
    let needed = (threshold * total as f64 / 2.0 - 1e-9).ceil().max(0.0) as usize;
    let matched = BlockMatcher::new(&a, &b).matching_chars(needed)?;
    let ratio = 2.0 * matched as f64 / total as f64;
    (ratio >= threshold).then_some(ratio)
}

/// Upper bound from lengths alone.
fn real_quick_ratio(a: &[char], b: &[char]) -> f64 {
    2.0 * a.len().min(b.len()) as f64 / (a.len() + b.len()) as f64
}

/// Upper bound from shared character counts, ignoring order.
fn quick_ratio(a: &[char], b: &[char]) -> f64 {
    let mut available: HashMap<char, usize> = HashMap::new();
    for c in b {
        *available.entry(*c).or_default() += 1;
    }
    let mut matched = 0usize;
    for c in a {
        if let Some(n) = available.get_mut(c) {
            if *n > 0 {
                *n -= 1;
                matched += 1;
            }
        }
    }
    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

/// Longest-block search over `b` indexed by character, with reusable
/// run-length buffers.
struct BlockMatcher<'s> {
    a: &'s [char],
    b_index: HashMap<char, Vec<usize>>,
    runs: Vec<usize>,
    next_runs: Vec<usize>,
    touched: Vec<usize>,
    next_touched: Vec<usize>,
}

impl<'s> BlockMatcher<'s> {
    fn new(a: &'s [char], b: &[char]) -> Self {
        let mut b_index: HashMap<char, Vec<usize>> = HashMap::new();
        for (j, c) in b.iter().enumerate() {
            b_index.entry(*c).or_default().push(j);
        }
        BlockMatcher {
            a,
            b_index,
            runs: vec![0; b.len() + 1],
            next_runs: vec![0; b.len() + 1],
            touched: Vec::new(),
            next_touched: Vec::new(),
        }
    }

    /// Characters in matching blocks, or `None` once fewer than `needed`
    /// can still be found. `needed = 0` never gives up.
    fn matching_chars(&mut self, needed: usize) -> Option<usize> {
        let (la, lb) = (self.a.len(), self.runs.len() - 1);
        let mut matched = 0usize;
        // matched + the best any pending range could still add
        let mut reachable = la.min(lb);
        if reachable < needed {
            return None;
        }
        let mut pending = vec![(0, la, 0, lb)];
        while let Some((alo, ahi, blo, bhi)) = pending.pop() {
            reachable -= (ahi - alo).min(bhi - blo);
            let (i, j, k) = self.longest_block(alo, ahi, blo, bhi);
            if k > 0 {
                matched += k;
                reachable += k;
                if alo < i && blo < j {
                    reachable += (i - alo).min(j - blo);
                    pending.push((alo, i, blo, j));
                }
                if i + k < ahi && j + k < bhi {
                    reachable += (ahi - i - k).min(bhi - j - k);
                    pending.push((i + k, ahi, j + k, bhi));
                }
            }
            if reachable < needed {
                return None;
            }
        }
        Some(matched)
    }

    /// Longest common contiguous block of a[alo..ahi] and b[blo..bhi],
    /// earliest in `a` on ties. Returns (start_a, start_b, len).
    fn longest_block(&mut self, alo: usize, ahi: usize, blo: usize, bhi: usize) -> (usize, usize, usize) {
        let mut best = (alo, blo, 0);
        for i in alo..ahi {
            if let Some(positions) = self.b_index.get(&self.a[i]) {
                let from = positions.partition_point(|&j| j < blo);
                for &j in &positions[from..] {
                    if j >= bhi {
                        break;
                    }
                    // runs[j + 1] is the block length ending at (i, j)
                    let len = self.runs[j] + 1;
                    self.next_runs[j + 1] = len;
                    self.next_touched.push(j + 1);
                    if len > best.2 {
                        best = (i + 1 - len, j + 1 - len, len);
                    }
                }
            }
            for t in self.touched.drain(..) {
                self.runs[t] = 0;
            }
            std::mem::swap(&mut self.runs, &mut self.next_runs);
            std::mem::swap(&mut self.touched, &mut self.next_touched);
        }
        for t in self.touched.drain(..) {
            self.runs[t] = 0;
        }
        best
    }
}

/// Lower-cased alphanumeric tokens of at least `KEY_PHRASE_MIN_LEN` chars.
pub fn key_phrases(content: &str) -> HashSet<String> {
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= KEY_PHRASE_MIN_LEN)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard overlap. Two empty sets do not match.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    inter as f64 / union as f64
}

// ═══════════════════════════════════════════════════════════════════════════
// Deduplicator
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub original_id: MemoryId,
    pub dedup_type: DedupType,
    pub similarity: f64,
}

/// Pre-computed comparison forms of one candidate.
struct CandidateForms {
    key: String,
    phrases: HashSet<String>,
    embedding: Option<Vec<f32>>,
}

impl CandidateForms {
    fn new(content: &str, embedding: Option<&[f32]>) -> Self {
        CandidateForms {
            key: dedup_key(content),
            phrases: key_phrases(content),
            embedding: embedding.map(<[f32]>::to_vec),
        }
    }
}

pub struct Deduplicator {
    store: MemoryStore,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(store: MemoryStore, config: DedupConfig) -> Self {
        Deduplicator { store, config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Run the layered check without recording anything.
    pub async fn check(
        &self,
        user_id: &str,
        content: &str,
        category: MemoryCategory,
        embedding: Option<&[f32]>,
    ) -> MemoryResult<Option<DuplicateMatch>> {
        let hash = content_hash(content);
        if let Some(original_id) = self.store.find_by_hash(user_id, &hash).await? {
            debug!("[dedup] exact hit on {}", original_id);
            return Ok(Some(DuplicateMatch {
                original_id,
                dedup_type: DedupType::Exact,
                similarity: 1.0,
            }));
        }

        let window = self.store.window(user_id, category, self.config.window).await?;
        if window.is_empty() {
            return Ok(None);
        }
        let forms = CandidateForms::new(content, embedding);
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || match_window(&config, &forms, window.iter()))
            .await
            .map_err(|e| MemoryError::Other(format!("dedup window task failed: {}", e)))
    }

    /// Layered check, and on a hit merge the candidate into the original
    /// (provenance row + access bump). Returns the match when one was found.
    pub async fn find_duplicate(
        &self,
        user_id: &str,
        content: &str,
        category: MemoryCategory,
        embedding: Option<&[f32]>,
    ) -> MemoryResult<Option<DuplicateMatch>> {
        let Some(hit) = self.check(user_id, content, category, embedding).await? else {
            return Ok(None);
        };
        let record = DuplicateRecord {
            original_id: hit.original_id.clone(),
            duplicate_content_hash: content_hash(content),
            similarity_score: hit.similarity,
            dedup_type: hit.dedup_type,
            created_at: Utc::now(),
        };
        match self.store.record_duplicate_hit(user_id, record).await {
            Ok(()) => {
                info!(
                    "[dedup] {} duplicate of {} (similarity {:.3})",
                    hit.dedup_type, hit.original_id, hit.similarity
                );
                Ok(Some(hit))
            }
            // The original left `active` between check and merge; store as new.
            Err(MemoryError::NotFound(_)) => {
                warn!("[dedup] Original {} vanished before merge, storing candidate as new", hit.original_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Converge a user's active set: walk oldest-first and retire every row
    /// equivalent to an earlier survivor. Returns how many were retired.
    pub async fn dedup_sweep(&self, user_id: &str) -> MemoryResult<usize> {
        let rows = self.store.active_oldest_first(user_id).await?;
        let total = rows.len();
        let config = self.config.clone();
        let plan = tokio::task::spawn_blocking(move || plan_sweep(&config, rows))
            .await
            .map_err(|e| MemoryError::Other(format!("dedup sweep task failed: {}", e)))?;

        let mut retired = 0usize;
        for (duplicate_id, record) in plan {
            let original_id = record.original_id.clone();
            let dedup_type = record.dedup_type;
            match self.store.merge_into(&duplicate_id, record).await {
                Ok(true) => {
                    retired += 1;
                    debug!("[dedup] sweep retired {} into {} ({})", duplicate_id, original_id, dedup_type);
                }
                Ok(false) => {}
                Err(e) => warn!("[dedup] sweep could not retire {}: {}", duplicate_id, e),
            }
        }

        info!("[dedup] Sweep for {}: {} active rows, {} retired", user_id, total, retired);
        Ok(retired)
    }
}

/// Layers 2–4 against a window, in strict layer order. Within a layer the
/// best-scoring row wins; ties go to the earlier (more recent) row.
fn match_window<'m, I>(
    config: &DedupConfig,
    forms: &CandidateForms,
    window: I,
) -> Option<DuplicateMatch>
where
    I: Iterator<Item = &'m Memory> + Clone,
{
    let layers: [(DedupType, f64); 3] = [
        (DedupType::Fuzzy, config.fuzzy_threshold),
        (DedupType::KeyPhrase, config.key_phrase_threshold),
        (DedupType::Semantic, config.semantic_threshold),
    ];
    for (layer, threshold) in layers {
        if layer == DedupType::Semantic && forms.embedding.is_none() {
            debug!("[dedup] semantic layer skipped, no candidate embedding");
            continue;
        }
        let mut best: Option<(&Memory, f64)> = None;
        for row in window.clone() {
            let Some(score) = layer_score(layer, threshold, forms, row) else {
                continue;
            };
            if score >= threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((row, score));
            }
        }
        if let Some((row, score)) = best {
            debug!("[dedup] {} hit on {} ({:.3} ≥ {:.2})", layer, row.id, score, threshold);
            return Some(DuplicateMatch {
                original_id: row.id.clone(),
                dedup_type: layer,
                similarity: score,
            });
        }
    }
    None
}

/// Decide which rows a sweep retires, oldest-first, without touching the
/// store. Returns (duplicate id, provenance record) pairs.
fn plan_sweep(config: &DedupConfig, rows: Vec<Memory>) -> Vec<(MemoryId, DuplicateRecord)> {
    let mut survivors_by_hash: HashMap<String, MemoryId> = HashMap::new();
    let mut survivors: HashMap<MemoryCategory, Vec<Memory>> = HashMap::new();
    let mut plan = Vec::new();

    for row in rows {
        let hit = if let Some(original_id) = survivors_by_hash.get(&row.content_hash) {
            Some(DuplicateMatch {
                original_id: original_id.clone(),
                dedup_type: DedupType::Exact,
                similarity: 1.0,
            })
        } else {
            let forms = CandidateForms::new(&row.content, row.embedding.as_deref());
            let peers = survivors.get(&row.category).map(Vec::as_slice).unwrap_or(&[]);
            let start = peers.len().saturating_sub(config.window);
            match_window(config, &forms, peers[start..].iter().rev())
        };

        match hit {
            Some(hit) => plan.push((
                row.id.clone(),
                DuplicateRecord {
                    original_id: hit.original_id,
                    duplicate_content_hash: row.content_hash.clone(),
                    similarity_score: hit.similarity,
                    dedup_type: hit.dedup_type,
                    created_at: Utc::now(),
                },
            )),
            None => {
                survivors_by_hash.insert(row.content_hash.clone(), row.id.clone());
                survivors.entry(row.category).or_default().push(row);
            }
        }
    }
    plan
}

fn layer_score(layer: DedupType, threshold: f64, forms: &CandidateForms, row: &Memory) -> Option<f64> {
    match layer {
        DedupType::Exact => None,
        DedupType::Fuzzy => sequence_ratio_at_least(&forms.key, &dedup_key(&row.content), threshold),
        DedupType::KeyPhrase => Some(jaccard(&forms.phrases, &key_phrases(&row.content))),
        DedupType::Semantic => {
            let candidate = forms.embedding.as_deref()?;
            let stored = row.embedding.as_deref()?;
            Some(cosine_similarity(candidate, stored))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_and_hash_ignore_case_and_spacing() {
        assert_eq!(normalize_content("  User   prefers\tdark roast \n"), "User prefers dark roast");
        assert_eq!(
            content_hash("User prefers dark roast coffee"),
            content_hash("  user prefers   Dark Roast coffee ")
        );
        assert_ne!(content_hash("dark roast"), content_hash("light roast"));
        assert_eq!(content_hash("x").len(), 64);
    }

    #[test]
    fn sequence_ratio_known_values() {
        assert_eq!(sequence_ratio("", ""), 1.0);
        assert_eq!(sequence_ratio("abcd", "abcd"), 1.0);
        assert_eq!(sequence_ratio("abc", "xyz"), 0.0);
        // difflib.SequenceMatcher(None, "abcd", "bcde").ratio() == 0.75
        assert!((sequence_ratio("abcd", "bcde") - 0.75).abs() < 1e-12);
        // "ab" + "cd" blocks around a mismatch: 2·4 / 10
        assert!((sequence_ratio("abXcd", "abYcd") - 0.8).abs() < 1e-12);
    }

    #[test]
    fn sequence_ratio_is_symmetric_for_typos() {
        let a = "ships all orders from the austin warehouse";
        let b = "ships all orders from the austin warehous";
        let r = sequence_ratio(a, b);
        assert!(r > 0.95, "ratio {}", r);
        assert!((r - sequence_ratio(b, a)).abs() < 1e-12);
    }

    #[test]
    fn bounded_ratio_agrees_with_full_ratio() {
        let pairs = [
            ("abcd", "bcde"),
            ("abXcd", "abYcd"),
            ("ships all orders from the austin warehouse", "ships all orders from the austin warehous"),
            ("prefers fedex for large heavy orders", "heavy orders go by fedex when large"),
            ("", ""),
        ];
        for (a, b) in pairs {
            let full = sequence_ratio(a, b);
            for t in [0.0, 0.5, 0.75, 0.8, 0.95, 1.0] {
                match sequence_ratio_at_least(a, b, t) {
                    Some(r) => {
                        assert!((r - full).abs() < 1e-12, "{a:?}/{b:?} at {t}");
                        assert!(r >= t);
                    }
                    None => assert!(full < t, "{a:?}/{b:?} rejected at {t} with ratio {full}"),
                }
            }
        }
    }

    /// Deterministic word salad from a fixed vocabulary.
    fn salad(seed: u64, chars: usize) -> String {
        const WORDS: [&str; 16] = [
            "order", "ship", "fedex", "candle", "wax", "restock", "invoice", "supplier",
            "weekly", "return", "label", "price", "austin", "warehouse", "customer", "refund",
        ];
        let mut state = seed;
        let mut out = String::with_capacity(chars + 16);
        while out.len() < chars {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            out.push_str(WORDS[(state >> 33) as usize % WORDS.len()]);
            out.push(' ');
        }
        out.truncate(chars);
        out
    }

    #[test]
    fn long_dissimilar_window_stays_fast() {
        use crate::atoms::constants::MAX_CONTENT_CHARS;
        let window: Vec<Memory> = (0..100)
            .map(|i| mem(&format!("m{i}"), &salad(i + 1, MAX_CONTENT_CHARS), None))
            .collect();
        let forms = CandidateForms::new(&salad(999, MAX_CONTENT_CHARS), None);
        let started = std::time::Instant::now();
        // Same vocabulary, so only the key-phrase layer may fire.
        let hit = match_window(&DedupConfig::default(), &forms, window.iter());
        assert!(hit.map_or(true, |h| h.dedup_type != DedupType::Fuzzy));
        assert!(started.elapsed() < std::time::Duration::from_secs(20), "took {:?}", started.elapsed());
    }

    #[test]
    fn key_phrase_tokens_and_jaccard() {
        let a = key_phrases("Prefers FedEx for large, heavy orders");
        assert!(a.contains("fedex"));
        assert!(a.contains("large"));
        assert!(!a.contains("for"));
        let b = key_phrases("For heavy orders, large: prefers FedEx");
        assert!((jaccard(&a, &b) - 1.0).abs() < 1e-12);
        assert_eq!(jaccard(&key_phrases("a an to"), &key_phrases("a an to")), 0.0);
    }

    fn mem(id: &str, content: &str, embedding: Option<Vec<f32>>) -> Memory {
        let mut m = crate::engine::store::test_support::memory("u1", content, MemoryCategory::Preferences);
        m.id = id.into();
        m.embedding = embedding;
        m
    }

    #[test]
    fn layers_run_in_order() {
        let d = DedupConfig::default();
        let window = vec![
            mem("sem", "totally different wording here", Some(vec![1.0, 0.0])),
            mem("kp", "heavy orders large prefers fedex", None),
            mem("fz", "prefers fedex for large heavy orders!", None),
        ];

        let forms = CandidateForms::new("Prefers FedEx for large heavy orders", Some(&[1.0f32, 0.0][..]));
        let hit = match_window(&d, &forms, window.iter()).unwrap();
        assert_eq!(hit.dedup_type, DedupType::Fuzzy);
        assert_eq!(hit.original_id, "fz");

        let hit = match_window(&d, &forms, window[..2].iter()).unwrap();
        assert_eq!(hit.dedup_type, DedupType::KeyPhrase);
        assert_eq!(hit.original_id, "kp");

        let hit = match_window(&d, &forms, window[..1].iter()).unwrap();
        assert_eq!(hit.dedup_type, DedupType::Semantic);
    }

    #[test]
    fn semantic_layer_needs_candidate_embedding() {
        let d = DedupConfig::default();
        let window = vec![mem("sem", "totally different wording here", Some(vec![1.0, 0.0]))];
        let forms = CandidateForms::new("something else entirely", None);
        assert!(match_window(&d, &forms, window.iter()).is_none());
    }

    #[test]
    fn raising_thresholds_never_adds_matches() {
        let window = vec![
            mem("a", "ships from the austin warehouse", Some(vec![0.9, 0.1])),
            mem("b", "austin warehouse ships everything", Some(vec![0.7, 0.7])),
        ];
        let forms = CandidateForms::new("ships from austin warehouse", Some(&[1.0f32, 0.0][..]));
        let mut last_hit = true;
        for step in 0..=10 {
            let t = 0.5 + step as f64 * 0.05;
            let d = DedupConfig {
                fuzzy_threshold: t,
                key_phrase_threshold: t,
                semantic_threshold: t,
                window: 100,
            };
            let hit = match_window(&d, &forms, window.iter()).is_some();
            assert!(last_hit || !hit, "match reappeared at threshold {}", t);
            last_hit = hit;
        }
    }
}
