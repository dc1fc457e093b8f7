//! Wake word matching on transcripts
//!
//! Matching runs on text, not audio: an exact pass over known aliases, then
//! a fuzzy pass scoring each token (and each n-gram as long as the hotword)
//! against the hotword. Fuzzy hits are learned as new aliases and persisted.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;

use crate::store::{HOTWORD_ALIASES, PersistenceStore};

/// Hotword settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HotwordSettings {
    /// The wake word itself
    pub word: String,
    /// Accent presets used to seed spelling variants (`irish`, `indian`)
    pub accent_presets: Vec<String>,
    /// Extra aliases always accepted
    pub seed_aliases: Vec<String>,
    /// Minimum fuzzy score for a hit
    pub fuzzy_threshold: f64,
    /// Most aliases kept; oldest are dropped first
    pub max_aliases: usize,
}

impl Default for HotwordSettings {
    fn default() -> Self {
        Self {
            word: "parley".to_string(),
            accent_presets: Vec::new(),
            seed_aliases: Vec::new(),
            fuzzy_threshold: 0.74,
            max_aliases: 2000,
        }
    }
}

/// A successful match
#[derive(Debug, Clone, PartialEq)]
pub struct HotwordHit {
    /// Alias (or token) that matched
    pub alias: String,
    /// 1.0 for exact alias matches, the fuzzy score otherwise
    pub score: f64,
}

/// Lowercase, keep ASCII letters and digits, collapse everything else to
/// single spaces
#[must_use]
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn compact(text: &str) -> String {
    normalize(text).replace(' ', "")
}

fn levenshtein(a: &[u8], b: &[u8]) -> usize {
    if a == b {
        return 0;
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let current = row[j + 1];
            let cost = usize::from(ca != cb);
            row[j + 1] = (row[j + 1] + 1).min(row[j] + 1).min(prev + cost);
            prev = current;
        }
    }
    row[b.len()]
}

fn longest_common_subsequence(a: &[u8], b: &[u8]) -> usize {
    let mut row = vec![0usize; b.len() + 1];
    for ca in a {
        let mut diagonal = 0;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb {
                diagonal + 1
            } else {
                row[j + 1].max(row[j])
            };
            diagonal = above;
        }
    }
    row[b.len()]
}

/// Blend of edit-distance similarity and subsequence ratio, in `[0, 1]`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (compact(a), compact(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let longest = a.len().max(b.len()) as f64;
    let edit = 1.0 - levenshtein(a, b) as f64 / longest;
    let lcs = 2.0 * longest_common_subsequence(a, b) as f64 / (a.len() + b.len()) as f64;
    0.5 * edit + 0.5 * lcs
}

/// Spelling variants for a wake word
#[must_use]
pub fn seed_variants(word: &str, presets: &[String], extra: &[String]) -> Vec<String> {
    let w = normalize(word);
    if w.is_empty() {
        return Vec::new();
    }
    let has = |name: &str| presets.iter().any(|p| p.trim().eq_ignore_ascii_case(name));

    let mut seeds = vec![
        w.clone(),
        w.replace(' ', "-"),
        w.replace('a', "ah"),
        w.replace('o', "aw"),
    ];
    if w.len() > 3 {
        seeds.push(w[..w.len() - 1].to_string());
    }
    if has("irish") {
        if let Some(rest) = w.strip_prefix('i') {
            seeds.push(format!("ee{rest}"));
            seeds.push(format!("ih{rest}"));
        }
        seeds.push(w.replace('v', "vv"));
        seeds.push(w.replace("va", "vanna"));
    }
    if has("indian") || has("english-india") {
        seeds.push(w.replace('v', "w"));
        seeds.push(w.replace("van", "wa n"));
        seeds.push(w.replace("ana", "aana"));
        if let Some(rest) = w.strip_prefix('i') {
            seeds.push(format!("ee{rest}"));
            seeds.push(format!("y{w}"));
        }
    }
    seeds.extend(extra.iter().cloned());

    let mut out: Vec<String> = Vec::new();
    for seed in seeds.iter().map(|s| normalize(s)) {
        if !seed.is_empty() && !out.contains(&seed) {
            out.push(seed);
        }
    }
    out
}

/// Detects the wake word in transcripts and learns new spellings
pub struct HotwordMatcher {
    settings: HotwordSettings,
    aliases: Mutex<Vec<String>>,
    store: Arc<dyn PersistenceStore>,
}

impl std::fmt::Debug for HotwordMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotwordMatcher")
            .field("word", &self.settings.word)
            .field("aliases", &self.alias_count())
            .finish_non_exhaustive()
    }
}

impl HotwordMatcher {
    /// Load learned aliases from the store and merge in the seeds
    #[must_use]
    pub fn new(settings: HotwordSettings, store: Arc<dyn PersistenceStore>) -> Self {
        let mut aliases: Vec<String> = Vec::new();
        let learned = store.list(HOTWORD_ALIASES).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not load learned hotword aliases");
            Vec::new()
        });
        for alias in learned
            .iter()
            .map(|a| normalize(a))
            .chain(seed_variants(
                &settings.word,
                &settings.accent_presets,
                &settings.seed_aliases,
            ))
        {
            if !alias.is_empty() && !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }
        cap(&mut aliases, settings.max_aliases);
        tracing::debug!(word = %settings.word, aliases = aliases.len(), "hotword aliases loaded");

        Self {
            settings,
            aliases: Mutex::new(aliases),
            store,
        }
    }

    /// The configured wake word
    #[must_use]
    pub fn word(&self) -> &str {
        &self.settings.word
    }

    /// Number of known aliases
    #[must_use]
    pub fn alias_count(&self) -> usize {
        self.aliases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Look for the wake word in `text`
    pub fn detect(&self, text: &str) -> Option<HotwordHit> {
        let cleaned = normalize(text);
        if cleaned.is_empty() {
            return None;
        }
        let compacted = cleaned.replace(' ', "");

        let mut aliases = self.aliases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(alias) = aliases
            .iter()
            .find(|alias| compacted.contains(&alias.replace(' ', "")))
        {
            return Some(HotwordHit {
                alias: alias.clone(),
                score: 1.0,
            });
        }

        let (token, score) = self
            .candidates(&cleaned)
            .into_iter()
            .map(|token| {
                let score = similarity(&token, &self.settings.word);
                (token, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        if score < self.settings.fuzzy_threshold {
            tracing::trace!(token, score, "no hotword");
            return None;
        }

        if !aliases.contains(&token) {
            aliases.push(token.clone());
            cap(&mut aliases, self.settings.max_aliases);
            if let Err(e) = self.store.append(HOTWORD_ALIASES, &token) {
                tracing::warn!(error = %e, "could not persist learned hotword alias");
            }
            tracing::info!(alias = %token, score, "learned hotword alias");
        }
        Some(HotwordHit {
            alias: token,
            score,
        })
    }

    /// Single tokens plus n-grams as long as the hotword
    fn candidates(&self, cleaned: &str) -> Vec<String> {
        let n = normalize(&self.settings.word).split(' ').count().max(1);
        let tokens: Vec<&str> = cleaned.split(' ').collect();
        let mut out: Vec<String> = tokens.iter().map(ToString::to_string).collect();
        if n > 1 && tokens.len() >= n {
            out.extend(tokens.windows(n).map(|w| w.join(" ")));
        }
        out.dedup();
        out
    }

    /// Remove the matched alias (or the wake word) from `text`
    #[must_use]
    pub fn strip(&self, text: &str, alias: Option<&str>) -> String {
        let target = normalize(alias.unwrap_or(&self.settings.word));
        if target.is_empty() {
            return text.trim().to_string();
        }
        let target_words: Vec<&str> = target.split(' ').collect();
        let words: Vec<&str> = text.split_whitespace().collect();

        let mut out: Vec<&str> = Vec::with_capacity(words.len());
        let mut i = 0;
        while i < words.len() {
            let end = i + target_words.len();
            let matches = end <= words.len()
                && words[i..end]
                    .iter()
                    .zip(&target_words)
                    .all(|(word, target)| normalize(word) == *target);
            if matches {
                i = end;
            } else {
                out.push(words[i]);
                i += 1;
            }
        }

        let joined = out.join(" ");
        joined
            .trim_matches(|c: char| c == ',' || c == '.' || c == '!' || c.is_whitespace())
            .to_string()
    }
}

fn cap(aliases: &mut Vec<String>, max: usize) {
    if max > 0 && aliases.len() > max {
        let excess = aliases.len() - max;
        aliases.drain(..excess);
    }
}
