//! Spoken command routing.
//!
//! Translates a finalized human transcript into a routing decision: who is
//! being addressed, what floor-control action the words imply, and with what
//! confidence. Short-term context survives between utterances so "also
//! respond to this" reaches whoever was addressed last.
//!
//! Parse order (first match wins):
//!
//! 1. direct prefix with an explicit marker ("hey claude ...", "@guest ...",
//!    "claude: ...") — confidence 0.9
//! 2. bare keyword prefix ("both of you ...") — confidence 0.7
//! 3. inline address within the first 20 characters — confidence 0.55
//! 4. fuzzy match over the first three tokens (Levenshtein distance <= 2,
//!    similarity >= 0.6) — confidence 0.7 x similarity
//! 5. contextual continuation ("also ...", "same to you") reusing the last
//!    addressed targets
//!
//! Barge-in and ducking phrases ("everyone stop", "turn down the volume")
//! are detected on the full text before any address parsing and returned
//! immediately.

use regex::Regex;
use serde::Serialize;

use crate::session::SpeakerId;

/// Characters that may delimit an address keyword.
const ADDRESS_DELIMITERS: &[char] = &[' ', ',', ':', '-'];
/// How far into the text an inline address may start.
const INLINE_WINDOW: usize = 20;
/// Floor for extracted thinking durations.
const MIN_THINKING_MS: u64 = 10_000;
/// Fallback thinking duration.
const DEFAULT_THINKING_MS: u64 = 30_000;

// ── Decision types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// Route the remainder to specific speakers.
    Address,
    /// Enter timed thinking mode.
    Thinking,
    /// No specific target; everyone hears it.
    Broadcast,
    /// Stop/interrupt the agents.
    BargeInControl,
    /// Lower the agents' volume.
    DuckingControl,
}

/// Rolling short-term context between utterances.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandContext {
    pub last_addressed: Option<Vec<SpeakerId>>,
    pub last_action: Option<CommandAction>,
    /// Epoch milliseconds of the last update.
    pub updated_at_ms: u64,
}

/// The outcome of routing one utterance.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub raw: String,
    pub normalized: String,
    pub targets: Vec<SpeakerId>,
    /// Text left after the address prefix was consumed.
    pub remainder: String,
    pub action: CommandAction,
    /// Set only for `Thinking`.
    pub duration_ms: Option<u64>,
    pub confidence: f64,
    pub matched_keywords: Vec<String>,
    pub fuzzy_matched: bool,
    /// The context as it was read at the start of this call.
    pub context: CommandContext,
}

// ── Configuration ──────────────────────────────────────────────────

/// Alias lists mapped to targets. The group and showrunner keywords are
/// fixed; participant names are deployment-specific.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub host_aliases: Vec<String>,
    pub guest_aliases: Vec<String>,
    pub human_aliases: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host_aliases: vec!["claude".into()],
            guest_aliases: vec!["guest".into()],
            human_aliases: vec!["basil".into()],
        }
    }
}

// ── Router ─────────────────────────────────────────────────────────

struct Keyword {
    word: String,
    targets: Vec<SpeakerId>,
    /// `^(hey )?@kw<delim>` or `^@kw<delim>`: explicit marker prefix.
    marker_re: Regex,
    /// `^kw<punct>`: keyword followed by punctuation.
    punct_re: Regex,
    /// `^kw<space-or-comma>`: bare keyword prefix.
    bare_re: Regex,
}

pub struct CommandRouter {
    keywords: Vec<Keyword>,
    context: CommandContext,
    barge_in_intents: Vec<(Regex, f64, &'static str)>,
    ducking_intents: Vec<(Regex, f64, &'static str)>,
    thinking_word_re: Regex,
    thinking_patterns: Vec<Regex>,
    continuation_patterns: Vec<Regex>,
    seconds_re: Regex,
    minutes_re: Regex,
    quick_re: Regex,
    long_re: Regex,
}

impl CommandRouter {
    pub fn new(config: &RouterConfig) -> Self {
        let mut keywords = Vec::new();
        let mut add = |aliases: &[String], targets: Vec<SpeakerId>| {
            for alias in aliases {
                let alias = alias.trim().to_lowercase();
                if alias.is_empty() {
                    continue;
                }
                let esc = regex::escape(&alias);
                keywords.push(Keyword {
                    marker_re: Regex::new(&format!(r"^(?:hey\s+@?|@){esc}[\s,:\-]+")).unwrap(),
                    punct_re: Regex::new(&format!(r"^{esc}\s*[,:\-][\s,:\-]*")).unwrap(),
                    bare_re: Regex::new(&format!(r"^{esc}[\s,]+")).unwrap(),
                    word: alias,
                    targets: targets.clone(),
                });
            }
        };

        add(&config.host_aliases, vec![SpeakerId::Host]);
        add(&config.guest_aliases, vec![SpeakerId::Guest]);
        add(&config.human_aliases, vec![SpeakerId::Human]);
        let group: Vec<String> = ["both", "everyone", "all"].map(String::from).to_vec();
        add(&group, vec![SpeakerId::Host, SpeakerId::Guest]);
        let showrunner: Vec<String> = ["showrunner", "autopilot"].map(String::from).to_vec();
        add(&showrunner, vec![SpeakerId::Host]);

        Self {
            keywords,
            context: CommandContext::default(),
            barge_in_intents: vec![
                (
                    Regex::new(r"\b(stop|halt|interrupt|quiet|silence)\b").unwrap(),
                    0.8,
                    "stop",
                ),
                (
                    Regex::new(r"\b(hold\s+up|wait\s+a\s+minute)\b").unwrap(),
                    0.75,
                    "hold up",
                ),
                (
                    Regex::new(r"\bmute\s+(everyone|all)\b").unwrap(),
                    0.85,
                    "mute everyone",
                ),
            ],
            ducking_intents: vec![
                (
                    Regex::new(r"\b(lower|reduce|quieter|softer)\s+(volume|sound)\b").unwrap(),
                    0.8,
                    "lower volume",
                ),
                (Regex::new(r"\bturn\s+down\b").unwrap(), 0.75, "turn down"),
                (Regex::new(r"\bvolume\s+down\b").unwrap(), 0.8, "volume down"),
            ],
            thinking_word_re: Regex::new(
                r"\b(thinking|think|pause|wait|hold|moment|beat|countdown|processing|consider|ponder|reflect)\b",
            )
            .unwrap(),
            thinking_patterns: [
                r"thinking\s+mode",
                r"take\s+a\s+(beat|moment|second)",
                r"need\s+to\s+think",
                r"give\s+(me|us|them)\s+(\d+)?\s*(seconds?|minutes?|time)",
                r"time\s+to\s+(think|process|consider)",
                r"let\s+(me|us|them)\s+(think|process|ponder)",
                r"pause\s+(for|to)",
            ]
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect(),
            continuation_patterns: [
                r"^(and\s+)?(also|too|as well)",
                r"^continue",
                r"^same\s+to\s+you",
                r"^you\s+too",
                r"\b(same|ditto)\b",
            ]
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect(),
            seconds_re: Regex::new(r"(\d+)\s*(seconds?|secs?|s\b)").unwrap(),
            minutes_re: Regex::new(r"(\d+)\s*(minutes?|mins?|m\b)").unwrap(),
            quick_re: Regex::new(r"(quick|brief|short)\s+(moment|pause|beat)").unwrap(),
            long_re: Regex::new(r"long\s+(moment|pause|beat)").unwrap(),
        }
    }

    /// Route one utterance. Returns `None` for empty input.
    pub fn route(&mut self, text: &str) -> Option<RouteDecision> {
        let raw = text.to_string();
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }

        let context_snapshot = self.context.clone();

        // Control intents bypass address parsing entirely.
        if let Some(decision) = self.detect_intent(&raw, &normalized, &context_snapshot) {
            self.update_context(&decision);
            return Some(decision);
        }

        let address = self.parse_address(&normalized, &context_snapshot);

        let (targets, remainder, mut confidence, matched_keywords, fuzzy_matched) = match address {
            Some(a) => a,
            None => (Vec::new(), normalized.clone(), 0.5, Vec::new(), false),
        };

        let action;
        let mut duration_ms = None;
        let mut final_targets = targets;

        if self.is_thinking(&remainder) {
            action = CommandAction::Thinking;
            duration_ms = Some(self.extract_duration(&remainder));
            if final_targets.is_empty() {
                final_targets = vec![SpeakerId::Host];
                confidence = 0.7;
            }
        } else if !final_targets.is_empty() {
            action = CommandAction::Address;
        } else {
            action = CommandAction::Broadcast;
        }

        let decision = RouteDecision {
            raw,
            normalized,
            targets: final_targets,
            remainder,
            action,
            duration_ms,
            confidence,
            matched_keywords,
            fuzzy_matched,
            context: context_snapshot,
        };
        self.update_context(&decision);
        Some(decision)
    }

    /// The current rolling context.
    pub fn context(&self) -> &CommandContext {
        &self.context
    }

    // ── Intents ───────────────────────────────────────────────────

    fn detect_intent(
        &self,
        raw: &str,
        normalized: &str,
        context: &CommandContext,
    ) -> Option<RouteDecision> {
        let found = self
            .barge_in_intents
            .iter()
            .find(|(re, _, _)| re.is_match(normalized))
            .map(|(_, conf, label)| (CommandAction::BargeInControl, *conf, *label))
            .or_else(|| {
                self.ducking_intents
                    .iter()
                    .find(|(re, _, _)| re.is_match(normalized))
                    .map(|(_, conf, label)| (CommandAction::DuckingControl, *conf, *label))
            });

        found.map(|(action, confidence, label)| RouteDecision {
            raw: raw.to_string(),
            normalized: normalized.to_string(),
            targets: vec![SpeakerId::Host, SpeakerId::Guest],
            remainder: normalized.to_string(),
            action,
            duration_ms: None,
            confidence,
            matched_keywords: vec![label.to_string()],
            fuzzy_matched: false,
            context: context.clone(),
        })
    }

    // ── Address parsing ───────────────────────────────────────────

    #[allow(clippy::type_complexity)]
    fn parse_address(
        &self,
        normalized: &str,
        context: &CommandContext,
    ) -> Option<(Vec<SpeakerId>, String, f64, Vec<String>, bool)> {
        // Tier 1: explicit marker ("hey"/"@"/punctuation), 0.9
        for kw in &self.keywords {
            let end = kw
                .marker_re
                .find(normalized)
                .or_else(|| kw.punct_re.find(normalized))
                .map(|m| m.end());
            if let Some(end) = end {
                return Some((
                    kw.targets.clone(),
                    normalized[end..].trim().to_string(),
                    0.9,
                    vec![kw.word.clone()],
                    false,
                ));
            }
        }

        // Tier 2: bare keyword prefix, 0.7
        for kw in &self.keywords {
            if let Some(m) = kw.bare_re.find(normalized) {
                return Some((
                    kw.targets.clone(),
                    normalized[m.end()..].trim().to_string(),
                    0.7,
                    vec![kw.word.clone()],
                    false,
                ));
            }
        }

        // Tier 3: inline address in the first 20 characters, 0.55
        for kw in &self.keywords {
            for (pos, _) in normalized.match_indices(kw.word.as_str()) {
                if pos == 0 || pos > INLINE_WINDOW {
                    continue;
                }
                let before_ok = normalized[..pos]
                    .chars()
                    .next_back()
                    .map_or(false, |c| ADDRESS_DELIMITERS.contains(&c));
                let after = normalized[pos + kw.word.len()..].chars().next();
                let after_ok = after.map_or(true, |c| ADDRESS_DELIMITERS.contains(&c));
                if before_ok && after_ok {
                    let rest = normalized[pos + kw.word.len()..]
                        .trim_start_matches(ADDRESS_DELIMITERS)
                        .to_string();
                    return Some((kw.targets.clone(), rest, 0.55, vec![kw.word.clone()], false));
                }
            }
        }

        // Tier 4: fuzzy match over the first three tokens
        if let Some(result) = self.fuzzy_address(normalized) {
            return Some(result);
        }

        // Tier 5: contextual continuation
        if let Some(last) = &context.last_addressed {
            if self
                .continuation_patterns
                .iter()
                .any(|re| re.is_match(normalized))
            {
                return Some((last.clone(), normalized.to_string(), 0.6, Vec::new(), false));
            }
        }

        None
    }

    #[allow(clippy::type_complexity)]
    fn fuzzy_address(
        &self,
        normalized: &str,
    ) -> Option<(Vec<SpeakerId>, String, f64, Vec<String>, bool)> {
        let mut best: Option<(f64, &Keyword, usize)> = None; // (similarity, keyword, token end)

        let mut cursor = 0;
        for token in normalized.split_whitespace().take(3) {
            let rel = normalized[cursor..].find(token)?;
            let start = cursor + rel;
            let end = start + token.len();
            cursor = end;

            let cleaned = token.trim_matches(|c: char| {
                ADDRESS_DELIMITERS.contains(&c) || matches!(c, '.' | '!' | '?' | ';')
            });
            if cleaned.is_empty() {
                continue;
            }

            for kw in &self.keywords {
                let distance = levenshtein(cleaned, &kw.word);
                if distance > 2 {
                    continue;
                }
                let similarity = 1.0 - distance as f64 / kw.word.len() as f64;
                if similarity < 0.6 {
                    continue;
                }
                if best.as_ref().map_or(true, |(s, _, _)| similarity > *s) {
                    best = Some((similarity, kw, end));
                }
            }
        }

        best.map(|(similarity, kw, end)| {
            (
                kw.targets.clone(),
                normalized[end..]
                    .trim_start_matches(ADDRESS_DELIMITERS)
                    .to_string(),
                0.7 * similarity,
                vec![kw.word.clone()],
                true,
            )
        })
    }

    // ── Thinking detection ────────────────────────────────────────

    fn is_thinking(&self, text: &str) -> bool {
        self.thinking_word_re.is_match(text)
            || self.thinking_patterns.iter().any(|re| re.is_match(text))
    }

    fn extract_duration(&self, text: &str) -> u64 {
        let duration = if let Some(caps) = self.seconds_re.captures(text) {
            caps[1].parse::<u64>().map(|n| n * 1000).ok()
        } else if let Some(caps) = self.minutes_re.captures(text) {
            caps[1].parse::<u64>().map(|n| n * 60_000).ok()
        } else if self.quick_re.is_match(text) {
            Some(10_000)
        } else if self.long_re.is_match(text) {
            Some(60_000)
        } else {
            None
        };
        duration.unwrap_or(DEFAULT_THINKING_MS).max(MIN_THINKING_MS)
    }

    fn update_context(&mut self, decision: &RouteDecision) {
        if decision.targets.is_empty() {
            return;
        }
        self.context.last_addressed = Some(decision.targets.clone());
        self.context.last_action = Some(decision.action);
        self.context.updated_at_ms = chrono::Utc::now().timestamp_millis() as u64;
    }
}

/// Minimum single-character edits to turn `a` into `b`.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

// ── Tests ──────────────────────────────────────────────────────────
