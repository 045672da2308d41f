//! Canned-response matching and intent classification
//!
//! Three pure classifiers over normalized text: the preloaded-reply
//! lookup, the ending-phrase classifier, and the human-agent intent
//! classifier. The phrase tables are configuration loaded at startup;
//! nothing here is hard-coded against them.

use serde::Deserialize;

/// Lowercase, trim, strip `.,!?;:`, collapse whitespace runs.
pub fn normalize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '.' | ',' | '!' | '?' | ';' | ':'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_spaces(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Phrase tables consumed by [`Matcher`].
#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    /// Exact normalized phrase -> canned reply
    pub preloaded: Vec<(String, String)>,
    /// Prefix -> canned reply, scanned longest-first
    pub prefixes: Vec<(String, String)>,
    pub ending_phrases: Vec<String>,
    pub intent_phrases: Vec<String>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let assistant_intro = "Hi! I'm your AI Assistant. How can I help you today?";
        Self {
            preloaded: vec![
                ("hello".into(), assistant_intro.into()),
                ("hi".into(), assistant_intro.into()),
                ("hey".into(), assistant_intro.into()),
                ("good morning".into(), assistant_intro.into()),
                ("good afternoon".into(), assistant_intro.into()),
                ("good evening".into(), assistant_intro.into()),
                (
                    "how are you".into(),
                    "I'm doing great, thanks for asking! How can I help you today?".into(),
                ),
                (
                    "who are you".into(),
                    "I'm the support assistant for this site. Ask me anything about our product.".into(),
                ),
                (
                    "what can you do".into(),
                    "I can answer product questions, help you troubleshoot, or connect you with an agent.".into(),
                ),
                (
                    "help".into(),
                    "Sure! Tell me what you need help with and I'll do my best.".into(),
                ),
            ],
            prefixes: vec![
                ("hello".into(), assistant_intro.into()),
                ("hi".into(), assistant_intro.into()),
                ("hey".into(), assistant_intro.into()),
                ("good morning".into(), assistant_intro.into()),
                (
                    "how are you".into(),
                    "I'm doing great, thanks for asking! How can I help you today?".into(),
                ),
            ],
            ending_phrases: vec![
                "bye".into(),
                "goodbye".into(),
                "bye bye".into(),
                "see you".into(),
                "see you later".into(),
                "that's all".into(),
                "that is all".into(),
                "no more questions".into(),
                "nothing else".into(),
                "i'm done".into(),
                "ok bye".into(),
            ],
            intent_phrases: vec![
                "talk to agent".into(),
                "talk to a human".into(),
                "talk to an agent".into(),
                "speak to agent".into(),
                "speak to a human".into(),
                "speak with someone".into(),
                "human agent".into(),
                "real person".into(),
                "real human".into(),
                "live agent".into(),
                "customer support agent".into(),
                "transfer me".into(),
                "connect me to an agent".into(),
                "can i talk to a person".into(),
            ],
        }
    }
}

const AGENT_KEYWORDS: &[&str] = &["agent", "human", "person", "representative", "support", "someone"];
const ACTION_KEYWORDS: &[&str] = &[
    "talk", "speak", "connect", "transfer", "want", "need", "get", "show", "give", "bring", "call",
];
const INTERROGATIVE_WORDS: &[&str] = &["what", "who", "is", "are", "explain", "define"];
const INTERROGATIVE_PHRASES: &[&str] = &["tell me about", "how does"];
const THANKS_KEYWORDS: &[&str] = &["thank", "thanks", "thankyou", "thx"];
const DONE_KEYWORDS: &[&str] = &["done", "finished", "complete"];

/// Compiled classifier tables. All lookups run on normalized text.
pub struct Matcher {
    exact: Vec<(String, String)>,
    prefixes: Vec<(String, String)>,
    ending: Vec<String>,
    intent: Vec<String>,
}

impl Matcher {
    pub fn new(config: MatcherConfig) -> Self {
        let exact = config
            .preloaded
            .into_iter()
            .map(|(k, v)| (normalize(&k), v))
            .collect();

        let mut prefixes: Vec<(String, String)> = config
            .prefixes
            .into_iter()
            .map(|(k, v)| (normalize(&k), v))
            .collect();
        // Longest prefix wins
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            exact,
            prefixes,
            ending: config.ending_phrases.iter().map(|p| normalize(p)).collect(),
            intent: config.intent_phrases.iter().map(|p| normalize(p)).collect(),
        }
    }

    /// Preloaded-reply lookup: exact hit first, then bounded prefix match.
    ///
    /// A prefix `p` matches when the input starts with `p` and is no
    /// longer than `p` plus a slack bound (20 for prefixes longer than
    /// 15 chars, 10 otherwise), so "hello there" hits but a full
    /// question starting with "hello" does not.
    pub fn preloaded_reply(&self, input: &str) -> Option<&str> {
        let n = normalize(input);
        if n.is_empty() {
            return None;
        }
        if let Some((_, reply)) = self.exact.iter().find(|(k, _)| *k == n) {
            return Some(reply);
        }
        for (prefix, reply) in &self.prefixes {
            let bound = if prefix.len() > 15 { 20 } else { 10 };
            if n.starts_with(prefix.as_str()) && n.len() <= prefix.len() + bound {
                return Some(reply);
            }
        }
        None
    }

    /// Does the input read as the visitor wrapping up the conversation?
    pub fn is_ending_phrase(&self, input: &str) -> bool {
        let n = normalize(input);
        if n.is_empty() {
            return false;
        }
        let n_tight = strip_spaces(&n);
        let words = word_count(&n);

        for phrase in &self.ending {
            let p_tight = strip_spaces(phrase);
            if n == *phrase
                || n.starts_with(phrase.as_str())
                || n.ends_with(phrase.as_str())
                || n_tight == p_tight
                || n_tight.starts_with(&p_tight)
                || n_tight.ends_with(&p_tight)
            {
                return true;
            }
            if words <= 4 && n.contains(phrase.as_str()) {
                return true;
            }
        }

        if words <= 5 {
            let has_gratitude = n
                .split_whitespace()
                .any(|w| THANKS_KEYWORDS.contains(&w) || DONE_KEYWORDS.contains(&w));
            if has_gratitude || THANKS_KEYWORDS.iter().any(|k| n_tight.contains(k)) {
                return true;
            }
        }

        false
    }

    /// Does the input ask for a human agent?
    ///
    /// Matches enumerated request phrases (directly or with whitespace
    /// stripped), or an agent keyword paired with an action keyword,
    /// unless the sentence carries interrogative context ("what is an
    /// agent" is a question about agents, not a request for one).
    pub fn is_human_intent(&self, input: &str) -> bool {
        let n = normalize(input);
        if n.is_empty() {
            return false;
        }
        let n_tight = strip_spaces(&n);

        if matches!(n.as_str(), "agent" | "human" | "person") {
            return true;
        }

        for phrase in &self.intent {
            if n == *phrase || n.contains(phrase.as_str()) || n_tight.contains(&strip_spaces(phrase))
            {
                return true;
            }
        }

        let tokens: Vec<&str> = n.split_whitespace().collect();
        let has_agent_kw = tokens.iter().any(|t| AGENT_KEYWORDS.contains(t));
        let has_action_kw = tokens.iter().any(|t| ACTION_KEYWORDS.contains(t));
        if has_agent_kw && has_action_kw {
            let interrogative = tokens.iter().any(|t| INTERROGATIVE_WORDS.contains(t))
                || INTERROGATIVE_PHRASES.iter().any(|p| n.contains(p));
            if !interrogative {
                return true;
            }
        }

        false
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}
