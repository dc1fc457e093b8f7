//! Keyword intent classification and canned replies

use std::sync::LazyLock;

use rand::seq::SliceRandom;
use regex::Regex;

/// Coarse intent of an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Hello, good morning, how are you
    Greeting,
    /// Positive mood
    Happy,
    /// Tiredness
    Tired,
    /// Sadness
    Sad,
    /// Anger or frustration
    Anger,
    /// Stress or anxiety
    Stress,
    /// Illness or pain
    Pain,
    /// How/why questions and multi-step requests
    Complex,
    /// Anything else worth acting on
    Task,
    /// Empty input
    Chitchat,
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).expect("valid regex"));
    };
}

pattern!(
    GREETING,
    r"(?i)\b(hi|hello|hey|good\s*(morning|afternoon|evening))\b|\b(how\s*are\s*you|how're\s*you)\b"
);
pattern!(
    HAPPY,
    r"(?i)\b(happy|great|awesome|amazing|fantastic|wonderful|glad|excited|excellent|nice|loved?)\b"
);
pattern!(
    TIRED,
    r"(?i)\b(tired|exhausted|sleepy|drained|fatigued|worn\s*out|wiped|shattered)\b"
);
pattern!(
    SAD,
    r"(?i)\b(sad|lonely|depressed|down|blue|heartbroken|upset|hurt|unhappy)\b"
);
pattern!(
    ANGER,
    r"(?i)\b(angry|mad|furious|annoyed|irritated|frustrated|pissed)\b"
);
pattern!(
    STRESS,
    r"(?i)\b(stressed|overwhelmed|burn(ed)?\s*out|under\s*pressure|anxious|anxiety|panic)\b"
);
pattern!(
    PAIN,
    r"(?i)\b(sick|ill|pain|hurts?|ache|fever|cold|flu|migraine|headache|nausea|vomit)\b"
);
pattern!(
    COMPLEX,
    r"(?i)\b(how|why|tutorial|guide|walk\s*me\s*through|steps|explain|configure|set\s*up|troubleshoot|compare|best\s*way|pros\s*and\s*cons|design|architecture|algorithm|calculate|derive|implement)\b"
);
pattern!(HOW_ARE_YOU, r"(?i)\bhow\s*are\s*you\b");
pattern!(HELLO, r"(?i)\b(hi|hello|hey)\b");
pattern!(PART_OF_DAY, r"(?i)\bgood\s*(morning|afternoon|evening)\b");

/// Classify `text`; earlier categories win
#[must_use]
pub fn classify(text: &str) -> Intent {
    let t = text.trim();
    if t.is_empty() {
        return Intent::Chitchat;
    }
    let checks: [(&LazyLock<Regex>, Intent); 8] = [
        (&GREETING, Intent::Greeting),
        (&HAPPY, Intent::Happy),
        (&TIRED, Intent::Tired),
        (&SAD, Intent::Sad),
        (&ANGER, Intent::Anger),
        (&STRESS, Intent::Stress),
        (&PAIN, Intent::Pain),
        (&COMPLEX, Intent::Complex),
    ];
    checks
        .iter()
        .find(|(re, _)| re.is_match(t))
        .map_or(Intent::Task, |(_, intent)| *intent)
}

/// Canned reply for a greeting, if `text` is one
#[must_use]
pub fn greeting_reply(text: &str) -> Option<String> {
    if HOW_ARE_YOU.is_match(text) {
        return Some("I’m steady and focused. What should we tackle first?".to_string());
    }
    if HELLO.is_match(text) {
        return Some("Hey! What can I do for you right now?".to_string());
    }
    PART_OF_DAY.captures(text).map(|caps| {
        let part = caps[1].to_lowercase();
        format!("Good {part}! What’s on your list?")
    })
}

const TIRED_LINES: &[&str] = &[
    "I'm sorry to hear that. I hope you can get some rest soon.",
    "That sounds exhausting. Please take a break if you need one.",
    "It's okay to feel that way. You've been working so hard.",
    "That sounds draining. Maybe a short pause would help?",
    "I hear you. Don't push yourself too hard.",
];

const SAD_LINES: &[&str] = &[
    "I'm sorry you're feeling that way. Is there anything I can help with?",
    "That sounds difficult. I'm here for you if you want to talk.",
    "It's okay to feel sad. Please know that I'm here to support you.",
    "That sounds really tough. Please remember that you're not alone.",
    "I hear you. I'm here to listen.",
];

const ANGER_LINES: &[&str] = &[
    "I understand. I'll try to be more helpful.",
    "I hear your frustration. Let's try to solve this together.",
    "I'm sorry for the trouble. Let's start over if you'd like.",
    "I hear you loud and clear. Let's figure this out.",
];

const STRESS_LINES: &[&str] = &[
    "That sounds like a lot to handle. Remember to take it one step at a time.",
    "It's okay to feel overwhelmed. What's the most important thing right now?",
    "Take a deep breath. Let's break this down together.",
    "That sounds very stressful. What can I help you with first?",
];

const PAIN_LINES: &[&str] = &[
    "I'm sorry you're not feeling well. I hope you get better soon.",
    "I'm sorry you're in pain. Please take it easy.",
    "I hope you can find some relief soon.",
    "Please take care of yourself. I wish you a speedy recovery.",
];

const HAPPY_LINES: &[&str] = &[
    "That's wonderful to hear!",
    "I'm so glad things are going well for you.",
    "That's great news.",
    "Tell me more about that!",
];

const PROCESSING_LINES: &[&str] = &[
    "Got it, give me a moment.",
    "Let me check that for you.",
    "Working on it, one sec.",
    "Let me look that up.",
    "One moment, verifying.",
    "Let me make sure I get this right.",
];

/// Empathetic reply for mood intents
#[must_use]
pub fn empathy_reply(intent: Intent) -> Option<&'static str> {
    let lines = match intent {
        Intent::Tired => TIRED_LINES,
        Intent::Sad => SAD_LINES,
        Intent::Anger => ANGER_LINES,
        Intent::Stress => STRESS_LINES,
        Intent::Pain => PAIN_LINES,
        Intent::Happy => HAPPY_LINES,
        _ => return None,
    };
    lines.choose(&mut rand::thread_rng()).copied()
}

/// Short lines spoken while a slow turn is being processed
#[must_use]
pub const fn processing_lines() -> &'static [&'static str] {
    PROCESSING_LINES
}

/// Random processing line
#[must_use]
pub fn processing_line() -> &'static str {
    PROCESSING_LINES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("One moment.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_order() {
        assert_eq!(classify("hello there"), Intent::Greeting);
        assert_eq!(classify("I feel so tired"), Intent::Tired);
        assert_eq!(classify("explain borrow checking"), Intent::Complex);
        assert_eq!(classify("weather in Paris"), Intent::Task);
        assert_eq!(classify("   "), Intent::Chitchat);
    }

    #[test]
    fn test_greeting_replies() {
        assert_eq!(
            greeting_reply("hey how are you").as_deref(),
            Some("I’m steady and focused. What should we tackle first?")
        );
        assert_eq!(
            greeting_reply("Hello").as_deref(),
            Some("Hey! What can I do for you right now?")
        );
        assert_eq!(
            greeting_reply("good Morning").as_deref(),
            Some("Good morning! What’s on your list?")
        );
        assert_eq!(greeting_reply("what time is it"), None);
    }

    #[test]
    fn test_empathy_reply_matches_mood() {
        let line = empathy_reply(Intent::Sad).unwrap();
        assert!(SAD_LINES.contains(&line));
        assert!(empathy_reply(Intent::Task).is_none());
        assert!(empathy_reply(Intent::Greeting).is_none());
    }

    #[test]
    fn test_processing_line_is_known() {
        assert!(processing_lines().contains(&processing_line()));
    }
}
