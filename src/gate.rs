//! Attention gate: deterministic pre-filters that reject conversational
//! noise before anything reaches storage or an LLM.
//!
//! Two profiles. The user gate drops greetings, filler, and platform
//! scaffolding. The assistant gate is stricter: it additionally drops
//! self-narration, tool-call dumps, and open proposals ("want me to …?"),
//! which would otherwise pollute long-term memory with questions nobody
//! answered. Both are pure functions with no I/O.

use regex::Regex;
use std::sync::LazyLock;

const USER_MIN_CHARS: usize = 30;
const USER_MAX_CHARS: usize = 2000;
const USER_MIN_WORDS: usize = 8;
const USER_MAX_EMOJI: usize = 3;

const ASSISTANT_MAX_CHARS: usize = 1000;
const ASSISTANT_MIN_WORDS: usize = 10;
const ASSISTANT_MAX_FENCED_RATIO: f64 = 0.5;

/// Markers injected into user turns by the memory-refresh pipeline itself.
/// Text carrying them is recycled context, not a fresh utterance.
const INJECTED_MARKERS: [&str; 2] = ["<relevant-memories>", "<core-memory-refresh>"];

/// Tool-call scaffolding that leaks into assistant turns.
const TOOL_MARKERS: [&str; 3] = ["<tool_result>", "<tool_use>", "<function_call>"];

static USER_NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // greetings / acknowledgements
        r"(?i)^(hi|hey|hello|yo|ok|okay|k|kk|sure|yes|yeah|yep|no|nope|nah|thanks|thank you|thx|ty|got it|sounds good|will do|cool|nice|great|perfect|awesome|alright|right|exactly|agreed|same|true|fair)[.!?\s]*$",
        // two-word affirmations ("sounds great", "ok thanks")
        r"(?i)^\w+[ ]\w+[.!?]{0,3}$",
        // deictic short responses
        r"(?i)^(i need those|let me test it|try it now|do it|go ahead|send it|that works|works now|it works)[.!\s]*$",
        // filler
        r"(?i)^(hmm+|lol+|haha+|idk|brb|gtg|oh|ah+|huh|wow|yikes|oof)[.!?\s]*$",
        // anything ≤ 3 chars
        r"^.{0,3}$",
        // XML-only payloads
        r"^\s*(<[^<>]+>\s*)+$",
        // session-reset prompts
        r"(?i)^a new session was started via",
        // raw chat-platform metadata
        r"(?i)^\[(slack|telegram|discord|imessage) message id:",
        // heartbeat / cron wrappers
        r"(?i)^(\[(cron|heartbeat)\]|heartbeat check|cron job:)",
        // conversation-info blocks
        r"(?i)<conversation[-_]info>",
        // scheduled reminder markers
        r"(?i)^(scheduled reminder|reminder:|\[reminder\])",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid noise pattern"))
    .collect()
});

static ASSISTANT_NARRATION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // self-talk openers
        r"(?i)^(let me|i'll|i will|now let me|first,? i|next,? i|now i'll)\b",
        // status narration
        r"(?i)^(starting|running|processing|checking|looking|searching|fetching|reading|analyzing|working on|executing)\b",
        // exclamatory openers
        r"^(Great|Perfect|Done|Excellent|Awesome|Got it)!",
        // step / page narration
        r"(?i)^(step \d|on page \d|page \d|moving to step)",
        // filler
        r"(?i)^(i'm here|i can see|i see that|looks like)\b",
        // completion wrap-ups
        r"(?i)^(done ✅|all good|all set|all done|here's what changed|here's what i did|completed:|finished:)",
        // voice-mode metadata
        r"(?i)\[voice mode|\[voice\]",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid narration pattern"))
    .collect()
});

/// Open proposals: questions the assistant asks and nobody answers.
/// Shared between the assistant gate and the sleep cycle's noise purge so
/// the two layers can never drift apart.
static OPEN_PROPOSALS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bwant me to\b[^?]*\?",
        r"(?i)\bshould i\b[^?]*\?",
        r"(?i)\bshall i\b[^?]*\?",
        r"(?i)\bwould you like me to\b[^?]*\?",
        r"(?i)\bdo you want me to\b[^?]*\?",
        r"(?i)\bcan i\b[^?]*\?",
        r"(?i)\bmay i\b[^?]*\?",
        r"(?i)\bready to\b[^?]*\?",
        r"(?i)\bproceed with\b[^?]*\?",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid proposal pattern"))
    .collect()
});

/// True if the text is an unanswered assistant proposal. Used by the
/// assistant gate at ingest and by the sleep cycle when purging stored noise.
pub fn is_open_proposal(text: &str) -> bool {
    OPEN_PROPOSALS.iter().any(|re| re.is_match(text))
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn is_emoji(c: char) -> bool {
    matches!(c,
        '\u{1F300}'..='\u{1F5FF}'   // symbols & pictographs
        | '\u{1F600}'..='\u{1F64F}' // emoticons
        | '\u{1F680}'..='\u{1F6FF}' // transport & map
        | '\u{1F900}'..='\u{1F9FF}' // supplemental symbols
        | '\u{1FA70}'..='\u{1FAFF}' // extended-A
        | '\u{2600}'..='\u{26FF}'   // miscellaneous symbols
        | '\u{2700}'..='\u{27BF}'   // dingbats
        | '\u{1F1E6}'..='\u{1F1FF}' // regional indicators
    )
}

fn emoji_count(text: &str) -> usize {
    text.chars().filter(|&c| is_emoji(c)).count()
}

/// Fraction of the text's characters that live inside ``` fenced blocks.
fn fenced_ratio(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let mut fenced = 0usize;
    let mut inside = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            inside = !inside;
            continue;
        }
        if inside {
            fenced += line.chars().count() + 1;
        }
    }
    fenced as f64 / total as f64
}

/// Gate for raw user utterances. Returns true if the text is worth storing.
pub fn passes_user_gate(text: &str) -> bool {
    let text = text.trim();
    let len = text.chars().count();
    if len < USER_MIN_CHARS || len > USER_MAX_CHARS {
        return false;
    }
    if word_count(text) < USER_MIN_WORDS {
        return false;
    }
    if INJECTED_MARKERS.iter().any(|m| text.contains(m)) {
        return false;
    }
    if USER_NOISE.iter().any(|re| re.is_match(text)) {
        return false;
    }
    if emoji_count(text) > USER_MAX_EMOJI {
        return false;
    }
    true
}

/// Gate for assistant utterances. Strictly stronger than the user gate:
/// shorter ceiling, higher word floor, and narration/proposal rejection.
pub fn passes_assistant_gate(text: &str) -> bool {
    let text = text.trim();
    let len = text.chars().count();
    if len < USER_MIN_CHARS || len > ASSISTANT_MAX_CHARS {
        return false;
    }
    if word_count(text) < ASSISTANT_MIN_WORDS {
        return false;
    }
    if fenced_ratio(text) > ASSISTANT_MAX_FENCED_RATIO {
        return false;
    }
    if TOOL_MARKERS.iter().any(|m| text.contains(m)) {
        return false;
    }
    if ASSISTANT_NARRATION.iter().any(|re| re.is_match(text)) {
        return false;
    }
    if is_open_proposal(text) {
        return false;
    }
    true
}
