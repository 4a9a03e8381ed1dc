//! Prompt injection and jailbreak detection

use crate::error::Result;
use crate::rules::{Rule, RuleTable};
use crate::types::{Severity, ViolationType};

const PROMPT_OVERRIDE: &str = "prompt override";
const ROLE_PLAY: &str = "role-play manipulation";
const SYSTEM_PROMPT_LEAK: &str = "system prompt extraction";
const INSTRUCTION_BYPASS: &str = "instruction bypass";
const ENCODING_TRICK: &str = "encoding trick";
const CONTEXT_MANIPULATION: &str = "context manipulation";

/// `(regex, category)` rows of the manipulation detector, highest priority first
const MANIPULATION_RULES: &[(&str, &str)] = &[
    // Prompt override attempts
    (
        r"\bignore\s+(?:all\s+|any\s+)?(?:of\s+)?(?:the\s+|your\s+|my\s+)?(?:previous|prior|above|earlier|preceding)\s+(?:instructions|prompts?|rules|directions|guidelines)",
        PROMPT_OVERRIDE,
    ),
    (
        r"\bdisregard\s+(?:all\s+)?(?:of\s+)?(?:your|the|previous|prior|above)\s+(?:\w+\s+)?(?:instructions|rules|guidelines|programming)",
        PROMPT_OVERRIDE,
    ),
    (
        r"\bforget\s+(?:everything|all)\s+(?:you\s+(?:were|have\s+been)\s+told|(?:previous|prior|above))",
        PROMPT_OVERRIDE,
    ),
    (r"\bnew\s+instructions\s*:", PROMPT_OVERRIDE),
    (r"\boverride\s*:", PROMPT_OVERRIDE),
    // Role-playing manipulation
    (
        r"\b(?:act|behave|respond)\s+(?:as|like)\s+(?:an?\s+)?(?:unrestricted|unfiltered|uncensored|jailbroken|evil|rogue)",
        ROLE_PLAY,
    ),
    (
        r"\bpretend\s+(?:that\s+)?(?:you\s+(?:are|have)|to\s+be)\s+(?:an?\s+)?(?:unrestricted|unfiltered|uncensored|no\s+(?:rules|limits|restrictions)|without)",
        ROLE_PLAY,
    ),
    (
        r"\byou\s+are\s+now\s+(?:an?\s+)?(?:unrestricted|unfiltered|uncensored|free|dan|evil|jailbroken)",
        ROLE_PLAY,
    ),
    (r"\bjailbr(?:eak|oken)", ROLE_PLAY),
    (r"\bdan\s+mode\b|\bdo\s+anything\s+now\b", ROLE_PLAY),
    (r"\bdeveloper\s+mode\b", ROLE_PLAY),
    // System prompt extraction
    (
        r"\bwhat\s+(?:is|are|was|were)\s+your\s+(?:system\s+|initial\s+|original\s+)?(?:prompt|instructions)",
        SYSTEM_PROMPT_LEAK,
    ),
    (
        r"\b(?:show|reveal|print|repeat|display|output)\s+(?:me\s+)?(?:your|the)\s+(?:system\s+|hidden\s+|initial\s+)?(?:prompt|instructions|system\s+message)",
        SYSTEM_PROMPT_LEAK,
    ),
    // Instruction bypass
    (
        r"\b(?:bypass|circumvent|disable|turn\s+off|ignore)\s+(?:your\s+|the\s+|all\s+|any\s+)*(?:safety|content|moderation)?\s*(?:filters?|restrictions|guidelines|guardrails|safeguards)",
        INSTRUCTION_BYPASS,
    ),
    (r"\bactually,?\s+do\s+this\s+instead\b", INSTRUCTION_BYPASS),
    // Encoding tricks
    (r"\b(?:base64|rot13|hex)\s*(?:decode|encoded)?\s*:", ENCODING_TRICK),
    (r"\bdecode\s+(?:this|the\s+following)\s*:", ENCODING_TRICK),
    // Context manipulation
    (r"(?m)^\s*(?:system|assistant)\s*:", CONTEXT_MANIPULATION),
    (r"\[\s*(?:system|inst)\s*\]|\bim_start\b|\bim_end\b", CONTEXT_MANIPULATION),
];

/// Build the manipulation-attempt detector.
///
/// Every row is Critical. `custom_phrases` are appended as literal phrases.
pub fn manipulation_table(custom_phrases: &[String]) -> Result<RuleTable> {
    let mut rules = MANIPULATION_RULES
        .iter()
        .map(|&(pattern, category)| Rule::regex(pattern, Severity::Critical, category))
        .collect::<Result<Vec<_>>>()?;

    for phrase in custom_phrases {
        if phrase.trim().is_empty() {
            continue;
        }
        rules.push(Rule::phrase(phrase, Severity::Critical, PROMPT_OVERRIDE)?);
    }

    Ok(RuleTable::new(
        "manipulation",
        ViolationType::ManipulationAttempt,
        rules,
    ))
}
