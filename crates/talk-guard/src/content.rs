//! Vocabulary tables: inappropriate content and harm indicators

use crate::error::Result;
use crate::rules::{Rule, RuleTable};
use crate::types::{Severity, ViolationType};

/// Politically, sexually or violently charged vocabulary, plus topics that
/// do not belong in a talk. Matched as whole words.
const INAPPROPRIATE_RULES: &[(&str, &str)] = &[
    (
        r"\b(?:democrats?|republicans?|politicians?|political\s+part(?:y|ies)|elections?|ballots?|abortion|campaign\s+for)\b",
        "political",
    ),
    (
        r"\b(?:sex|sexual(?:ly)?|sexy|porn\w*|nude|nudity|naked|erotic\w*|orgasm\w*|fetish\w*|hookup)\b",
        "sexual",
    ),
    (
        r"\b(?:gore|gory|torture[sd]?|massacres?|behead\w*|mutilat\w*|bloodbath|dismember\w*)\b",
        "violent",
    ),
    (
        r"\b(?:cocaine|heroin|meth|marijuana|weed|get(?:ting)?\s+high|drunk)\b",
        "substances",
    ),
    (r"\b(?:fuck\w*|shit\w*|bitch\w*|bastards?|asshole\w*)\b", "profanity"),
    (
        r"\b(?:gambling|casinos?|betting\s+odds|lottery\s+numbers|crypto\s+(?:pump|giveaway))\b",
        "off-topic",
    ),
];

/// Vocabulary indicating violence, self-harm or crime. Generated text
/// containing any of these is rejected outright.
const HARM_RULES: &[(&str, &str)] = &[
    (
        r"\b(?:kill\s+(?:yourself|myself|themselves|himself|herself)|suicid\w*|self[-\s]?harm\w*|cut(?:ting)?\s+(?:yourself|myself)|end\s+(?:your|my|their)\s+(?:own\s+)?life)\b",
        "self-harm",
    ),
    (
        r"\b(?:murder(?:s|ed|ing)?|shoot(?:ing)?\s+(?:up|people|them)|stab(?:bed|bing)?\s+(?:him|her|them|people)|(?:build|make)\s+a\s+bomb|mass\s+shooting|assault\s+(?:him|her|them|people))\b",
        "violence",
    ),
    (
        r"\b(?:shoplift\w*|money\s+laundering|launder(?:ing)?\s+money|hack(?:ing)?\s+into|counterfeit\w*|sell(?:ing)?\s+drugs|identity\s+theft|break(?:ing)?\s+into\s+(?:a\s+)?(?:house|car|home))\b",
        "crime",
    ),
];

fn build(
    name: &'static str,
    violation_type: ViolationType,
    severity: Severity,
    rows: &[(&str, &'static str)],
) -> Result<RuleTable> {
    let rules = rows
        .iter()
        .map(|&(pattern, category)| Rule::regex(pattern, severity, category))
        .collect::<Result<Vec<_>>>()?;
    Ok(RuleTable::new(name, violation_type, rules))
}

/// Inappropriate-content detector; every row is High
pub fn inappropriate_table() -> Result<RuleTable> {
    build(
        "inappropriate content",
        ViolationType::InappropriateContent,
        Severity::High,
        INAPPROPRIATE_RULES,
    )
}

/// Harm lexicon used on generated text; every row is Critical
pub fn harm_table() -> Result<RuleTable> {
    build(
        "harm",
        ViolationType::PolicyViolation,
        Severity::Critical,
        HARM_RULES,
    )
}
