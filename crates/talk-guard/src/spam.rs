//! Spam heuristics

use crate::config::SpamConfig;
use crate::error::Result;
use crate::pii::{PiiDetector, PiiKind};
use crate::rules::{extract_hosts, host_allowed, Rule, RuleTable};
use crate::types::{Severity, ViolationType};

/// Build the spam detector; every row is Medium
pub fn spam_table(config: &SpamConfig, allowed_domains: &[String]) -> Result<RuleTable> {
    let max_word_repeats = config.max_word_repeats.max(2);
    let max_char_run = config.max_char_run.max(2);
    let max_caps_ratio = config.max_caps_ratio;
    let caps_min_letters = config.caps_min_letters;
    let allowed = allowed_domains.to_vec();
    let contacts = PiiDetector::new(&[PiiKind::Email, PiiKind::Phone]);

    let rules = vec![
        Rule::heuristic("repeated words", Severity::Medium, "repetition", move |text| {
            longest_word_repeat(text)
                .filter(|(_, n)| *n >= max_word_repeats)
                .map(|(word, n)| format!("'{}' repeated {} times", word, n))
        }),
        Rule::heuristic("repeated characters", Severity::Medium, "repetition", move |text| {
            longest_char_run(text)
                .filter(|(_, n)| *n >= max_char_run)
                .map(|(c, n)| format!("'{}' repeated {} times", c, n))
        }),
        Rule::regex(
            &format!(r"[!?]{{{},}}|\.{{{},}}", config.punctuation_run.max(2), config.punctuation_run.max(4)),
            Severity::Medium,
            "punctuation",
        )?,
        Rule::heuristic("excessive capitals", Severity::Medium, "shouting", move |text| {
            let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
            if letters.len() < caps_min_letters {
                return None;
            }
            let upper = letters.iter().filter(|c| c.is_uppercase()).count();
            let ratio = upper as f32 / letters.len() as f32;
            (ratio > max_caps_ratio).then(|| format!("{:.0}% capitals", ratio * 100.0))
        }),
        Rule::heuristic("unapproved link", Severity::Medium, "links", move |text| {
            extract_hosts(text)
                .into_iter()
                .find(|host| !host_allowed(host, &allowed))
        }),
        Rule::heuristic("contact information", Severity::Medium, "contact", move |text| {
            contacts
                .detect(text)
                .first()
                .map(|r| format!("{} found", r.kind))
        }),
        Rule::regex(
            r"\b(?:buy\s+now|click\s+here|act\s+now|limited\s+time\s+offer|free\s+money|order\s+today|subscribe\s+now)\b",
            Severity::Medium,
            "promotion",
        )?,
    ];

    Ok(RuleTable::new("spam", ViolationType::Spam, rules))
}

/// Longest run of the same word (case and punctuation ignored)
fn longest_word_repeat(text: &str) -> Option<(String, usize)> {
    let mut best: Option<(String, usize)> = None;
    let mut current: Option<(String, usize)> = None;

    for raw in text.split_whitespace() {
        let word: String = raw
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.is_empty() {
            continue;
        }
        current = match current {
            Some((prev, n)) if prev == word => Some((prev, n + 1)),
            _ => Some((word, 1)),
        };
        if let Some((ref w, n)) = current {
            if best.as_ref().map_or(true, |(_, b)| n > *b) {
                best = Some((w.clone(), n));
            }
        }
    }
    best
}

/// Longest run of one non-whitespace character
fn longest_char_run(text: &str) -> Option<(char, usize)> {
    let mut best: Option<(char, usize)> = None;
    let mut prev: Option<char> = None;
    let mut run = 0;

    for c in text.chars() {
        if c.is_whitespace() {
            prev = None;
            run = 0;
            continue;
        }
        if Some(c) == prev {
            run += 1;
        } else {
            prev = Some(c);
            run = 1;
        }
        if best.map_or(true, |(_, b)| run > b) {
            best = Some((c, run));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> RuleTable {
        spam_table(&SpamConfig::default(), &["churchofjesuschrist.org".to_string()]).unwrap()
    }

    fn categories(text: &str) -> Vec<&'static str> {
        detector().scan(text).into_iter().map(|m| m.category).collect()
    }

    #[test]
    fn test_repetition() {
        assert!(categories("pray pray pray pray for me").contains(&"repetition"));
        assert!(categories("soooooooooooo good").contains(&"repetition"));
        assert!(!categories("pray and pray again").contains(&"repetition"));
    }

    #[test]
    fn test_punctuation_and_caps() {
        assert!(categories("Amazing!!!!").contains(&"punctuation"));
        assert!(!categories("Really?! Yes.").contains(&"punctuation"));
        assert!(categories("THIS IS THE BEST TALK EVER WRITTEN").contains(&"shouting"));
        assert!(!categories("A talk on the Book of Mormon by LDS youth").contains(&"shouting"));
    }

    #[test]
    fn test_links() {
        assert!(categories("read https://spam.biz/offer today").contains(&"links"));
        assert!(categories("or visit www.spam.biz").contains(&"links"));
        assert!(!categories("see https://www.churchofjesuschrist.org/study").contains(&"links"));
    }

    #[test]
    fn test_contact_info() {
        assert!(categories("email me at seller@deals.com").contains(&"contact"));
        assert!(categories("call 555-123-4567").contains(&"contact"));
    }

    #[test]
    fn test_clean_text() {
        assert!(detector()
            .scan("Tell me about faith, hope, and the blessings of service.")
            .is_empty());
    }

    #[test]
    fn test_word_repeat_helper() {
        assert_eq!(
            longest_word_repeat("Go go, GO! go"),
            Some(("go".to_string(), 4))
        );
        assert_eq!(longest_char_run("ab  ccc"), Some(('c', 3)));
        assert_eq!(longest_word_repeat("   "), None);
    }
}
