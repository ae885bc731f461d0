//! Strips credential-shaped variables from the supervisor's own environment
//! before it is handed to a spawned child. The sandbox environment overlay
//! is applied on top by the caller, never by this module.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::RegexSet;

const EXACT_DENYLIST: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "CLAUDE_API_KEY",
    "DISCORD_TOKEN",
    "DISCORD_BOT_TOKEN",
    "TELEGRAM_BOT_TOKEN",
    "SLACK_BOT_TOKEN",
    "SLACK_SIGNING_SECRET",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "NPM_TOKEN",
    "MOLTBOT_OAUTH_DIR",
];

static SUFFIX_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)_TOKEN$",
        r"(?i)_SECRET$",
        r"(?i)_API_KEY$",
        r"(?i)_PASSWORD$",
        r"(?i)_PRIVATE_KEY$",
    ])
    .expect("suffix denylist patterns are valid")
});

fn is_sensitive(name: &str) -> bool {
    EXACT_DENYLIST
        .iter()
        .any(|denied| denied.eq_ignore_ascii_case(name))
        || SUFFIX_PATTERNS.is_match(name)
}

/// Returns the supervisor's own environment minus every variable matching
/// the sensitive-name patterns, case-insensitively.
pub fn filtered_environment() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| !is_sensitive(key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_are_filtered_case_insensitively() {
        assert!(is_sensitive("ANTHROPIC_API_KEY"));
        assert!(is_sensitive("anthropic_api_key"));
        assert!(is_sensitive("GITHUB_TOKEN"));
    }

    #[test]
    fn suffix_patterns_are_filtered() {
        assert!(is_sensitive("FOO_TOKEN"));
        assert!(is_sensitive("MY_PASSWORD"));
        assert!(is_sensitive("SOME_SERVICE_SECRET"));
        assert!(is_sensitive("DB_PRIVATE_KEY"));
    }

    #[test]
    fn unrelated_names_survive() {
        assert!(!is_sensitive("PATH"));
        assert!(!is_sensitive("HOME"));
        assert!(!is_sensitive("LANG"));
    }

    #[test]
    fn filtered_environment_excludes_injected_secret() {
        std::env::set_var("MOLTBOT_TEST_FOO_TOKEN", "secret-value");
        let env = filtered_environment();
        assert!(!env.contains_key("MOLTBOT_TEST_FOO_TOKEN"));
        std::env::remove_var("MOLTBOT_TEST_FOO_TOKEN");
    }
}
