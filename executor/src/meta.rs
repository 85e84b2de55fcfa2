//! Isolate meta-file parsing and verdict mapping.

use std::collections::HashMap;

/// Meta files are `key:value` lines; later duplicates win.
pub fn parse_meta(text: &str) -> HashMap<String, String> {
    let mut entries = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    entries
}

/// What the meta file says happened inside the box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaOutcome {
    /// `status: TO`
    TimedOut,
    /// `cg-oom-killed` is present and non-zero.
    OomKilled,
    /// `status: XX`, an isolate-internal failure. Carries the meta `message`.
    SandboxError(String),
    /// Any other non-empty `status` (`RE`, `SG`): the boxed program failed.
    ProgramFailed,
    /// No adverse status recorded.
    Clean,
}

pub fn classify_meta(meta: &HashMap<String, String>) -> MetaOutcome {
    if meta.get("status").is_some_and(|status| status == "TO") {
        return MetaOutcome::TimedOut;
    }
    let oom = meta
        .get("cg-oom-killed")
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);
    if oom != 0 {
        return MetaOutcome::OomKilled;
    }
    match meta.get("status").map(String::as_str) {
        Some("XX") => MetaOutcome::SandboxError(
            meta.get("message").cloned().unwrap_or_default(),
        ),
        Some(status) if !status.is_empty() => MetaOutcome::ProgramFailed,
        _ => MetaOutcome::Clean,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_key_value_lines() {
        let meta = parse_meta("time:0.017\ntime-wall:0.102\nstatus:TO\nmessage:Time limit exceeded\n");
        assert_eq!(meta.get("status").map(String::as_str), Some("TO"));
        assert_eq!(meta.get("time").map(String::as_str), Some("0.017"));
    }

    #[test]
    fn timeout_wins_over_everything() {
        let meta = parse_meta("status:TO\ncg-oom-killed:1\n");
        assert_eq!(classify_meta(&meta), MetaOutcome::TimedOut);
    }

    #[test]
    fn oom_kill_is_memory_limit() {
        let meta = parse_meta("cg-oom-killed:1\nstatus:SG\nexitsig:9\n");
        assert_eq!(classify_meta(&meta), MetaOutcome::OomKilled);
    }

    #[test]
    fn xx_status_carries_the_message() {
        let meta = parse_meta("status:XX\nmessage:Cannot run proxy\n");
        assert_eq!(
            classify_meta(&meta),
            MetaOutcome::SandboxError("Cannot run proxy".to_string())
        );
    }

    #[test]
    fn re_status_is_a_program_failure() {
        let meta = parse_meta("status:RE\nexitcode:1\n");
        assert_eq!(classify_meta(&meta), MetaOutcome::ProgramFailed);
    }

    #[test]
    fn clean_meta_is_clean() {
        let meta = parse_meta("time:0.01\nmax-rss:1200\n");
        assert_eq!(classify_meta(&meta), MetaOutcome::Clean);
    }
}
