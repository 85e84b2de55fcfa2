use judge_protocol::JobKind;
use judge_queue::StreamEntry;

/// A leniently-parsed queue delivery. Read-side parsing never fails: missing
/// or malformed fields degrade to empty/`None` values and the dispatch loop
/// decides what is reportable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedEntry {
    pub msg_id: String,
    pub job_id: String,
    pub problem_id: String,
    pub problem_key: String,
    pub kind: Option<JobKind>,
    /// Raw kind string for metrics labels, "submit" when absent.
    pub kind_label: String,
    /// Raw profile string for metrics labels, "unknown" when absent.
    pub profile_label: String,
    pub code: String,
    pub created_at: Option<i64>,
}

pub fn parse_entry(stream_entry: StreamEntry) -> ParsedEntry {
    let StreamEntry { id: msg_id, fields } = stream_entry;
    let get = |key: &str| fields.get(key).cloned().unwrap_or_default();

    let job_id = get("job_id");
    let problem_id = get("problem_id");
    let problem_key = {
        let raw = get("problem_key");
        if raw.is_empty() { problem_id.clone() } else { raw }
    };
    let kind_label = {
        let raw = get("kind");
        if raw.is_empty() { "submit".to_string() } else { raw }
    };
    let kind = JobKind::parse(&kind_label);
    let profile_label = {
        let raw = get("profile");
        if raw.is_empty() { "unknown".to_string() } else { raw }
    };
    let created_at_raw = get("created_at");
    let created_at_trimmed = created_at_raw.trim();
    let created_at = if !created_at_trimmed.is_empty()
        && created_at_trimmed.chars().all(|ch| ch.is_ascii_digit())
    {
        created_at_trimmed.parse::<i64>().ok()
    } else {
        None
    };

    ParsedEntry {
        msg_id,
        job_id,
        problem_id,
        problem_key,
        kind,
        kind_label,
        profile_label,
        code: get("code"),
        created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn entry(pairs: &[(&str, &str)]) -> StreamEntry {
        StreamEntry {
            id: "1700000000-0".to_string(),
            fields: pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }

    #[test]
    fn complete_entry_parses_every_field() {
        let parsed = parse_entry(entry(&[
            ("job_id", "j1"),
            ("problem_id", "course/ch1/add"),
            ("problem_key", "course/ch1/add"),
            ("profile", "light"),
            ("kind", "run"),
            ("code", "def add(a, b):\n    return a + b\n"),
            ("created_at", "1700000000"),
        ]));
        assert_eq!(parsed.kind, Some(JobKind::Run));
        assert_eq!(parsed.created_at, Some(1_700_000_000));
        assert_eq!(parsed.profile_label, "light");
    }

    #[test]
    fn missing_fields_degrade_gracefully() {
        let parsed = parse_entry(entry(&[("job_id", "j1"), ("problem_id", "p")]));
        assert_eq!(parsed.kind, Some(JobKind::Submit));
        assert_eq!(parsed.kind_label, "submit");
        assert_eq!(parsed.profile_label, "unknown");
        assert_eq!(parsed.problem_key, "p");
        assert_eq!(parsed.created_at, None);
        assert_eq!(parsed.code, "");
    }

    #[test]
    fn invalid_kind_is_preserved_for_reporting() {
        let parsed = parse_entry(entry(&[("job_id", "j1"), ("kind", "rerun")]));
        assert_eq!(parsed.kind, None);
        assert_eq!(parsed.kind_label, "rerun");
    }

    #[test]
    fn non_numeric_created_at_is_dropped() {
        let parsed = parse_entry(entry(&[("job_id", "j1"), ("created_at", "yesterday")]));
        assert_eq!(parsed.created_at, None);
        let parsed = parse_entry(entry(&[("job_id", "j1"), ("created_at", " 1700000001 ")]));
        assert_eq!(parsed.created_at, Some(1_700_000_001));
    }

    #[test]
    fn empty_map_yields_empty_identity() {
        let parsed = parse_entry(StreamEntry {
            id: "x".to_string(),
            fields: HashMap::new(),
        });
        assert_eq!(parsed.job_id, "");
        assert_eq!(parsed.problem_id, "");
    }
}
