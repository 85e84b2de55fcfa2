use judge_protocol::CaseRecord;
use judge_protocol::RunResult;
use judge_protocol::SanitizedCase;
use judge_protocol::Summary;
use judge_protocol::Verdict;

/// How much per-case detail a result carries: everything for `run`, only the
/// first failing case for `submit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetailMode {
    All,
    FirstFailure,
}

/// Count passes and failures, splitting by case visibility, and locate the
/// first non-accepted record.
pub fn summarize(records: &[CaseRecord]) -> (Summary, Option<usize>) {
    let mut summary = Summary::default();
    let mut first_failed = None;
    for (index, record) in records.iter().enumerate() {
        summary.total += 1;
        let passed = record.status.is_accepted();
        if passed {
            summary.passed += 1;
        } else {
            summary.failed += 1;
            if first_failed.is_none() {
                first_failed = Some(index);
            }
        }
        if record.hidden {
            summary.hidden_total += 1;
            if passed {
                summary.hidden_passed += 1;
            }
        } else {
            summary.public_total += 1;
            if passed {
                summary.public_passed += 1;
            }
        }
    }
    (summary, first_failed)
}

/// Summary for error-shaped results where no case produced a record.
pub fn error_summary(public_count: usize, hidden_count: usize) -> Summary {
    Summary {
        total: public_count + hidden_count,
        passed: 0,
        failed: 0,
        public_total: public_count,
        public_passed: 0,
        hidden_total: hidden_count,
        hidden_passed: 0,
    }
}

/// Truncate to a character budget, marking the cut with an ellipsis.
pub fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = value.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Hidden cases are reduced to identity and status; visible cases keep their
/// detail fields under the character budget.
pub fn sanitize(record: &CaseRecord, max_chars: usize) -> SanitizedCase {
    if record.hidden {
        return SanitizedCase {
            id: record.id.clone(),
            status: record.status,
            hidden: true,
            input: None,
            stdout: None,
            output: None,
            expected: None,
            stderr: None,
        };
    }
    SanitizedCase {
        id: record.id.clone(),
        status: record.status,
        hidden: false,
        input: Some(record.input.clone()),
        stdout: Some(truncate(&record.stdout, max_chars)),
        output: Some(truncate(&record.output, max_chars)),
        expected: Some(truncate(&record.expected, max_chars)),
        stderr: Some(truncate(&record.stderr, max_chars)),
    }
}

/// Assemble the persisted result from a successful harness run.
pub fn finish_run(records: &[CaseRecord], detail_mode: DetailMode, max_chars: usize) -> RunResult {
    let (summary, first_failed) = summarize(records);
    let status = match first_failed {
        Some(index) => records[index].status,
        None => Verdict::Accepted,
    };
    let tests = match detail_mode {
        DetailMode::All => records.iter().map(|record| sanitize(record, max_chars)).collect(),
        DetailMode::FirstFailure => first_failed
            .map(|index| vec![sanitize(&records[index], max_chars)])
            .unwrap_or_default(),
    };
    RunResult {
        status,
        summary,
        tests,
        error: None,
        error_kind: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: &str, status: Verdict, hidden: bool) -> CaseRecord {
        CaseRecord {
            id: id.to_string(),
            status,
            input: "a = 1".to_string(),
            stdout: String::new(),
            output: "1".to_string(),
            expected: "1".to_string(),
            stderr: String::new(),
            hidden,
        }
    }

    #[test]
    fn summarize_splits_public_and_hidden() {
        let records = [
            record("p1", Verdict::Accepted, false),
            record("p2", Verdict::WrongAnswer, false),
            record("h1", Verdict::Accepted, true),
        ];
        let (summary, first_failed) = summarize(&records);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.public_total, 2);
        assert_eq!(summary.public_passed, 1);
        assert_eq!(summary.hidden_total, 1);
        assert_eq!(summary.hidden_passed, 1);
        assert_eq!(first_failed, Some(1));
    }

    #[test]
    fn truncate_respects_character_budget() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0123456789", 8), "01234...");
        // Multi-byte characters count as characters, not bytes.
        assert_eq!(truncate("éééééééééé", 8), "ééééé...");
    }

    #[test]
    fn first_failure_mode_returns_single_case() {
        let records = [
            record("p1", Verdict::Accepted, false),
            record("h1", Verdict::WrongAnswer, true),
            record("h2", Verdict::RuntimeError, true),
        ];
        let result = finish_run(&records, DetailMode::FirstFailure, 2000);
        assert_eq!(result.status, Verdict::WrongAnswer);
        assert_eq!(result.tests.len(), 1);
        assert_eq!(result.tests[0].id, "h1");
        // The failing case is hidden, so no detail may leak.
        assert_eq!(result.tests[0].output, None);
        assert_eq!(result.error, None);
    }

    #[test]
    fn all_mode_returns_every_case() {
        let records = [
            record("p1", Verdict::Accepted, false),
            record("p2", Verdict::Accepted, false),
        ];
        let result = finish_run(&records, DetailMode::All, 2000);
        assert_eq!(result.status, Verdict::Accepted);
        assert_eq!(result.tests.len(), 2);
        assert_eq!(result.tests[1].input.as_deref(), Some("a = 1"));
    }

    #[test]
    fn all_accepted_first_failure_mode_has_no_detail() {
        let records = [record("p1", Verdict::Accepted, false)];
        let result = finish_run(&records, DetailMode::FirstFailure, 2000);
        assert_eq!(result.status, Verdict::Accepted);
        assert_eq!(result.tests, Vec::new());
    }
}
