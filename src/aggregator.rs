use crate::model::{Record, ResultRow, Verdict};

/// Picks the verdict that speaks for the record: highest precedence
/// (valid > unknown > rate-limited > invalid > error), earliest candidate on ties.
///
/// `verdicts` pairs each verdict with its candidate ordinal.
pub fn best_verdict(verdicts: &[(usize, Verdict)]) -> Option<&Verdict> {
    verdicts
        .iter()
        .max_by(|(oa, a), (ob, b)| {
            a.status
                .rank()
                .cmp(&b.status.rank())
                // reversed so the lower ordinal compares greater
                .then_with(|| ob.cmp(oa))
        })
        .map(|(_, v)| v)
}

pub fn aggregate(index: usize, record: Record, verdicts: &[(usize, Verdict)]) -> ResultRow {
    ResultRow {
        index,
        record,
        verdict: best_verdict(verdicts).cloned(),
        skipped: None,
        candidates_tried: verdicts.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RowStatus, VerdictStatus};

    fn v(status: VerdictStatus, candidate: &str) -> Verdict {
        Verdict::new(status, candidate)
    }

    #[test]
    fn valid_beats_unknown_and_invalid() {
        let verdicts = vec![
            (0, v(VerdictStatus::Invalid, "a@x.com")),
            (1, v(VerdictStatus::Valid, "b@x.com")),
            (2, v(VerdictStatus::Unknown, "c@x.com")),
        ];
        let row = aggregate(0, Record::new("A B", "x.com"), &verdicts);
        assert_eq!(row.status(), RowStatus::Valid);
        assert_eq!(row.email(), Some("b@x.com"));
        assert_eq!(row.candidates_tried, 3);
    }

    #[test]
    fn full_precedence_chain() {
        let order = [
            VerdictStatus::Error,
            VerdictStatus::Invalid,
            VerdictStatus::RateLimited,
            VerdictStatus::Unknown,
            VerdictStatus::Valid,
        ];
        for window in order.windows(2) {
            let verdicts = vec![(0, v(window[0], "lo@x.com")), (1, v(window[1], "hi@x.com"))];
            assert_eq!(best_verdict(&verdicts).unwrap().status, window[1]);
        }
    }

    #[test]
    fn ties_go_to_earliest_candidate_regardless_of_arrival() {
        // arrival order differs from generation order
        let verdicts = vec![
            (3, v(VerdictStatus::Valid, "late@x.com")),
            (1, v(VerdictStatus::Valid, "early@x.com")),
            (2, v(VerdictStatus::Valid, "mid@x.com")),
        ];
        assert_eq!(best_verdict(&verdicts).unwrap().evidence.candidate, "early@x.com");
    }

    #[test]
    fn no_verdicts_gives_empty_row() {
        let row = aggregate(4, Record::new("A B", "x.com"), &[]);
        assert!(row.verdict.is_none());
        assert_eq!(row.index, 4);
        assert_eq!(row.status(), RowStatus::Unknown);
    }
}
