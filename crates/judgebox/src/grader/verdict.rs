use crate::protocol::{TestResponse, TestStatus};
use crate::submission::TestResultUpdate;

/// Score recorded for a test the grader itself failed to evaluate
pub const INTERNAL_ERROR_SCORE: i32 = -1;

pub const CORRECT: &str = "Correct";
pub const WRONG_ANSWER: &str = "Wrong Answer";
pub const MISSING_OUTPUT: &str = "Missing output file";

/// Message of a test result the grader could not produce a verdict for
pub fn internal_error(reason: &str) -> String {
    format!("Internal grader error: {reason}")
}

/// Turn a test run into the result row written to the store.
///
/// Outputs are compared after trimming surrounding whitespace.
pub fn judge(response: &TestResponse, expected: &[u8], weight: i32) -> TestResultUpdate {
    let (score, message) = match response.status {
        TestStatus::Ok => {
            let expected = String::from_utf8_lossy(expected);
            if response.output.trim() == expected.trim() {
                (weight, CORRECT.to_owned())
            } else {
                (0, WRONG_ANSWER.to_owned())
            }
        }
        TestStatus::Timeout | TestStatus::RuntimeError | TestStatus::SandboxError => {
            (0, response.comments.clone())
        }
        TestStatus::MissingOutput => (0, MISSING_OUTPUT.to_owned()),
        TestStatus::InternalError => (INTERNAL_ERROR_SCORE, internal_error(&response.comments)),
    };

    TestResultUpdate {
        score,
        message,
        time: response.time,
        memory: response.memory,
    }
}

/// Sum of test scores, leaving out tests the grader failed on
pub fn total_score<'a>(scores: impl IntoIterator<Item = &'a TestResultUpdate>) -> i32 {
    scores
        .into_iter()
        .map(|update| update.score)
        .filter(|&score| score != INTERNAL_ERROR_SCORE)
        .sum()
}
