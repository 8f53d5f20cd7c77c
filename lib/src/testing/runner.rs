use super::TestResult;

/// Pass/fail tally for one suite run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SuiteSummary {
    pub total: u32,
    pub passed: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl SuiteSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Run one test, logging its name and outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    crate::klog_debug!("TEST RUN: {}", name);
    let result = test();
    match result {
        TestResult::Pass => crate::klog_debug!("TEST PASS: {}", name),
        TestResult::Skipped => crate::klog_info!("TEST SKIPPED: {}", name),
        TestResult::Fail | TestResult::Panic => crate::klog_error!("TEST FAILED: {}", name),
    }
    result
}

/// Run every test of a suite in order and return the tally.
pub fn run_suite(suite: &str, tests: &[(&str, fn() -> TestResult)]) -> SuiteSummary {
    let mut summary = SuiteSummary::default();
    for (name, test) in tests {
        summary.total += 1;
        match run_single_test(name, test) {
            TestResult::Pass => summary.passed += 1,
            TestResult::Skipped => summary.skipped += 1,
            TestResult::Fail | TestResult::Panic => summary.failed += 1,
        }
    }
    crate::klog_info!(
        "SUITE {}: {}/{} passed, {} skipped",
        suite,
        summary.passed,
        summary.total,
        summary.skipped
    );
    summary
}
