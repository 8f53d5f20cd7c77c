//! In-tree test harness.
//!
//! Tests are plain `fn() -> TestResult` functions written with the assertion
//! macros in [`assertions`](self), grouped into suites with
//! [`define_test_suite!`](crate::define_test_suite). A suite expands to one
//! `#[test]` per function so the hosted test runner can execute them.

mod assertions;
mod runner;

pub use runner::{SuiteSummary, run_single_test, run_suite};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Panic,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Panic)
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

#[macro_export]
macro_rules! skip {
    ($reason:expr) => {{
        $crate::klog_info!("TEST SKIP: {}", $reason);
        $crate::testing::TestResult::Skipped
    }};
}

#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:expr) => {{
        $total += 1;
        let result = $crate::testing::run_single_test(stringify!($test_fn), || $test_fn());
        if result.is_pass() {
            $passed += 1;
        }
        result
    }};

    ($test_fn:expr) => {{ $crate::testing::run_single_test(stringify!($test_fn), || $test_fn()) }};
}

/// Register a list of test functions as a suite.
///
/// Every function becomes a `#[test]` inside a generated `<suite>_suite`
/// module; a `Fail`/`Panic` result fails that test, `Skipped` passes it.
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:ident),* $(,)?]) => {
        $crate::paste::paste! {
            mod [<$suite_name _suite>] {
                $(
                    #[test]
                    fn $test_fn() {
                        let result = $crate::testing::run_single_test(
                            concat!(stringify!($suite_name), "::", stringify!($test_fn)),
                            super::$test_fn,
                        );
                        assert!(
                            !result.is_failure(),
                            "{}::{} returned {:?}",
                            stringify!($suite_name),
                            stringify!($test_fn),
                            result
                        );
                    }
                )*

                #[test]
                fn suite_summary() {
                    let summary = $crate::testing::run_suite(
                        stringify!($suite_name),
                        &[$( (stringify!($test_fn), super::$test_fn as fn() -> $crate::testing::TestResult) ),*],
                    );
                    assert!(summary.all_passed(), "suite {} had failures", stringify!($suite_name));
                }
            }
        }
    };
}
