use unikos_lib::testing::TestResult;
use unikos_lib::{assert_eq_test, assert_test, pass};

use crate::port_util::{EPHEMERAL_FIRST, EPHEMERAL_LAST, PortUtil};
use crate::types::NetError;

pub fn test_bind_and_unbind() -> TestResult {
    let mut ports = PortUtil::new();
    assert_test!(ports.bind(80).is_ok());
    assert_eq_test!(ports.bind(80).err(), Some(NetError::AddressInUse));
    assert_test!(ports.is_bound(80));
    assert_eq_test!(ports.bound_count(), 1);
    assert_eq_test!(ports.ephemeral_bound(), 0);
    assert_test!(ports.unbind(80));
    assert_test!(!ports.unbind(80));
    assert_eq_test!(ports.bound_count(), 0);
    pass!()
}

pub fn test_ephemeral_round_robin() -> TestResult {
    let mut ports = PortUtil::new();
    let first = ports.bind_ephemeral();
    let second = ports.bind_ephemeral();
    assert_eq_test!(first, Ok(EPHEMERAL_FIRST));
    assert_eq_test!(second, Ok(EPHEMERAL_FIRST + 1));
    // Releasing a port does not rewind the cursor.
    ports.unbind(EPHEMERAL_FIRST);
    assert_eq_test!(ports.bind_ephemeral(), Ok(EPHEMERAL_FIRST + 2));
    assert_eq_test!(ports.ephemeral_bound(), 2);
    pass!()
}

pub fn test_get_next_does_not_bind() -> TestResult {
    let mut ports = PortUtil::new();
    let port = match ports.get_next_ephemeral() {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    assert_test!(!ports.is_bound(port));
    assert_eq_test!(ports.get_next_ephemeral(), Ok(port + 1));
    pass!()
}

pub fn test_cursor_wraps_and_skips_bound() -> TestResult {
    let mut ports = PortUtil::with_start(EPHEMERAL_LAST);
    assert_test!(ports.bind(EPHEMERAL_FIRST).is_ok());
    assert_eq_test!(ports.bind_ephemeral(), Ok(EPHEMERAL_LAST));
    assert_eq_test!(ports.bind_ephemeral(), Ok(EPHEMERAL_FIRST + 1), "wrapped past a bound port");
    // Starts below the range are clamped into it.
    assert_eq_test!(PortUtil::with_start(1024).get_next_ephemeral(), Ok(EPHEMERAL_FIRST));
    pass!()
}

pub fn test_exhaustion() -> TestResult {
    let mut ports = PortUtil::new();
    for _ in EPHEMERAL_FIRST..=EPHEMERAL_LAST {
        if ports.bind_ephemeral().is_err() {
            return TestResult::Fail;
        }
    }
    assert_test!(!ports.has_free_ephemeral());
    assert_eq_test!(ports.bind_ephemeral(), Err(NetError::PortsExhausted));
    assert_test!(ports.bind(8080).is_ok(), "well-known ports are unaffected");
    assert_test!(ports.unbind(50000));
    assert_eq_test!(ports.bind_ephemeral(), Ok(50000));
    pass!()
}

unikos_lib::define_test_suite!(
    port_util,
    [
        test_bind_and_unbind,
        test_ephemeral_round_robin,
        test_get_next_does_not_bind,
        test_cursor_wraps_and_skips_bound,
        test_exhaustion,
    ]
);
