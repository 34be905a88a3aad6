mod cross_process_tests;

/// Send library logs to the test harness; run with `RUST_LOG=debug` to see them.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
