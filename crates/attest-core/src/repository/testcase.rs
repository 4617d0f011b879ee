//! Test-case library port used by the `test-case` action.

use std::future::Future;
use std::pin::Pin;

use attest_types::error::StoreError;
use attest_types::testcase::TestCase;

/// Fetch-by-id access to the persisted test-case library.
///
/// Object-safe (boxed futures) because the engine holds it as `Arc<dyn …>`.
pub trait TestCaseRepository: Send + Sync {
    fn get_test_case(
        &self,
        test_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TestCase>, StoreError>> + Send + '_>>;
}
