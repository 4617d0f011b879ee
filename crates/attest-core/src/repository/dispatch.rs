//! Unified transport dispatch port for `http` and `command` steps.
//!
//! The dispatcher owns the transport-specific work (HTTP framing, process
//! spawning). It is total: transport failures come back as an outcome with
//! `passed = false` and an error message, never as a panic or `Err`.

use std::future::Future;
use std::pin::Pin;

use attest_types::testcase::{DispatchOutcome, DispatchRequest};

pub trait UnifiedActionDispatcher: Send + Sync {
    fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Pin<Box<dyn Future<Output = DispatchOutcome> + Send + '_>>;
}
