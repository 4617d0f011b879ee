//! Environment variable injection port.
//!
//! Supplies the active environment's variable map for a tenant/project pair.
//! These form the base layer of a run's variables; workflow variables are
//! overlaid on top.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use attest_types::error::StoreError;
use serde_json::Value;

pub trait VariableInjector: Send + Sync {
    fn active_environment_variables(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Value>, StoreError>> + Send + '_>>;
}
