//! Scoped cluster acquisition.
//!
//! [`KindCluster::scoped`] pairs `create()` with a guaranteed `delete()`:
//! the body runs between them and teardown happens whether the body returns
//! a value, returns an error of its own, or panics.

use crate::cluster::{ClusterError, KindCluster, Result};
use crate::executor::Executor;
use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::{error, info};

/// What code running inside a scope needs to reach the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    pub name: String,
    pub kubeconfig_path: PathBuf,
}

impl<E: Executor> KindCluster<E> {
    /// Handle for the running cluster; `None` until credentials exist.
    pub fn handle(&self) -> Option<ClusterHandle> {
        self.kubeconfig_path().map(|path| ClusterHandle {
            name: self.name().to_string(),
            kubeconfig_path: path.to_path_buf(),
        })
    }

    /// Create the cluster, run `body` against it, then delete it.
    ///
    /// A deletion failure is logged and does not replace the body's result.
    /// A panic in the body is resumed after teardown.
    pub async fn scoped<F, Fut, T>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(ClusterHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        self.create().await?;

        let outcome = match self.handle() {
            Some(handle) => AssertUnwindSafe(body(handle)).catch_unwind().await,
            None => {
                // create() only succeeds after exporting credentials.
                self.teardown().await;
                return Err(ClusterError::CredentialsMissing {
                    name: self.name().to_string(),
                    message: "no kubeconfig after create".to_string(),
                });
            }
        };

        self.teardown().await;

        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    async fn teardown(&mut self) {
        match self.delete().await {
            Ok(()) => info!(cluster = %self.name(), "scoped cluster released"),
            Err(err) => error!(cluster = %self.name(), error = %err, "failed to delete scoped cluster"),
        }
    }
}
