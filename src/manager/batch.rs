use std::path::PathBuf;
use std::sync::Arc;

use crate::module::Module;
use crate::task::{HostFuture, TaskScope};

/// Runs `op` on every module as its own task and waits for all of them.
///
/// Tasks are spawned in slice order and may finish in any order. Each failure
/// (a `false` result, an error or a panic) is logged against its module.
/// Returns the manifest paths of the failed modules in slice order.
pub async fn for_each_module<F>(
    scope: &TaskScope,
    modules: &[Arc<Module>],
    operation: &'static str,
    op: F,
) -> Vec<PathBuf>
where
    F: Fn(&Module) -> bool + Clone + Send + 'static,
{
    let tasks: Vec<HostFuture<bool>> = modules
        .iter()
        .map(|module| {
            let module = Arc::clone(module);
            let op = op.clone();
            scope.spawn(async move { Ok(op(&module)) })
        })
        .collect();

    let mut failed = Vec::new();
    for (module, task) in modules.iter().zip(tasks) {
        match task.await {
            Ok(true) => continue,
            Ok(false) => {
                tracing::error!(operation, path = %module.manifest_file().display(), "Module {} failed", operation);
            }
            Err(e) => {
                tracing::error!(operation, path = %module.manifest_file().display(), "Module {} failed: {}", operation, e);
            }
        }
        failed.push(module.manifest_file().to_path_buf());
    }

    tracing::debug!(operation, count = modules.len(), failed = failed.len(), "Batch finished");
    failed
}
