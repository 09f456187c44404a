//! Run async manager calls to completion from synchronous code.

use std::future::Future;

use crate::error::{Error, Result};

/// Drive `future` on a dedicated current-thread runtime in a scoped thread.
///
/// The calling thread only blocks on the join, so this is safe to call from inside another
/// runtime's task as long as `future` does not need that runtime to make progress.
pub fn block_on<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
    T: Send,
{
    std::thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Internal(format!("Failed to build bridge runtime: {}", e)))?;
            runtime.block_on(future)
        });
        handle
            .join()
            .unwrap_or_else(|_| Err(Error::Internal("Bridged call panicked".to_string())))
    })
}
