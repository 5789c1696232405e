//! The task-local "current transaction" slot.
//!
//! Each tokio task sees its own slot. A value is installed only for the
//! duration of a [`scope`] future, and the previous value is back in place
//! as soon as that future completes, panics or is dropped.

use std::future::Future;
use std::sync::Arc;

use crate::session::Session;
use crate::transaction::context::TransactionContext;

tokio::task_local! {
    static CURRENT: Option<Arc<TransactionContext>>;
}

/// The context installed for the running task, if any.
///
/// Returns `None` outside any transaction scope, including from tasks
/// spawned inside one.
pub fn current_transaction() -> Option<Arc<TransactionContext>> {
    CURRENT.try_with(|current| current.clone()).ok().flatten()
}

/// The session of the current context, if any.
pub fn current_session() -> Option<Arc<dyn Session>> {
    current_transaction().map(|ctx| ctx.session().clone())
}

/// Run `fut` with `ctx` installed in the slot.
pub(crate) async fn scope<F>(ctx: Arc<TransactionContext>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(Some(ctx), fut).await
}
