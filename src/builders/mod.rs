//! Operation builders
//!
//! One builder per operation kind. A builder is a single-use value: every
//! with-option call consumes it and returns the updated value, and the
//! terminal `for_path` executes it against the connection client with
//! namespace translation and retry.
//!
//! Selecting `in_background()` swaps the terminal for one that returns
//! immediately and delivers the result as a
//! [`CanopyEvent`](crate::event::CanopyEvent) through the framework's
//! listener containers instead.

mod acl;
mod children;
mod create;
mod data;
mod delete;
mod exists;
mod sync;
mod transaction;

pub use acl::{GetAclBuilder, SetAclBuilder};
pub use children::GetChildrenBuilder;
pub use create::CreateBuilder;
pub use data::{GetDataBuilder, SetDataBuilder};
pub use delete::DeleteBuilder;
pub use exists::ExistsBuilder;
pub use sync::SyncBuilder;
pub use transaction::{CanopyTransaction, TransactionResult};

use crate::event::BackgroundContext;

/// A builder whose terminal executes in the background.
///
/// Created by a builder's `in_background` / `in_background_with_context`;
/// its `for_path` hands the work to a spawned task and returns immediately.
/// Errors are carried on the delivered event, never returned to the caller.
pub struct InBackground<B> {
    pub(crate) builder: B,
    pub(crate) context: Option<BackgroundContext>,
}

impl<B> InBackground<B> {
    pub(crate) fn new(builder: B, context: Option<BackgroundContext>) -> Self {
        Self { builder, context }
    }
}
