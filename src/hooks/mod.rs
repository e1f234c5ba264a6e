//! User-supplied request and response hooks.
//!
//! Hooks run in ascending [`RequestHook::order`] / [`ResponseHook::order`];
//! hooks with equal order run in registration order. Request hooks run once
//! per logical send, before the first try. Response hooks run once on the
//! final response. Any hook error ends the send with [`ErrorKind::Hook`],
//! which is never retried.

use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{BoxError, ErrorKind, PendingRequest, Response, Result};

/// Inspects or rewrites a request before it is sent
#[async_trait]
pub trait RequestHook: Debug + Send + Sync {
    /// Position among all request hooks, lower runs first
    fn order(&self) -> i32 {
        0
    }

    /// Called once per logical send
    async fn before_send(&self, request: &mut PendingRequest) -> std::result::Result<(), BoxError>;
}

/// Inspects or rewrites a response before it is handed out
#[async_trait]
pub trait ResponseHook: Debug + Send + Sync {
    /// Position among all response hooks, lower runs first
    fn order(&self) -> i32 {
        0
    }

    /// Called once with the final response of a logical send
    async fn after_receive(
        &self,
        response: &mut Response,
        request: &PendingRequest,
    ) -> std::result::Result<(), BoxError>;
}

/// Ordered list of hooks that can grow while requests are in flight.
///
/// Running the chain works on a snapshot, so registering a hook never waits
/// for a running hook and vice versa.
#[derive(Debug)]
pub(crate) struct HookChain<H: ?Sized>(RwLock<Vec<Arc<H>>>);

impl<H: ?Sized> Default for HookChain<H> {
    fn default() -> Self {
        Self(RwLock::new(Vec::new()))
    }
}

impl<H: ?Sized> HookChain<H> {
    /// Insert after every hook with an order less than or equal to `order`.
    fn insert_ordered(&self, hook: Arc<H>, order: i32, order_of: impl Fn(&H) -> i32) {
        let mut hooks = self
            .0
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let position = hooks.partition_point(|h| order_of(&**h) <= order);
        hooks.insert(position, hook);
    }

    fn snapshot(&self) -> Vec<Arc<H>> {
        self.0
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl HookChain<dyn RequestHook> {
    pub(crate) fn push(&self, hook: Arc<dyn RequestHook>) {
        let order = hook.order();
        self.insert_ordered(hook, order, |h| h.order());
    }

    pub(crate) async fn run(&self, request: &mut PendingRequest) -> Result<()> {
        for hook in self.snapshot() {
            hook.before_send(request).await.map_err(ErrorKind::Hook)?;
        }
        Ok(())
    }
}

impl HookChain<dyn ResponseHook> {
    pub(crate) fn push(&self, hook: Arc<dyn ResponseHook>) {
        let order = hook.order();
        self.insert_ordered(hook, order, |h| h.order());
    }

    pub(crate) async fn run(&self, response: &mut Response, request: &PendingRequest) -> Result<()> {
        for hook in self.snapshot() {
            hook.after_receive(response, request)
                .await
                .map_err(ErrorKind::Hook)?;
        }
        Ok(())
    }
}
