//! Handlers for server-initiated frames, keyed by command id.
//!
//! The registry is filled before connecting and then shared read-only with
//! the dispatch loop. Frames whose command has no handler are treated as
//! responses and routed to the pending-request table instead.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::cursor::GroupCursorTable;

/// Command id of the new-message push.
pub const PUSH_NOTIFY_CMD: u32 = 202006;

/// A pushed frame handed to a handler.
#[derive(Debug, Clone)]
pub struct PushFrame {
    /// Command id.
    pub cmd: u32,
    /// Correlation id chosen by the server.
    pub correlation_id: u32,
    /// Decoded payload.
    pub payload: Bytes,
    /// Cursor table of the connection the frame arrived on.
    pub cursors: Arc<GroupCursorTable>,
}

/// Type-erased push handler.
///
/// The closure runs synchronously on the dispatch loop, in arrival order; the
/// future it returns is spawned as its own task.
pub type PushHandler = Arc<dyn Fn(PushFrame) -> BoxFuture<'static, ()> + Send + Sync>;

/// Map from command id to push handler.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    handlers: HashMap<u32, PushHandler>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `cmd`, returning the handler it replaces.
    pub fn register_callback<F, Fut>(&mut self, cmd: u32, handler: F) -> Option<PushHandler>
    where
        F: Fn(PushFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: PushHandler = Arc::new(move |frame| handler(frame).boxed());
        self.handlers.insert(cmd, handler)
    }

    /// Remove the handler for `cmd`.
    pub fn remove_callback(&mut self, cmd: u32) -> Option<PushHandler> {
        self.handlers.remove(&cmd)
    }

    pub fn get(&self, cmd: u32) -> Option<&PushHandler> {
        self.handlers.get(&cmd)
    }

    pub fn contains(&self, cmd: u32) -> bool {
        self.handlers.contains_key(&cmd)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invoke the handler for `frame.cmd`.
    ///
    /// Returns the handler's future, or gives the frame back when no handler
    /// is registered so the caller can route it elsewhere.
    pub fn dispatch(&self, frame: PushFrame) -> Result<BoxFuture<'static, ()>, PushFrame> {
        match self.handlers.get(&frame.cmd) {
            Some(handler) => Ok(handler(frame)),
            None => Err(frame),
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut cmds: Vec<_> = self.handlers.keys().copied().collect();
        cmds.sort_unstable();
        f.debug_struct("CallbackRegistry")
            .field("cmds", &cmds)
            .finish()
    }
}
