//! Method-name → handler table for inbound RPCs.
//!
//! Arguments are checked against the method's schema before the handler
//! runs, so handlers can read them with the typed accessors on
//! [`RpcCall`] without re-validating.

use std::collections::HashMap;

use navi_wire::{RpcCall, rpc};
use tracing::debug;

use crate::error::SessionError;
use crate::transport::ConnectionId;

/// Handler for one method. `C` is the state the table dispatches into.
pub type Handler<C> = fn(&mut C, ConnectionId, &RpcCall) -> Result<(), SessionError>;

/// What happened to one dispatched call.
#[derive(Debug)]
pub enum DispatchOutcome {
    Handled,
    /// No handler registered; the call was ignored.
    UnknownMethod,
    /// The call failed validation or its handler returned an error.
    Rejected(SessionError),
}

pub struct DispatchTable<C> {
    handlers: HashMap<&'static str, Handler<C>>,
}

impl<C> Default for DispatchTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DispatchTable<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `method`, replacing any previous one.
    pub fn register(&mut self, method: &'static str, handler: Handler<C>) -> &mut Self {
        self.handlers.insert(method, handler);
        self
    }

    pub fn dispatch(&self, ctx: &mut C, connection: ConnectionId, call: &RpcCall) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(call.method.as_str()) else {
            debug!(connection, method = %call.method, "ignoring unknown method");
            return DispatchOutcome::UnknownMethod;
        };
        if let Some(schema) = rpc::schema(&call.method)
            && let Err(e) = call.validate(schema)
        {
            return DispatchOutcome::Rejected(e.into());
        }
        match handler(ctx, connection, call) {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) => DispatchOutcome::Rejected(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_wire::{DecodeError, method};

    #[derive(Default)]
    struct Counter {
        vibrations: u32,
        sizes: Vec<(i32, i32)>,
    }

    fn on_vibrate(ctx: &mut Counter, _: ConnectionId, _: &RpcCall) -> Result<(), SessionError> {
        ctx.vibrations += 1;
        Ok(())
    }

    fn on_set_size(ctx: &mut Counter, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        ctx.sizes.push((call.int(0)?, call.int(1)?));
        Ok(())
    }

    fn table() -> DispatchTable<Counter> {
        let mut table = DispatchTable::new();
        table
            .register(method::VIBRATE, on_vibrate)
            .register(method::SET_SIZE, on_set_size);
        table
    }

    #[test]
    fn test_dispatches_by_name() {
        let table = table();
        let mut ctx = Counter::default();
        assert!(matches!(
            table.dispatch(&mut ctx, 1, &RpcCall::vibrate()),
            DispatchOutcome::Handled
        ));
        assert!(matches!(
            table.dispatch(&mut ctx, 1, &RpcCall::set_size(1080, 1920)),
            DispatchOutcome::Handled
        ));
        assert_eq!(ctx.vibrations, 1);
        assert_eq!(ctx.sizes, vec![(1080, 1920)]);
    }

    #[test]
    fn test_unknown_method_leaves_state_unchanged() {
        let table = table();
        let mut ctx = Counter::default();
        let outcome = table.dispatch(&mut ctx, 1, &RpcCall::new("SelfDestruct").arg(1));
        assert!(matches!(outcome, DispatchOutcome::UnknownMethod));
        assert_eq!(ctx.vibrations, 0);

        table.dispatch(&mut ctx, 1, &RpcCall::vibrate());
        assert_eq!(ctx.vibrations, 1);
    }

    #[test]
    fn test_bad_arguments_rejected_without_running_handler() {
        let table = table();
        let mut ctx = Counter::default();
        let wrong_type = RpcCall::new(method::SET_SIZE).arg(1080).arg("wide");
        let outcome = table.dispatch(&mut ctx, 1, &wrong_type);
        assert!(matches!(
            outcome,
            DispatchOutcome::Rejected(SessionError::Decode(DecodeError::ArgType { index: 1, .. }))
        ));
        let missing = RpcCall::new(method::SET_SIZE).arg(1080);
        assert!(matches!(
            table.dispatch(&mut ctx, 1, &missing),
            DispatchOutcome::Rejected(SessionError::Decode(DecodeError::ArgCount { .. }))
        ));
        assert!(ctx.sizes.is_empty());

        table.dispatch(&mut ctx, 1, &RpcCall::set_size(4, 3));
        assert_eq!(ctx.sizes, vec![(4, 3)]);
    }
}
