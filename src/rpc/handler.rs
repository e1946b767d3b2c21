//! The protocol-id keyed handler registries inbound frames dispatch through.
//!
//! Grounded in the teacher's PORTMAP dispatch (`PortmapProgram::from_u32` →
//! match-arm handler call → `proc_unavail` fallback for anything
//! unrecognized), generalized from a fixed enum match to an open
//! `protocol_id -> handler` map so callers can register new protocols
//! without touching this module. Two independent maps exist because posts
//! and calls are dispatched differently: a post just runs and its return
//! code is logged, a call's return value becomes the packed reply.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::value::Value;

/// A registered RPC-call handler: takes the call's decoded arguments and
/// produces the reply arguments. The handler closure itself must be
/// `Send + Sync` (the registry can be populated from any thread during
/// setup) but the future it returns is driven entirely on the reactor thread
/// and need not be `Send`.
pub type Handler = Box<dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = Vec<Value>>>> + Send + Sync>;

/// A registered one-way post handler: takes the post's decoded arguments and
/// returns a status code. Run synchronously on the reactor thread; a post
/// handler that needs to do I/O should launch a coroutine via `run` and
/// return immediately.
pub type PostHandler = Box<dyn Fn(Vec<Value>) -> i32 + Send + Sync>;

/// Process-local `protocol_id -> handler` tables, one for posts and one for
/// calls. Guarded by a `Mutex` even though real dispatch happens from a
/// single reactor thread, so a handler registered from a setup thread ahead
/// of `Reactor::run` is still sound.
#[derive(Default)]
pub struct HandlerRegistry {
    calls: Mutex<HashMap<u16, Handler>>,
    posts: Mutex<HashMap<u16, PostHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry { calls: Mutex::new(HashMap::new()), posts: Mutex::new(HashMap::new()) }
    }

    /// Register `handler` as the RPC-call handler for `protocol_id`. Rejects
    /// a second registration for the same id rather than silently
    /// overwriting it. Independent of the post-handler namespace: a
    /// `protocol_id` may have both a call handler and a post handler.
    pub fn register(&self, protocol_id: u16, handler: Handler) -> Result<()> {
        let mut calls = self.calls.lock().expect("handler registry poisoned");
        if calls.contains_key(&protocol_id) {
            return Err(Error::Codec(format!("protocol {protocol_id} already has a call handler")));
        }
        calls.insert(protocol_id, handler);
        Ok(())
    }

    /// Register `handler` as the post handler for `protocol_id`.
    pub fn register_post(&self, protocol_id: u16, handler: PostHandler) -> Result<()> {
        let mut posts = self.posts.lock().expect("handler registry poisoned");
        if posts.contains_key(&protocol_id) {
            return Err(Error::Codec(format!("protocol {protocol_id} already has a post handler")));
        }
        posts.insert(protocol_id, handler);
        Ok(())
    }

    /// Invoke the call handler for `protocol_id`, if one is registered.
    /// `Err(UnknownProtocol)` is the runtime's `PROTO_UNKNOWN` fallback.
    pub fn dispatch(
        &self,
        protocol_id: u16,
        args: Vec<Value>,
    ) -> Result<Pin<Box<dyn Future<Output = Vec<Value>>>>> {
        let calls = self.calls.lock().expect("handler registry poisoned");
        match calls.get(&protocol_id) {
            Some(handler) => Ok(handler(args)),
            None => Err(Error::UnknownProtocol(protocol_id)),
        }
    }

    /// Invoke the post handler for `protocol_id`, if one is registered.
    /// `Err(UnknownProtocol)` means the caller should drop the post silently
    /// (no reply is ever sent for a post either way).
    pub fn dispatch_post(&self, protocol_id: u16, args: Vec<Value>) -> Result<i32> {
        let posts = self.posts.lock().expect("handler registry poisoned");
        match posts.get(&protocol_id) {
            Some(handler) => Ok(handler(args)),
            None => Err(Error::UnknownProtocol(protocol_id)),
        }
    }

    pub fn is_registered(&self, protocol_id: u16) -> bool {
        self.calls.lock().expect("handler registry poisoned").contains_key(&protocol_id)
    }

    pub fn is_post_registered(&self, protocol_id: u16) -> bool {
        self.posts.lock().expect("handler registry poisoned").contains_key(&protocol_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_protocol_is_unknown() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch(1, vec![]).unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(1)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = HandlerRegistry::new();
        registry.register(1, Box::new(|args| Box::pin(async move { args }))).unwrap();
        let err = registry.register(1, Box::new(|args| Box::pin(async move { args }))).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn post_and_call_handlers_share_a_protocol_id_independently() {
        let registry = HandlerRegistry::new();
        registry.register(1, Box::new(|args| Box::pin(async move { args }))).unwrap();
        registry.register_post(1, Box::new(|_args| 0)).unwrap();
        assert!(registry.is_registered(1));
        assert!(registry.is_post_registered(1));
    }

    #[test]
    fn unregistered_post_is_unknown() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch_post(9, vec![]).unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(9)));
    }

    #[test]
    fn duplicate_post_registration_is_rejected() {
        let registry = HandlerRegistry::new();
        registry.register_post(1, Box::new(|_args| 0)).unwrap();
        let err = registry.register_post(1, Box::new(|_args| 0)).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
