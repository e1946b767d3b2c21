//! netloom - a single-threaded reactor, framed channels, stackless
//! coroutines, and an RPC dispatcher, in one crate.
//!
//! This library provides a small cooperative runtime for building
//! request/reply network services: one thread owns an epoll/kqueue/IOCP
//! event loop, a timer heap, and a coroutine scheduler together, and
//! application code is written as ordinary `async fn` bodies that `.await`
//! RPC calls and sleeps without ever blocking that thread.
//!
//! ## Main Components
//!
//! - `reactor`: the event loop itself — an fd-indexed event table backed by
//!   `mio`, a timer heap, and the tick (`process`/`run`) that drains
//!   readiness, runs ready coroutines, and services due timers.
//!
//! - `channel`: per-connection framed I/O. A `Channel` owns one socket's
//!   send/receive buffers and drives a pluggable [`channel::codec::HeaderCodec`]
//!   to turn a byte stream into discrete frame bodies.
//!
//! - `coro`: the stackless coroutine scheduler. Coroutines are `async fn`
//!   bodies driven by a hand-rolled single-threaded `Executor`; the only
//!   await points are this module's own `sleep` and the RPC waiter registry.
//!
//! - `rpc`: the wire sub-frame format and `Dispatcher`, which ties a
//!   `Channel` to a `HandlerRegistry` and the coroutine executor's waiter
//!   registry to implement outbound `pcall` and inbound call dispatch.
//!
//! - `value`: the tagged argument type shared by RPC frames and coroutine
//!   wait results.
//!
//! - `timer`: the timer min-heap the reactor services each tick.
//!
//! - `error`: the crate-wide error type and its mapping onto the wire RPC
//!   reply codes.
//!
//! ## Usage
//!
//! Build a `Reactor`, register listening sockets with `Reactor::add_event`,
//! accept connections into `rpc::Dispatcher`s backed by a shared
//! `rpc::handler::HandlerRegistry`, spawn coroutines with
//! `Reactor::coro`/`Executor::run` that `.await` `Dispatcher::pcall` and
//! `coro::sleep`, then call `Reactor::run` to drive everything.

pub mod channel;
pub mod coro;
pub mod error;
pub mod reactor;
pub mod rpc;
pub mod timer;
pub mod value;

pub use error::{Error, Result};
