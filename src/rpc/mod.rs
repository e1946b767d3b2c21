//! Ties the sub-frame wire format, the handler registry, and a [`Channel`]
//! together into a request/reply RPC endpoint.
//!
//! Outbound calls ([`Dispatcher::pcall`]) suspend the calling coroutine on
//! the [`crate::coro::waiter`] rendezvous; inbound frames are decoded and
//! either resume a waiting coroutine (a reply), dispatch to a registered RPC
//! handler (a call), or dispatch to a registered post handler (a one-way
//! post) — mirroring the teacher's `handle_portmap`/`dispatch_call` split
//! between request decoding and reply encoding.

pub mod frame;
pub mod handler;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{self, Either};
use futures::pin_mut;
use tracing::{debug, warn};

use crate::channel::codec::HeaderCodec;
use crate::channel::{Channel, ChannelConfig};
use crate::coro::waiter::wait_for;
use crate::coro::{self, CoroId};
use crate::error::{Error, Result, RetCode};
use crate::reactor::{self, Reactor};
use crate::value::Value;
use frame::Frame;
use handler::HandlerRegistry;

/// One RPC-speaking connection: a [`Channel`] plus the identifier this
/// endpoint logs itself as.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Channel,
    self_id: u64,
}

impl Dispatcher {
    /// Wrap `stream` in a [`Channel`] and install the frame decode/dispatch
    /// loop. `handlers` is shared (`Rc`) so several connections accepted on
    /// the same reactor can answer the same registered protocols.
    pub fn new(
        reactor: &mut Reactor,
        stream: mio::net::TcpStream,
        codec: &'static dyn HeaderCodec,
        config: ChannelConfig,
        handlers: Rc<HandlerRegistry>,
        self_id: u64,
    ) -> Result<Dispatcher> {
        // `Channel::new` needs the callback before it can hand back the
        // `Channel` the callback itself needs to send slow-path replies, so
        // the handle is threaded through a cell filled right after
        // construction. The callback never runs before then: dispatch only
        // happens from a later reactor tick, never from inside `Channel::new`.
        let channel_slot: Rc<RefCell<Option<Channel>>> = Rc::new(RefCell::new(None));
        let slot_for_packet = channel_slot.clone();

        let channel = Channel::new(
            reactor,
            stream,
            codec,
            config,
            move |body| {
                let channel = slot_for_packet.borrow().clone()?;
                Dispatcher::handle_inbound(body, &handlers, &channel)
            },
            move || debug!(self_id, "rpc dispatcher connection closed"),
        )?;
        *channel_slot.borrow_mut() = Some(channel.clone());

        Ok(Dispatcher { channel, self_id })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Issue an outbound call and suspend the calling coroutine until the
    /// matching reply arrives. Must be `.await`ed from inside a coroutine
    /// running under the same reactor's executor.
    pub async fn pcall(&self, protocol_id: u16, args: Vec<Value>) -> Result<Vec<Value>> {
        let coro_id = coro::self_id().ok_or(Error::NotInCoroutine)?;
        let wait_id = reactor::with_current(|r| r.coro().waiters().next_wait_id())
            .ok_or(Error::NotInCoroutine)?;

        let frame = Frame::call(wait_id, coro_id_to_wire(coro_id), protocol_id, args);
        self.channel.send(&frame.encode()?)?;
        reactor::with_current(|r| r.coro().inc_nrpc());

        wait_for(wait_id).await
    }

    /// Like [`Dispatcher::pcall`], but races the call against a `sleep(ms)`
    /// timeout. Returns `Err(Timeout)` if the reply hasn't arrived by then;
    /// the `wait_id` is left registered (and will leak, per the runtime's
    /// documented cancellation limits) since the reply may still arrive and
    /// there is no peer-side cancel message to send.
    pub async fn pcall_timeout(&self, ms: u64, protocol_id: u16, args: Vec<Value>) -> Result<Vec<Value>> {
        let call = self.pcall(protocol_id, args);
        let timeout = coro::sleep(Duration::from_millis(ms));
        pin_mut!(call);
        pin_mut!(timeout);
        match future::select(call, timeout).await {
            Either::Left((result, _)) => result,
            Either::Right((_, _)) => Err(Error::Timeout),
        }
    }

    /// Send a one-way post: no reply is ever expected or awaited.
    pub fn post(&self, protocol_id: u16, args: Vec<Value>) -> Result<()> {
        let frame = Frame::post(protocol_id, args);
        self.channel.send(&frame.encode()?)
    }

    /// Decode one inbound sub-frame body and dispatch it per `is_rpc`.
    /// Returns a reply body to send back immediately only for the
    /// synchronous `UnknownProtocol` failure path on a call; a successfully
    /// dispatched call replies later via `channel.send` from its own spawned
    /// coroutine, and a post never replies at all.
    fn handle_inbound(body: &[u8], handlers: &Rc<HandlerRegistry>, channel: &Channel) -> Option<Vec<u8>> {
        let frame = match Frame::decode(body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed rpc frame");
                return None;
            }
        };

        match frame {
            Frame::Reply { wait_id, retcode, args, .. } => {
                let result = if retcode == 0 { Ok(args) } else { Err(retcode_to_error(retcode)) };
                let delivered = reactor::with_current(|r| r.coro().resume_with_result(wait_id, result));
                if delivered.is_none() {
                    warn!(wait_id, "reply arrived with no active reactor");
                }
                None
            }
            Frame::Post { protocol_id, args } => {
                Self::dispatch_post(protocol_id, args, handlers);
                None
            }
            Frame::Call { wait_id, coro_id, protocol_id, args } => {
                Self::dispatch_call(wait_id, coro_id, protocol_id, args, handlers, channel)
            }
        }
    }

    fn dispatch_post(protocol_id: u16, args: Vec<Value>, handlers: &Rc<HandlerRegistry>) {
        match handlers.dispatch_post(protocol_id, args) {
            Ok(code) if code != 0 => debug!(protocol_id, code, "post handler returned a non-zero status"),
            Ok(_) => {}
            Err(e) => warn!(protocol_id, error = %e, "dropping post with no registered handler"),
        }
    }

    fn dispatch_call(
        wait_id: u32,
        coro_id: i32,
        protocol_id: u16,
        args: Vec<Value>,
        handlers: &Rc<HandlerRegistry>,
        channel: &Channel,
    ) -> Option<Vec<u8>> {
        match handlers.dispatch(protocol_id, args) {
            Ok(future) => {
                let channel = channel.clone();
                let spawned = reactor::with_current(|r| {
                    r.coro().run(async move {
                        let reply_args = future.await;
                        let reply = Frame::reply(wait_id, coro_id, RetCode::Success as i32, reply_args);
                        if let Ok(bytes) = reply.encode() {
                            let _ = channel.send(&bytes);
                        }
                    });
                });
                if spawned.is_none() {
                    warn!(protocol_id, "call arrived with no active reactor to run its handler");
                }
                None
            }
            Err(err) => {
                let retcode = RetCode::from(&err) as i32;
                let reply = Frame::reply(wait_id, coro_id, retcode, vec![]);
                reply.encode().ok()
            }
        }
    }
}

fn coro_id_to_wire(id: CoroId) -> i32 {
    id.0 as i32
}

fn retcode_to_error(retcode: i32) -> Error {
    use num_traits::FromPrimitive;
    match RetCode::from_i32(retcode) {
        Some(RetCode::CoroutineException) => Error::CoroutineException,
        Some(RetCode::CoroutineFailed) => Error::CoroutineFailed,
        Some(RetCode::UnknownProtocol) => Error::UnknownProtocol(0),
        Some(RetCode::AllocFailure) => Error::AllocFailure,
        Some(RetCode::NotInCoroutine) => Error::NotInCoroutine,
        Some(RetCode::BuffFull) => Error::BuffFull,
        Some(RetCode::Timeout) => Error::Timeout,
        Some(RetCode::InvalidResponseFraming) => Error::InvalidResponseFraming,
        Some(RetCode::Success) | None => Error::Codec(format!("unexpected retcode {retcode}")),
    }
}
