//! Per-connection framed I/O: owns one socket's send/receive buffers, drives
//! the configured [`HeaderCodec`], and hands complete frame bodies to a
//! caller-supplied callback.
//!
//! A `Channel` is shared as `Rc<RefCell<ChannelInner>>` so the closure the
//! reactor calls on readiness, and the handle application code holds to call
//! `send`, can both reach the same buffers — the single-threaded-reactor
//! model means this never needs to be `Arc`/`Mutex`.

pub mod codec;

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use mio::net::{TcpListener as MioTcpListener, TcpStream};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::reactor::backend::Readiness;
use crate::reactor::{self, EventId, Reactor};
use codec::HeaderCodec;

/// Receive/send buffer ceiling per channel, matching the runtime's default
/// per-connection resource bound.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2 * 1024 * 1024;

/// Frames drained per readiness notification before yielding back to the
/// reactor, so one very chatty connection cannot starve the others.
const MAX_FRAMES_PER_READY: usize = 16;

/// Tunables for [`Channel::connect`]/[`Channel::accept`].
#[derive(Clone, Copy, Debug)]
pub struct ChannelConfig {
    pub recv_capacity: usize,
    pub send_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig { recv_capacity: DEFAULT_BUFFER_CAPACITY, send_capacity: DEFAULT_BUFFER_CAPACITY }
    }
}

struct Inner {
    stream: TcpStream,
    peer: SocketAddr,
    codec: &'static dyn HeaderCodec,
    recv_buf: BytesMut,
    send_buf: BytesMut,
    config: ChannelConfig,
    event_id: Option<EventId>,
    on_packet: Box<dyn FnMut(&[u8]) -> Option<Vec<u8>>>,
    on_close: Option<Box<dyn FnOnce()>>,
    closed: bool,
}

/// A handle to one framed connection. Cloning shares the same underlying
/// socket and buffers (it is a reference-counted handle, not a new channel).
#[derive(Clone)]
pub struct Channel(Rc<RefCell<Inner>>);

impl Channel {
    /// Wrap an already-connected `mio::net::TcpStream` and register it with
    /// `reactor`. `on_packet` is invoked with each complete frame body and
    /// may return a reply body to send back; `on_close` runs exactly once
    /// when the channel is torn down (peer EOF, I/O error, or explicit
    /// `close()`).
    pub fn new(
        reactor: &mut Reactor,
        mut stream: TcpStream,
        codec: &'static dyn HeaderCodec,
        config: ChannelConfig,
        on_packet: impl FnMut(&[u8]) -> Option<Vec<u8>> + 'static,
        on_close: impl FnOnce() + 'static,
    ) -> Result<Channel> {
        let peer = stream.peer_addr().map_err(Error::Io)?;
        let inner = Rc::new(RefCell::new(Inner {
            stream,
            peer,
            codec,
            recv_buf: BytesMut::with_capacity(4096),
            send_buf: BytesMut::new(),
            config,
            event_id: None,
            on_packet: Box::new(on_packet),
            on_close: Some(Box::new(on_close)),
            closed: false,
        }));

        let channel = Channel(inner.clone());
        let dispatch_handle = channel.clone();
        // Registered for both readable and writable up front: mio's
        // edge-triggered backends only notify on genuine state transitions,
        // so there is no busy-loop cost to always watching for writable,
        // and it avoids needing a live reactor handle on `Channel` just to
        // toggle interest when a send buffers up.
        let event_id = {
            let mut guard = inner.borrow_mut();
            reactor.add_event(&mut guard.stream, Readiness::BOTH, move |readiness| {
                dispatch_handle.on_ready(readiness);
            })?
        };
        inner.borrow_mut().event_id = Some(event_id);
        debug!(peer = %inner.borrow().peer, "channel opened");
        Ok(channel)
    }

    /// Resolve `addr` and connect, then wrap the connected stream exactly as
    /// [`Channel::new`] does. Connects via a blocking `std::net::TcpStream`
    /// rather than `mio::net::TcpStream::connect` specifically so the
    /// socket's `peer_addr()` (read eagerly by `Channel::new`) is never
    /// raced against an in-progress non-blocking connect.
    pub fn connect(
        reactor: &mut Reactor,
        addr: SocketAddr,
        codec: &'static dyn HeaderCodec,
        config: ChannelConfig,
        on_packet: impl FnMut(&[u8]) -> Option<Vec<u8>> + 'static,
        on_close: impl FnOnce() + 'static,
    ) -> Result<Channel> {
        let std_stream = std::net::TcpStream::connect(addr).map_err(Error::Io)?;
        std_stream.set_nodelay(true).map_err(Error::Io)?;
        std_stream.set_nonblocking(true).map_err(Error::Io)?;
        let stream = TcpStream::from_std(std_stream);
        Channel::new(reactor, stream, codec, config, on_packet, on_close)
    }

    /// Bind `bind_addr` and register the listener with `reactor`. Each
    /// accepted connection gets a fresh `Channel` built from `make_on_packet`/
    /// `make_on_close` (invoked once per accept, not shared across
    /// connections) and the same `codec`/`config` passed here. Returns the
    /// listener's own `EventId` and the address it actually bound to (useful
    /// when `bind_addr`'s port is `0`); the accepted channels' ids are not
    /// exposed since nothing outside the accept loop needs to address them
    /// directly.
    pub fn listen(
        reactor: &mut Reactor,
        bind_addr: SocketAddr,
        codec: &'static dyn HeaderCodec,
        config: ChannelConfig,
        make_on_packet: impl Fn() -> Box<dyn FnMut(&[u8]) -> Option<Vec<u8>>> + 'static,
        make_on_close: impl Fn() -> Box<dyn FnOnce()> + 'static,
    ) -> Result<(EventId, SocketAddr)> {
        let std_listener = std::net::TcpListener::bind(bind_addr).map_err(Error::Io)?;
        std_listener.set_nonblocking(true).map_err(Error::Io)?;
        let local_addr = std_listener.local_addr().map_err(Error::Io)?;
        let listener = Rc::new(RefCell::new(MioTcpListener::from_std(std_listener)));
        let listener_for_accept = listener.clone();

        let event_id = {
            let mut guard = listener.borrow_mut();
            reactor.add_event(&mut *guard, Readiness::READABLE, move |_readiness| loop {
                let (stream, peer) = match listener_for_accept.borrow_mut().accept() {
                    Ok(pair) => pair,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(error = %e, "failed to set TCP_NODELAY on accepted connection");
                }
                let on_packet = make_on_packet();
                let on_close = make_on_close();
                // `Channel::new` needs `&mut Reactor`, but this callback runs
                // from inside `Reactor::process_inner`'s own `&mut self`
                // dispatch loop, so it cannot hold one of its own.
                match reactor::with_current(|r| Channel::new(r, stream, codec, config, on_packet, on_close)) {
                    Some(Ok(_channel)) => debug!(%peer, "accepted connection"),
                    Some(Err(e)) => warn!(error = %e, "failed to register accepted connection"),
                    None => warn!("accepted connection with no active reactor"),
                }
            })?
        };
        Ok((event_id, local_addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.0.borrow().peer
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    /// Queue `body` for send, framed by the channel's codec. Writes directly
    /// to the socket when possible; anything that would block is buffered
    /// (up to `send_capacity`, `Err(BuffFull)` beyond that) and flushed on
    /// the next writable readiness.
    pub fn send(&self, body: &[u8]) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.closed {
            return Err(Error::Io(io::Error::new(io::ErrorKind::NotConnected, "channel closed")));
        }

        let mut frame = BytesMut::with_capacity(inner.codec.header_len() + body.len());
        inner.codec.write_header(body.len(), &mut frame)?;
        frame.extend_from_slice(body);

        if inner.send_buf.is_empty() {
            match inner.stream.write(&frame) {
                Ok(n) if n == frame.len() => return Ok(()),
                Ok(n) => {
                    let remainder = frame.split_off(n);
                    inner.buffer_for_send(&remainder)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    inner.buffer_for_send(&frame)?;
                }
                Err(e) => {
                    let err = Error::Io(e);
                    drop(inner);
                    self.close();
                    return Err(err);
                }
            }
        } else {
            inner.buffer_for_send(&frame)?;
        }
        inner.arm_writable()?;
        Ok(())
    }

    /// Deregister and drop the underlying socket, running `on_close` once.
    pub fn close(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let hook = inner.on_close.take();
        drop(inner);
        if let Some(hook) = hook {
            hook();
        }
    }

    fn on_ready(&self, readiness: Readiness) {
        if readiness.readable {
            self.drain_readable();
        }
        if readiness.writable && !self.is_closed() {
            self.flush_send_buffer();
        }
    }

    fn drain_readable(&self) {
        let mut frames = 0;
        loop {
            if frames >= MAX_FRAMES_PER_READY {
                trace!("reached per-readiness frame bound, yielding");
                break;
            }
            let mut inner = self.0.borrow_mut();
            if inner.closed {
                return;
            }

            let mut buf = [0u8; 64 * 1024];
            let read_result = inner.stream.read(&mut buf);
            match read_result {
                Ok(0) => {
                    drop(inner);
                    debug!("peer closed connection");
                    self.close();
                    return;
                }
                Ok(n) => {
                    if inner.recv_buf.len() + n > inner.config.recv_capacity {
                        drop(inner);
                        warn!("receive buffer capacity exceeded, closing channel");
                        self.close();
                        return;
                    }
                    inner.recv_buf.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    drop(inner);
                    warn!(error = %e, "channel read error");
                    self.close();
                    return;
                }
            }

            let mut dispatched_any = false;
            loop {
                if frames >= MAX_FRAMES_PER_READY {
                    break;
                }
                let total = match inner.codec.check_complete(&inner.recv_buf) {
                    Ok(Some(total)) => total,
                    Ok(None) => break,
                    Err(e) => {
                        drop(inner);
                        warn!(error = %e, "invalid frame, closing channel");
                        self.close();
                        return;
                    }
                };
                let header_len = inner.codec.header_len();
                let mut frame = inner.recv_buf.split_to(total);
                if let Err(e) = inner.codec.read_header(&mut frame) {
                    drop(inner);
                    warn!(error = %e, "invalid frame header, closing channel");
                    self.close();
                    return;
                }
                debug_assert_eq!(frame.len(), total - header_len);
                let reply = (inner.on_packet)(&frame[..]);
                frames += 1;
                dispatched_any = true;
                if let Some(reply) = reply {
                    drop(inner);
                    let _ = self.send(&reply);
                    inner = self.0.borrow_mut();
                }
            }
            if !dispatched_any {
                break;
            }
        }
    }

    fn flush_send_buffer(&self) {
        let mut inner = self.0.borrow_mut();
        while !inner.send_buf.is_empty() {
            match inner.stream.write(&inner.send_buf) {
                Ok(0) => break,
                Ok(n) => inner.send_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    drop(inner);
                    warn!(error = %e, "channel write error");
                    self.close();
                    return;
                }
            }
        }
        if inner.send_buf.is_empty() {
            let _ = inner.disarm_writable();
        }
    }
}

impl Inner {
    fn buffer_for_send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.send_buf.len() + bytes.len() > self.config.send_capacity {
            return Err(Error::BuffFull);
        }
        self.send_buf.extend_from_slice(bytes);
        Ok(())
    }

    fn arm_writable(&mut self) -> Result<()> {
        // No-op: the channel is registered for both readable and writable
        // for its whole lifetime (see the comment in `Channel::new`), so
        // there is no interest mask to toggle here.
        Ok(())
    }

    fn disarm_writable(&mut self) -> Result<()> {
        Ok(())
    }
}
