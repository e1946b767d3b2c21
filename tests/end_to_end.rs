//! End-to-end scenarios driven entirely through `Reactor::process`: framed
//! echo over a real loopback socket pair, RPC call/reply through a
//! `Dispatcher`, out-of-order reply delivery, timer fairness across many
//! sleeping coroutines, and panic isolation between coroutines.

use std::cell::RefCell;
use std::net::{SocketAddr, TcpListener, TcpStream as StdTcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use netloom::channel::codec::Blp4Codec;
use netloom::channel::{Channel, ChannelConfig};
use netloom::coro;
use netloom::reactor::{Reactor, ReactorConfig};
use netloom::rpc::handler::HandlerRegistry;
use netloom::rpc::Dispatcher;
use netloom::value::Value;

static BLP4: Blp4Codec = Blp4Codec;

/// A connected pair of nonblocking `mio` streams over real loopback sockets.
fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let client = StdTcpStream::connect(addr).expect("connect loopback client");
    let (server, _) = listener.accept().expect("accept loopback connection");
    client.set_nonblocking(true).expect("client nonblocking");
    server.set_nonblocking(true).expect("server nonblocking");
    (TcpStream::from_std(client), TcpStream::from_std(server))
}

fn drive_until(reactor: &mut Reactor, mut done: impl FnMut() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !done() && Instant::now() < deadline {
        reactor.process(Some(Duration::from_millis(20))).expect("reactor tick");
    }
}

#[test]
fn blp4_echo_round_trip() {
    let mut reactor = Reactor::create(ReactorConfig::default()).unwrap();
    let (client_stream, server_stream) = connected_pair();

    let _server = Channel::new(
        &mut reactor,
        server_stream,
        &BLP4,
        ChannelConfig::default(),
        |body| Some(body.to_vec()),
        || {},
    )
    .unwrap();

    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let received_for_client = received.clone();
    let client = Channel::new(
        &mut reactor,
        client_stream,
        &BLP4,
        ChannelConfig::default(),
        move |body| {
            *received_for_client.borrow_mut() = Some(body.to_vec());
            None
        },
        || {},
    )
    .unwrap();

    client.send(b"hello reactor").unwrap();

    drive_until(&mut reactor, || received.borrow().is_some(), Duration::from_secs(2));

    assert_eq!(received.borrow().as_deref(), Some(&b"hello reactor"[..]));
}

#[test]
fn listen_accepts_and_connect_dials_a_real_loopback_socket() {
    let mut reactor = Reactor::create(ReactorConfig::default()).unwrap();

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let received_for_server = received.clone();
    let (_listener, listen_addr) = Channel::listen(
        &mut reactor,
        bind_addr,
        &BLP4,
        ChannelConfig::default(),
        move || {
            let received = received_for_server.clone();
            Box::new(move |body: &[u8]| {
                *received.borrow_mut() = Some(body.to_vec());
                None
            })
        },
        || Box::new(|| {}),
    )
    .unwrap();

    let client = Channel::connect(
        &mut reactor,
        listen_addr,
        &BLP4,
        ChannelConfig::default(),
        |_body| None,
        || {},
    )
    .unwrap();
    client.send(b"dialed in").unwrap();

    drive_until(&mut reactor, || received.borrow().is_some(), Duration::from_secs(2));
    assert_eq!(received.borrow().as_deref(), Some(&b"dialed in"[..]));
}

#[test]
fn rpc_call_round_trips_through_dispatcher() {
    let mut reactor = Reactor::create(ReactorConfig::default()).unwrap();
    let (client_stream, server_stream) = connected_pair();

    let server_handlers = Rc::new(HandlerRegistry::new());
    server_handlers.register(1, Box::new(|args| Box::pin(async move { args }))).unwrap();

    let _server = Dispatcher::new(
        &mut reactor,
        server_stream,
        &BLP4,
        ChannelConfig::default(),
        server_handlers,
        100,
    )
    .unwrap();
    let client =
        Dispatcher::new(&mut reactor, client_stream, &BLP4, ChannelConfig::default(), Rc::new(HandlerRegistry::new()), 1)
            .unwrap();

    let result = Rc::new(RefCell::new(None));
    let result_for_coro = result.clone();
    let client_for_coro = client.clone();
    reactor.coro().run(async move {
        let reply = client_for_coro.pcall(1, vec![Value::I32(7)]).await;
        *result_for_coro.borrow_mut() = Some(reply);
    });

    drive_until(&mut reactor, || result.borrow().is_some(), Duration::from_secs(2));

    let got = result.borrow_mut().take().expect("call completed").expect("call succeeded");
    assert_eq!(got, vec![Value::I32(7)]);
}

#[test]
fn unregistered_protocol_reports_unknown_protocol() {
    let mut reactor = Reactor::create(ReactorConfig::default()).unwrap();
    let (client_stream, server_stream) = connected_pair();

    let _server = Dispatcher::new(
        &mut reactor,
        server_stream,
        &BLP4,
        ChannelConfig::default(),
        Rc::new(HandlerRegistry::new()),
        100,
    )
    .unwrap();
    let client =
        Dispatcher::new(&mut reactor, client_stream, &BLP4, ChannelConfig::default(), Rc::new(HandlerRegistry::new()), 1)
            .unwrap();

    let result = Rc::new(RefCell::new(None));
    let result_for_coro = result.clone();
    let client_for_coro = client.clone();
    reactor.coro().run(async move {
        let reply = client_for_coro.pcall(99, vec![]).await;
        *result_for_coro.borrow_mut() = Some(reply);
    });

    drive_until(&mut reactor, || result.borrow().is_some(), Duration::from_secs(2));

    let got = result.borrow_mut().take().unwrap();
    assert!(matches!(got, Err(netloom::Error::UnknownProtocol(99))));
}

#[test]
fn replies_arrive_out_of_order_when_handler_delays_differ() {
    let mut reactor = Reactor::create(ReactorConfig::default()).unwrap();
    let (client_stream, server_stream) = connected_pair();

    let server_handlers = Rc::new(HandlerRegistry::new());
    server_handlers
        .register(
            2,
            Box::new(|args| {
                Box::pin(async move {
                    if let Some(Value::I32(ms)) = args.first() {
                        coro::sleep(Duration::from_millis(*ms as u64)).await;
                    }
                    args
                })
            }),
        )
        .unwrap();

    let _server = Dispatcher::new(
        &mut reactor,
        server_stream,
        &BLP4,
        ChannelConfig::default(),
        server_handlers,
        100,
    )
    .unwrap();
    let client =
        Dispatcher::new(&mut reactor, client_stream, &BLP4, ChannelConfig::default(), Rc::new(HandlerRegistry::new()), 1)
            .unwrap();

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let order_slow = order.clone();
    let client_slow = client.clone();
    reactor.coro().run(async move {
        let _ = client_slow.pcall(2, vec![Value::I32(60)]).await;
        order_slow.borrow_mut().push("slow");
    });

    let order_fast = order.clone();
    let client_fast = client.clone();
    reactor.coro().run(async move {
        let _ = client_fast.pcall(2, vec![Value::I32(5)]).await;
        order_fast.borrow_mut().push("fast");
    });

    drive_until(&mut reactor, || order.borrow().len() == 2, Duration::from_secs(2));

    assert_eq!(*order.borrow(), vec!["fast", "slow"]);
}

#[test]
fn hundred_sleeping_coroutines_all_complete() {
    let mut reactor = Reactor::create(ReactorConfig::default()).unwrap();
    let counter = Rc::new(RefCell::new(0usize));

    for i in 0..100u64 {
        let c = counter.clone();
        reactor.coro().run(async move {
            coro::sleep(Duration::from_millis(i % 10)).await;
            *c.borrow_mut() += 1;
        });
    }

    drive_until(&mut reactor, || *counter.borrow() == 100, Duration::from_secs(5));

    assert_eq!(*counter.borrow(), 100);
}

#[test]
fn panicking_coroutine_does_not_take_down_others() {
    let mut reactor = Reactor::create(ReactorConfig::default()).unwrap();

    reactor.coro().run(async {
        panic!("deliberate test panic");
    });

    let done = Rc::new(RefCell::new(false));
    let done_for_b = done.clone();
    reactor.coro().run(async move {
        coro::sleep(Duration::from_millis(30)).await;
        *done_for_b.borrow_mut() = true;
    });

    drive_until(&mut reactor, || *done.borrow(), Duration::from_secs(2));
    assert!(*done.borrow(), "sleeping coroutine should complete despite sibling panic");

    // The reactor must still be usable afterward.
    let more = Rc::new(RefCell::new(false));
    let more_for_c = more.clone();
    reactor.coro().run(async move {
        *more_for_c.borrow_mut() = true;
    });
    reactor.process(Some(Duration::from_millis(10))).unwrap();
    assert!(*more.borrow(), "reactor should keep servicing new coroutines after a panic");
}
