/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # A concrete `tokio` event-loop adapter
//!
//! §9 notes that each event-loop integration is "a trivial adapter
//! implementing a four-method capability"; this module is the one concrete
//! instance this crate ships, since `tokio` is the ecosystem's default
//! reactor (the other integrations the reference implementation carries —
//! `libevent`, `libev`, `libuv` — are each a separate, optional file there
//! too). [`TokioConnection`] wraps [`crate::driver::AsyncDriver`] behind
//! `async fn`s so an embedder that just wants a future, rather than raw
//! readiness callbacks, never has to touch [`crate::driver::EventLoopAdapter`]
//! directly.
//!
//! [`TokioConnection`] is `!Send` (it holds `Rc<RefCell<_>>`, per §5's
//! single-threaded core) and its background task is spawned with
//! [`tokio::task::spawn_local`]; callers must run it inside a
//! [`tokio::task::LocalSet`].

use crate::config::{ConnectOptions, Endpoint};
use crate::driver::{AsyncDriver, DriverOptions, EventLoopAdapter, NonBlockingTransport};
use crate::error::{Error, Result};
use crate::reply::Reply;
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Notify};

enum Socket {
    Tcp(Rc<TcpStream>),
    #[cfg(unix)]
    Unix(Rc<UnixStream>),
}

impl Socket {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.try_read(buf),
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_write(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.try_write(buf),
        }
    }

    async fn ready(&self, interest: Interest) -> io::Result<tokio::io::Ready> {
        match self {
            Socket::Tcp(s) => s.ready(interest).await,
            #[cfg(unix)]
            Socket::Unix(s) => s.ready(interest).await,
        }
    }

    fn shutdown(&self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = match self {
                Socket::Tcp(s) => s.as_raw_fd(),
                Socket::Unix(s) => s.as_raw_fd(),
            };
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        }
    }
}

/// [`NonBlockingTransport`] backed by a `tokio` socket. `poll_connect`
/// always reports success immediately: unlike the raw non-blocking-BSD-socket
/// path §4.6 describes (where `connect()` returns in-progress and completion
/// is detected on the first writable event), `tokio::net::TcpStream::connect`
/// is itself an `async fn` that only resolves once the three-way handshake
/// has finished, so by the time a [`TokioTransport`] exists the connection is
/// already up.
pub struct TokioTransport {
    socket: Socket,
}

impl NonBlockingTransport for TokioTransport {
    fn poll_connect(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.socket.try_read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        match self.socket.try_write(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn shutdown(&mut self) {
        self.socket.shutdown();
    }
}

/// What the driver currently wants the background task to wait for (§4.6
/// "Adapter capability set"), plus an optional one-shot command-timeout
/// deadline (§4.6 `schedule_timer`).
#[derive(Default)]
struct Interests {
    read: Cell<bool>,
    write: Cell<bool>,
    timer: Cell<Option<Duration>>,
}

/// [`EventLoopAdapter`] that just flips flags the background `drive` task
/// polls; the task itself owns the actual `tokio::io::Interest` wait.
pub struct TokioAdapter {
    interests: Rc<Interests>,
    notify: Rc<Notify>,
}

impl EventLoopAdapter for TokioAdapter {
    fn add_read(&mut self) {
        self.interests.read.set(true);
        self.notify.notify_one();
    }
    fn del_read(&mut self) {
        self.interests.read.set(false);
    }
    fn add_write(&mut self) {
        self.interests.write.set(true);
        self.notify.notify_one();
    }
    fn del_write(&mut self) {
        self.interests.write.set(false);
    }
    fn cleanup(&mut self) {
        self.interests.read.set(false);
        self.interests.write.set(false);
        self.interests.timer.set(None);
    }
    fn schedule_timer(&mut self, after: Duration) {
        self.interests.timer.set(Some(after));
        self.notify.notify_one();
    }
}

/// The concrete [`AsyncDriver`] instantiation this adapter drives.
pub type Driver = AsyncDriver<TokioTransport, TokioAdapter>;

/// An `async fn`-shaped connection: the event-loop-agnostic driver of §4.6,
/// pre-wired to a `tokio` reactor. Not `Send` — confine it to one task and
/// run that task inside a [`tokio::task::LocalSet`].
pub struct TokioConnection {
    driver: Rc<RefCell<Driver>>,
    task: tokio::task::JoinHandle<()>,
}

impl TokioConnection {
    /// Connect and start the background read/write-readiness loop. Must be
    /// called from within a [`tokio::task::LocalSet`] (the loop is spawned
    /// with [`tokio::task::spawn_local`] since [`Driver`] is `!Send`).
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let socket = match &options.endpoint {
            Endpoint::Tcp { ip, port, .. } => {
                let stream = TcpStream::connect((ip.as_str(), *port))
                    .await
                    .map_err(Error::from)?;
                stream.set_nodelay(true).map_err(Error::from)?;
                Socket::Tcp(Rc::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = UnixStream::connect(path).await.map_err(Error::from)?;
                Socket::Unix(Rc::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => {
                return Err(Error::other("unix sockets are not supported on this platform"))
            }
            Endpoint::Fd(_) => {
                return Err(Error::other(
                    "adopting a raw descriptor is not yet implemented for the tokio adapter",
                ))
            }
        };

        let interests = Rc::new(Interests::default());
        let notify = Rc::new(Notify::new());
        let adapter = TokioAdapter {
            interests: interests.clone(),
            notify: notify.clone(),
        };
        let transport = TokioTransport {
            socket: clone_socket(&socket),
        };
        let driver_options = DriverOptions {
            command_timeout: options.command_timeout,
            noautofree: options.noautofree,
        };
        let driver = Rc::new(RefCell::new(AsyncDriver::new(
            transport,
            adapter,
            driver_options,
        )));
        let task = tokio::task::spawn_local(drive(driver.clone(), socket, interests, notify));
        Ok(Self { driver, task })
    }

    pub fn set_on_connect(&self, cb: impl FnMut(Result<()>) + 'static) {
        self.driver.borrow_mut().set_on_connect(cb);
    }

    pub fn set_on_disconnect(&self, cb: impl FnMut(Result<()>) + 'static) {
        self.driver.borrow_mut().set_on_disconnect(cb);
    }

    pub fn set_push_callback(&self, cb: impl FnMut(Reply) + 'static) {
        self.driver.borrow_mut().set_push_callback(cb);
    }

    pub fn is_connected(&self) -> bool {
        self.driver.borrow().is_connected()
    }

    /// Submit a single-reply command and await its reply as a future. Not
    /// meant for the subscribe/monitor families, which invoke their callback
    /// more than once — use [`crate::driver::AsyncDriver::submit`] via
    /// [`TokioConnection::driver`] directly for those.
    pub async fn command<I, A>(&self, args: I) -> Result<Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Rc::new(RefCell::new(Some(tx)));
        self.driver.borrow_mut().submit(args, move |reply| {
            if let Some(tx) = tx.borrow_mut().take() {
                let _ = tx.send(reply);
            }
        })?;
        rx.await
            .map_err(|_| Error::other("connection torn down before the reply arrived"))
    }

    /// Borrow the underlying driver directly, for callers that need
    /// subscribe/monitor semantics or raw callback-based submission.
    pub fn driver(&self) -> &Rc<RefCell<Driver>> {
        &self.driver
    }

    pub fn disconnect(&self) {
        self.driver.borrow_mut().disconnect();
    }

    pub fn free(self) {
        self.driver.borrow_mut().free();
        self.task.abort();
    }
}

fn clone_socket(socket: &Socket) -> Socket {
    match socket {
        Socket::Tcp(s) => Socket::Tcp(s.clone()),
        #[cfg(unix)]
        Socket::Unix(s) => Socket::Unix(s.clone()),
    }
}

/// The background readiness loop: translates `tokio::io::Interest` waits
/// into the three `AsyncDriver::handle_*` calls (§4.6).
async fn drive(driver: Rc<RefCell<Driver>>, socket: Socket, interests: Rc<Interests>, notify: Rc<Notify>) {
    loop {
        if driver.borrow().is_freeing() && !driver.borrow().is_connected() {
            return;
        }
        let want_read = interests.read.get();
        let want_write = interests.write.get();
        let timer = interests.timer.get();

        if !want_read && !want_write {
            if let Some(dur) = timer {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(dur) => {
                        interests.timer.set(None);
                        driver.borrow_mut().handle_timeout();
                    }
                }
            } else {
                notify.notified().await;
            }
            continue;
        }

        let interest = match (want_read, want_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => unreachable!("checked above"),
        };
        let ready = match timer {
            Some(dur) => tokio::select! {
                r = socket.ready(interest) => r,
                _ = tokio::time::sleep(dur) => {
                    interests.timer.set(None);
                    driver.borrow_mut().handle_timeout();
                    continue;
                }
            },
            None => socket.ready(interest).await,
        };
        match ready {
            Ok(ev) => {
                let mut d = driver.borrow_mut();
                if ev.is_readable() {
                    d.handle_readable();
                }
                if ev.is_writable() {
                    d.handle_writable();
                }
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectOptions;
    use std::io::Write as _;
    use std::net::TcpListener;
    use tokio::task::LocalSet;

    #[test]
    fn command_round_trip_over_a_real_tokio_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"+PONG\r\n").unwrap();
            // keep the socket open until the client is done with it
            std::thread::sleep(Duration::from_millis(200));
        });

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = LocalSet::new();
        local.block_on(&rt, async move {
            let conn = TokioConnection::connect(ConnectOptions::tcp(
                addr.ip().to_string(),
                addr.port(),
            ))
            .await
            .unwrap();
            let reply = conn.command(["PING"]).await.unwrap();
            assert_eq!(reply, Reply::Status(bytes::Bytes::from_static(b"PONG")));
        });
        server.join().unwrap();
    }
}
