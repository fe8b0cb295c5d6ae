/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # The request queue (async)
//!
//! Associates outbound requests with their eventual replies while
//! preserving FIFO order (§4.5). Single-threaded by design — the core
//! never crosses a thread boundary on its own (§5) — so callbacks are
//! reference counted with a plain `Rc<RefCell<_>>`, the way the store's
//! connection-handler state is held by a single task rather than shared
//! across an `Arc`/`Mutex` pair.

use crate::reply::Reply;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// How many replies a submitted command still expects, or one of the three
/// sentinel modes (§3 "Request Callback").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCount {
    Count(usize),
    UnsubscribeAll,
    Monitor,
    Reset,
}

/// A user-supplied reply handler plus its bookkeeping. Held by `Rc<RefCell<_>>`
/// so the FIFO, the subscription tables, and the monitor slot can all retain
/// a reference to the same callback without duplicating its state (§4.6
/// "reference counting for callbacks").
pub struct Callback {
    pub pending: PendingCount,
    handler: Box<dyn FnMut(Reply)>,
    finalizer: Option<Box<dyn FnOnce()>>,
}

impl Callback {
    pub fn new(pending: PendingCount, handler: impl FnMut(Reply) + 'static) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            pending,
            handler: Box::new(handler),
            finalizer: None,
        }))
    }

    pub fn with_finalizer(
        pending: PendingCount,
        handler: impl FnMut(Reply) + 'static,
        finalizer: impl FnOnce() + 'static,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            pending,
            handler: Box::new(handler),
            finalizer: Some(Box::new(finalizer)),
        }))
    }

    pub fn invoke(&mut self, reply: Reply) {
        (self.handler)(reply);
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if let Some(f) = self.finalizer.take() {
            f();
        }
    }
}

type CallbackRef = Rc<RefCell<Callback>>;

/// The three pubsub-family commands the grammar in §4.5 cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFamily {
    Channel,
    Pattern,
    Shard,
}

/// Classify a command for queueing purposes (§4.5 "Classification on send").
/// `cmd` is the command name (case-insensitively matched, like the wire
/// protocol's own command dispatch) and `argv` is everything after it.
pub fn classify(cmd: &str, argv: &[impl AsRef<[u8]>]) -> PendingCount {
    match cmd.to_ascii_uppercase().as_str() {
        "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE" => PendingCount::Count(argv.len().max(1)),
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "SUNSUBSCRIBE" => {
            if argv.is_empty() {
                PendingCount::UnsubscribeAll
            } else {
                PendingCount::Count(argv.len())
            }
        }
        "MONITOR" => PendingCount::Monitor,
        "RESET" => PendingCount::Reset,
        _ => PendingCount::Count(1),
    }
}

/// The three ordered sub-queues of §4.5, plus the subscription tables and
/// monitor/subscribed-mode bookkeeping.
#[derive(Default)]
pub struct RequestQueue {
    to_write: VecDeque<CallbackRef>,
    wait_write: VecDeque<CallbackRef>,
    wait_read: VecDeque<CallbackRef>,
    channels: HashMap<Vec<u8>, CallbackRef>,
    patterns: HashMap<Vec<u8>, CallbackRef>,
    shard_channels: HashMap<Vec<u8>, CallbackRef>,
    monitor: Option<CallbackRef>,
    monitoring: bool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a freshly submitted command's callback (§4.5).
    pub fn submit(&mut self, cb: CallbackRef) {
        self.to_write.push_back(cb);
    }

    /// Mark everything currently in `to_write` as flushed onto the wire
    /// (moves it into `wait_read`, since this crate always writes a command
    /// fully before returning rather than modeling a partial-write
    /// `wait_write` stage at the queue level — partial writes are instead
    /// retried entirely by the transport/driver, keeping this invariant
    /// simple: `to_write` and `wait_write` are logically one stage here).
    pub fn mark_flushed(&mut self) {
        while let Some(cb) = self.to_write.pop_front() {
            self.wait_read.push_back(cb);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        !self.channels.is_empty() || !self.patterns.is_empty() || !self.shard_channels.is_empty()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    /// Route one reply per §4.5's eight-rule dispatch order. Returns `true`
    /// if the reply was consumed as an out-of-band / pubsub reply (FIFO
    /// untouched), `false` if it was routed through the ordinary FIFO path.
    pub fn route(&mut self, reply: Reply) -> bool {
        if let Some(kind) = pubsub_kind(&reply) {
            self.route_pubsub(kind, reply);
            return true;
        }
        if let Reply::Push(_) = &reply {
            // an out-of-band push that didn't match the pubsub grammar;
            // the caller's push callback (outside this queue) handles it.
            return true;
        }
        if self.monitoring && is_monitor_line(&reply) {
            if let Some(cb) = &self.monitor {
                cb.borrow_mut().invoke(reply);
            }
            return true;
        }
        self.route_fifo_head(reply);
        false
    }

    fn route_fifo_head(&mut self, reply: Reply) {
        let Some(cb) = self.wait_read.pop_front() else {
            return;
        };
        let is_reset_ack = matches!(cb.borrow().pending, PendingCount::Reset)
            && matches!(&reply, Reply::Status(s) if s.as_ref() == b"RESET");
        let is_monitor_ack =
            matches!(cb.borrow().pending, PendingCount::Monitor) && is_ok_status(&reply);
        if is_reset_ack {
            self.reset();
        }
        if is_monitor_ack {
            self.monitoring = true;
            self.monitor = Some(cb.clone());
        }
        cb.borrow_mut().invoke(reply);
        let done = {
            let mut b = cb.borrow_mut();
            b.pending = decrement(b.pending);
            is_done(b.pending)
        };
        if !done {
            self.wait_read.push_front(cb);
        }
    }

    fn route_pubsub(&mut self, kind: PubsubKind, reply: Reply) {
        let Some(children) = reply.as_children() else {
            return;
        };
        let name = children.get(1).and_then(Reply::as_bytes).map(|b| b.to_vec());
        match kind {
            PubsubKind::Message => {
                if let Some(name) = name {
                    if let Some(cb) = self.channels.get(&name) {
                        cb.borrow_mut().invoke(reply);
                    }
                }
            }
            PubsubKind::PMessage => {
                let pattern = children.first().and_then(Reply::as_bytes).map(|b| b.to_vec());
                if let Some(pattern) = pattern {
                    if let Some(cb) = self.patterns.get(&pattern) {
                        cb.borrow_mut().invoke(reply);
                    }
                }
            }
            PubsubKind::SMessage => {
                if let Some(name) = name {
                    if let Some(cb) = self.shard_channels.get(&name) {
                        cb.borrow_mut().invoke(reply);
                    }
                }
            }
            PubsubKind::Subscribe(table) => {
                let Some(cb) = self.wait_read.front().cloned() else {
                    return;
                };
                if let Some(name) = name {
                    self.table_mut(table).insert(name, cb.clone());
                }
                self.finish_one_head_unit();
            }
            PubsubKind::Unsubscribe(table) => {
                let count = children.get(2).and_then(Reply::as_integer).unwrap_or(-1);
                if let Some(name) = &name {
                    if let Some(cb) = self.table_mut(table).remove(name) {
                        cb.borrow_mut().invoke(reply.clone());
                    }
                }
                if let Some(head) = self.wait_read.front() {
                    let is_unsub_all = matches!(head.borrow().pending, PendingCount::UnsubscribeAll);
                    if is_unsub_all && count == 0 {
                        self.wait_read.pop_front();
                        return;
                    }
                }
                self.finish_one_head_unit();
            }
        }
    }

    fn table_mut(&mut self, table: SubscribeFamily) -> &mut HashMap<Vec<u8>, CallbackRef> {
        match table {
            SubscribeFamily::Channel => &mut self.channels,
            SubscribeFamily::Pattern => &mut self.patterns,
            SubscribeFamily::Shard => &mut self.shard_channels,
        }
    }

    fn finish_one_head_unit(&mut self) {
        let Some(cb) = self.wait_read.front().cloned() else {
            return;
        };
        let done = {
            let mut b = cb.borrow_mut();
            b.pending = decrement(b.pending);
            is_done(b.pending)
        };
        if done {
            self.wait_read.pop_front();
        }
    }

    /// Reset logic (§4.5 rule 8 / §4.6 disconnect protocol's teardown
    /// invokes the same finalizer path with a `Nil` reply).
    pub fn reset(&mut self) {
        self.monitoring = false;
        self.monitor = None;
        for (_, cb) in self.channels.drain() {
            cb.borrow_mut().invoke(Reply::Nil);
        }
        for (_, cb) in self.patterns.drain() {
            cb.borrow_mut().invoke(Reply::Nil);
        }
        for (_, cb) in self.shard_channels.drain() {
            cb.borrow_mut().invoke(Reply::Nil);
        }
    }

    /// True if any command is still in flight (queued, partially flushed, or
    /// awaiting its reply). The async driver's idle-timeout check (§4.6 "if
    /// connected and `wait_read` is empty") is phrased against this, not
    /// `wait_read` alone, since a just-submitted command sitting in
    /// `to_write` is just as much "in flight" for timeout purposes.
    pub fn has_pending(&self) -> bool {
        !self.to_write.is_empty() || !self.wait_write.is_empty() || !self.wait_read.is_empty()
    }

    /// Invoke every still-pending callback with `Nil` and clear all queues
    /// (§4.6 teardown: "for every pending callback ... invoke with Nil").
    pub fn drain_with_nil(&mut self) {
        for cb in self
            .to_write
            .drain(..)
            .chain(self.wait_write.drain(..))
            .chain(self.wait_read.drain(..))
        {
            cb.borrow_mut().invoke(Reply::Nil);
        }
        self.reset();
    }
}

fn decrement(pending: PendingCount) -> PendingCount {
    match pending {
        PendingCount::Count(n) => PendingCount::Count(n.saturating_sub(1)),
        // a Reset/Monitor callback's single ack is run through
        // `route_fifo_head`, which pops it off `wait_read` for good — Monitor
        // keeps living on only via the separate reference `self.monitor`
        // holds, never by staying in the FIFO (mirrors the reference
        // implementation unconditionally zeroing `pending_replies` after
        // running a regular/Reset/Monitor reply).
        PendingCount::Reset | PendingCount::Monitor => PendingCount::Count(0),
        other => other,
    }
}

fn is_done(pending: PendingCount) -> bool {
    matches!(pending, PendingCount::Count(0))
}

fn is_ok_status(reply: &Reply) -> bool {
    matches!(reply, Reply::Status(s) if s.as_ref() == b"OK")
}

/// Status reply whose first byte is an ASCII digit (§4.6 "monitor-reply
/// heuristic" — monitored commands are timestamped).
fn is_monitor_line(reply: &Reply) -> bool {
    matches!(reply, Reply::Status(s) if s.first().is_some_and(u8::is_ascii_digit))
}

enum PubsubKind {
    Message,
    PMessage,
    SMessage,
    Subscribe(SubscribeFamily),
    Unsubscribe(SubscribeFamily),
}

/// True if `reply` matches the pubsub delivery grammar (§4.5 rule 2): used by
/// the async driver to decide whether an out-of-band `Push` reply belongs to
/// pubsub (routed through [`RequestQueue::route`]) or is a plain server push
/// (routed to the driver's own push callback, bypassing the queue entirely).
pub fn is_pubsub_shaped(reply: &Reply) -> bool {
    pubsub_kind(reply).is_some()
}

/// Classify a reply against the pubsub grammar: a 3- or 4-element
/// array/push whose first element names the pubsub message kind (§4.5
/// rule 2).
fn pubsub_kind(reply: &Reply) -> Option<PubsubKind> {
    let children = reply.as_children()?;
    let head = children.first()?.as_bytes()?;
    match head {
        b"message" if children.len() == 3 => Some(PubsubKind::Message),
        b"pmessage" if children.len() == 4 => Some(PubsubKind::PMessage),
        b"smessage" if children.len() == 3 => Some(PubsubKind::SMessage),
        b"subscribe" if children.len() == 3 => Some(PubsubKind::Subscribe(SubscribeFamily::Channel)),
        b"psubscribe" if children.len() == 3 => Some(PubsubKind::Subscribe(SubscribeFamily::Pattern)),
        b"ssubscribe" if children.len() == 3 => Some(PubsubKind::Subscribe(SubscribeFamily::Shard)),
        b"unsubscribe" if children.len() == 3 => {
            Some(PubsubKind::Unsubscribe(SubscribeFamily::Channel))
        }
        b"punsubscribe" if children.len() == 3 => {
            Some(PubsubKind::Unsubscribe(SubscribeFamily::Pattern))
        }
        b"sunsubscribe" if children.len() == 3 => {
            Some(PubsubKind::Unsubscribe(SubscribeFamily::Shard))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn status(s: &str) -> Reply {
        Reply::Status(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn string(s: &str) -> Reply {
        Reply::String(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn classify_default_and_subscribe_family() {
        assert_eq!(classify("GET", &["k"]), PendingCount::Count(1));
        assert_eq!(
            classify("SUBSCRIBE", &["a", "b", "c"]),
            PendingCount::Count(3)
        );
        assert_eq!(classify("UNSUBSCRIBE", &Vec::<&str>::new()), PendingCount::UnsubscribeAll);
        assert_eq!(classify("MONITOR", &Vec::<&str>::new()), PendingCount::Monitor);
        assert_eq!(classify("RESET", &Vec::<&str>::new()), PendingCount::Reset);
    }

    #[test]
    fn fifo_order_is_preserved_across_several_commands() {
        let mut q = RequestQueue::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            let tag = tag.to_string();
            q.submit(Callback::new(PendingCount::Count(1), move |_| {
                seen.borrow_mut().push(tag.clone());
            }));
        }
        q.mark_flushed();
        q.route(status("OK"));
        q.route(status("OK"));
        q.route(status("OK"));
        assert_eq!(*seen.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn subscribe_reply_installs_channel_callback_and_later_messages_route_to_it() {
        let mut q = RequestQueue::new();
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        q.submit(Callback::new(PendingCount::Count(1), move |r| {
            received2.borrow_mut().push(r);
        }));
        q.mark_flushed();
        let subscribe_ack = Reply::Array(vec![string("subscribe"), string("ch1"), Reply::Integer(1)]);
        assert!(q.route(subscribe_ack));
        assert!(q.is_subscribed());

        let message = Reply::Array(vec![string("message"), string("ch1"), string("hello")]);
        assert!(q.route(message));
        assert_eq!(received.borrow().len(), 2);
    }

    #[test]
    fn unsubscribe_all_completes_only_when_tail_count_hits_zero() {
        let mut q = RequestQueue::new();
        let done = Rc::new(RefCell::new(false));
        let done2 = done.clone();
        q.submit(Callback::new(PendingCount::UnsubscribeAll, move |_| {
            *done2.borrow_mut() = true;
        }));
        q.mark_flushed();
        // subscribe to two channels "out of band" so unsubscribe has entries
        q.channels.insert(b"a".to_vec(), Callback::new(PendingCount::Count(1), |_| {}));
        q.channels.insert(b"b".to_vec(), Callback::new(PendingCount::Count(1), |_| {}));

        let unsub_a = Reply::Array(vec![string("unsubscribe"), string("a"), Reply::Integer(1)]);
        q.route(unsub_a);
        assert!(!*done.borrow());

        let unsub_b = Reply::Array(vec![string("unsubscribe"), string("b"), Reply::Integer(0)]);
        q.route(unsub_b);
        assert!(*done.borrow());
    }

    #[test]
    fn monitor_lines_route_to_monitor_callback_without_touching_fifo() {
        let mut q = RequestQueue::new();
        let lines = Rc::new(RefCell::new(Vec::new()));
        let lines2 = lines.clone();
        q.submit(Callback::new(PendingCount::Monitor, move |r| {
            lines2.borrow_mut().push(r);
        }));
        q.mark_flushed();
        q.route(status("OK"));
        assert!(q.is_monitoring());
        q.route(status("1620000000.000000 [0 127.0.0.1:1234] \"GET\" \"foo\""));
        assert_eq!(lines.borrow().len(), 2);
    }

    #[test]
    fn reset_ack_is_popped_and_does_not_jam_the_next_command() {
        let mut q = RequestQueue::new();
        let reset_fired = Rc::new(RefCell::new(0));
        let reset_fired2 = reset_fired.clone();
        q.submit(Callback::new(PendingCount::Reset, move |_| {
            *reset_fired2.borrow_mut() += 1;
        }));
        let ping_reply = Rc::new(RefCell::new(None));
        let ping_reply2 = ping_reply.clone();
        q.submit(Callback::new(PendingCount::Count(1), move |r| {
            *ping_reply2.borrow_mut() = Some(r);
        }));
        q.mark_flushed();
        q.route(status("RESET"));
        assert_eq!(*reset_fired.borrow(), 1);
        q.route(status("PONG"));
        assert_eq!(*reset_fired.borrow(), 1, "reset callback must not fire again");
        assert_eq!(*ping_reply.borrow(), Some(status("PONG")));
    }

    #[test]
    fn monitor_ack_is_retained_only_via_the_monitor_slot_not_the_fifo() {
        let mut q = RequestQueue::new();
        q.submit(Callback::new(PendingCount::Monitor, |_| {}));
        let ping_reply = Rc::new(RefCell::new(None));
        let ping_reply2 = ping_reply.clone();
        q.submit(Callback::new(PendingCount::Count(1), move |r| {
            *ping_reply2.borrow_mut() = Some(r);
        }));
        q.mark_flushed();
        q.route(status("OK"));
        assert!(q.is_monitoring());
        q.route(status("PONG"));
        assert_eq!(*ping_reply.borrow(), Some(status("PONG")));
    }

    #[test]
    fn reset_clears_subscriptions_with_nil() {
        let mut q = RequestQueue::new();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        q.channels
            .insert(b"a".to_vec(), Callback::new(PendingCount::Count(1), move |r| {
                *got2.borrow_mut() = Some(r);
            }));
        q.reset();
        assert_eq!(*got.borrow(), Some(Reply::Nil));
        assert!(!q.is_subscribed());
    }

    #[test]
    fn drain_with_nil_invokes_every_pending_callback() {
        let mut q = RequestQueue::new();
        let count = Rc::new(RefCell::new(0));
        for _ in 0..3 {
            let count = count.clone();
            q.submit(Callback::new(PendingCount::Count(1), move |_| {
                *count.borrow_mut() += 1;
            }));
        }
        q.drain_with_nil();
        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn has_pending_tracks_all_three_sub_queues() {
        let mut q = RequestQueue::new();
        assert!(!q.has_pending());
        q.submit(Callback::new(PendingCount::Count(1), |_| {}));
        assert!(q.has_pending());
        q.mark_flushed();
        assert!(q.has_pending());
        q.route(status("OK"));
        assert!(!q.has_pending());
    }

    #[test]
    fn is_pubsub_shaped_distinguishes_message_push_from_plain_push() {
        let message = Reply::Push(vec![string("message"), string("ch1"), string("hi")]);
        assert!(is_pubsub_shaped(&message));
        let plain = Reply::Push(vec![string("invalidate"), string("somekey")]);
        assert!(!is_pubsub_shaped(&plain));
    }
}
