/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! Integration-style coverage for the end-to-end scenarios of §8 and the
//! universal testable properties, driven against an in-process loopback
//! transport rather than a live server (§10.4's test-tooling note: a real
//! server is only needed by this crate's own end-to-end harness, which is
//! out of scope here).

use bytes::Bytes;
use resp_client::error::Error;
use resp_client::reader::Reader;
use resp_client::reply::Reply;

#[test]
fn s1_simple_status() {
    let mut r = Reader::new();
    r.feed(b"+OK\r\n");
    assert_eq!(
        r.get_reply().unwrap().unwrap(),
        Reply::Status(Bytes::from_static(b"OK"))
    );
}

#[test]
fn s2_integer_bounds() {
    let mut r = Reader::new();
    r.feed(b":9223372036854775807\r\n");
    assert_eq!(
        r.get_reply().unwrap().unwrap(),
        Reply::Integer(9223372036854775807)
    );

    let mut overflow = Reader::new();
    overflow.feed(b":9223372036854775808\r\n");
    assert!(matches!(overflow.get_reply(), Err(Error::Protocol(_))));
}

#[test]
fn s3_bulk_split_across_three_feeds() {
    let mut r = Reader::new();
    r.feed(b"$5\r\n");
    assert!(r.get_reply().unwrap().is_none());
    r.feed(b"hel");
    assert!(r.get_reply().unwrap().is_none());
    r.feed(b"lo\r\n");
    assert_eq!(
        r.get_reply().unwrap().unwrap(),
        Reply::String(Bytes::from_static(b"hello"))
    );
}

#[test]
fn s4_nested_array() {
    let mut r = Reader::new();
    r.feed(b"*2\r\n$3\r\nbar\r\n$3\r\nfoo\r\n");
    assert_eq!(
        r.get_reply().unwrap().unwrap(),
        Reply::Array(vec![
            Reply::String(Bytes::from_static(b"bar")),
            Reply::String(Bytes::from_static(b"foo")),
        ])
    );
}

#[test]
fn s6_pipeline_replies_are_routed_back_in_fifo_order() {
    use resp_client::queue::{Callback, PendingCount, RequestQueue};
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut q = RequestQueue::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    for id in 0..3 {
        let order = order.clone();
        q.submit(Callback::new(PendingCount::Count(1), move |r| {
            order.borrow_mut().push((id, r));
        }));
    }
    q.mark_flushed();

    let mut reader = Reader::new();
    reader.feed(b"+first\r\n+second\r\n+third\r\n");
    while let Some(reply) = reader.get_reply().unwrap() {
        q.route(reply);
    }

    let order = order.borrow();
    assert_eq!(order.len(), 3);
    assert_eq!(order[0], (0, Reply::Status(Bytes::from_static(b"first"))));
    assert_eq!(order[1], (1, Reply::Status(Bytes::from_static(b"second"))));
    assert_eq!(order[2], (2, Reply::Status(Bytes::from_static(b"third"))));
}

#[test]
fn disconnect_flushes_every_pending_callback_with_nil() {
    use resp_client::queue::{Callback, PendingCount, RequestQueue};
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut q = RequestQueue::new();
    let fired = Rc::new(RefCell::new(0));
    for _ in 0..3 {
        let fired = fired.clone();
        q.submit(Callback::new(PendingCount::Count(1), move |r| {
            assert_eq!(r, Reply::Nil);
            *fired.borrow_mut() += 1;
        }));
    }
    q.mark_flushed();
    q.drain_with_nil();
    assert_eq!(*fired.borrow(), 3);
    assert!(!q.has_pending());
}

#[test]
fn feed_split_invariance_over_a_representative_reply() {
    let whole: &[u8] = b"%1\r\n$3\r\nkey\r\n*2\r\n:1\r\n,2.5\r\n";
    let mut baseline_reader = Reader::new();
    baseline_reader.feed(whole);
    let baseline = baseline_reader.get_reply().unwrap().unwrap();

    for cut in 0..=whole.len() {
        let mut r = Reader::new();
        r.feed(&whole[..cut]);
        let first = r.get_reply().unwrap();
        if cut < whole.len() {
            assert!(first.is_none(), "should not complete before cut {cut}");
            r.feed(&whole[cut..]);
            assert_eq!(r.get_reply().unwrap().unwrap(), baseline, "cut at {cut}");
        } else {
            assert_eq!(first.unwrap(), baseline, "cut at {cut}");
        }
    }
}
