//! End-to-end scenarios over the in-process loopback provider: two plugin
//! instances on one host exchanging tagged messages and RMA transfers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use na_ofi::{
    AccessMode, Class, Completion, CompletionInfo, CompletionQueue, Config, Context, Error,
};
use ofi::loopback::Loopback;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let env_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .from_env_lossy();
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

fn noop() -> na_ofi::Callback {
    Box::new(|_| {})
}

/// One plugin instance bound to an ephemeral port in the given domain.
fn instance(domain: &str) -> (Class, Context, CompletionQueue) {
    instance_on(Loopback::new(), domain, 1)
}

fn instance_on(
    interface: Arc<Loopback>,
    domain: &str,
    max_contexts: u8,
) -> (Class, Context, CompletionQueue) {
    init_tracing();
    let interface: Arc<dyn ofi::Interface> = interface;
    let class = Class::initialize(
        interface,
        "sockets",
        Config {
            host: Some(format!("{domain}/127.0.0.1:0")),
            max_contexts,
            ..Config::default()
        },
    )
    .unwrap();
    let completions = CompletionQueue::new();
    let context = class.context_create(0, completions.clone()).unwrap();
    (class, context, completions)
}

/// Drive progress in 10 ms slices until `want` completions are queued.
fn progress_until(context: &Context, queue: &CompletionQueue, want: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while queue.len() < want {
        match context.progress(10) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(err) => panic!("progress failed: {err}"),
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {want} completions"
        );
    }
}

#[test]
fn unexpected_tag_echo() {
    let (a, a_ctx, a_q) = instance("echo");
    let (b, b_ctx, b_q) = instance("echo");
    let a_uri = a.addr_to_string(&a.addr_self()).unwrap();
    let b_uri = b.addr_to_string(&b.addr_self()).unwrap();
    assert!(a.addr_is_self(&a.addr_self()));

    // A waits for any unexpected message.
    let recv_op = a.op_create();
    let mut recv_buf = a.msg_buf_alloc(a.msg_get_max_unexpected_size()).unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let fired_in_cb = fired.clone();
    a_ctx
        .msg_recv_unexpected(
            &recv_op,
            Box::new(move |completion: &Completion| {
                assert!(completion.result().is_ok());
                fired_in_cb.store(true, Ordering::SeqCst);
            }),
            &mut recv_buf,
        )
        .unwrap();

    // B sends four payload bytes with tag 0x2A.
    let addr_a = b.addr_lookup2(&a_uri).unwrap();
    assert!(!b.addr_is_self(&addr_a));
    let header = b.msg_get_unexpected_header_size();
    assert_eq!(header, 8);
    let mut send_buf = b.msg_buf_alloc(header + 4).unwrap();
    b.msg_init_unexpected(&mut send_buf).unwrap();
    send_buf[header..header + 4].copy_from_slice(&[0x01, 0x02, 0x03, 0x04]);
    let send_op = b.op_create();
    b_ctx
        .msg_send_unexpected(&send_op, noop(), &send_buf, header + 4, &addr_a, 0, 0x2A)
        .unwrap();

    progress_until(&b_ctx, &b_q, 1);
    let send_done = b_q.pop().unwrap();
    assert!(send_done.result().is_ok());
    assert!(matches!(send_done.info(), CompletionInfo::SendUnexpected));

    progress_until(&a_ctx, &a_q, 1);
    let recv_done = a_q.pop().unwrap();
    assert!(recv_done.result().is_ok());
    match recv_done.info() {
        CompletionInfo::RecvUnexpected {
            source,
            tag,
            actual_size,
        } => {
            assert_eq!(*tag, 0x2A);
            assert_eq!(*actual_size, header + 4);
            // The source resolves to B's own address.
            let source = source.as_ref().unwrap();
            assert_eq!(a.addr_to_string(source).unwrap(), b_uri);
        }
        _ => panic!("expected an unexpected-receive completion"),
    }
    assert_eq!(&recv_buf[header..header + 4], &[0x01, 0x02, 0x03, 0x04]);

    recv_done.trigger();
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn expected_and_unexpected_disambiguation() {
    let (a, a_ctx, a_q) = instance("disambig");
    let (b, b_ctx, b_q) = instance("disambig");
    let a_uri = a.addr_to_string(&a.addr_self()).unwrap();
    let b_uri = b.addr_to_string(&b.addr_self()).unwrap();

    // A posts both kinds of receive.
    let unexp_op = a.op_create();
    let mut unexp_buf = a.msg_buf_alloc(512).unwrap();
    a_ctx
        .msg_recv_unexpected(&unexp_op, noop(), &mut unexp_buf)
        .unwrap();

    let addr_b = a.addr_lookup2(&b_uri).unwrap();
    let exp_op = a.op_create();
    let mut exp_buf = a.msg_buf_alloc(512).unwrap();
    a_ctx
        .msg_recv_expected(&exp_op, noop(), &mut exp_buf, &addr_b, 0, 0xFF)
        .unwrap();

    // B sends unexpected tag 0, then expected tag 0xFF.
    let addr_a = b.addr_lookup2(&a_uri).unwrap();
    let header = b.msg_get_unexpected_header_size();
    let mut unexp_send = b.msg_buf_alloc(header + 2).unwrap();
    b.msg_init_unexpected(&mut unexp_send).unwrap();
    unexp_send[header..header + 2].copy_from_slice(&[0xAB, 0xCD]);
    let send1 = b.op_create();
    b_ctx
        .msg_send_unexpected(&send1, noop(), &unexp_send, header + 2, &addr_a, 0, 0x00)
        .unwrap();

    let mut exp_send = b.msg_buf_alloc(4).unwrap();
    exp_send[..4].copy_from_slice(&[9, 8, 7, 6]);
    let send2 = b.op_create();
    b_ctx
        .msg_send_expected(&send2, noop(), &exp_send, 4, &addr_a, 0, 0xFF)
        .unwrap();

    progress_until(&b_ctx, &b_q, 2);
    progress_until(&a_ctx, &a_q, 2);

    let mut saw_unexpected = false;
    let mut saw_expected = false;
    while let Some(completion) = a_q.pop() {
        assert!(completion.result().is_ok());
        match completion.info() {
            CompletionInfo::RecvUnexpected {
                tag, actual_size, ..
            } => {
                assert_eq!(*tag, 0x00);
                assert_eq!(*actual_size, header + 2);
                assert_eq!(&unexp_buf[header..header + 2], &[0xAB, 0xCD]);
                saw_unexpected = true;
            }
            CompletionInfo::RecvExpected { actual_size } => {
                assert_eq!(*actual_size, 4);
                assert_eq!(&exp_buf[..4], &[9, 8, 7, 6]);
                saw_expected = true;
            }
            _ => panic!("unexpected completion type on receiver"),
        }
    }
    assert!(saw_unexpected && saw_expected);
}

#[test]
fn address_reuse_and_removal() {
    init_tracing();
    let loopback = Loopback::new();
    let interface: Arc<dyn ofi::Interface> = loopback.clone();
    let class = Class::initialize(
        interface,
        "sockets",
        Config {
            host: Some("reuse/127.0.0.1:0".to_string()),
            ..Config::default()
        },
    )
    .unwrap();

    let inserts = loopback.av_inserts();
    let first = class.addr_lookup2("sockets://127.0.0.1:4000").unwrap();
    let second = class.addr_lookup2("sockets://127.0.0.1:4000").unwrap();
    assert_eq!(first.handle(), second.handle());
    assert_eq!(loopback.av_inserts() - inserts, 1);

    // Dropping a remove-marked reference evicts the mapping.
    class.addr_set_remove(&second);
    class.addr_free(second);
    assert_eq!(loopback.av_removes(), 1);

    let third = class.addr_lookup2("sockets://127.0.0.1:4000").unwrap();
    assert_eq!(loopback.av_inserts() - inserts, 2);
    drop(third);
    drop(first);
}

#[test]
fn addr_serialize_round_trip() {
    let (class, _ctx, _q) = instance("addrserde");
    let addr = class.addr_lookup2("sockets://127.0.0.1:4222").unwrap();

    let size = class.addr_get_serialize_size(&addr).unwrap();
    assert_eq!(size, 8 + 8);
    let mut buf = vec![0u8; size];
    class.addr_serialize(&mut buf, &addr).unwrap();

    let rebuilt = class.addr_deserialize(&buf).unwrap();
    assert_eq!(rebuilt.handle(), addr.handle());
    assert_eq!(
        class.addr_to_string(&rebuilt).unwrap(),
        "sockets://127.0.0.1:4222"
    );

    // Truncated input is rejected without side effects.
    assert!(matches!(
        class.addr_deserialize(&buf[..4]),
        Err(Error::Overflow)
    ));
}

#[test]
fn rma_put_and_get_visibility() {
    let (a, a_ctx, a_q) = instance("rma-a");
    let (b, _b_ctx, _b_q) = instance("rma-b");
    let b_uri = b.addr_to_string(&b.addr_self()).unwrap();

    let mut local = vec![0xAAu8; 64 * 1024];
    let mut remote = vec![0x00u8; 64 * 1024];

    let local_handle = unsafe {
        a.mem_handle_create(local.as_mut_ptr(), local.len(), AccessMode::ReadWrite)
    }
    .unwrap();
    a.mem_register(&local_handle).unwrap();

    let remote_handle = unsafe {
        b.mem_handle_create(remote.as_mut_ptr(), remote.len(), AccessMode::ReadWrite)
    }
    .unwrap();
    b.mem_register(&remote_handle).unwrap();

    // B publishes its region descriptor; A adopts it.
    let mut descriptor = vec![0u8; b.mem_handle_get_serialize_size(&remote_handle)];
    b.mem_handle_serialize(&mut descriptor, &remote_handle).unwrap();
    let target = a.mem_handle_deserialize(&descriptor).unwrap();

    let addr_b = a.addr_lookup2(&b_uri).unwrap();
    let put_op = a.op_create();
    a_ctx
        .put(
            &put_op,
            noop(),
            &local_handle,
            0,
            &target,
            0,
            local.len() as u64,
            &addr_b,
            0,
        )
        .unwrap();
    progress_until(&a_ctx, &a_q, 1);
    let completion = a_q.pop().unwrap();
    assert!(completion.result().is_ok());
    assert!(matches!(completion.info(), CompletionInfo::Put));

    // Delivery-complete: the remote bytes are visible once the put
    // completion fired.
    assert!(remote.iter().all(|&byte| byte == 0xAA));

    // Read a slice back through a get.
    remote[..4].copy_from_slice(&[1, 2, 3, 4]);
    let mut readback = vec![0u8; 4096];
    let readback_handle = unsafe {
        a.mem_handle_create(readback.as_mut_ptr(), readback.len(), AccessMode::ReadWrite)
    }
    .unwrap();
    a.mem_register(&readback_handle).unwrap();
    let get_op = a.op_create();
    a_ctx
        .get(
            &get_op,
            noop(),
            &readback_handle,
            0,
            &target,
            0,
            4,
            &addr_b,
            0,
        )
        .unwrap();
    progress_until(&a_ctx, &a_q, 1);
    let completion = a_q.pop().unwrap();
    assert!(completion.result().is_ok());
    assert!(matches!(completion.info(), CompletionInfo::Get));
    assert_eq!(&readback[..4], &[1, 2, 3, 4]);

    a.mem_deregister(&readback_handle).unwrap();
    a.mem_deregister(&local_handle).unwrap();
    b.mem_deregister(&remote_handle).unwrap();
}

#[test]
fn scalable_mr_adopts_global_registration() {
    init_tracing();
    // A fabric flavor without the allocated MR-mode bit: every handle
    // aliases its domain's whole-address-space registration.
    let loopback = Loopback::with_scalable_mr();
    let (a, a_ctx, a_q) = instance_on(loopback.clone(), "sclmr-a", 1);
    let (b, _b_ctx, _b_q) = instance_on(loopback, "sclmr-b", 1);
    let b_uri = b.addr_to_string(&b.addr_self()).unwrap();

    let mut local = vec![0x11u8; 4096];
    let mut remote = vec![0u8; 4096];
    let local_handle = unsafe {
        a.mem_handle_create(local.as_mut_ptr(), local.len(), AccessMode::ReadWrite)
    }
    .unwrap();
    a.mem_register(&local_handle).unwrap();
    let remote_handle = unsafe {
        b.mem_handle_create(remote.as_mut_ptr(), remote.len(), AccessMode::ReadWrite)
    }
    .unwrap();
    b.mem_register(&remote_handle).unwrap();

    // Both domains hand out their global key rather than per-handle keys.
    assert_ne!(local_handle.key(), 0);
    assert_eq!(local_handle.key(), remote_handle.key());

    let mut descriptor = vec![0u8; b.mem_handle_get_serialize_size(&remote_handle)];
    b.mem_handle_serialize(&mut descriptor, &remote_handle).unwrap();
    let target = a.mem_handle_deserialize(&descriptor).unwrap();

    let addr_b = a.addr_lookup2(&b_uri).unwrap();
    let op = a.op_create();
    a_ctx
        .put(
            &op,
            noop(),
            &local_handle,
            0,
            &target,
            0,
            local.len() as u64,
            &addr_b,
            0,
        )
        .unwrap();
    progress_until(&a_ctx, &a_q, 1);
    assert!(a_q.pop().unwrap().result().is_ok());
    assert!(remote.iter().all(|&byte| byte == 0x11));

    // Deregistering drops only the handle's alias; the global
    // registration stays usable for later handles.
    a.mem_deregister(&local_handle).unwrap();
    b.mem_deregister(&remote_handle).unwrap();
    let again = unsafe {
        b.mem_handle_create(remote.as_mut_ptr(), remote.len(), AccessMode::ReadOnly)
    }
    .unwrap();
    b.mem_register(&again).unwrap();
    assert_eq!(again.key(), local_handle.key());
}

#[test]
fn expected_recv_ignores_other_tags() {
    let (a, a_ctx, a_q) = instance("tagiso");
    let (b, b_ctx, b_q) = instance("tagiso");
    let a_uri = a.addr_to_string(&a.addr_self()).unwrap();
    let b_uri = b.addr_to_string(&b.addr_self()).unwrap();

    let addr_b = a.addr_lookup2(&b_uri).unwrap();
    let op = a.op_create();
    let mut buf = a.msg_buf_alloc(256).unwrap();
    a_ctx
        .msg_recv_expected(&op, noop(), &mut buf, &addr_b, 0, 5)
        .unwrap();

    // A send with a different tag must not complete the receive.
    let addr_a = b.addr_lookup2(&a_uri).unwrap();
    let mut send_buf = b.msg_buf_alloc(8).unwrap();
    send_buf[..2].copy_from_slice(&[1, 2]);
    let send_op = b.op_create();
    b_ctx
        .msg_send_expected(&send_op, noop(), &send_buf, 2, &addr_a, 0, 6)
        .unwrap();
    progress_until(&b_ctx, &b_q, 1);

    assert!(matches!(a_ctx.progress(50), Err(Error::Timeout)));
    assert!(a_q.is_empty());

    // The receive stays cancellable.
    a_ctx.cancel(&op).unwrap();
    let _ = a_ctx.progress(50);
    let completion = a_q.pop().unwrap();
    assert!(matches!(completion.result(), Err(Error::Canceled)));
    assert!(matches!(
        completion.info(),
        CompletionInfo::RecvExpected { .. }
    ));
}

#[test]
fn cancel_in_flight_receive() {
    let (class, context, queue) = instance("cancel");

    let op = class.op_create();
    let mut buf = class.msg_buf_alloc(1024).unwrap();
    context.msg_recv_unexpected(&op, noop(), &mut buf).unwrap();

    context.cancel(&op).unwrap();

    // The canceled completion surfaces within the timeout; the tick
    // itself reports no regular events.
    match context.progress(100) {
        Ok(()) | Err(Error::Timeout) => {}
        Err(err) => panic!("progress failed: {err}"),
    }
    let completion = queue.pop().unwrap();
    assert!(matches!(completion.result(), Err(Error::Canceled)));
    match completion.info() {
        CompletionInfo::RecvUnexpected { source, .. } => assert!(source.is_none()),
        _ => panic!("expected a canceled unexpected receive"),
    }

    // Nothing further arrives.
    assert!(matches!(context.progress(20), Err(Error::Timeout)));
    assert!(queue.is_empty());

    // Cancel is idempotent on completed and never-posted ops.
    context.cancel(&op).unwrap();
    let untouched = class.op_create();
    context.cancel(&untouched).unwrap();
    assert!(untouched.is_completed());

    class.finalize().unwrap();
}

#[test]
fn concurrent_lookups_deduplicate() {
    init_tracing();
    let loopback = Loopback::new();
    let interface: Arc<dyn ofi::Interface> = loopback.clone();
    let class = Class::initialize(
        interface,
        "sockets",
        Config {
            host: Some("race/127.0.0.1:0".to_string()),
            ..Config::default()
        },
    )
    .unwrap();

    let inserts = loopback.av_inserts();
    let removes = loopback.av_removes();

    let mut workers = Vec::new();
    for _ in 0..4 {
        let class = class.clone();
        workers.push(std::thread::spawn(move || {
            class
                .addr_lookup2("sockets://127.0.0.1:4100")
                .unwrap()
                .handle()
        }));
    }
    let handles: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    // All threads observe the same fabric address, and the cache nets
    // out to exactly one live AV entry.
    assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
    let net = (loopback.av_inserts() - inserts) - (loopback.av_removes() - removes);
    assert_eq!(net, 1);
}

#[test]
fn source_learned_from_error_completions() {
    init_tracing();
    // One fabric flavor that reports unknown senders through
    // address-not-available error entries.
    let loopback = Loopback::with_source_error();
    let (a, a_ctx, a_q) = instance_on(loopback.clone(), "srcerr", 1);
    let (b, b_ctx, b_q) = instance_on(loopback, "srcerr", 1);
    let a_uri = a.addr_to_string(&a.addr_self()).unwrap();
    let b_uri = b.addr_to_string(&b.addr_self()).unwrap();

    let recv_op = a.op_create();
    let mut recv_buf = a.msg_buf_alloc(256).unwrap();
    a_ctx
        .msg_recv_unexpected(&recv_op, noop(), &mut recv_buf)
        .unwrap();

    let addr_a = b.addr_lookup2(&a_uri).unwrap();
    let header = b.msg_get_unexpected_header_size();
    let mut send_buf = b.msg_buf_alloc(header + 1).unwrap();
    b.msg_init_unexpected(&mut send_buf).unwrap();
    send_buf[header] = 0x5A;
    let send_op = b.op_create();
    b_ctx
        .msg_send_unexpected(&send_op, noop(), &send_buf, header + 1, &addr_a, 0, 3)
        .unwrap();
    progress_until(&b_ctx, &b_q, 1);

    progress_until(&a_ctx, &a_q, 1);
    let completion = a_q.pop().unwrap();
    assert!(completion.result().is_ok());
    match completion.info() {
        CompletionInfo::RecvUnexpected { source, tag, .. } => {
            assert_eq!(*tag, 3);
            // The sender was learned from the error entry's address data.
            let source = source.as_ref().unwrap();
            assert_eq!(a.addr_to_string(source).unwrap(), b_uri);
        }
        _ => panic!("expected an unexpected-receive completion"),
    }
}

#[test]
fn scalable_contexts_route_by_index() {
    init_tracing();
    let loopback = Loopback::new();
    let (a, a_ctx0, a_q0) = instance_on(loopback.clone(), "sep", 2);
    let a_ctx1_q = CompletionQueue::new();
    let a_ctx1 = a.context_create(1, a_ctx1_q.clone()).unwrap();
    let (b, b_ctx, b_q) = instance_on(loopback, "sep", 1);
    let a_uri = a.addr_to_string(&a.addr_self()).unwrap();

    // Context indices are bounded by max_contexts.
    assert!(matches!(
        a.context_create(2, CompletionQueue::new()),
        Err(Error::OpNotSupported)
    ));

    let recv_op = a.op_create();
    let mut recv_buf = a.msg_buf_alloc(128).unwrap();
    a_ctx1
        .msg_recv_unexpected(&recv_op, noop(), &mut recv_buf)
        .unwrap();

    let addr_a = b.addr_lookup2(&a_uri).unwrap();
    let header = b.msg_get_unexpected_header_size();
    let mut send_buf = b.msg_buf_alloc(header + 1).unwrap();
    b.msg_init_unexpected(&mut send_buf).unwrap();
    send_buf[header] = 0x77;
    let send_op = b.op_create();
    b_ctx
        .msg_send_unexpected(&send_op, noop(), &send_buf, header + 1, &addr_a, 1, 5)
        .unwrap();
    progress_until(&b_ctx, &b_q, 1);

    // The message lands on context 1, not context 0.
    progress_until(&a_ctx1, &a_ctx1_q, 1);
    let completion = a_ctx1_q.pop().unwrap();
    assert!(completion.result().is_ok());
    assert!(matches!(
        completion.info(),
        CompletionInfo::RecvUnexpected { .. }
    ));
    assert!(matches!(a_ctx0.progress(0), Err(Error::Timeout)));
    assert!(a_q0.is_empty());

    a_ctx1.destroy().unwrap();
}

#[test]
fn message_size_bounds() {
    let (class, context, _queue) = instance("bounds");

    // Requests above the block size never reach the fabric.
    assert!(matches!(
        class.msg_buf_alloc(class.msg_get_max_unexpected_size() + 1),
        Err(Error::MsgSize)
    ));

    let dest = class.addr_lookup2("sockets://127.0.0.1:4300").unwrap();
    let buf = class.msg_buf_alloc(64).unwrap();
    let op = class.op_create();
    let oversize = class.msg_get_max_unexpected_size() + 1;
    assert!(matches!(
        context.msg_send_unexpected(&op, noop(), &buf, oversize, &dest, 0, 1),
        Err(Error::MsgSize)
    ));
    // The failed post left the op reusable.
    assert!(op.is_completed());

    // Zero-timeout progress never blocks.
    let started = Instant::now();
    assert!(matches!(context.progress(0), Err(Error::Timeout)));
    assert!(started.elapsed() < Duration::from_millis(100));
}
