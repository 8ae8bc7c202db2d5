//! End-to-end tests over real sockets and real shared memory.
//!
//! The shared scenarios live in localcall-testkit; this file runs them
//! and adds the boundary cases that need direct access to the wire.

use std::time::Duration;

use localcall::{registry, CallerConfig, Endpoint, Error, ServiceCaller};
use localcall_testkit as testkit;

#[tokio::test]
async fn identity_hello() {
    testkit::run_identity_roundtrip(b"hello").await;
}

#[tokio::test]
async fn identity_random_bytes() {
    // A fixed pseudo-random pattern; the content is irrelevant, the
    // fidelity is not.
    let payload: Vec<u8> = (0..100_000u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect();
    testkit::run_identity_roundtrip(&payload).await;
}

#[tokio::test]
async fn reverse_bytes() {
    testkit::run_reverse().await;
}

#[tokio::test]
async fn zero_length_roundtrip() {
    testkit::run_zero_length().await;
}

#[tokio::test]
async fn sequential_calls_use_fresh_connections() {
    testkit::run_sequential_calls().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_64_mib() {
    testkit::run_large_echo(64 << 20).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn grow_reply_1_kib_to_16_mib() {
    testkit::run_grow_reply(1 << 10, 16 << 20).await;
}

#[tokio::test]
async fn reply_just_over_request_capacity_grows() {
    // Exactly one byte past what the request segment can hold.
    testkit::run_grow_reply(16, localcall::MIN_SEGMENT_CAPACITY - 8 + 1).await;
}

#[tokio::test]
async fn failing_handler_surfaces_remote_error() {
    testkit::run_handler_error("boom").await;
}

#[tokio::test]
async fn panicking_handler_surfaces_remote_error() {
    testkit::run_panicking_handler("boom").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_callers_serialize() {
    testkit::run_concurrent_callers().await;
}

#[tokio::test]
async fn call_timeout_fires() {
    testkit::run_call_timeout().await;
}

#[tokio::test]
async fn absent_service_is_not_found() {
    let caller = ServiceCaller::with_config(
        &testkit::unique_service_name("absent"),
        CallerConfig {
            connect_timeout: Duration::from_millis(50),
            call_timeout: None,
        },
    )
    .unwrap();
    assert!(matches!(caller.call(b"x").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn path_separator_name_fails_before_any_socket_exists() {
    assert!(matches!(
        ServiceCaller::new("oops/name"),
        Err(Error::Protocol(_))
    ));
    let endpoint = Endpoint::new().unwrap();
    assert!(matches!(
        endpoint.create_service(
            "oops/name",
            |req: &[u8]| -> Result<Vec<u8>, String> { Ok(req.to_vec()) }
        ),
        Err(Error::Protocol(_))
    ));
}

#[tokio::test]
async fn duplicate_registration_across_endpoints() {
    let name = testkit::unique_service_name("dup");
    let first = Endpoint::new().unwrap();
    first
        .create_service(&name, |req: &[u8]| -> Result<Vec<u8>, String> {
            Ok(req.to_vec())
        })
        .unwrap();

    let second = Endpoint::new().unwrap();
    assert!(matches!(
        second.create_service(&name, |req: &[u8]| -> Result<Vec<u8>, String> {
            Ok(req.to_vec())
        }),
        Err(Error::AddressInUse(_))
    ));
}

#[tokio::test]
async fn server_dying_mid_call_surfaces_transport() {
    use localcall::frame::{self, Frame};

    let name = testkit::unique_service_name("dying");
    let path = registry::socket_path(&name);
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    // A server that reads the REQUEST, says READY, then drops dead
    // before DONE.
    let fake_server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = frame::read_frame(&mut stream).await.unwrap();
        assert!(matches!(request, Frame::Request { .. }));
        frame::write_frame(&mut stream, &Frame::Ready).await.unwrap();
        drop(stream);
    });

    let caller = ServiceCaller::new(&name).unwrap();
    match caller.call(b"doomed").await {
        Err(Error::Transport(_)) => {}
        other => panic!("expected Transport, got {other:?}"),
    }

    fake_server.await.unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(testkit::shm_objects_remaining(&name), 0);
}

#[tokio::test]
async fn garbage_done_frame_is_a_protocol_error() {
    use localcall::frame::{self, Frame};

    let name = testkit::unique_service_name("garbage");
    let path = registry::socket_path(&name);
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    // A server that completes the handshake but points DONE at a segment
    // that does not exist.
    let fake_server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = frame::read_frame(&mut stream).await.unwrap();
        frame::write_frame(&mut stream, &Frame::Ready).await.unwrap();
        frame::write_frame(
            &mut stream,
            &Frame::Done {
                shm_name: "/lc-nowhere".into(),
                capacity: 64,
            },
        )
        .await
        .unwrap();
        // Hold the stream until the caller has reacted.
        let _ = frame::read_frame(&mut stream).await;
    });

    let caller = ServiceCaller::new(&name).unwrap();
    match caller.call(b"x").await {
        Err(Error::Protocol(_)) => {}
        other => panic!("expected Protocol, got {other:?}"),
    }

    fake_server.await.unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(testkit::shm_objects_remaining(&name), 0);
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
async fn calls_do_not_leak_file_descriptors() {
    let served = testkit::ServedService::start("fds", |req: &[u8]| -> Result<Vec<u8>, String> {
        Ok(req.to_vec())
    })
    .unwrap();
    let caller = served.caller().unwrap();

    // Warm up so lazily created runtime fds are in the baseline.
    caller.call(b"warmup").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let baseline = open_fd_count();

    for _ in 0..5 {
        caller.call(&vec![7u8; 1 << 20]).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = open_fd_count();
    assert!(
        after <= baseline,
        "fd count grew from {baseline} to {after}"
    );
}

#[cfg(target_os = "linux")]
fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}
