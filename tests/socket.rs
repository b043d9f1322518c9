mod common;

use std::time::{Duration, Instant};

use common::{Trace, run, sleep_ms};
use tinyproc::{
    KernelError, ShutdownMode, Task,
    syscall::{
        accept, close, connect, create_thread, exec, listen, pipe, read, shutdown, socket,
        thread_join, wait_child, write,
    },
};

#[test]
fn request_and_reply_across_processes() {
    let status = run(|_| {
        let listener = socket(Some(80)).unwrap();
        listen(listener).unwrap();

        let client = exec(
            Task::new(|_| {
                let sock = socket(None).unwrap();
                connect(sock, 80, None).unwrap();
                write(sock, b"ping").unwrap();
                let mut buf = [0u8; 4];
                read(sock, &mut buf).unwrap();
                (&buf == b"pong") as i32
            }),
            &[],
        )
        .unwrap();

        let peer = accept(listener).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read(peer, &mut buf), Ok(4));
        assert_eq!(&buf, b"ping");
        assert_eq!(write(peer, b"pong"), Ok(4));
        assert_eq!(wait_child(Some(client)), Ok((client, 1)));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn requests_are_admitted_in_arrival_order() {
    let trace = Trace::default();
    let status = {
        let trace = trace.clone();
        run(move |_| {
            let listener = socket(Some(81)).unwrap();
            listen(listener).unwrap();

            for i in 0..3u8 {
                let trace = trace.clone();
                exec(
                    Task::new(move |_| {
                        sleep_ms(15 * i as u64);
                        let sock = socket(None).unwrap();
                        trace.push(format!("connect {i}"));
                        connect(sock, 81, None).unwrap();
                        write(sock, &[i]).unwrap() as i32
                    }),
                    &[],
                )
                .unwrap();
            }

            sleep_ms(100);
            for expected in 0..3u8 {
                let peer = accept(listener).unwrap();
                let mut buf = [0u8; 1];
                assert_eq!(read(peer, &mut buf), Ok(1));
                assert_eq!(buf[0], expected);
                trace.push(format!("accepted {}", buf[0]));
                close(peer).unwrap();
            }
            for _ in 0..3 {
                assert_eq!(wait_child(None).map(|(_, status)| status), Ok(1));
            }
            0
        })
    };
    assert_eq!(status, 0);
    assert_eq!(
        trace.events(),
        [
            "connect 0",
            "connect 1",
            "connect 2",
            "accepted 0",
            "accepted 1",
            "accepted 2"
        ]
    );
}

#[test]
fn shutdown_closes_one_direction_at_a_time() {
    let status = run(|_| {
        let listener = socket(Some(82)).unwrap();
        listen(listener).unwrap();
        let server = create_thread(Task::new(move |_| accept(listener).unwrap() as i32), &[])
            .unwrap();
        let client = socket(None).unwrap();
        connect(client, 82, None).unwrap();
        let peer = thread_join(server).unwrap() as usize;

        let mut buf = [0u8; 8];
        assert_eq!(write(client, b"hi"), Ok(2));
        shutdown(client, ShutdownMode::Write).unwrap();
        assert_eq!(read(peer, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(read(peer, &mut buf), Ok(0));
        assert_eq!(write(client, b"x"), Err(KernelError::BrokenPipe));

        assert_eq!(write(peer, b"yo"), Ok(2));
        assert_eq!(read(client, &mut buf[..2]), Ok(2));
        assert_eq!(&buf[..2], b"yo");

        shutdown(client, ShutdownMode::Read).unwrap();
        assert_eq!(write(peer, b"z"), Err(KernelError::BrokenPipe));
        assert_eq!(read(client, &mut buf), Err(KernelError::BrokenPipe));

        assert_eq!(shutdown(client, ShutdownMode::Both), Ok(()));
        assert_eq!(shutdown(listener, ShutdownMode::Both), Err(KernelError::InvalidArgument));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn closing_a_peer_ends_the_stream() {
    let status = run(|_| {
        let listener = socket(Some(83)).unwrap();
        listen(listener).unwrap();
        let server = create_thread(Task::new(move |_| accept(listener).unwrap() as i32), &[])
            .unwrap();
        let client = socket(None).unwrap();
        connect(client, 83, None).unwrap();
        let peer = thread_join(server).unwrap() as usize;

        write(client, b"bye").unwrap();
        close(client).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(read(peer, &mut buf), Ok(3));
        assert_eq!(read(peer, &mut buf), Ok(0));
        assert_eq!(write(peer, b"?"), Err(KernelError::BrokenPipe));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn ports_and_variants_are_checked() {
    let status = run(|_| {
        assert_eq!(socket(Some(0)), Err(KernelError::InvalidArgument));
        assert_eq!(socket(Some(1024)), Err(KernelError::InvalidArgument));

        let anonymous = socket(None).unwrap();
        assert_eq!(listen(anonymous), Err(KernelError::InvalidArgument));
        assert_eq!(connect(anonymous, 0, None), Err(KernelError::InvalidArgument));
        assert_eq!(connect(anonymous, 5, None), Err(KernelError::ProtocolViolation));

        let first = socket(Some(84)).unwrap();
        let second = socket(Some(84)).unwrap();
        listen(first).unwrap();
        assert_eq!(listen(second), Err(KernelError::ProtocolViolation));
        assert_eq!(listen(first), Err(KernelError::InvalidArgument));
        assert_eq!(accept(second), Err(KernelError::ProtocolViolation));
        assert_eq!(connect(first, 84, None), Err(KernelError::InvalidArgument));

        let mut buf = [0u8; 1];
        assert_eq!(read(second, &mut buf), Err(KernelError::InvalidArgument));
        assert_eq!(write(second, b"x"), Err(KernelError::InvalidArgument));
        assert_eq!(shutdown(second, ShutdownMode::Read), Err(KernelError::InvalidArgument));

        let fids = pipe().unwrap();
        assert_eq!(accept(fids.read), Err(KernelError::InvalidArgument));
        assert_eq!(listen(fids.write), Err(KernelError::InvalidArgument));

        // Freed on close.
        close(first).unwrap();
        assert_eq!(listen(second), Ok(()));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn timed_out_connect_leaves_no_trace() {
    let status = run(|_| {
        let listener = socket(Some(85)).unwrap();
        listen(listener).unwrap();

        let late = socket(None).unwrap();
        let start = Instant::now();
        assert_eq!(
            connect(late, 85, Some(Duration::from_millis(30))),
            Err(KernelError::Timeout)
        );
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(30), "{waited:?}");
        assert!(waited < Duration::from_secs(2), "{waited:?}");
        assert_eq!(connect(late, 85, Some(Duration::ZERO)), Err(KernelError::Timeout));

        let client = exec(
            Task::new(|_| {
                let sock = socket(None).unwrap();
                connect(sock, 85, None).unwrap();
                write(sock, b"2").unwrap() as i32
            }),
            &[],
        )
        .unwrap();

        let peer = accept(listener).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read(peer, &mut buf), Ok(1));
        assert_eq!(&buf, b"2");
        assert_eq!(wait_child(Some(client)), Ok((client, 1)));

        // Still unbound, so it can try again.
        let retry = create_thread(Task::new(move |_| accept(listener).unwrap() as i32), &[])
            .unwrap();
        assert_eq!(connect(late, 85, None), Ok(()));
        assert!(thread_join(retry).is_ok());
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn closing_a_listener_fails_pending_connects() {
    let status = run(|_| {
        let listener = socket(Some(86)).unwrap();
        listen(listener).unwrap();

        let connectors: Vec<_> = (0..3)
            .map(|_| {
                create_thread(
                    Task::new(|_| {
                        let sock = socket(None).unwrap();
                        (connect(sock, 86, None) == Err(KernelError::BrokenPipe)) as i32
                    }),
                    &[],
                )
                .unwrap()
            })
            .collect();
        sleep_ms(40);
        close(listener).unwrap();
        for connector in connectors {
            assert_eq!(thread_join(connector), Ok(1));
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn closing_a_listener_fails_a_blocked_accept() {
    let status = run(|_| {
        let listener = socket(Some(87)).unwrap();
        listen(listener).unwrap();

        let acceptor = create_thread(
            Task::new(move |_| (accept(listener) == Err(KernelError::BrokenPipe)) as i32),
            &[],
        )
        .unwrap();
        sleep_ms(30);
        close(listener).unwrap();
        assert_eq!(thread_join(acceptor), Ok(1));

        let replacement = socket(Some(87)).unwrap();
        assert_eq!(listen(replacement), Ok(()));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn huge_timeout_waits_like_forever() {
    let status = run(|_| {
        let listener = socket(Some(88)).unwrap();
        listen(listener).unwrap();

        let connector = create_thread(
            Task::new(|_| {
                let sock = socket(None).unwrap();
                connect(sock, 88, Some(Duration::MAX)).unwrap();
                write(sock, b"k").unwrap() as i32
            }),
            &[],
        )
        .unwrap();

        let peer = accept(listener).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read(peer, &mut buf), Ok(1));
        assert_eq!(&buf, b"k");
        assert_eq!(thread_join(connector), Ok(1));
        0
    });
    assert_eq!(status, 0);
}
