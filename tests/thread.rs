mod common;

use std::sync::{Mutex, mpsc};

use common::{run, sleep_ms};
use tinyproc::{
    INIT_PID, Kernel, KernelConfig, KernelError, TASK_PANICKED, Task, Tid,
    syscall::{
        create_thread, exec, pipe, read, thread_detach, thread_exit, thread_join, thread_self,
        wait_child, write,
    },
};

#[test]
fn join_returns_the_exit_status() {
    let status = run(|_| {
        let tid = create_thread(Task::new(|args| args.iter().map(|&b| b as i32).sum()), &[1, 2, 3])
            .unwrap();
        assert_eq!(thread_join(tid), Ok(6));
        // The record is gone after the join.
        assert_eq!(thread_join(tid), Err(KernelError::NotFound));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn thread_ids_are_distinct() {
    let status = run(|_| {
        let me = thread_self().unwrap();
        let first = create_thread(Task::new(|_| thread_self().unwrap() as i32), &[]).unwrap();
        let second = create_thread(Task::new(|_| thread_self().unwrap() as i32), &[]).unwrap();
        assert!(me != first && first != second && me != second);
        assert_eq!(thread_join(first), Ok(first as i32));
        assert_eq!(thread_join(second), Ok(second as i32));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn every_joiner_sees_the_status() {
    let status = run(|_| {
        let target = create_thread(
            Task::new(|_| {
                sleep_ms(50);
                9
            }),
            &[],
        )
        .unwrap();
        let joiners: Vec<_> = (0..2)
            .map(|_| {
                create_thread(
                    Task::new(move |_| thread_join(target).unwrap_or(-100)),
                    &[],
                )
                .unwrap()
            })
            .collect();

        for joiner in joiners {
            assert_eq!(thread_join(joiner), Ok(9));
        }
        assert_eq!(thread_join(target), Err(KernelError::NotFound));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn detach_fails_a_pending_join() {
    let status = run(|_| {
        let target = create_thread(
            Task::new(|_| {
                sleep_ms(80);
                0
            }),
            &[],
        )
        .unwrap();
        let joiner = create_thread(
            Task::new(move |_| match thread_join(target) {
                Err(KernelError::InvalidArgument) => 1,
                _ => 2,
            }),
            &[],
        )
        .unwrap();

        sleep_ms(20);
        assert_eq!(thread_detach(target), Ok(()));
        assert_eq!(thread_join(joiner), Ok(1));
        assert_eq!(thread_join(target), Err(KernelError::InvalidArgument));

        // Reclaimed on exit.
        sleep_ms(100);
        assert_eq!(thread_join(target), Err(KernelError::NotFound));
        assert_eq!(thread_detach(target), Err(KernelError::NotFound));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn exited_threads_cannot_be_detached() {
    let status = run(|_| {
        let tid = create_thread(Task::new(|_| 4), &[]).unwrap();
        sleep_ms(20);
        assert_eq!(thread_detach(tid), Err(KernelError::InvalidArgument));
        assert_eq!(thread_join(tid), Ok(4));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn a_thread_cannot_join_itself() {
    let status = run(|_| {
        let me = thread_self().unwrap();
        assert_eq!(thread_join(me), Err(KernelError::InvalidArgument));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn threads_of_other_processes_are_invisible() {
    let status = run(|_| {
        let me = thread_self().unwrap();
        let child = exec(
            Task::new(move |_| {
                let joined = thread_join(me) == Err(KernelError::NotFound);
                let detached = thread_detach(me) == Err(KernelError::NotFound);
                (joined && detached) as i32
            }),
            &[],
        )
        .unwrap();
        assert_eq!(wait_child(Some(child)), Ok((child, 1)));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn thread_exit_ends_only_the_caller() {
    fn finish(status: i32) -> ! {
        thread_exit(status)
    }

    let status = run(|_| {
        let tid = create_thread(Task::new(|_| finish(11)), &[]).unwrap();
        assert_eq!(thread_join(tid), Ok(11));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn panics_become_an_exit_status() {
    let status = run(|_| {
        let tid = create_thread(Task::new(|_| panic!("thread task failed")), &[]).unwrap();
        assert_eq!(thread_join(tid), Ok(TASK_PANICKED));

        let child = exec(Task::new(|_| panic!("process task failed")), &[]).unwrap();
        assert_eq!(wait_child(Some(child)), Ok((child, TASK_PANICKED)));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn process_outlives_its_main_thread() {
    let status = run(|_| {
        let fids = pipe().unwrap();
        let wfid = fids.write;
        let child = exec(
            Task::new(move |_| {
                create_thread(
                    Task::new(move |_| {
                        sleep_ms(40);
                        write(wfid, b"w").unwrap() as i32
                    }),
                    &[],
                )
                .unwrap();
                3
            }),
            &[],
        )
        .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(read(fids.read, &mut buf), Ok(1));
        assert_eq!(&buf, b"w");
        assert_eq!(wait_child(Some(child)), Ok((child, 3)));
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn thread_records_report_their_state() {
    let (ready_tx, ready_rx) = mpsc::channel::<(Tid, Tid)>();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let ready_tx = Mutex::new(ready_tx);
    let resume_rx = Mutex::new(resume_rx);

    let kernel = Kernel::boot(
        KernelConfig::default(),
        Task::new(move |_| {
            let finished = create_thread(Task::new(|_| 5), &[]).unwrap();
            let detached = create_thread(
                Task::new(|_| {
                    sleep_ms(100);
                    0
                }),
                &[],
            )
            .unwrap();
            thread_detach(detached).unwrap();
            sleep_ms(30);
            ready_tx.lock().unwrap().send((finished, detached)).unwrap();
            resume_rx.lock().unwrap().recv().unwrap();
            thread_join(finished).unwrap()
        }),
        &[],
    )
    .unwrap();

    let (finished, detached) = ready_rx.recv().unwrap();
    let threads = kernel.get_process(INIT_PID).unwrap().threads();
    let record = |tid: Tid| threads.iter().find(|t| t.tid() == tid).unwrap();
    assert!(record(finished).is_exited());
    assert!(!record(finished).is_detached());
    assert!(!record(detached).is_exited());
    assert!(record(detached).is_detached());
    drop(threads);

    resume_tx.send(()).unwrap();
    assert_eq!(kernel.wait_halt(), 5);
}

#[test]
#[should_panic(expected = "outside of a kernel thread")]
fn thread_exit_outside_the_kernel_panics() {
    thread_exit(3);
}
