//! Integration tests for cooperative worker threads

#![allow(clippy::expect_used)]

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tether_sync::{
    CooperativeThread, Event, Handle, SyncError, ThreadConfig, ThreadControl, ThreadState,
    Timeout, WaitObject, WaitResult, Worker, WorkerResult, wait_for_object,
};

const SETTLE: Timeout = Timeout::Millis(2000);

/// Loops until stopped from outside.
struct Dummy;

impl Worker for Dummy {
    fn iterate(&mut self, _control: &ThreadControl, _handle: Handle) -> WorkerResult {
        Ok(())
    }

    fn abandoned(&mut self, _control: &ThreadControl, _handle: Handle) -> WorkerResult {
        Err("dummy received an abandoned event".into())
    }
}

/// Stops itself on its first iteration.
struct StopSelf;

impl Worker for StopSelf {
    fn iterate(&mut self, control: &ThreadControl, _handle: Handle) -> WorkerResult {
        control.stop()?;
        Ok(())
    }

    fn abandoned(&mut self, _control: &ThreadControl, _handle: Handle) -> WorkerResult {
        Err("stopper received an abandoned event".into())
    }
}

/// Reports every callback over a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Setup,
    Iterate(Handle),
    Abandoned(Handle),
}

struct Recorder {
    calls: mpsc::Sender<Call>,
}

impl Worker for Recorder {
    fn setup(&mut self, _control: &ThreadControl) -> WorkerResult {
        self.calls.send(Call::Setup)?;
        Ok(())
    }

    fn iterate(&mut self, _control: &ThreadControl, handle: Handle) -> WorkerResult {
        self.calls.send(Call::Iterate(handle))?;
        Ok(())
    }

    fn abandoned(&mut self, control: &ThreadControl, handle: Handle) -> WorkerResult {
        control.remove_wait_object(handle)?;
        self.calls.send(Call::Abandoned(handle))?;
        Ok(())
    }
}

fn recorder(name: &str, timeout: Timeout) -> (CooperativeThread, mpsc::Receiver<Call>) {
    let (calls, received) = mpsc::channel();
    let thread = CooperativeThread::spawn(
        ThreadConfig::new(name).with_wait_timeout(timeout),
        Recorder { calls },
    )
    .expect("spawn");
    (thread, received)
}

fn next_call(received: &mpsc::Receiver<Call>) -> Call {
    received
        .recv_timeout(Duration::from_secs(2))
        .expect("callback within two seconds")
}

struct Peer(UnixStream);

impl WaitObject for Peer {
    fn handle(&self) -> Handle {
        Handle::from_raw(self.0.as_raw_fd())
    }
}

#[test]
fn test_construction_and_teardown() {
    for i in 0u32..64 {
        let dummy = Arc::new(
            CooperativeThread::spawn(
                ThreadConfig::new("dummy").with_wait_timeout(Timeout::POLL),
                Dummy,
            )
            .expect("spawn"),
        );
        let stopper = CooperativeThread::spawn(
            ThreadConfig::new("stopper").with_wait_timeout(Timeout::from_millis(10)),
            StopSelf,
        )
        .expect("spawn");
        let waiter =
            CooperativeThread::spawn(ThreadConfig::new("waiter"), StopSelf).expect("spawn");
        waiter.add_wait_object(dummy.clone()).expect("add");

        if i & 0x01 != 0 {
            dummy.start().expect("start");
        }
        if i & 0x02 != 0 {
            stopper.start().expect("start");
        }
        if i & 0x04 != 0 {
            waiter.start().expect("start");
        }
        if i & 0x08 != 0 {
            dummy.stop().expect("stop");
        }
        if i & 0x10 != 0 {
            stopper.stop().expect("stop");
        }
        if i & 0x20 != 0 {
            waiter.stop().expect("stop");
        }

        assert_eq!(dummy.error(), "");
        assert_eq!(stopper.error(), "");
        assert_eq!(waiter.error(), "");

        let started = Instant::now();
        drop(stopper);
        dummy.stop().expect("stop");
        drop(waiter);
        drop(dummy);
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "teardown took {:?}",
            started.elapsed()
        );
    }
}

#[test]
fn test_self_stop_signals_waiters() {
    let thread = CooperativeThread::spawn(
        ThreadConfig::new("self-stop").with_wait_timeout(Timeout::from_millis(10)),
        StopSelf,
    )
    .expect("spawn");

    thread.start().expect("start");
    assert_eq!(wait_for_object(&thread, SETTLE).expect("wait"), WaitResult::Success);
    assert_eq!(thread.state(), ThreadState::Stopped);
    assert!(thread.is_stopping());

    // Stopped threads can be restarted
    thread.start().expect("restart");
    assert_eq!(wait_for_object(&thread, SETTLE).expect("wait"), WaitResult::Success);
    assert_eq!(thread.error(), "");
}

#[test]
fn test_restart_races_stop() {
    struct Counting(Arc<AtomicU64>);

    impl Worker for Counting {
        fn iterate(&mut self, _control: &ThreadControl, _handle: Handle) -> WorkerResult {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    let iterations = Arc::new(AtomicU64::new(0));
    let thread = CooperativeThread::spawn(
        ThreadConfig::new("restarted").with_wait_timeout(Timeout::POLL),
        Counting(iterations.clone()),
    )
    .expect("spawn");
    thread.start().expect("start");

    for _ in 0..50 {
        let control = thread.control();
        std::thread::spawn(move || {
            for _ in 0..20 {
                control.stop().expect("stop");
                control.start().expect("start");
            }
        })
        .join()
        .expect("cycler");

        // A late stop acknowledgement must not overwrite the restart
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(thread.state(), ThreadState::Running);
        assert_eq!(
            wait_for_object(&thread, Timeout::POLL).expect("wait"),
            WaitResult::Timeout
        );

        let before = iterations.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
        assert!(iterations.load(Ordering::Relaxed) > before);
    }

    thread.stop().expect("stop");
    assert_eq!(wait_for_object(&thread, SETTLE).expect("wait"), WaitResult::Success);
    assert_eq!(thread.state(), ThreadState::Stopped);
    assert_eq!(thread.error(), "");
}

#[test]
fn test_waiter_follows_other_thread() {
    let dummy = Arc::new(
        CooperativeThread::spawn(
            ThreadConfig::new("followed").with_wait_timeout(Timeout::from_millis(5)),
            Dummy,
        )
        .expect("spawn"),
    );
    let waiter = CooperativeThread::spawn(ThreadConfig::new("follower"), StopSelf).expect("spawn");
    waiter.add_wait_object(dummy.clone()).expect("add");

    dummy.start().expect("start");
    waiter.start().expect("start");
    assert_eq!(
        waiter.control().wait_stopped(Timeout::from_millis(50)).expect("wait"),
        WaitResult::Timeout
    );

    dummy.stop().expect("stop");
    assert_eq!(waiter.control().wait_stopped(SETTLE).expect("wait"), WaitResult::Success);
    assert_eq!(waiter.error(), "");
}

#[test]
fn test_setup_runs_once_before_iterate() {
    let (thread, calls) = recorder("setup-once", Timeout::from_millis(5));
    thread.start().expect("start");

    assert_eq!(next_call(&calls), Call::Setup);
    assert_eq!(next_call(&calls), Call::Iterate(Handle::INVALID));

    thread.stop().expect("stop");
    thread.control().wait_stopped(SETTLE).expect("wait");
    thread.start().expect("restart");
    thread.stop().expect("stop");
    drop(thread);

    assert!(calls.iter().all(|call| call != Call::Setup));
}

#[test]
fn test_registered_object_dispatches_its_handle() {
    let (thread, calls) = recorder("dispatch", Timeout::Infinite);
    let event = Arc::new(Event::new(false, false).expect("event"));
    thread.add_wait_object(event.clone()).expect("add");
    thread.start().expect("start");
    assert_eq!(next_call(&calls), Call::Setup);

    event.set().expect("set");
    assert_eq!(next_call(&calls), Call::Iterate(event.handle()));

    // Auto-reset: the wait consumed the signal, so there is no second call
    assert!(calls.recv_timeout(Duration::from_millis(50)).is_err());

    thread.remove_wait_object(event.handle()).expect("remove");
    // Let the loop apply the removal before signalling again
    std::thread::sleep(Duration::from_millis(20));
    event.set().expect("set");
    assert!(calls.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(event.is_set().expect("is_set"));
}

#[test]
fn test_hang_up_dispatches_abandoned() {
    let (thread, calls) = recorder("abandoned", Timeout::Infinite);
    let (local, remote) = UnixStream::pair().expect("socket pair");
    let peer = Arc::new(Peer(local));
    thread.add_wait_object(peer.clone()).expect("add");
    thread.start().expect("start");
    assert_eq!(next_call(&calls), Call::Setup);

    drop(remote);
    assert_eq!(next_call(&calls), Call::Abandoned(peer.handle()));
    // The worker removed the handle, so the hang-up is reported once
    assert!(calls.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(thread.error(), "");
}

#[test]
fn test_wait_timeout_can_change() {
    let (thread, calls) = recorder("retimed", Timeout::Infinite);
    thread.start().expect("start");
    assert_eq!(next_call(&calls), Call::Setup);
    assert!(calls.recv_timeout(Duration::from_millis(50)).is_err());

    thread.set_wait_timeout(Timeout::from_millis(5));
    // Nudge the loop so the new interval applies to the next wait
    thread.add_wait_object(Arc::new(Event::new(true, false).expect("event"))).expect("add");
    assert_eq!(next_call(&calls), Call::Iterate(Handle::INVALID));
}

#[test]
fn test_error_is_captured() {
    struct Failing;

    impl Worker for Failing {
        fn iterate(&mut self, _control: &ThreadControl, _handle: Handle) -> WorkerResult {
            Err("storage went away".into())
        }
    }

    let thread = CooperativeThread::spawn(
        ThreadConfig::new("failing").with_wait_timeout(Timeout::POLL),
        Failing,
    )
    .expect("spawn");
    thread.start().expect("start");

    assert_eq!(wait_for_object(&thread, SETTLE).expect("wait"), WaitResult::Success);
    thread.control().wait_exited(SETTLE).expect("wait");
    assert_eq!(thread.state(), ThreadState::Exited);
    assert_eq!(thread.error(), "storage went away");
    assert!(matches!(thread.start(), Err(SyncError::InvalidOperation(_))));
}

#[test]
fn test_panic_is_captured() {
    struct Panicking;

    impl Worker for Panicking {
        fn setup(&mut self, _control: &ThreadControl) -> WorkerResult {
            panic!("setup exploded");
        }

        fn iterate(&mut self, _control: &ThreadControl, _handle: Handle) -> WorkerResult {
            Ok(())
        }
    }

    let thread =
        CooperativeThread::spawn(ThreadConfig::new("panicking"), Panicking).expect("spawn");
    thread.start().expect("start");
    thread.control().wait_exited(SETTLE).expect("wait");
    assert_eq!(thread.error(), "setup exploded");
    assert!(thread.start().is_err());
}

#[test]
fn test_invalid_object_is_rejected() {
    struct Invalid;

    impl WaitObject for Invalid {
        fn handle(&self) -> Handle {
            Handle::INVALID
        }
    }

    let thread = CooperativeThread::spawn(ThreadConfig::default(), Dummy).expect("spawn");
    assert!(matches!(
        thread.add_wait_object(Arc::new(Invalid)),
        Err(SyncError::InvalidHandle(_))
    ));
}

#[test]
fn test_drop_without_start_is_prompt() {
    let started = Instant::now();
    for _ in 0..32 {
        let thread = CooperativeThread::spawn(ThreadConfig::default(), Dummy).expect("spawn");
        assert_eq!(thread.state(), ThreadState::Created);
        drop(thread);
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}
