//! End-to-end scenarios exercising the scheduler and both backends.

#![cfg(target_os = "linux")]

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft::{io, BackendSelect, Config, Error, Resume};

fn raw_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

#[test]
fn snooze_round_trip() {
    let value = weft::run_default(|| {
        let fiber = weft::spawn(|| {
            weft::snooze()?;
            Ok(7)
        })?;
        fiber.join()
    })
    .unwrap();
    assert_eq!(value, 7);
}

#[test]
fn snooze_count_matches_switch_count() {
    weft::run_default(|| {
        weft::stats()?; // reset counters
        for _ in 0..5 {
            weft::snooze()?;
        }
        let stats = weft::stats()?;
        assert_eq!(stats.switch_count, 5);
        Ok(())
    })
    .unwrap();
}

#[test]
fn write_then_read_over_pipe() {
    weft::run_default(|| {
        let (r, w) = raw_pipe();
        let writer = weft::spawn(move || {
            io::write(w, b"hello")?;
            io::close(w)?;
            Ok(())
        })?;

        let mut buf = Vec::new();
        let n = io::read(r, &mut buf, 10, true)?;
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        // Write end is closed: the next read reports EOF.
        let mut buf2 = Vec::new();
        assert_eq!(io::read(r, &mut buf2, 10, false)?, 0);

        writer.join()?;
        io::close(r)?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn write_then_read_over_pipe_epoll() {
    weft::run(Config::default().backend(BackendSelect::Epoll), || {
        let (r, w) = raw_pipe();
        let writer = weft::spawn(move || {
            io::write(w, b"hello")?;
            io::close(w)?;
            Ok(())
        })?;

        let mut buf = Vec::new();
        let n = io::read(r, &mut buf, 10, true)?;
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        writer.join()?;
        io::close(r)?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn pipe_half_close_semantics() {
    weft::run_default(|| {
        let mut pipe = weft::Pipe::new()?;
        let w = pipe.fd(true)?;
        io::write(w, b"abc")?;
        pipe.close()?;
        assert!(pipe.closed());
        assert_eq!(pipe.fd(true), Err(Error::ClosedPipe));

        // Read end survives the half-close and drains to EOF.
        let r = pipe.fd(false)?;
        let mut buf = Vec::new();
        assert_eq!(io::read(r, &mut buf, 16, true)?, 3);
        assert_eq!(&buf, b"abc");
        Ok(())
    })
    .unwrap();
}

#[test]
fn accept_loop_serves_three_clients() {
    let served = weft::run_default(|| {
        let listener = unsafe {
            libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
        };
        assert!(listener >= 0);
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (storage, len) = sockaddr_of(&addr);
        unsafe {
            let one: libc::c_int = 1;
            libc::setsockopt(
                listener,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            assert_eq!(
                libc::bind(
                    listener,
                    &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                    len
                ),
                0
            );
            assert_eq!(libc::listen(listener, 16), 0);
        }
        let port = local_port(listener);

        // Clients run on a plain OS thread with std blocking sockets.
        let client_thread = std::thread::spawn(move || {
            for _ in 0..3 {
                use std::io::Read;
                let mut stream =
                    std::net::TcpStream::connect(("127.0.0.1", port)).expect("connect");
                let mut byte = [0u8; 1];
                stream.read_exact(&mut byte).expect("read");
                assert_eq!(&byte, b"x");
            }
        });

        let mut served = 0u32;
        let outcome = io::accept_loop(listener, |conn| {
            io::write(conn, b"x")?;
            io::close(conn)?;
            served += 1;
            if served == 3 {
                return Err(Error::Terminated); // stop the loop
            }
            Ok(())
        });
        assert_eq!(outcome, Err(Error::Terminated));
        io::close(listener)?;
        client_thread.join().unwrap();
        Ok(served)
    })
    .unwrap();
    assert_eq!(served, 3);
}

#[test]
fn timeout_wins_over_sleep() {
    weft::run_default(|| {
        let started = Instant::now();
        let outcome = weft::timeout(Duration::from_millis(50), || {
            weft::sleep(Duration::from_secs(10))?;
            Ok(())
        });
        assert_eq!(outcome, Err(Error::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));

        // The cancelled sleep leaves nothing pending.
        let stats = weft::stats()?;
        assert_eq!(stats.pending_ops, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn move_on_returns_none_on_expiry() {
    weft::run_default(|| {
        let outcome = weft::move_on_after(Duration::from_millis(20), || {
            weft::sleep(Duration::from_secs(10))?;
            Ok(1)
        })?;
        assert_eq!(outcome, None);

        let outcome = weft::move_on_after(Duration::from_secs(10), || Ok(2))?;
        assert_eq!(outcome, Some(2));
        Ok(())
    })
    .unwrap();
}

#[test]
fn cross_thread_schedule_wakes_blocked_poll() {
    weft::run_default(|| {
        let remote = weft::remote()?;
        let me = weft::current_fiber()?;
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.schedule(me, Resume::Value(42)).unwrap();
        });

        let resumed = weft::wait_event(false)?;
        assert_eq!(resumed, Resume::Value(42));
        sender.join().unwrap();
        Ok(())
    })
    .unwrap();
}

#[test]
fn queue_delivers_in_push_order_across_waiters() {
    weft::run_default(|| {
        let queue: weft::Queue<i32> = weft::Queue::new();
        let received: Rc<RefCell<Vec<(usize, i32)>>> = Rc::new(RefCell::new(Vec::new()));

        let mut consumers = Vec::new();
        for i in 0..3 {
            let queue = queue.clone();
            let received = received.clone();
            consumers.push(weft::spawn(move || {
                let value = queue.shift()?;
                received.borrow_mut().push((i, value));
                Ok(())
            })?);
        }

        let producer_queue = queue.clone();
        let producer = weft::spawn(move || {
            for v in 1..=3 {
                producer_queue.push(v);
            }
            Ok(())
        })?;

        for consumer in consumers {
            consumer.join()?;
        }
        producer.join()?;

        // Values arrive in push order, to the waiters in parking order.
        assert_eq!(&*received.borrow(), &[(0, 1), (1, 2), (2, 3)]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn double_schedule_runs_once_with_latest_value() {
    weft::run_default(|| {
        let wakes = Rc::new(RefCell::new(Vec::new()));
        let wakes_in = wakes.clone();
        let fiber = weft::spawn(move || {
            let resumed = weft::wait_event(false)?;
            wakes_in.borrow_mut().push(resumed);
            Ok(())
        })?;

        weft::snooze()?; // let the fiber reach its wait
        weft::schedule(fiber.id(), Resume::Value(1))?;
        weft::schedule(fiber.id(), Resume::Value(2))?;
        fiber.join()?;

        assert_eq!(&*wakes.borrow(), &[Resume::Value(2)]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn event_signal_delivers_value_once() {
    weft::run_default(|| {
        let event: weft::Event<i32> = weft::Event::new();
        let event_in = event.clone();
        let waiter = weft::spawn(move || {
            let value = event_in.wait()?;
            Ok(value)
        })?;

        weft::snooze()?;
        assert!(event.signal(9));
        // No waiter anymore: a second signal is dropped.
        assert!(!event.signal(10));

        assert_eq!(waiter.join()?, Some(9));
        Ok(())
    })
    .unwrap();
}

#[test]
fn parked_fiber_does_not_run_until_unparked() {
    weft::run_default(|| {
        let progress = Rc::new(RefCell::new(0));
        let progress_in = progress.clone();
        let fiber = weft::spawn(move || {
            for _ in 0..3 {
                *progress_in.borrow_mut() += 1;
                weft::snooze()?;
            }
            Ok(())
        })?;

        weft::park(fiber.id())?;
        for _ in 0..5 {
            weft::snooze()?;
        }
        assert_eq!(*progress.borrow(), 0);

        weft::unpark(fiber.id())?;
        fiber.join()?;
        assert_eq!(*progress.borrow(), 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn mailbox_send_receive() {
    weft::run_default(|| {
        let receiver = weft::spawn(|| {
            let msg: String = weft::mailbox_receive()?;
            Ok(msg)
        })?;
        weft::mailbox_send(receiver.id(), String::from("ping"))?;
        assert_eq!(receiver.join()?, "ping");
        Ok(())
    })
    .unwrap();
}

#[test]
fn interrupt_cancels_sleeping_fiber() {
    weft::run_default(|| {
        let sleeper = weft::spawn(|| {
            weft::sleep(Duration::from_secs(30))?;
            Ok(())
        })?;
        weft::snooze()?; // let it reach the sleep
        weft::interrupt(sleeper.id(), Error::Terminated)?;
        assert_eq!(sleeper.join(), Err(Error::Terminated));
        Ok(())
    })
    .unwrap();
}

#[test]
fn timer_loop_ticks_and_stops() {
    weft::run_default(|| {
        let started = Instant::now();
        let mut ticks = 0;
        weft::timer_loop(Duration::from_millis(10), || {
            ticks += 1;
            Ok(ticks < 3)
        })?;
        assert_eq!(ticks, 3);
        assert!(started.elapsed() >= Duration::from_millis(25));
        Ok(())
    })
    .unwrap();
}

#[test]
fn send_recv_over_socketpair() {
    weft::run_default(|| {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);

        let peer = fds[1];
        let sender = weft::spawn(move || {
            io::send(peer, b"ping", 0)?;
            Ok(())
        })?;

        let mut buf = Vec::new();
        let n = io::recv(fds[0], &mut buf, 16)?;
        assert_eq!(n, 4);
        assert_eq!(&buf, b"ping");
        sender.join()?;
        io::close(fds[0])?;
        io::close(fds[1])?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn writev_gathers_all_parts() {
    weft::run_default(|| {
        let (r, w) = raw_pipe();
        let writer = weft::spawn(move || {
            let n = io::writev(w, &[b"foo", b"bar"])?;
            assert_eq!(n, 6);
            io::close(w)?;
            Ok(())
        })?;
        let mut buf = Vec::new();
        io::read(r, &mut buf, 16, true)?;
        assert_eq!(&buf, b"foobar");
        writer.join()?;
        io::close(r)?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn chain_runs_ops_in_order() {
    weft::run_default(|| {
        let (r, w) = raw_pipe();
        io::chain(&[
            io::ChainOp::Write { fd: w, buf: b"a" },
            io::ChainOp::Write { fd: w, buf: b"b" },
        ])?;
        let mut buf = Vec::new();
        io::read(r, &mut buf, 2, false)?;
        assert_eq!(&buf, b"ab");
        io::close(w)?;
        io::close(r)?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn splice_moves_bytes_between_pipes() {
    weft::run_default(|| {
        let (r1, w1) = raw_pipe();
        let (r2, w2) = raw_pipe();
        io::write(w1, b"abcde")?;
        let n = io::splice(r1, w2, 1024)?;
        assert_eq!(n, 5);
        let mut buf = Vec::new();
        io::read(r2, &mut buf, 16, false)?;
        assert_eq!(&buf, b"abcde");
        for fd in [r1, w1, r2, w2] {
            io::close(fd)?;
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn double_splice_relays_until_eof() {
    weft::run_default(|| {
        let (r1, w1) = raw_pipe();
        let (r2, w2) = raw_pipe();
        let feeder = weft::spawn(move || {
            io::write(w1, b"stream me")?;
            io::close(w1)?;
            Ok(())
        })?;
        let n = io::double_splice(r1, w2)?;
        assert_eq!(n, 9);
        io::close(w2)?;
        let mut buf = Vec::new();
        io::read(r2, &mut buf, 64, true)?;
        assert_eq!(&buf, b"stream me");
        feeder.join()?;
        io::close(r1)?;
        io::close(r2)?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn waitpid_reaps_child() {
    weft::run_default(|| {
        let child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id() as i32;
        let (reaped, _status) = io::waitpid(pid)?;
        assert_eq!(reaped, pid);
        Ok(())
    })
    .unwrap();
}

#[test]
fn sleep_epoll_backend() {
    weft::run(Config::default().backend(BackendSelect::Epoll), || {
        let started = Instant::now();
        weft::sleep(Duration::from_millis(30))?;
        assert!(started.elapsed() >= Duration::from_millis(25));
        Ok(())
    })
    .unwrap();
}

#[test]
fn fiber_states_are_observable() {
    weft::run_default(|| {
        let fiber = weft::spawn(|| {
            weft::snooze()?;
            Ok(())
        })?;
        assert_eq!(weft::state(fiber.id()), weft::FiberState::Runnable);
        let id = fiber.id();
        fiber.join()?;
        assert_eq!(weft::state(id), weft::FiberState::Dead);
        assert_eq!(
            weft::state(weft::current_fiber()?),
            weft::FiberState::Running
        );
        Ok(())
    })
    .unwrap();
}

fn sockaddr_of(addr: &std::net::SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        std::net::SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        _ => unreachable!("tests use v4 loopback"),
    }
}

fn local_port(fd: RawFd) -> u16 {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    assert_eq!(ret, 0);
    let sin = unsafe { &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
    u16::from_be(sin.sin_port)
}
