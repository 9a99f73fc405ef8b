use std::{
    cell::{Cell, RefCell},
    io::{Read, Write},
    os::unix::net::UnixStream,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{create, register_default_backends, Error, EventLoop, EventMask};

fn loop_for(backend: &str) -> EventLoop {
    register_default_backends();
    create(Some(backend)).unwrap_or_else(|| panic!("backend {backend} not available"))
}

fn pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn fd_readable_scenario_polling() {
    fd_readable_case("polling");
}

#[test]
fn fd_readable_scenario_poll() {
    fd_readable_case("poll");
}

/// One byte written, one READABLE firing, and the loop keeps running until
/// an explicit exit.
fn fd_readable_case(backend: &str) {
    let el = loop_for(backend);
    let (watched, mut peer) = pair();
    let raw = std::os::fd::AsRawFd::as_raw_fd(&watched);

    let fired = Rc::new(RefCell::new(Vec::new()));
    let fired2 = fired.clone();
    let source = el
        .source_alloc(move |_source, fd, mask| {
            assert_eq!(fd, Some(raw));
            let mut buf = [0u8; 16];
            let _ = (&watched).read(&mut buf);
            fired2.borrow_mut().push(mask);
        })
        .unwrap();
    el.set_fd(&source, raw, EventMask::READABLE).unwrap();
    el.add(&source).unwrap();

    let stopper = {
        let el2 = el.clone();
        el.source_alloc(move |_, _, _| el2.exit()).unwrap()
    };
    el.set_timeout(&stopper, Some(Duration::from_millis(150)), EventMask::ONCE)
        .unwrap();
    el.add(&stopper).unwrap();

    peer.write_all(b"x").unwrap();
    el.run();

    let fired = fired.borrow();
    assert_eq!(fired.len(), 1);
    assert!(fired[0].contains(EventMask::READABLE));
    // The persistent watch survives its firing.
    assert!(source.is_registered());

    el.source_free(&source);
    el.source_free(&stopper);
    el.close();
}

#[test]
fn fd_persistent_fires_per_event_polling() {
    fd_persistent_case("polling");
}

#[test]
fn fd_persistent_fires_per_event_poll() {
    fd_persistent_case("poll");
}

/// Three bytes pending, one byte consumed per firing: a watch without ONCE
/// fires for every readiness event with no re-registration.
fn fd_persistent_case(backend: &str) {
    let el = loop_for(backend);
    let (watched, mut peer) = pair();
    let raw = std::os::fd::AsRawFd::as_raw_fd(&watched);

    peer.write_all(b"abc").unwrap();

    let count = Rc::new(Cell::new(0u32));
    let count2 = count.clone();
    let el2 = el.clone();
    let source = el
        .source_alloc(move |_source, _fd, mask| {
            assert!(mask.contains(EventMask::READABLE));
            let mut buf = [0u8; 1];
            (&watched).read_exact(&mut buf).unwrap();
            count2.set(count2.get() + 1);
            if count2.get() == 3 {
                el2.exit();
            }
        })
        .unwrap();
    el.set_fd(&source, raw, EventMask::READABLE).unwrap();
    el.add(&source).unwrap();

    el.run();
    assert_eq!(count.get(), 3);

    el.source_free(&source);
    el.close();
}

#[test]
fn fd_once_disables_after_one_firing_polling() {
    fd_once_case("polling");
}

#[test]
fn fd_once_disables_after_one_firing_poll() {
    fd_once_case("poll");
}

fn fd_once_case(backend: &str) {
    let el = loop_for(backend);
    let (watched, mut peer) = pair();
    let raw = std::os::fd::AsRawFd::as_raw_fd(&watched);

    // Two bytes pending, but the ONCE watch may only deliver one firing.
    peer.write_all(b"xy").unwrap();

    let count = Rc::new(Cell::new(0u32));
    let count2 = count.clone();
    let source = el
        .source_alloc(move |_source, _fd, _mask| {
            let mut buf = [0u8; 1];
            (&watched).read_exact(&mut buf).unwrap();
            count2.set(count2.get() + 1);
        })
        .unwrap();
    el.set_fd(&source, raw, EventMask::READABLE | EventMask::ONCE)
        .unwrap();
    el.add(&source).unwrap();

    // The spent watch was the only one, so the source unregisters itself
    // and the empty loop returns on its own.
    el.run();

    assert_eq!(count.get(), 1);
    assert!(!source.is_registered());

    el.source_free(&source);
    el.close();
}

#[test]
fn timeout_once_returns_when_loop_empties_polling() {
    timeout_once_case("polling");
}

#[test]
fn timeout_once_returns_when_loop_empties_poll() {
    timeout_once_case("poll");
}

/// The 500 ms one-shot timeout: one TIMEOUT firing, then zero registered
/// sources and `run` returns by itself.
fn timeout_once_case(backend: &str) {
    let el = loop_for(backend);

    let fired = Rc::new(RefCell::new(Vec::new()));
    let fired2 = fired.clone();
    let source = el
        .source_alloc(move |_source, _fd, mask| fired2.borrow_mut().push(mask))
        .unwrap();
    el.set_timeout(&source, Some(Duration::from_millis(500)), EventMask::ONCE)
        .unwrap();
    el.add(&source).unwrap();

    let started = Instant::now();
    el.run();
    let elapsed = started.elapsed();

    let fired = fired.borrow();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0], EventMask::TIMEOUT);
    assert!(!source.is_registered());
    assert!(elapsed >= Duration::from_millis(400), "fired after {elapsed:?}");

    el.source_free(&source);
    el.close();
}

#[test]
fn timeout_periodic_rearms_itself_polling() {
    timeout_periodic_case("polling");
}

#[test]
fn timeout_periodic_rearms_itself_poll() {
    timeout_periodic_case("poll");
}

fn timeout_periodic_case(backend: &str) {
    let el = loop_for(backend);

    let instants = Rc::new(RefCell::new(Vec::new()));
    let instants2 = instants.clone();
    let el2 = el.clone();
    let source = el
        .source_alloc(move |_source, _fd, mask| {
            assert_eq!(mask, EventMask::TIMEOUT);
            instants2.borrow_mut().push(Instant::now());
            if instants2.borrow().len() == 3 {
                el2.exit();
            }
        })
        .unwrap();
    el.set_timeout(&source, Some(Duration::from_millis(30)), EventMask::empty())
        .unwrap();
    el.add(&source).unwrap();

    el.run();

    let instants = instants.borrow();
    assert_eq!(instants.len(), 3);
    for gap in instants.windows(2) {
        let spacing = gap[1] - gap[0];
        assert!(spacing >= Duration::from_millis(15), "spacing {spacing:?}");
    }
    // Still registered: only exit stopped it, not the ONCE rule.
    assert!(source.is_registered());

    el.source_free(&source);
    el.close();
}

#[test]
fn remove_then_add_restores_watch_polling() {
    remove_then_add_case("polling");
}

#[test]
fn remove_then_add_restores_watch_poll() {
    remove_then_add_case("poll");
}

fn remove_then_add_case(backend: &str) {
    let el = loop_for(backend);
    let (watched, mut peer) = pair();
    let raw = std::os::fd::AsRawFd::as_raw_fd(&watched);

    let count = Rc::new(Cell::new(0u32));
    let count2 = count.clone();
    let el2 = el.clone();
    let source = el
        .source_alloc(move |_source, _fd, _mask| {
            let mut buf = [0u8; 1];
            (&watched).read_exact(&mut buf).unwrap();
            count2.set(count2.get() + 1);
            el2.exit();
        })
        .unwrap();
    el.set_fd(&source, raw, EventMask::READABLE).unwrap();

    el.add(&source).unwrap();
    el.remove(&source).unwrap();
    el.add(&source).unwrap();

    peer.write_all(b"x").unwrap();
    el.run();
    assert_eq!(count.get(), 1);

    el.source_free(&source);
    el.close();
}

#[test]
fn registration_state_errors_polling() {
    registration_state_errors_case("polling");
}

#[test]
fn registration_state_errors_poll() {
    registration_state_errors_case("poll");
}

/// The documented discipline: double add is rejected, removing an
/// unregistered source is reported, operations on a freed source are
/// reported.
fn registration_state_errors_case(backend: &str) {
    let el = loop_for(backend);

    let source = el.source_alloc(|_, _, _| {}).unwrap();
    el.set_timeout(&source, Some(Duration::from_millis(10)), EventMask::ONCE)
        .unwrap();

    assert!(matches!(el.remove(&source), Err(Error::NotRegistered)));

    el.add(&source).unwrap();
    assert!(matches!(el.add(&source), Err(Error::AlreadyRegistered)));

    el.remove(&source).unwrap();
    assert!(matches!(el.remove(&source), Err(Error::NotRegistered)));

    el.source_free(&source);
    assert!(matches!(
        el.set_fd(&source, 0, EventMask::READABLE),
        Err(Error::NotRegistered)
    ));
    assert!(matches!(el.add(&source), Err(Error::NotRegistered)));

    el.close();
}

#[test]
fn free_from_own_callback_polling() {
    free_from_own_callback_case("polling");
}

#[test]
fn free_from_own_callback_poll() {
    free_from_own_callback_case("poll");
}

/// A source freeing itself mid-callback gets no further firings, and the
/// loop keeps servicing other sources.
fn free_from_own_callback_case(backend: &str) {
    let el = loop_for(backend);

    let suicides = Rc::new(Cell::new(0u32));
    let suicides2 = suicides.clone();
    let el2 = el.clone();
    let quick = el
        .source_alloc(move |source, _fd, _mask| {
            suicides2.set(suicides2.get() + 1);
            el2.source_free(source);
        })
        .unwrap();
    // Periodic: were it not freed it would fire many times.
    el.set_timeout(&quick, Some(Duration::from_millis(10)), EventMask::empty())
        .unwrap();
    el.add(&quick).unwrap();

    let later = Rc::new(Cell::new(0u32));
    let later2 = later.clone();
    let slow = el
        .source_alloc(move |_, _, _| later2.set(later2.get() + 1))
        .unwrap();
    el.set_timeout(&slow, Some(Duration::from_millis(80)), EventMask::ONCE)
        .unwrap();
    el.add(&slow).unwrap();

    // Returns once `slow` fires and both sources are gone.
    el.run();

    assert_eq!(suicides.get(), 1);
    assert_eq!(later.get(), 1);

    el.source_free(&slow);
    el.close();
}

#[test]
fn exit_before_run_returns_immediately_polling() {
    exit_before_run_case("polling");
}

#[test]
fn exit_before_run_returns_immediately_poll() {
    exit_before_run_case("poll");
}

fn exit_before_run_case(backend: &str) {
    let el = loop_for(backend);

    let count = Rc::new(Cell::new(0u32));
    let count2 = count.clone();
    let source = el
        .source_alloc(move |_, _, _| count2.set(count2.get() + 1))
        .unwrap();
    el.set_timeout(&source, Some(Duration::from_millis(50)), EventMask::empty())
        .unwrap();
    el.add(&source).unwrap();

    el.exit();
    let started = Instant::now();
    el.run();

    assert!(started.elapsed() < Duration::from_millis(40));
    assert_eq!(count.get(), 0);

    el.source_free(&source);
    el.close();
}

#[test]
fn set_fd_on_registered_source_swaps_watch_polling() {
    set_fd_swap_case("polling");
}

#[test]
fn set_fd_on_registered_source_swaps_watch_poll() {
    set_fd_swap_case("poll");
}

/// Replacing the fd of a registered source must move the live watch, not
/// stack a second one: only the new descriptor fires afterwards.
fn set_fd_swap_case(backend: &str) {
    let el = loop_for(backend);
    let (old_watched, mut old_peer) = pair();
    let (new_watched, mut new_peer) = pair();
    let new_raw = std::os::fd::AsRawFd::as_raw_fd(&new_watched);

    let count = Rc::new(Cell::new(0u32));
    let count2 = count.clone();
    let source = el
        .source_alloc(move |_source, fd, _mask| {
            assert_eq!(fd, Some(new_raw));
            let mut buf = [0u8; 1];
            (&new_watched).read_exact(&mut buf).unwrap();
            count2.set(count2.get() + 1);
        })
        .unwrap();
    el.set_fd(
        &source,
        std::os::fd::AsRawFd::as_raw_fd(&old_watched),
        EventMask::READABLE,
    )
    .unwrap();
    el.add(&source).unwrap();

    el.set_fd(&source, new_raw, EventMask::READABLE).unwrap();

    // Both descriptors have pending data; only the new one is watched.
    old_peer.write_all(b"o").unwrap();
    new_peer.write_all(b"n").unwrap();

    let stopper = {
        let el2 = el.clone();
        el.source_alloc(move |_, _, _| el2.exit()).unwrap()
    };
    el.set_timeout(&stopper, Some(Duration::from_millis(100)), EventMask::ONCE)
        .unwrap();
    el.add(&stopper).unwrap();

    el.run();
    assert_eq!(count.get(), 1);
    drop(old_watched);

    el.source_free(&source);
    el.source_free(&stopper);
    el.close();
}

#[test]
fn unconfigured_source_never_fires_polling() {
    unconfigured_source_case("polling");
}

#[test]
fn unconfigured_source_never_fires_poll() {
    unconfigured_source_case("poll");
}

fn unconfigured_source_case(backend: &str) {
    let el = loop_for(backend);

    let count = Rc::new(Cell::new(0u32));
    let count2 = count.clone();
    let idle = el
        .source_alloc(move |_, _, _| count2.set(count2.get() + 1))
        .unwrap();
    // Legal: neither an fd nor a timeout configured.
    el.add(&idle).unwrap();

    let stopper = {
        let el2 = el.clone();
        el.source_alloc(move |_, _, _| el2.exit()).unwrap()
    };
    el.set_timeout(&stopper, Some(Duration::from_millis(40)), EventMask::ONCE)
        .unwrap();
    el.add(&stopper).unwrap();

    el.run();

    assert_eq!(count.get(), 0);
    assert!(idle.is_registered());

    el.source_free(&idle);
    el.source_free(&stopper);
    el.close();
}

#[test]
fn set_timeout_replaces_prior_interval_polling() {
    set_timeout_replace_case("polling");
}

#[test]
fn set_timeout_replaces_prior_interval_poll() {
    set_timeout_replace_case("poll");
}

fn set_timeout_replace_case(backend: &str) {
    let el = loop_for(backend);

    let count = Rc::new(Cell::new(0u32));
    let count2 = count.clone();
    let source = el
        .source_alloc(move |_, _, _| count2.set(count2.get() + 1))
        .unwrap();
    el.set_timeout(&source, Some(Duration::from_secs(300)), EventMask::ONCE)
        .unwrap();
    // Replacement, not stacking: only the short interval remains.
    el.set_timeout(&source, Some(Duration::from_millis(30)), EventMask::ONCE)
        .unwrap();
    el.add(&source).unwrap();

    let started = Instant::now();
    el.run();

    assert_eq!(count.get(), 1);
    assert!(started.elapsed() < Duration::from_secs(10));

    el.source_free(&source);
    el.close();
}
