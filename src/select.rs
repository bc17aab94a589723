//! Epoll-backed readiness multiplexer.
//!
//! The standard library offers no selector over arbitrary socket families,
//! and the CAN protocol sockets this crate deals in are exactly that, so the
//! multiplexing is built directly on the epoll API. An [`EpollSelector`]
//! tracks a set of channel registrations and turns `epoll_wait` results back
//! into [`IoEvent`]s against those registrations.
//!
//! Registrations are immutable values. Updating the interest set of a
//! channel yields a new [`Registration`]; every value of the same lineage
//! stays valid for [`cancel`](EpollSelector::cancel). A descriptor number
//! that the OS hands out again after a close starts a new lineage, so events
//! and cancellations can never be attributed to the channel that used to own
//! the number.
//!
//! See the [epoll man page](https://man7.org/linux/man-pages/man7/epoll.7.html).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bitflags::bitflags;
use libc::{c_int, epoll_event};

use crate::error::Error;
use crate::sys;

/// Identifies the OS resource behind a channel.
///
/// Purely an identity: the handle never owns the resource, and closing the
/// owning channel invalidates it without notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(RawFd);

impl NativeHandle {
    pub fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    /// The raw descriptor number.
    pub fn value(&self) -> RawFd {
        self.0
    }
}

/// The closed set of handle kinds a channel can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHandle {
    /// A channel backed by a pollable Unix file descriptor.
    Fd(NativeHandle),
    /// A channel without an OS resource behind it, e.g. an in-memory
    /// loopback. Selectors cannot poll these.
    Detached,
}

/// A channel whose underlying resource can be identified for multiplexing.
pub trait NativeChannel {
    /// The handle of the resource backing this channel.
    fn handle(&self) -> ChannelHandle;

    /// Whether the channel is still open. A selector refuses to register
    /// closed channels.
    fn is_open(&self) -> bool;
}

bitflags! {
    /// Channel operations that can be selected on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        /// The channel can be read.
        const READ = 0b01;
        /// The channel can be written.
        const WRITE = 0b10;
    }
}

impl Interest {
    fn to_epoll(self) -> u32 {
        let mut events = 0;
        if self.contains(Interest::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if self.contains(Interest::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn from_epoll(events: u32) -> Self {
        let mut interests = Interest::empty();
        if events & libc::EPOLLIN as u32 != 0 {
            interests |= Interest::READ;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            interests |= Interest::WRITE;
        }
        interests
    }
}

/// The association between a selector, a channel's handle and an interest
/// set.
///
/// Produced by [`EpollSelector::register`] and replaced, never mutated, by
/// [`EpollSelector::update`]. Values compare equal only within one lineage
/// and interest state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    selector: u64,
    serial: u64,
    handle: NativeHandle,
    interests: Interest,
}

impl Registration {
    /// The handle of the resource being selected.
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    /// The operations this registration was interested in when it was
    /// issued. Later updates do not reflect back into older values.
    pub fn interests(&self) -> Interest {
        self.interests
    }
}

/// One readiness notification out of a poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoEvent {
    registration: Registration,
    ready: Interest,
}

impl IoEvent {
    /// The registration the event belongs to.
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// The operations that are ready.
    pub fn ready(&self) -> Interest {
        self.ready
    }
}

const DEFAULT_MAX_EVENTS: usize = 100;

static NEXT_SELECTOR_ID: AtomicU64 = AtomicU64::new(1);

struct State {
    by_fd: HashMap<RawFd, Registration>,
    next_serial: u64,
}

/// The epoll-backed selector.
///
/// Registration, update, cancellation and wakeup may be called from any
/// thread at any time. The blocking wait itself runs on whichever thread
/// calls one of the select methods and never holds the registration lock;
/// exactly one thread should select at a time.
pub struct EpollSelector {
    id: u64,
    epoll_fd: RawFd,
    event_fd: RawFd,
    max_events: usize,
    open: AtomicBool,
    state: Mutex<State>,
}

impl EpollSelector {
    /// Opens a selector with the default event batch size.
    pub fn open() -> Result<Self, Error> {
        Self::open_with_capacity(DEFAULT_MAX_EVENTS)
    }

    /// Opens a selector returning at most `max_events` events per poll.
    pub fn open_with_capacity(max_events: usize) -> Result<Self, Error> {
        let epoll_fd = sys::epoll_create()?;
        let event_fd = match sys::eventfd() {
            Ok(fd) => fd,
            Err(err) => {
                let _ = sys::close(epoll_fd);
                return Err(err.into());
            }
        };
        // the wakeup resource is a permanent, internal member of the set
        if let Err(err) = sys::epoll_add(epoll_fd, event_fd, libc::EPOLLIN as u32) {
            let _ = sys::close(epoll_fd);
            let _ = sys::close(event_fd);
            return Err(err.into());
        }

        Ok(Self {
            id: NEXT_SELECTOR_ID.fetch_add(1, Ordering::Relaxed),
            epoll_fd,
            event_fd,
            max_events,
            open: AtomicBool::new(true),
            state: Mutex::new(State {
                by_fd: HashMap::new(),
                next_serial: 1,
            }),
        })
    }

    /// Whether the selector has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::Closed("selector"));
        }
        Ok(())
    }

    /// Registers a channel with the given interest set.
    ///
    /// An empty interest set is stored but not armed in the epoll set. A
    /// descriptor number that reappears after a close fully replaces the
    /// stale entry; the old registration values are dead from that point on.
    pub fn register<C>(&self, channel: &C, interests: Interest) -> Result<Registration, Error>
    where
        C: NativeChannel + ?Sized,
    {
        self.ensure_open()?;
        if !channel.is_open() {
            return Err(Error::Closed("channel"));
        }
        let handle = match channel.handle() {
            ChannelHandle::Fd(handle) => handle,
            ChannelHandle::Detached => return Err(Error::UnsupportedHandle),
        };
        let fd = handle.value();

        if !interests.is_empty() {
            sys::epoll_add(self.epoll_fd, fd, interests.to_epoll())?;
        }

        let mut state = self.state.lock().unwrap();
        let serial = state.next_serial;
        state.next_serial += 1;
        let registration = Registration {
            selector: self.id,
            serial,
            handle,
            interests,
        };
        state.by_fd.insert(fd, registration.clone());
        Ok(registration)
    }

    /// Replaces the interest set of a registration.
    ///
    /// Returns the new registration value; the one passed in stays valid for
    /// cancellation only. Values that have been cancelled or superseded by a
    /// reused descriptor are rejected with [`Error::StaleRegistration`].
    pub fn update(
        &self,
        registration: &Registration,
        interests: Interest,
    ) -> Result<Registration, Error> {
        self.ensure_open()?;
        if registration.selector != self.id {
            return Err(Error::StaleRegistration);
        }
        let fd = registration.handle.value();

        let mut state = self.state.lock().unwrap();
        let current = match state.by_fd.get(&fd) {
            Some(current) if current.serial == registration.serial => current.interests,
            _ => return Err(Error::StaleRegistration),
        };

        if current != interests {
            if interests.is_empty() {
                sys::epoll_del(self.epoll_fd, fd)?;
            } else if current.is_empty() {
                sys::epoll_add(self.epoll_fd, fd, interests.to_epoll())?;
            } else {
                sys::epoll_mod(self.epoll_fd, fd, interests.to_epoll())?;
            }
        }

        let updated = Registration {
            interests,
            ..registration.clone()
        };
        state.by_fd.insert(fd, updated.clone());
        Ok(updated)
    }

    /// Cancels a registration.
    ///
    /// Idempotent: returns `Ok(true)` only if this selector currently owned
    /// the registration and removed it. Cancelling an already-cancelled,
    /// superseded or foreign registration is a no-op returning `Ok(false)`.
    /// A cancelled registration is never matched to a readiness event again.
    pub fn cancel(&self, registration: &Registration) -> Result<bool, Error> {
        if registration.selector != self.id {
            return Ok(false);
        }
        let fd = registration.handle.value();

        let mut state = self.state.lock().unwrap();
        let current = match state.by_fd.get(&fd) {
            Some(current) if current.serial == registration.serial => current.interests,
            _ => return Ok(false),
        };
        state.by_fd.remove(&fd);
        if !current.is_empty() {
            sys::epoll_del(self.epoll_fd, fd)?;
        }
        Ok(true)
    }

    /// Blocks until at least one event or a wakeup arrives.
    pub fn select(&self) -> Result<Vec<IoEvent>, Error> {
        self.poll(None)
    }

    /// Blocks for at most `timeout`, possibly returning no events.
    pub fn select_timeout(&self, timeout: Duration) -> Result<Vec<IoEvent>, Error> {
        self.poll(Some(timeout))
    }

    /// Polls without blocking.
    pub fn select_now(&self) -> Result<Vec<IoEvent>, Error> {
        self.poll(Some(Duration::ZERO))
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<Vec<IoEvent>, Error> {
        self.ensure_open()?;
        let timeout_ms = match timeout {
            None => -1,
            Some(timeout) => c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX),
        };

        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.max_events];
        // the wait runs without the registration lock so register, update,
        // cancel and wakeup from other threads are never starved by it
        let n = sys::epoll_wait(self.epoll_fd, &mut events, timeout_ms)?;

        let state = self.state.lock().unwrap();
        let mut ready = Vec::with_capacity(n);
        for event in &events[..n] {
            let fd = event.u64 as RawFd;
            if fd == self.event_fd {
                sys::eventfd_clear(self.event_fd)?;
                continue;
            }
            // a registration cancelled while the wait was in flight is no
            // longer in the table and its event is dropped unseen
            if let Some(registration) = state.by_fd.get(&fd) {
                ready.push(IoEvent {
                    registration: registration.clone(),
                    ready: Interest::from_epoll(event.events),
                });
            }
        }
        Ok(ready)
    }

    /// Interrupts a blocked select call from another thread.
    ///
    /// The signal is latched: wakeups before the next wait coalesce into a
    /// single early return, and a wakeup with no wait in progress is
    /// consumed by the next one.
    pub fn wakeup(&self) -> Result<(), Error> {
        self.ensure_open()?;
        sys::eventfd_signal(self.event_fd)?;
        Ok(())
    }

    /// Releases the epoll and wakeup resources.
    ///
    /// Both release attempts are always made. If both fail, the reported
    /// error is the second failure with the first recorded as its suppressed
    /// cause. Closing an already-closed selector does nothing.
    pub fn close(&self) -> Result<(), Error> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let epoll_result = sys::close(self.epoll_fd);
        let event_result = sys::close(self.event_fd);
        match (epoll_result, event_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(primary), Ok(())) | (Ok(()), Err(primary)) => Err(Error::ShutdownFailed {
                primary,
                suppressed: None,
            }),
            (Err(suppressed), Err(primary)) => Err(Error::ShutdownFailed {
                primary,
                suppressed: Some(suppressed),
            }),
        }
    }
}

impl Drop for EpollSelector {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                log::warn!("failed to close selector: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Instant;

    struct TestChannel {
        stream: UnixStream,
        open: bool,
    }

    impl TestChannel {
        fn new(stream: UnixStream) -> Self {
            Self { stream, open: true }
        }
    }

    impl NativeChannel for TestChannel {
        fn handle(&self) -> ChannelHandle {
            ChannelHandle::Fd(NativeHandle::new(self.stream.as_raw_fd()))
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    struct DetachedChannel;

    impl NativeChannel for DetachedChannel {
        fn handle(&self) -> ChannelHandle {
            ChannelHandle::Detached
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn pair() -> (TestChannel, UnixStream) {
        let (local, peer) = UnixStream::pair().unwrap();
        (TestChannel::new(local), peer)
    }

    #[test]
    fn read_readiness_is_reported_once() {
        let selector = EpollSelector::open().unwrap();
        let (channel, mut peer) = pair();
        let registration = selector.register(&channel, Interest::READ).unwrap();

        peer.write_all(&[0x01]).unwrap();

        let events = selector.select_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].registration(), &registration);
        assert!(events[0].ready().contains(Interest::READ));
    }

    #[test]
    fn select_now_is_empty_without_events() {
        let selector = EpollSelector::open().unwrap();
        let (channel, _peer) = pair();
        selector.register(&channel, Interest::READ).unwrap();

        assert!(selector.select_now().unwrap().is_empty());
    }

    #[test]
    fn closed_channels_are_rejected() {
        let selector = EpollSelector::open().unwrap();
        let (mut channel, _peer) = pair();
        channel.open = false;

        assert!(matches!(
            selector.register(&channel, Interest::READ),
            Err(Error::Closed("channel"))
        ));
    }

    #[test]
    fn detached_handles_are_rejected() {
        let selector = EpollSelector::open().unwrap();
        assert!(matches!(
            selector.register(&DetachedChannel, Interest::READ),
            Err(Error::UnsupportedHandle)
        ));
    }

    #[test]
    fn wakeup_interrupts_a_blocked_select() {
        let selector = std::sync::Arc::new(EpollSelector::open().unwrap());
        let (channel, _peer) = pair();
        selector.register(&channel, Interest::READ).unwrap();

        let waker = std::sync::Arc::clone(&selector);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wakeup().unwrap();
        });

        let start = Instant::now();
        let events = selector.select_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        assert!(events.is_empty());
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn wakeups_coalesce_into_one_early_return() {
        let selector = EpollSelector::open().unwrap();
        selector.wakeup().unwrap();
        selector.wakeup().unwrap();
        selector.wakeup().unwrap();

        // the first poll consumes the latch, the second waits its timeout out
        assert!(selector.select_now().unwrap().is_empty());
        let start = Instant::now();
        assert!(selector
            .select_timeout(Duration::from_millis(50))
            .unwrap()
            .is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn cancel_is_idempotent_and_ownership_checked() {
        let selector = EpollSelector::open().unwrap();
        let other = EpollSelector::open().unwrap();
        let (channel, _peer) = pair();
        let registration = selector.register(&channel, Interest::READ).unwrap();

        assert!(!other.cancel(&registration).unwrap());
        assert!(selector.cancel(&registration).unwrap());
        assert!(!selector.cancel(&registration).unwrap());
    }

    #[test]
    fn cancelled_registrations_are_suppressed() {
        let selector = EpollSelector::open().unwrap();
        let (channel, mut peer) = pair();
        let registration = selector.register(&channel, Interest::READ).unwrap();

        peer.write_all(&[0xFF]).unwrap();
        assert!(selector.cancel(&registration).unwrap());

        assert!(selector.select_now().unwrap().is_empty());
    }

    #[test]
    fn interest_updates_produce_new_registrations() {
        let selector = EpollSelector::open().unwrap();
        let (channel, mut peer) = pair();

        // stored with empty interests: nothing is armed
        let registration = selector.register(&channel, Interest::empty()).unwrap();
        peer.write_all(&[0x0A]).unwrap();
        assert!(selector.select_now().unwrap().is_empty());

        // arming READ makes the pending byte visible
        let updated = selector.update(&registration, Interest::READ).unwrap();
        assert_eq!(updated.interests(), Interest::READ);
        let events = selector.select_now().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].registration(), &updated);

        // disarming silences it again
        selector.update(&updated, Interest::empty()).unwrap();
        assert!(selector.select_now().unwrap().is_empty());

        // the original value still cancels the lineage
        assert!(selector.cancel(&registration).unwrap());
        assert!(matches!(
            selector.update(&registration, Interest::READ),
            Err(Error::StaleRegistration)
        ));
    }

    #[test]
    fn write_readiness_is_translated() {
        let selector = EpollSelector::open().unwrap();
        let (channel, _peer) = pair();
        let registration = selector
            .register(&channel, Interest::READ | Interest::WRITE)
            .unwrap();

        // a fresh stream has buffer space, so WRITE is immediately ready
        let events = selector.select_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].registration(), &registration);
        assert!(events[0].ready().contains(Interest::WRITE));
        assert!(!events[0].ready().contains(Interest::READ));
    }

    #[test]
    fn descriptor_reuse_starts_a_fresh_lineage() {
        let selector = EpollSelector::open().unwrap();

        let (channel, peer) = pair();
        let reused_fd = channel.stream.as_raw_fd();
        let stale = selector.register(&channel, Interest::READ).unwrap();
        assert!(selector.cancel(&stale).unwrap());
        drop(channel);
        drop(peer);

        // the freed descriptor numbers are the lowest available, so a new
        // pair picks them right back up
        let mut reused = None;
        for _ in 0..64 {
            let (local, peer) = UnixStream::pair().unwrap();
            if local.as_raw_fd() == reused_fd {
                reused = Some((TestChannel::new(local), peer));
                break;
            }
            if peer.as_raw_fd() == reused_fd {
                reused = Some((TestChannel::new(peer), local));
                break;
            }
        }
        let Some((channel, mut peer)) = reused else {
            // another thread grabbed the number; nothing to verify here
            return;
        };

        let fresh = selector.register(&channel, Interest::READ).unwrap();
        peer.write_all(&[0x42]).unwrap();

        let events = selector.select_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].registration(), &fresh);
        assert_ne!(events[0].registration(), &stale);

        // the stale value can no longer cancel anything
        assert!(!selector.cancel(&stale).unwrap());
        assert!(selector.cancel(&fresh).unwrap());
    }

    #[test]
    fn close_is_idempotent_and_fails_later_selects() {
        let selector = EpollSelector::open().unwrap();
        selector.close().unwrap();
        selector.close().unwrap();

        assert!(matches!(selector.select_now(), Err(Error::Closed("selector"))));
        assert!(matches!(selector.wakeup(), Err(Error::Closed("selector"))));
    }
}
