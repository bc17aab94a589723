//! Event-driven dispatch over several channels.
//!
//! A [`ChannelListener`] owns an [`EpollSelector`] and a single worker
//! thread that waits for readiness, reads the ready channel and hands the
//! received bytes to the handler registered for that channel. The worker
//! starts with the first channel and stops once the last one is removed.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, NativeError};
use crate::select::{ChannelHandle, EpollSelector, Interest, NativeChannel, Registration};

/// Size of the buffer the worker reads ready channels into.
const RECV_BUFFER_SIZE: usize = 4096;

/// A channel a [`ChannelListener`] can poll and read.
pub trait PollChannel: NativeChannel + Send + Sync + 'static {
    /// Reads one message into `buf`, returning how many bytes arrived.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, NativeError>;

    /// Switches the channel between blocking and non-blocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), NativeError>;
}

/// Callback invoked with every message received on a channel.
pub type MessageHandler<C> = Box<dyn FnMut(&C, &[u8]) + Send>;

struct Entry<C> {
    channel: Arc<C>,
    handler: MessageHandler<C>,
    registration: Registration,
}

struct Shared<C> {
    selector: EpollSelector,
    timeout: Duration,
    running: AtomicBool,
    channels: Mutex<HashMap<RawFd, Entry<C>>>,
}

/// Dispatches received messages to per-channel handlers from a dedicated
/// worker thread.
pub struct ChannelListener<C: PollChannel> {
    shared: Arc<Shared<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: PollChannel> ChannelListener<C> {
    /// Creates a listener whose worker re-checks its shutdown state at the
    /// given poll timeout.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            shared: Arc::new(Shared {
                selector: EpollSelector::open()?,
                timeout,
                running: AtomicBool::new(false),
                channels: Mutex::new(HashMap::new()),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Adds a channel together with its message handler.
    ///
    /// The channel is forced into non-blocking mode and registered for read
    /// readiness; the worker thread starts if it is not already running.
    ///
    /// Handlers run on the worker thread with the channel table locked and
    /// must not call back into this listener.
    pub fn add_channel(
        &self,
        channel: Arc<C>,
        handler: impl FnMut(&C, &[u8]) + Send + 'static,
    ) -> Result<(), Error> {
        let fd = channel_fd(channel.as_ref())?;
        let mut channels = self.shared.channels.lock().unwrap();
        if channels.contains_key(&fd) {
            return Err(Error::AlreadyRegistered);
        }
        channel.set_nonblocking(true)?;
        let registration = self
            .shared
            .selector
            .register(channel.as_ref(), Interest::READ)?;
        channels.insert(
            fd,
            Entry {
                channel,
                handler: Box::new(handler),
                registration,
            },
        );
        drop(channels);
        self.start()
    }

    /// Removes a channel, cancelling its registration. The worker stops once
    /// no channels remain.
    pub fn remove_channel(&self, channel: &C) -> Result<(), Error> {
        let fd = channel_fd(channel)?;
        let mut channels = self.shared.channels.lock().unwrap();
        let entry = channels.remove(&fd).ok_or(Error::NotRegistered)?;
        self.shared.selector.cancel(&entry.registration)?;
        let empty = channels.is_empty();
        drop(channels);
        if empty {
            self.stop();
        }
        Ok(())
    }

    /// Stops the worker and closes the selector.
    pub fn close(&self) -> Result<(), Error> {
        self.stop();
        self.shared.selector.close()
    }

    fn start(&self) -> Result<(), Error> {
        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("can-listener".into())
            .spawn(move || run(shared))
            .map_err(|source| NativeError { op: "spawn", source })?;
        *worker = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        // unblock a wait in progress; a closed selector needs no wakeup
        let _ = self.shared.selector.wakeup();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl<C: PollChannel> Drop for ChannelListener<C> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to close listener: {err}");
        }
    }
}

fn channel_fd<C: NativeChannel + ?Sized>(channel: &C) -> Result<RawFd, Error> {
    match channel.handle() {
        ChannelHandle::Fd(handle) => Ok(handle.value()),
        ChannelHandle::Detached => Err(Error::UnsupportedHandle),
    }
}

fn run<C: PollChannel>(shared: Arc<Shared<C>>) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    while shared.running.load(Ordering::SeqCst) {
        if shared.channels.lock().unwrap().is_empty() {
            shared.running.store(false, Ordering::SeqCst);
            break;
        }

        let events = match shared.selector.select_timeout(shared.timeout) {
            Ok(events) => events,
            Err(Error::Closed(_)) => break,
            Err(err) => {
                log::error!("polling failed, stopping the listener worker: {err}");
                shared.running.store(false, Ordering::SeqCst);
                break;
            }
        };

        // events are handled in delivery order; a slow handler delays the
        // rest of the batch but never reorders it
        for event in events {
            let fd = event.registration().handle().value();
            let mut channels = shared.channels.lock().unwrap();
            let Some(entry) = channels.get_mut(&fd) else {
                log::warn!("dropping event for an untracked channel (fd {fd})");
                continue;
            };
            let Entry {
                channel, handler, ..
            } = entry;
            match channel.recv(&mut buf) {
                Ok(n) => {
                    let channel = Arc::clone(channel);
                    if catch_unwind(AssertUnwindSafe(|| handler(channel.as_ref(), &buf[..n])))
                        .is_err()
                    {
                        log::error!("message handler panicked (fd {fd})");
                    }
                }
                Err(err) if err.is_retryable() => {}
                Err(err) => {
                    log::error!("failed to read channel (fd {fd}): {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use crate::select::NativeHandle;

    struct TestChannel {
        stream: UnixStream,
    }

    impl TestChannel {
        fn pair() -> (Arc<Self>, UnixStream) {
            let (local, peer) = UnixStream::pair().unwrap();
            (Arc::new(Self { stream: local }), peer)
        }
    }

    impl NativeChannel for TestChannel {
        fn handle(&self) -> ChannelHandle {
            ChannelHandle::Fd(NativeHandle::new(self.stream.as_raw_fd()))
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    impl PollChannel for TestChannel {
        fn recv(&self, buf: &mut [u8]) -> Result<usize, NativeError> {
            (&self.stream).read(buf).map_err(|source| NativeError {
                op: "read",
                source,
            })
        }

        fn set_nonblocking(&self, nonblocking: bool) -> Result<(), NativeError> {
            self.stream
                .set_nonblocking(nonblocking)
                .map_err(|source| NativeError {
                    op: "fcntl",
                    source,
                })
        }
    }

    fn listener() -> ChannelListener<TestChannel> {
        ChannelListener::new(Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn messages_are_dispatched_to_their_handler() {
        let listener = listener();
        let (channel, mut peer) = TestChannel::pair();
        let (tx, rx) = mpsc::channel();

        listener
            .add_channel(Arc::clone(&channel), move |_, payload| {
                tx.send(payload.to_vec()).unwrap();
            })
            .unwrap();

        peer.write_all(&[0x11, 0x22, 0x33]).unwrap();
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, vec![0x11, 0x22, 0x33]);

        listener.remove_channel(&channel).unwrap();
    }

    #[test]
    fn each_channel_keeps_its_own_handler() {
        let listener = listener();
        let (first, mut first_peer) = TestChannel::pair();
        let (second, mut second_peer) = TestChannel::pair();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();

        listener
            .add_channel(Arc::clone(&first), move |_, payload| {
                tx.send((1u8, payload.to_vec())).unwrap();
            })
            .unwrap();
        listener
            .add_channel(Arc::clone(&second), move |_, payload| {
                tx2.send((2u8, payload.to_vec())).unwrap();
            })
            .unwrap();

        first_peer.write_all(b"one").unwrap();
        second_peer.write_all(b"two").unwrap();

        let mut received = vec![
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        ];
        received.sort();
        assert_eq!(
            received,
            vec![(1, b"one".to_vec()), (2, b"two".to_vec())]
        );
    }

    #[test]
    fn adding_a_channel_twice_fails() {
        let listener = listener();
        let (channel, _peer) = TestChannel::pair();

        listener
            .add_channel(Arc::clone(&channel), |_, _| {})
            .unwrap();
        assert!(matches!(
            listener.add_channel(Arc::clone(&channel), |_, _| {}),
            Err(Error::AlreadyRegistered)
        ));
    }

    #[test]
    fn removing_an_unknown_channel_fails() {
        let listener = listener();
        let (channel, _peer) = TestChannel::pair();

        assert!(matches!(
            listener.remove_channel(&channel),
            Err(Error::NotRegistered)
        ));
    }

    #[test]
    fn a_panicking_handler_does_not_stop_the_worker() {
        let listener = listener();
        let (channel, mut peer) = TestChannel::pair();
        let (tx, rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        listener
            .add_channel(Arc::clone(&channel), move |_, payload| {
                seen.fetch_add(1, Ordering::SeqCst);
                tx.send(payload.to_vec()).unwrap();
                panic!("handler failure");
            })
            .unwrap();

        peer.write_all(b"first").unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            b"first".to_vec()
        );

        // the worker survived the panic and still dispatches
        peer.write_all(b"second").unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            b"second".to_vec()
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn the_worker_restarts_after_the_last_channel_is_removed() {
        let listener = listener();
        let (channel, _peer) = TestChannel::pair();
        listener
            .add_channel(Arc::clone(&channel), |_, _| {})
            .unwrap();
        listener.remove_channel(&channel).unwrap();

        let (channel, mut peer) = TestChannel::pair();
        let (tx, rx) = mpsc::channel();
        listener
            .add_channel(Arc::clone(&channel), move |_, payload| {
                tx.send(payload.to_vec()).unwrap();
            })
            .unwrap();

        peer.write_all(b"again").unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            b"again".to_vec()
        );
    }
}
