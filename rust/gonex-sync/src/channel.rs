//! Typed FIFO channel with bounded capacity.
//!
//! Capacity 0 is a rendezvous: a send completes only when a receiver takes
//! the value. Buffered channels enqueue until full, then the sender joins a
//! FIFO waiter queue. A receive always pairs with the earliest eligible
//! sender before the buffer is consulted on refill, and a send always pairs
//! with the earliest waiting receiver before buffering.
//!
//! # Example
//! ```no_run
//! use gonex_sync::Channel;
//!
//! async fn example() {
//!     let ch: Channel<i32> = Channel::bounded(2);
//!     ch.send(1).await.unwrap();
//!     assert_eq!(ch.receive().await.unwrap(), Some(1));
//!     ch.close();
//!     assert_eq!(ch.receive().await.unwrap(), None);
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use gonex_core::{validate_timeout, CircularQueue, GonexError, GonexResult, Timeout};

use crate::waiter::next_waiter_id;

/// Options accepted by [`Channel::with_options`].
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Buffer capacity; 0 means rendezvous.
    pub capacity: usize,
    /// Default timeout applied when send/receive is called without one.
    pub default_timeout: Timeout,
    /// Diagnostic name carried into errors and logs.
    pub name: Option<String>,
}

struct SendWaiter<T> {
    id: u64,
    value: Option<T>,
    tx: oneshot::Sender<GonexResult<()>>,
}

struct RecvWaiter<T> {
    id: u64,
    tx: oneshot::Sender<Option<T>>,
}

struct State<T> {
    buffer: CircularQueue<T>,
    send_waiters: VecDeque<SendWaiter<T>>,
    recv_waiters: VecDeque<RecvWaiter<T>>,
    closed: bool,
}

struct Shared<T> {
    state: PlMutex<State<T>>,
    /// Pinged on every state transition; `select` subscribes to this instead
    /// of blind-polling buffered channels.
    readiness: Notify,
    capacity: usize,
    default_timeout: Timeout,
    name: Option<String>,
    id: Uuid,
}

/// A typed FIFO channel. Cloning shares the same underlying channel.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("capacity", &self.shared.capacity)
            .field("name", &self.shared.name)
            .finish()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// A buffered channel with the given capacity (0 = rendezvous) and no
    /// default timeout.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_options(ChannelOptions {
            capacity,
            ..ChannelOptions::default()
        })
    }

    pub fn with_options(options: ChannelOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: PlMutex::new(State {
                    buffer: CircularQueue::new(options.capacity),
                    send_waiters: VecDeque::new(),
                    recv_waiters: VecDeque::new(),
                    closed: false,
                }),
                readiness: Notify::new(),
                capacity: options.capacity,
                default_timeout: options.default_timeout,
                name: options.name,
                id: Uuid::new_v4(),
            }),
        }
    }

    /// Stable identity of the underlying channel, used by the marshal layer.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Send with the channel's default timeout.
    pub async fn send(&self, value: T) -> GonexResult<()> {
        self.send_timeout(value, self.shared.default_timeout).await
    }

    /// Send with an explicit timeout. Pairs with the earliest waiting
    /// receiver first; buffers otherwise; waits FIFO when full.
    pub async fn send_timeout(&self, value: T, timeout: Timeout) -> GonexResult<()> {
        validate_timeout(timeout.as_millis())?;
        let (id, rx) = {
            let mut st = self.shared.state.lock();
            if st.closed {
                return Err(self.closed_error());
            }
            match Self::deliver_locked(&mut st, value) {
                Ok(()) => {
                    drop(st);
                    self.shared.readiness.notify_waiters();
                    return Ok(());
                }
                Err(back) => {
                    let (tx, rx) = oneshot::channel();
                    let id = next_waiter_id();
                    st.send_waiters.push_back(SendWaiter {
                        id,
                        value: Some(back),
                        tx,
                    });
                    (id, rx)
                }
            }
        };

        let mut wait = SendWait {
            shared: &self.shared,
            id,
            rx,
            settled: false,
        };
        let outcome = match timeout.as_duration() {
            Some(d) => match tokio::time::timeout(d, &mut wait.rx).await {
                Ok(res) => res,
                Err(_elapsed) => {
                    wait.settled = true;
                    return self.resolve_send_timeout(id, &mut wait.rx, timeout);
                }
            },
            None => (&mut wait.rx).await,
        };
        wait.settled = true;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(GonexError::Internal {
                message: "send waiter dropped without a grant".to_string(),
            }),
        }
    }

    /// Non-blocking send. `Ok(true)` on delivery, `Ok(false)` when the
    /// channel is full with no receiver waiting, `Err(ChannelClosed)` after
    /// close.
    pub fn try_send(&self, value: T) -> GonexResult<bool> {
        match self.try_send_reclaim(value)? {
            Ok(()) => Ok(true),
            Err(_back) => Ok(false),
        }
    }

    /// Non-blocking send that hands the value back on a full buffer, so the
    /// caller can retry without cloning. `select` leans on this.
    pub fn try_send_reclaim(&self, value: T) -> GonexResult<Result<(), T>> {
        let mut st = self.shared.state.lock();
        if st.closed {
            return Err(self.closed_error());
        }
        match Self::deliver_locked(&mut st, value) {
            Ok(()) => {
                drop(st);
                self.shared.readiness.notify_waiters();
                Ok(Ok(()))
            }
            Err(back) => Ok(Err(back)),
        }
    }

    /// Non-blocking send that reports a full buffer as an error instead of
    /// `false`.
    pub fn try_send_or_err(&self, value: T) -> GonexResult<()> {
        match self.try_send(value)? {
            true => Ok(()),
            false => Err(GonexError::ChannelBufferFull {
                capacity: self.shared.capacity,
            }),
        }
    }

    /// Receive with the channel's default timeout.
    pub async fn receive(&self) -> GonexResult<Option<T>> {
        self.receive_timeout(self.shared.default_timeout).await
    }

    /// Receive with an explicit timeout. `Ok(None)` means closed-and-empty.
    pub async fn receive_timeout(&self, timeout: Timeout) -> GonexResult<Option<T>> {
        validate_timeout(timeout.as_millis())?;
        let (id, rx) = {
            let mut st = self.shared.state.lock();
            if let Some(v) = Self::dequeue_locked(&mut st) {
                drop(st);
                self.shared.readiness.notify_waiters();
                return Ok(Some(v));
            }
            if st.closed {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            let id = next_waiter_id();
            st.recv_waiters.push_back(RecvWaiter { id, tx });
            (id, rx)
        };

        let mut wait = RecvWait {
            shared: &self.shared,
            id,
            rx,
            settled: false,
        };
        let outcome = match timeout.as_duration() {
            Some(d) => match tokio::time::timeout(d, &mut wait.rx).await {
                Ok(res) => res,
                Err(_elapsed) => {
                    wait.settled = true;
                    return self.resolve_receive_timeout(id, &mut wait.rx, timeout);
                }
            },
            None => (&mut wait.rx).await,
        };
        wait.settled = true;
        match outcome {
            Ok(value) => Ok(value),
            Err(_) => Err(GonexError::Internal {
                message: "receive waiter dropped without a grant".to_string(),
            }),
        }
    }

    /// Non-blocking receive; `None` when nothing is ready.
    pub fn try_receive(&self) -> Option<T> {
        let mut st = self.shared.state.lock();
        let v = Self::dequeue_locked(&mut st);
        if v.is_some() {
            drop(st);
            self.shared.readiness.notify_waiters();
        }
        v
    }

    /// Close the channel. New and pending sends fail with `ChannelClosed`,
    /// pending receives resolve `None`, and buffered values are dropped.
    /// Idempotent.
    pub fn close(&self) {
        let (senders, receivers) = {
            let mut st = self.shared.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.buffer.clear();
            (
                std::mem::take(&mut st.send_waiters),
                std::mem::take(&mut st.recv_waiters),
            )
        };
        for sw in senders {
            let _ = sw.tx.send(Err(self.closed_error()));
        }
        for rw in receivers {
            let _ = rw.tx.send(None);
        }
        self.shared.readiness.notify_waiters();
    }

    /// Resolves when the channel's state changes (a send, receive, or close
    /// happened since this call). Readiness hook for `select`.
    pub async fn readiness_changed(&self) {
        self.shared.readiness.notified().await;
    }

    fn closed_error(&self) -> GonexError {
        GonexError::ChannelClosed {
            name: self.shared.name.clone(),
        }
    }

    /// Deliver a value under the lock: earliest live receive-waiter first,
    /// then the buffer. Gives the value back when neither can take it.
    fn deliver_locked(st: &mut State<T>, value: T) -> Result<(), T> {
        let mut v = value;
        while let Some(rw) = st.recv_waiters.pop_front() {
            match rw.tx.send(Some(v)) {
                Ok(()) => return Ok(()),
                // Receiver future is gone; its slot is dead. Try the next.
                Err(payload) => match payload {
                    Some(back) => v = back,
                    None => return Ok(()),
                },
            }
        }
        st.buffer.push(v)
    }

    /// Pop a value under the lock: buffered values first (refilling from the
    /// earliest live send-waiter), then a rendezvous with a waiting sender.
    fn dequeue_locked(st: &mut State<T>) -> Option<T> {
        if let Some(v) = st.buffer.pop() {
            // A slot opened; complete the earliest sender into it. A dead tx
            // is an orphan waiter kept only for its value; the value still
            // transfers.
            while let Some(mut sw) = st.send_waiters.pop_front() {
                let Some(value) = sw.value.take() else { continue };
                match st.buffer.push(value) {
                    Ok(()) => {
                        let _ = sw.tx.send(Ok(()));
                        break;
                    }
                    Err(back) => {
                        sw.value = Some(back);
                        st.send_waiters.push_front(sw);
                        break;
                    }
                }
            }
            return Some(v);
        }
        // Empty buffer: rendezvous directly with the earliest sender.
        while let Some(mut sw) = st.send_waiters.pop_front() {
            let Some(value) = sw.value.take() else { continue };
            let _ = sw.tx.send(Ok(()));
            return Some(value);
        }
        None
    }

    /// Put back a value whose receiver vanished after the grant, so exactly
    /// one party still observes it.
    fn redeliver_locked(st: &mut State<T>, value: T) {
        if st.closed {
            // Closed channels drop buffered values; this one follows them.
            return;
        }
        match Self::deliver_locked(st, value) {
            Ok(()) => {}
            Err(back) => match st.buffer.push_front(back) {
                Ok(()) => {}
                Err(back) => {
                    // No room anywhere: park it as an orphan send-waiter at
                    // the front of the queue, where the next dequeue finds it
                    // before younger senders.
                    let (tx, _rx) = oneshot::channel();
                    st.send_waiters.push_front(SendWaiter {
                        id: next_waiter_id(),
                        value: Some(back),
                        tx,
                    });
                }
            },
        }
    }

    /// A send timed out; either remove our waiter or, if a grant slipped in
    /// first, report what the grant said. Grants are sent under the state
    /// lock, so once we hold it `try_recv` is authoritative.
    fn resolve_send_timeout(
        &self,
        id: u64,
        rx: &mut oneshot::Receiver<GonexResult<()>>,
        timeout: Timeout,
    ) -> GonexResult<()> {
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.send_waiters.iter().position(|w| w.id == id) {
            st.send_waiters.remove(pos);
            return Err(GonexError::ChannelTimeout {
                timeout_ms: timeout.as_millis(),
            });
        }
        match rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(GonexError::Internal {
                message: "send waiter vanished without a grant".to_string(),
            }),
        }
    }

    fn resolve_receive_timeout(
        &self,
        id: u64,
        rx: &mut oneshot::Receiver<Option<T>>,
        timeout: Timeout,
    ) -> GonexResult<Option<T>> {
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.recv_waiters.iter().position(|w| w.id == id) {
            st.recv_waiters.remove(pos);
            return Err(GonexError::ChannelTimeout {
                timeout_ms: timeout.as_millis(),
            });
        }
        match rx.try_recv() {
            Ok(value) => Ok(value),
            Err(_) => Err(GonexError::Internal {
                message: "receive waiter vanished without a grant".to_string(),
            }),
        }
    }
}

/// Unregisters a send future that was dropped mid-wait. If the grant already
/// happened the value transferred and there is nothing to undo.
struct SendWait<'a, T> {
    shared: &'a Shared<T>,
    id: u64,
    rx: oneshot::Receiver<GonexResult<()>>,
    settled: bool,
}

impl<T> Drop for SendWait<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.send_waiters.iter().position(|w| w.id == self.id) {
            st.send_waiters.remove(pos);
        }
    }
}

/// Unregisters a receive future that was dropped mid-wait, redelivering a
/// concurrently granted value so it is observed by exactly one party.
struct RecvWait<'a, T: Send + 'static> {
    shared: &'a Shared<T>,
    id: u64,
    rx: oneshot::Receiver<Option<T>>,
    settled: bool,
}

impl<T: Send + 'static> Drop for RecvWait<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.recv_waiters.iter().position(|w| w.id == self.id) {
            st.recv_waiters.remove(pos);
            return;
        }
        if let Ok(Some(value)) = self.rx.try_recv() {
            Channel::redeliver_locked(&mut st, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonex_core::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_buffered_send_receive() {
        let ch: Channel<i32> = Channel::bounded(2);
        ch.send(1).await.unwrap();
        ch.send(2).await.unwrap();
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.receive().await.unwrap(), Some(1));
        assert_eq!(ch.receive().await.unwrap(), Some(2));
        assert_eq!(ch.len(), 0);
    }

    #[tokio::test]
    async fn test_rendezvous_blocks_until_receiver() {
        let ch: Channel<i32> = Channel::bounded(0);
        let sender = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.send_timeout(42, Timeout::INFINITE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());
        assert_eq!(
            ch.receive_timeout(Timeout::INFINITE).await.unwrap(),
            Some(42)
        );
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_prefers_waiting_receiver_over_buffer() {
        let ch: Channel<i32> = Channel::bounded(4);
        let receiver = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.receive_timeout(Timeout::INFINITE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.send(7).await.unwrap();
        assert_eq!(receiver.await.unwrap().unwrap(), Some(7));
        // Delivered directly, never buffered.
        assert_eq!(ch.len(), 0);
    }

    #[tokio::test]
    async fn test_sender_fifo_preserved_on_refill() {
        let ch: Channel<i32> = Channel::bounded(1);
        ch.send(1).await.unwrap();
        let mut blocked = Vec::new();
        for v in [2, 3] {
            let ch = ch.clone();
            blocked.push(tokio::spawn(async move {
                ch.send_timeout(v, Timeout::INFINITE).await
            }));
            // Serialize the spawns so the waiter queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(ch.receive().await.unwrap());
        }
        assert_eq!(got, vec![Some(1), Some(2), Some(3)]);
        for h in blocked {
            h.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_rejects_pending_send_and_resolves_receives() {
        let ch: Channel<i32> = Channel::bounded(0);
        let pending_send = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.send_timeout(1, Timeout::INFINITE).await })
        };
        let other: Channel<u8> = Channel::bounded(0);
        let pending_recv = {
            let other = other.clone();
            tokio::spawn(async move { other.receive_timeout(Timeout::INFINITE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.close();
        other.close();
        let err = pending_send.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
        assert_eq!(pending_recv.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_drops_buffered_values() {
        let ch: Channel<i32> = Channel::bounded(4);
        ch.send(1).await.unwrap();
        ch.send(2).await.unwrap();
        ch.close();
        assert_eq!(ch.len(), 0);
        assert_eq!(ch.receive().await.unwrap(), None);
        let err = ch.send(3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    }

    #[tokio::test]
    async fn test_receive_timeout_expires() {
        let ch: Channel<i32> = Channel::bounded(1);
        let err = ch
            .receive_timeout(Timeout::from_millis(30).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelTimeout);
        // Other operations unaffected afterwards.
        ch.send(5).await.unwrap();
        assert_eq!(ch.receive().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_try_variants() {
        let ch: Channel<i32> = Channel::bounded(1);
        assert!(ch.try_send(1).unwrap());
        assert!(!ch.try_send(2).unwrap());
        assert_eq!(
            ch.try_send_or_err(2).unwrap_err().kind(),
            ErrorKind::ChannelBufferFull
        );
        assert_eq!(ch.try_receive(), Some(1));
        assert_eq!(ch.try_receive(), None);
        ch.close();
        assert_eq!(ch.try_send(3).unwrap_err().kind(), ErrorKind::ChannelClosed);
    }

    #[tokio::test]
    async fn test_cancelled_receive_leaves_no_waiter() {
        let ch: Channel<i32> = Channel::bounded(0);
        {
            let recv = ch.receive_timeout(Timeout::INFINITE);
            tokio::pin!(recv);
            // Poll once so the waiter registers, then drop the future.
            let _ = futures::poll!(recv.as_mut());
        }
        // The dead waiter must not swallow a later send.
        assert!(!ch.try_send(9).unwrap());
        let recv = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.receive_timeout(Timeout::INFINITE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ch.try_send(9).unwrap());
        assert_eq!(recv.await.unwrap().unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_length_never_exceeds_capacity() {
        let ch: Channel<i32> = Channel::bounded(3);
        for i in 0..3 {
            ch.send(i).await.unwrap();
        }
        assert_eq!(ch.len(), ch.capacity());
        assert!(!ch.try_send(99).unwrap());
        assert_eq!(ch.len(), 3);
    }
}
