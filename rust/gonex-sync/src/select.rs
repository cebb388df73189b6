//! Non-deterministic choice over channel operations.
//!
//! Cases are tried non-blocking in the order given; the first ready case
//! wins and its handler runs exactly once. With no ready case, a select
//! over any unbuffered channel races the blocking operations (polling can
//! never observe a transient rendezvous), while a purely buffered select
//! polls with exponential backoff, waiting on the channels' readiness
//! signals between rounds. An overall timeout resolves to `None` without
//! error.
//!
//! # Example
//! ```no_run
//! use gonex_sync::{recv_case, select_with_default, Channel};
//!
//! async fn example(a: Channel<i32>, b: Channel<i32>) {
//!     let picked = select_with_default(
//!         vec![
//!             recv_case(&a, |v| ("a", v)),
//!             recv_case(&b, |v| ("b", v)),
//!         ],
//!         || tracing::debug!("nothing ready"),
//!     )
//!     .await
//!     .unwrap();
//!     let _ = picked;
//! }
//! ```

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use gonex_core::{validate_timeout, GonexResult, Timeout};

use crate::channel::Channel;

/// Options accepted by [`select`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions {
    /// Overall deadline; expiry resolves the select to `None`.
    pub timeout: Timeout,
}

const BACKOFF_INITIAL: Duration = Duration::from_millis(1);
const BACKOFF_CAP: Duration = Duration::from_millis(100);

enum TryOutcome<R> {
    Ready(R),
    NotReady,
}

trait CaseOps<R>: Send {
    fn try_run(&mut self) -> TryOutcome<R>;
    fn is_unbuffered(&self) -> bool;
    fn subscribe(&self) -> BoxFuture<'static, ()>;
    fn into_blocking(self: Box<Self>) -> BoxFuture<'static, Option<R>>;
}

/// One arm of a [`select`]: a channel, an operation, and a handler run if
/// this arm wins.
pub struct SelectCase<R> {
    inner: Box<dyn CaseOps<R>>,
}

struct RecvCase<T, R> {
    ch: Channel<T>,
    handler: Option<Box<dyn FnOnce(Option<T>) -> R + Send>>,
}

impl<T: Send + 'static, R: Send + 'static> CaseOps<R> for RecvCase<T, R> {
    fn try_run(&mut self) -> TryOutcome<R> {
        if let Some(v) = self.ch.try_receive() {
            let Some(handler) = self.handler.take() else {
                return TryOutcome::NotReady;
            };
            return TryOutcome::Ready(handler(Some(v)));
        }
        if self.ch.is_closed() {
            // A closed channel is always ready to receive its zero value.
            let Some(handler) = self.handler.take() else {
                return TryOutcome::NotReady;
            };
            return TryOutcome::Ready(handler(None));
        }
        TryOutcome::NotReady
    }

    fn is_unbuffered(&self) -> bool {
        self.ch.capacity() == 0
    }

    fn subscribe(&self) -> BoxFuture<'static, ()> {
        let ch = self.ch.clone();
        async move { ch.readiness_changed().await }.boxed()
    }

    fn into_blocking(mut self: Box<Self>) -> BoxFuture<'static, Option<R>> {
        let ch = self.ch.clone();
        let handler = self.handler.take();
        async move {
            let handler = handler?;
            match ch.receive_timeout(Timeout::INFINITE).await {
                Ok(v) => Some(handler(v)),
                Err(_) => None,
            }
        }
        .boxed()
    }
}

struct SendCase<T, R> {
    ch: Channel<T>,
    value: Option<T>,
    handler: Option<Box<dyn FnOnce() -> R + Send>>,
}

impl<T: Send + 'static, R: Send + 'static> CaseOps<R> for SendCase<T, R> {
    fn try_run(&mut self) -> TryOutcome<R> {
        let Some(value) = self.value.take() else {
            return TryOutcome::NotReady;
        };
        match self.ch.try_send_reclaim(value) {
            Ok(Ok(())) => match self.handler.take() {
                Some(handler) => TryOutcome::Ready(handler()),
                None => TryOutcome::NotReady,
            },
            Ok(Err(back)) => {
                self.value = Some(back);
                TryOutcome::NotReady
            }
            // A closed channel can never complete this send; the case goes
            // permanently quiet rather than erroring the whole select.
            Err(_closed) => TryOutcome::NotReady,
        }
    }

    fn is_unbuffered(&self) -> bool {
        self.ch.capacity() == 0
    }

    fn subscribe(&self) -> BoxFuture<'static, ()> {
        let ch = self.ch.clone();
        async move { ch.readiness_changed().await }.boxed()
    }

    fn into_blocking(mut self: Box<Self>) -> BoxFuture<'static, Option<R>> {
        let ch = self.ch.clone();
        let value = self.value.take();
        let handler = self.handler.take();
        async move {
            let (value, handler) = (value?, handler?);
            match ch.send_timeout(value, Timeout::INFINITE).await {
                Ok(()) => Some(handler()),
                Err(_) => None,
            }
        }
        .boxed()
    }
}

/// A receive arm; the handler sees `Some(value)` or `None` when the channel
/// is closed and drained.
pub fn recv_case<T, R>(
    ch: &Channel<T>,
    handler: impl FnOnce(Option<T>) -> R + Send + 'static,
) -> SelectCase<R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    SelectCase {
        inner: Box::new(RecvCase {
            ch: ch.clone(),
            handler: Some(Box::new(handler)),
        }),
    }
}

/// A send arm; the handler runs after the value is delivered.
pub fn send_case<T, R>(
    ch: &Channel<T>,
    value: T,
    handler: impl FnOnce() -> R + Send + 'static,
) -> SelectCase<R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    SelectCase {
        inner: Box::new(SendCase {
            ch: ch.clone(),
            value: Some(value),
            handler: Some(Box::new(handler)),
        }),
    }
}

/// Wait until one case completes or the timeout elapses. `Ok(None)` on
/// timeout; no error is raised for it.
pub async fn select<R: Send + 'static>(
    mut cases: Vec<SelectCase<R>>,
    options: SelectOptions,
) -> GonexResult<Option<R>> {
    validate_timeout(options.timeout.as_millis())?;
    if cases.is_empty() {
        return Ok(None);
    }

    // Fast scan in declaration order.
    for case in &mut cases {
        if let TryOutcome::Ready(r) = case.inner.try_run() {
            return Ok(Some(r));
        }
    }

    let deadline = options.timeout.deadline();

    if cases.iter().any(|c| c.inner.is_unbuffered()) {
        // Election by racing the blocking operations; the first completion
        // wins and dropping the rest unregisters their waiters.
        let race = async move {
            let mut futs: Vec<BoxFuture<'static, Option<R>>> =
                cases.into_iter().map(|c| c.inner.into_blocking()).collect();
            while !futs.is_empty() {
                let (res, _idx, rest) = futures::future::select_all(futs).await;
                if let Some(r) = res {
                    return Some(r);
                }
                // That case failed terminally (e.g. its channel closed while
                // sending); keep racing the rest.
                futs = rest;
            }
            None
        };
        return match deadline {
            Some(d) => Ok(tokio::time::timeout_at(d.into(), race)
                .await
                .unwrap_or(None)),
            None => Ok(race.await),
        };
    }

    // Buffered-only election: poll with exponential backoff, sleeping on
    // the channels' readiness signals between rounds.
    let mut backoff = BACKOFF_INITIAL;
    loop {
        for case in &mut cases {
            if let TryOutcome::Ready(r) = case.inner.try_run() {
                return Ok(Some(r));
            }
        }
        let mut wait = backoff;
        if let Some(d) = deadline {
            let now = std::time::Instant::now();
            if now >= d {
                return Ok(None);
            }
            wait = wait.min(d - now);
        }
        let wakeups = futures::future::select_all(
            cases
                .iter()
                .map(|c| c.inner.subscribe())
                .collect::<Vec<_>>(),
        );
        let _ = tokio::time::timeout(wait, wakeups).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// Try every case once; with none ready, run `default` and resolve `None`.
pub async fn select_with_default<R: Send + 'static>(
    mut cases: Vec<SelectCase<R>>,
    default: impl FnOnce() + Send,
) -> GonexResult<Option<R>> {
    for case in &mut cases {
        if let TryOutcome::Ready(r) = case.inner.try_run() {
            return Ok(Some(r));
        }
    }
    default();
    Ok(None)
}

/// [`select`] with an explicit timeout in milliseconds.
pub async fn select_with_timeout<R: Send + 'static>(
    cases: Vec<SelectCase<R>>,
    timeout_ms: i64,
) -> GonexResult<Option<R>> {
    let timeout = Timeout::from_millis(timeout_ms)?;
    select(cases, SelectOptions { timeout }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fast_scan_prefers_declaration_order() {
        let a: Channel<i32> = Channel::bounded(1);
        let b: Channel<i32> = Channel::bounded(1);
        a.send(1).await.unwrap();
        b.send(2).await.unwrap();

        let r = select(
            vec![recv_case(&a, |v| ("a", v)), recv_case(&b, |v| ("b", v))],
            SelectOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(r, Some(("a", Some(1))));
        // b untouched.
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_default_runs_when_nothing_ready() {
        let a: Channel<i32> = Channel::bounded(0);
        let b: Channel<i32> = Channel::bounded(0);
        let marked = Arc::new(AtomicBool::new(false));
        let m = marked.clone();

        let r = select_with_default(
            vec![recv_case(&a, |v| v), recv_case(&b, |v| v)],
            move || m.store(true, Ordering::SeqCst),
        )
        .await
        .unwrap();
        assert_eq!(r, None);
        assert!(marked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_default_skipped_when_case_ready() {
        let a: Channel<i32> = Channel::bounded(1);
        a.send(5).await.unwrap();
        let marked = Arc::new(AtomicBool::new(false));
        let m = marked.clone();

        let r = select_with_default(vec![recv_case(&a, |v| v)], move || {
            m.store(true, Ordering::SeqCst)
        })
        .await
        .unwrap();
        assert_eq!(r, Some(Some(5)));
        assert!(!marked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_resolves_none_without_error() {
        let a: Channel<i32> = Channel::bounded(1);
        let r = select_with_timeout(vec![recv_case(&a, |v| v)], 40)
            .await
            .unwrap();
        assert_eq!(r, None);
    }

    #[tokio::test]
    async fn test_unbuffered_race_observes_rendezvous() {
        let a: Channel<i32> = Channel::bounded(0);
        let sender = {
            let a = a.clone();
            tokio::spawn(async move {
                crate::time::sleep(30).await;
                a.send_timeout(9, Timeout::INFINITE).await
            })
        };
        let r = select_with_timeout(vec![recv_case(&a, |v| v)], 5_000)
            .await
            .unwrap();
        assert_eq!(r, Some(Some(9)));
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_case_wins_when_capacity_opens() {
        let a: Channel<i32> = Channel::bounded(1);
        a.send(1).await.unwrap();
        let drainer = {
            let a = a.clone();
            tokio::spawn(async move {
                crate::time::sleep(30).await;
                a.receive_timeout(Timeout::INFINITE).await
            })
        };
        let r = select_with_timeout(vec![send_case(&a, 2, || "sent")], 5_000)
            .await
            .unwrap();
        assert_eq!(r, Some("sent"));
        assert_eq!(drainer.await.unwrap().unwrap(), Some(1));
        assert_eq!(a.try_receive(), Some(2));
    }

    #[tokio::test]
    async fn test_closed_receive_case_is_ready() {
        let a: Channel<i32> = Channel::bounded(0);
        a.close();
        let r = select(
            vec![recv_case(&a, |v| v.is_none())],
            SelectOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(r, Some(true));
    }

    #[tokio::test]
    async fn test_losing_case_leaves_no_waiter() {
        let a: Channel<i32> = Channel::bounded(0);
        let b: Channel<i32> = Channel::bounded(0);
        let sender = {
            let b = b.clone();
            tokio::spawn(async move {
                crate::time::sleep(20).await;
                b.send_timeout(1, Timeout::INFINITE).await
            })
        };
        let r = select_with_timeout(
            vec![recv_case(&a, |_| "a"), recv_case(&b, |_| "b")],
            5_000,
        )
        .await
        .unwrap();
        assert_eq!(r, Some("b"));
        sender.await.unwrap().unwrap();

        // The losing case on `a` must have unregistered: a fresh send pairs
        // with a fresh receiver, not a ghost.
        assert!(!a.try_send(7).unwrap());
    }
}
