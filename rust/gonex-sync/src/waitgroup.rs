//! Barrier accumulator: `wait` completes when the counter reaches zero.
//!
//! Errors reported through [`WaitGroup::add_error`] settle waiters early and
//! surface from `wait`: a single error unwrapped, several as an aggregate.

use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;

use gonex_core::{validate_timeout, GonexError, GonexResult, Timeout};

struct State {
    counter: i64,
    errors: Vec<GonexError>,
    waiters: Vec<oneshot::Sender<Option<GonexError>>>,
}

/// A Go-style wait group. Cloning shares the same counter.
#[derive(Clone)]
pub struct WaitGroup {
    state: Arc<PlMutex<State>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            state: Arc::new(PlMutex::new(State {
                counter: 0,
                errors: Vec::new(),
                waiters: Vec::new(),
            })),
        }
    }

    /// Adjust the counter by `delta`. Driving it below zero is a contract
    /// error and leaves the counter unchanged.
    pub fn add(&self, delta: i64) -> GonexResult<()> {
        let settled = {
            let mut st = self.state.lock();
            if st.counter + delta < 0 {
                return Err(GonexError::WaitGroupNegativeCounter {
                    counter: st.counter,
                    delta,
                });
            }
            st.counter += delta;
            if st.counter == 0 {
                Self::take_settlement(&mut st)
            } else {
                None
            }
        };
        if let Some((waiters, result)) = settled {
            for w in waiters {
                let _ = w.send(result.clone());
            }
        }
        Ok(())
    }

    /// Equivalent to `add(-1)`.
    pub fn done(&self) -> GonexResult<()> {
        self.add(-1)
    }

    /// Record a failure. Pending waiters settle immediately with the
    /// aggregated error.
    pub fn add_error(&self, error: GonexError) {
        let (waiters, result) = {
            let mut st = self.state.lock();
            st.errors.push(error);
            let waiters = std::mem::take(&mut st.waiters);
            (waiters, GonexError::aggregate(st.errors.clone()))
        };
        for w in waiters {
            let _ = w.send(result.clone());
        }
    }

    pub fn counter(&self) -> i64 {
        self.state.lock().counter
    }

    /// Wait until the counter reaches zero or an error is reported.
    pub async fn wait(&self) -> GonexResult<()> {
        self.wait_timeout(Timeout::INFINITE).await
    }

    /// Wait with a deadline. Expiry affects only this waiter.
    pub async fn wait_timeout(&self, timeout: Timeout) -> GonexResult<()> {
        validate_timeout(timeout.as_millis())?;
        let rx = {
            let mut st = self.state.lock();
            if st.counter == 0 || !st.errors.is_empty() {
                return match GonexError::aggregate(st.errors.clone()) {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push(tx);
            rx
        };
        let outcome = match timeout.as_duration() {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(res) => res,
                Err(_elapsed) => {
                    return Err(GonexError::WaitGroupTimeout {
                        timeout_ms: timeout.as_millis(),
                    });
                }
            },
            None => rx.await,
        };
        match outcome {
            Ok(Some(err)) => Err(err),
            Ok(None) => Ok(()),
            Err(_) => Err(GonexError::Internal {
                message: "wait group settled without a result".to_string(),
            }),
        }
    }

    /// Counter hit zero: detach waiters with the final verdict. Caller holds
    /// the state lock.
    #[allow(clippy::type_complexity)]
    fn take_settlement(
        st: &mut State,
    ) -> Option<(Vec<oneshot::Sender<Option<GonexError>>>, Option<GonexError>)> {
        let waiters = std::mem::take(&mut st.waiters);
        let result = GonexError::aggregate(st.errors.clone());
        Some((waiters, result))
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}
