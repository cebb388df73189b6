//! Cancellation and value propagation along a context tree.
//!
//! A context is a node in a tree. Cancelling a node cancels its children
//! with the same cause, no later than the parent. `err()` is monotonic:
//! once non-`None` it never reverts. Value lookup walks the parent chain
//! and the nearest binding wins.
//!
//! # Example
//! ```no_run
//! use gonex_sync::context;
//!
//! async fn example() {
//!     let (ctx, canceler) = context::with_cancel(&context::background());
//!     tokio::spawn({
//!         let ctx = ctx.clone();
//!         async move {
//!             ctx.done().await;
//!             tracing::info!("cancelled: {:?}", ctx.err());
//!         }
//!     });
//!     canceler.cancel();
//! }
//! ```

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as PlMutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use gonex_core::{validate_timeout, GonexError, GonexResult, Timeout};

/// Values carried by a context. Stored type-erased; read back with
/// [`Context::value_as`].
pub type ContextValue = Arc<dyn Any + Send + Sync>;

struct CtxState {
    err: Option<GonexError>,
    children: Vec<Weak<Inner>>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

struct Inner {
    id: Uuid,
    parent: Option<Context>,
    deadline: Option<Instant>,
    kv: Option<(String, ContextValue)>,
    state: PlMutex<CtxState>,
    notify: Notify,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// A node in the cancellation tree. Cloning shares the node.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Cancels the context it was created with. Does nothing if the context is
/// already cancelled.
#[derive(Clone)]
pub struct Canceler {
    ctx: Context,
}

impl Canceler {
    pub fn cancel(&self) {
        self.ctx.cancel_with(GonexError::ContextCancelled);
    }
}

/// The root context: never cancelled, no deadline, no values.
pub fn background() -> Context {
    Context::new_node(None, None, None)
}

/// A child cancelled by the returned [`Canceler`], or when `parent` is.
pub fn with_cancel(parent: &Context) -> (Context, Canceler) {
    let ctx = Context::new_node(Some(parent.clone()), None, None);
    let canceler = Canceler { ctx: ctx.clone() };
    (ctx, canceler)
}

/// A child cancelled after `ms` milliseconds with a `ContextTimeout` cause,
/// by the returned [`Canceler`], or when `parent` is.
pub fn with_timeout(parent: &Context, ms: i64) -> GonexResult<(Context, Canceler)> {
    validate_timeout(ms)?;
    let timeout = Timeout::from_millis(ms)?;
    match timeout.as_duration() {
        Some(d) => Ok(Context::new_deadline_node(
            parent,
            Instant::now() + d,
            GonexError::ContextTimeout { timeout_ms: ms },
        )),
        // The infinite sentinel arms nothing.
        None => Ok(with_cancel(parent)),
    }
}

/// A child cancelled at `deadline` with a `ContextDeadlineExceeded` cause.
pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, Canceler) {
    Context::new_deadline_node(parent, deadline, GonexError::ContextDeadlineExceeded)
}

/// A child carrying a key/value binding; cancellation follows the parent.
pub fn with_value(
    parent: &Context,
    key: impl Into<String>,
    value: impl Any + Send + Sync,
) -> Context {
    Context::new_node(
        Some(parent.clone()),
        None,
        Some((key.into(), Arc::new(value) as ContextValue)),
    )
}

impl Context {
    fn new_node(
        parent: Option<Context>,
        deadline: Option<Instant>,
        kv: Option<(String, ContextValue)>,
    ) -> Context {
        // A child's deadline never exceeds its parent's.
        let effective_deadline = match (&parent, deadline) {
            (Some(p), Some(d)) => Some(match p.deadline() {
                Some(pd) if pd < d => pd,
                _ => d,
            }),
            (Some(p), None) => p.deadline(),
            (None, d) => d,
        };
        let ctx = Context {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                parent: parent.clone(),
                deadline: effective_deadline,
                kv,
                state: PlMutex::new(CtxState {
                    err: None,
                    children: Vec::new(),
                    timer: None,
                }),
                notify: Notify::new(),
            }),
        };
        if let Some(p) = parent {
            // Born cancelled if the parent already is; registered otherwise.
            let inherited = {
                let mut pst = p.inner.state.lock();
                match &pst.err {
                    Some(e) => Some(e.clone()),
                    None => {
                        pst.children.push(Arc::downgrade(&ctx.inner));
                        None
                    }
                }
            };
            if let Some(cause) = inherited {
                ctx.cancel_with(cause);
            }
        }
        ctx
    }

    fn new_deadline_node(
        parent: &Context,
        deadline: Instant,
        cause: GonexError,
    ) -> (Context, Canceler) {
        let ctx = Context::new_node(Some(parent.clone()), Some(deadline), None);
        let effective = ctx
            .deadline()
            .unwrap_or(deadline);
        // The timer holds only a weak reference so an abandoned context can
        // be reclaimed before its deadline.
        let weak = Arc::downgrade(&ctx.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(effective).await;
            if let Some(inner) = weak.upgrade() {
                Context { inner }.cancel_with(cause);
            }
        });
        ctx.inner.state.lock().timer = Some(timer);
        let canceler = Canceler { ctx: ctx.clone() };
        (ctx, canceler)
    }

    /// Stable identity, used by the marshal layer.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The cancellation cause, or `None` while live. Monotonic.
    pub fn err(&self) -> Option<GonexError> {
        self.inner.state.lock().err.clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().err.is_some()
    }

    /// The effective deadline, already capped by ancestors.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Resolves when this context is cancelled. Returns immediately if it
    /// already is.
    pub async fn done(&self) {
        loop {
            if self.is_done() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Recheck after registering: a cancel may have slipped between
            // the check and the registration.
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// Type-erased value lookup along the parent chain.
    pub fn value(&self, key: &str) -> Option<ContextValue> {
        let mut node = Some(self.clone());
        while let Some(ctx) = node {
            if let Some((k, v)) = &ctx.inner.kv {
                if k == key {
                    return Some(v.clone());
                }
            }
            node = ctx.inner.parent.clone();
        }
        None
    }

    /// Typed value lookup; `None` if the key is missing or the type differs.
    pub fn value_as<V: Any + Send + Sync + Clone>(&self, key: &str) -> Option<V> {
        self.value(key)
            .and_then(|v| v.downcast_ref::<V>().cloned())
    }

    /// All bindings visible from this node, nearest first, one per key.
    /// Snapshot source for the marshal layer.
    pub fn collect_values(&self) -> Vec<(String, ContextValue)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut node = Some(self.clone());
        while let Some(ctx) = node {
            if let Some((k, v)) = &ctx.inner.kv {
                if seen.insert(k.clone()) {
                    out.push((k.clone(), v.clone()));
                }
            }
            node = ctx.inner.parent.clone();
        }
        out
    }

    /// Cancel this node and its subtree with `cause`. First cause wins.
    pub(crate) fn cancel_with(&self, cause: GonexError) {
        let children = {
            let mut st = self.inner.state.lock();
            if st.err.is_some() {
                return;
            }
            st.err = Some(cause.clone());
            if let Some(timer) = st.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut st.children)
        };
        self.inner.notify.notify_waiters();
        // Children are cancelled with the parent's cause.
        for child in children {
            if let Some(inner) = child.upgrade() {
                Context { inner }.cancel_with(cause.clone());
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("err", &self.inner.state.lock().err)
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonex_core::ErrorKind;

    #[tokio::test]
    async fn test_background_never_cancelled() {
        let ctx = background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn test_cancel_sets_err_monotonically() {
        let (ctx, canceler) = with_cancel(&background());
        assert!(ctx.err().is_none());
        canceler.cancel();
        assert_eq!(ctx.err().map(|e| e.kind()), Some(ErrorKind::ContextCancelled));
        // A second cancel does not change the cause.
        canceler.cancel();
        assert_eq!(ctx.err().map(|e| e.kind()), Some(ErrorKind::ContextCancelled));
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates_to_children() {
        let (parent, canceler) = with_cancel(&background());
        let (child, _child_canceler) = with_cancel(&parent);
        let grandchild = with_value(&child, "k", 1i64);

        canceler.cancel();
        assert!(parent.is_done());
        assert!(child.is_done());
        assert!(grandchild.is_done());
        // Cause flows down unchanged.
        assert_eq!(
            grandchild.err().map(|e| e.kind()),
            Some(ErrorKind::ContextCancelled)
        );
    }

    #[tokio::test]
    async fn test_child_of_cancelled_parent_is_born_cancelled() {
        let (parent, canceler) = with_cancel(&background());
        canceler.cancel();
        let (child, _c) = with_cancel(&parent);
        assert!(child.is_done());
    }

    #[tokio::test]
    async fn test_timeout_cancels_with_timeout_kind() {
        let (ctx, _canceler) = with_timeout(&background(), 40).unwrap();
        assert!(ctx.err().is_none());
        ctx.done().await;
        assert_eq!(ctx.err().map(|e| e.kind()), Some(ErrorKind::ContextTimeout));
    }

    #[tokio::test]
    async fn test_deadline_cancels_with_deadline_kind() {
        let (ctx, _canceler) =
            with_deadline(&background(), Instant::now() + Duration::from_millis(40));
        ctx.done().await;
        assert_eq!(
            ctx.err().map(|e| e.kind()),
            Some(ErrorKind::ContextDeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn test_explicit_cancel_beats_timeout() {
        let (ctx, canceler) = with_timeout(&background(), 10_000).unwrap();
        canceler.cancel();
        assert_eq!(ctx.err().map(|e| e.kind()), Some(ErrorKind::ContextCancelled));
    }

    #[tokio::test]
    async fn test_child_deadline_capped_by_parent() {
        let (parent, _pc) = with_timeout(&background(), 50).unwrap();
        let (child, _cc) = with_timeout(&parent, 10_000).unwrap();
        let parent_deadline = parent.deadline().unwrap();
        assert_eq!(child.deadline(), Some(parent_deadline));
    }

    #[tokio::test]
    async fn test_value_lookup_walks_parents_nearest_wins() {
        let root = background();
        let a = with_value(&root, "user", "alice".to_string());
        let b = with_value(&a, "role", "admin".to_string());
        let c = with_value(&b, "user", "bob".to_string());

        assert_eq!(c.value_as::<String>("user").as_deref(), Some("bob"));
        assert_eq!(b.value_as::<String>("user").as_deref(), Some("alice"));
        assert_eq!(c.value_as::<String>("role").as_deref(), Some("admin"));
        assert!(c.value("missing").is_none());
    }

    #[tokio::test]
    async fn test_invalid_timeout_rejected() {
        assert!(with_timeout(&background(), -2).is_err());
    }

    #[tokio::test]
    async fn test_done_wakes_waiters() {
        let (ctx, canceler) = with_cancel(&background());
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.done().await;
                ctx.err().map(|e| e.kind())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceler.cancel();
        assert_eq!(waiter.await.unwrap(), Some(ErrorKind::ContextCancelled));
    }
}
