//! Actions (places) of a net.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Unique ID identifying an [`Action`] within a net.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(u64);

/// The opaque tag produced by an action's handler and fed to the predicates
/// of its outgoing transitions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionResult(i64);

/// User code executed when an action is activated.
///
/// Any `Fn() -> ActionResult + Send + Sync` closure is a handler.
pub trait ActionHandler: Send + Sync {
    fn invoke(&self) -> ActionResult;
}

/// A node of the net, carrying an optional handler and a token counter.
///
/// An action is activated when its token counter reaches
/// [`required_tokens`](Self::required_tokens), at which point the threshold
/// is deducted and the remainder persists for future activations. The
/// counter is only mutated by the scheduler and the action's own runner
/// while the activation lock is held; it is atomic so that observers may
/// read a snapshot without taking that lock.
pub struct Action {
    id: ActionId,
    name: String,
    required_tokens: NonZeroUsize,
    current_tokens: AtomicUsize,
    handler: Option<Box<dyn ActionHandler>>,
}

impl ActionId {
    /// Converts the given `u64` into an action ID.
    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the `u64` value corresponding to the action ID.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ActionId {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

impl ActionResult {
    /// The conventional "all went well" result. This is also the default,
    /// and what an action without a handler produces.
    pub const OK: Self = Self(0);

    /// The conventional "something went wrong" result.
    pub const NOK: Self = Self(1);

    #[inline]
    pub const fn from_i64(value: i64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

impl<F> ActionHandler for F
where
    F: Fn() -> ActionResult + Send + Sync,
{
    fn invoke(&self) -> ActionResult {
        self()
    }
}

impl Action {
    pub(crate) fn new(
        id: ActionId,
        name: String,
        handler: Option<Box<dyn ActionHandler>>,
        required_tokens: NonZeroUsize,
    ) -> Self {
        Self {
            id,
            name,
            required_tokens,
            current_tokens: AtomicUsize::new(0),
            handler,
        }
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of tokens the action must accumulate before it
    /// fires.
    pub fn required_tokens(&self) -> NonZeroUsize {
        self.required_tokens
    }

    /// Returns a snapshot of the action's current token count.
    pub fn current_tokens(&self) -> usize {
        self.current_tokens.load(Ordering::Acquire)
    }

    /// Invokes the action's handler, or the default behavior (log and
    /// return [`ActionResult::OK`]) if it has none.
    pub(crate) fn invoke_handler(&self) -> ActionResult {
        match &self.handler {
            Some(handler) => handler.invoke(),
            None => {
                cascade_log::debug!("Action {} ({}) executed", self.name, self.id);
                ActionResult::OK
            }
        }
    }

    /// Adds one token. The caller must hold the activation lock.
    pub(crate) fn deposit_token(&self) {
        self.current_tokens.fetch_add(1, Ordering::AcqRel);
    }

    /// Sets the token count to the firing threshold. The caller must hold
    /// the activation lock.
    pub(crate) fn fill_tokens(&self) {
        self.current_tokens
            .store(self.required_tokens.get(), Ordering::Release);
    }

    /// Deducts the firing threshold from the token count. The caller must
    /// hold the activation lock and have observed the count at or above the
    /// threshold.
    pub(crate) fn consume_required_tokens(&self) {
        let previous = self
            .current_tokens
            .fetch_sub(self.required_tokens.get(), Ordering::AcqRel);
        assert!(
            previous >= self.required_tokens.get(),
            "Token underflow when firing action {}",
            self.id
        );
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("required_tokens", &self.required_tokens)
            .field("current_tokens", &self.current_tokens)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}
