//! Finite state machine primitive.
//!
//! Provides a typed state machine with a declarative transition graph. Two
//! optional behaviors layer on top of the basic machine: *stoppable* machines
//! latch after the first illegal transition and refuse further transitions
//! until reset, and [`NonceMachine`] additionally guards every transition
//! with a single-use 128-bit nonce for protocol-layer anti-replay.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use rand::RngCore;
use subtle::ConstantTimeEq;

/// Size of a transition nonce in bytes.
pub const NONCE_LEN: usize = 16;

/// FSM errors.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    /// The transition is not an edge of the machine's transition graph.
    #[error("cannot transition from state {from} to {to}")]
    TransitionNotAllowed {
        /// State the machine was in.
        from: String,
        /// State the transition targeted.
        to: String,
    },

    /// The machine latched after an earlier illegal transition.
    #[error("state machine is stopped after an illegal transition")]
    Stopped,

    /// The supplied transition nonce did not match the current nonce.
    #[error("transition nonce did not match")]
    NonceMismatch,
}

/// A typed finite state machine with an explicit transition graph.
///
/// States are plain copyable values (typically a small enum). Use
/// [`Machine::builder`] to declare the allowable edges.
#[derive(Debug, Clone)]
pub struct Machine<S> {
    current: S,
    initial: S,
    allowable: HashMap<S, Vec<S>>,
    stop_on_error: bool,
    stopped: bool,
}

/// Builder for [`Machine`].
#[derive(Debug)]
pub struct MachineBuilder<S> {
    initial: S,
    allowable: HashMap<S, Vec<S>>,
    stop_on_error: bool,
}

impl<S> MachineBuilder<S>
where
    S: Copy + Eq + Hash + Debug,
{
    /// Add edges `from -> to` for every target state in `to`.
    #[must_use]
    pub fn transition(mut self, from: S, to: impl IntoIterator<Item = S>) -> Self {
        self.allowable.entry(from).or_default().extend(to);
        self
    }

    /// Latch the machine after the first illegal transition. Every
    /// subsequent transition fails with [`FsmError::Stopped`] until
    /// [`Machine::reset`] is called.
    #[must_use]
    pub fn stoppable(mut self) -> Self {
        self.stop_on_error = true;
        self
    }

    /// Build the machine.
    #[must_use]
    pub fn build(self) -> Machine<S> {
        Machine {
            current: self.initial,
            initial: self.initial,
            allowable: self.allowable,
            stop_on_error: self.stop_on_error,
            stopped: false,
        }
    }
}

impl<S> Machine<S>
where
    S: Copy + Eq + Hash + Debug,
{
    /// Start building a machine with the given initial state.
    pub fn builder(initial: S) -> MachineBuilder<S> {
        MachineBuilder {
            initial,
            allowable: HashMap::new(),
            stop_on_error: false,
        }
    }

    /// Current state.
    pub const fn state(&self) -> S {
        self.current
    }

    /// Whether a transition between two states is an edge of the graph.
    #[must_use]
    pub fn allowable(&self, from: S, to: S) -> bool {
        self.allowable.get(&from).is_some_and(|tos| tos.contains(&to))
    }

    /// Advance the machine to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::TransitionNotAllowed`] if the edge does not exist,
    /// or [`FsmError::Stopped`] if a stoppable machine has latched.
    pub fn transition(&mut self, to: S) -> Result<(), FsmError> {
        if self.stop_on_error && self.stopped {
            return Err(FsmError::Stopped);
        }
        if self.allowable(self.current, to) {
            self.current = to;
            Ok(())
        } else {
            self.stopped = true;
            Err(FsmError::TransitionNotAllowed {
                from: format!("{:?}", self.current),
                to: format!("{to:?}"),
            })
        }
    }

    /// Return to the initial state and clear any stop latch.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.stopped = false;
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// A state machine whose transitions are guarded by a single-use nonce.
///
/// Each transition must present the machine's current nonce; a fresh nonce
/// is generated after every transition attempt, success or failure. Combined
/// with [`MachineBuilder::stoppable`], an incorrect nonce permanently stops
/// the machine until reset.
#[derive(Debug)]
pub struct NonceMachine<S> {
    inner: Machine<S>,
    nonce: [u8; NONCE_LEN],
}

impl<S> NonceMachine<S>
where
    S: Copy + Eq + Hash + Debug,
{
    /// Wrap a machine with nonce-guarded transitions.
    #[must_use]
    pub fn new(inner: Machine<S>) -> Self {
        Self {
            inner,
            nonce: fresh_nonce(),
        }
    }

    /// Current state.
    pub const fn state(&self) -> S {
        self.inner.state()
    }

    /// Whether a transition between two states is an edge of the graph.
    #[must_use]
    pub fn allowable(&self, from: S, to: S) -> bool {
        self.inner.allowable(from, to)
    }

    /// The nonce that must accompany the next transition.
    pub const fn nonce(&self) -> [u8; NONCE_LEN] {
        self.nonce
    }

    /// Advance the machine to `to`, authenticating with `nonce`.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::NonceMismatch`] when the nonce is wrong, plus any
    /// error the underlying [`Machine::transition`] can produce.
    pub fn transition(&mut self, to: S, nonce: [u8; NONCE_LEN]) -> Result<(), FsmError> {
        let expected = self.nonce;
        self.nonce = fresh_nonce();

        let matches: bool = expected.ct_eq(&nonce).into();
        if !matches {
            if self.inner.stop_on_error {
                self.inner.stop();
            }
            return Err(FsmError::NonceMismatch);
        }
        self.inner.transition(to)
    }

    /// Return to the initial state, clear any stop latch, and rotate the
    /// nonce.
    pub fn reset(&mut self) {
        self.inner.reset();
        self.nonce = fresh_nonce();
    }
}

fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}
