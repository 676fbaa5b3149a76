//! A small runtime for explicit, persisted state machines.
//!
//! Each machine declares its transitions as constant tables of edges. Applying
//! a transition looks up the edge for the current state, persists the new
//! state together with the instant it was entered, and only then returns, so
//! the resource always reflects the last state a machine reached.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use gefyra_operator_k8s_api::{BridgeState, ClientState, MountState};
use std::{fmt, sync::Arc};
use tracing::debug;

/// A closed set of named states.
pub trait State: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn all() -> &'static [Self];
}

/// Moves every state in `from` to `to`.
#[derive(Debug)]
pub struct Edge<S: 'static> {
    pub from: &'static [S],
    pub to: S,
}

#[derive(Debug)]
pub struct Transition<S: 'static> {
    pub name: &'static str,
    pub edges: &'static [Edge<S>],
}

/// Stores the operator-owned fields of a resource.
#[async_trait::async_trait]
pub trait Persist: Send + Sync {
    /// Records that the resource entered `state` at `at`.
    async fn record_state(&self, state: &'static str, at: DateTime<Utc>) -> Result<()>;

    /// Merges `patch` into the resource's status.
    async fn patch_status(&self, patch: serde_json::Value) -> Result<()>;

    /// Merges `patch` into the resource's spec.
    async fn patch_spec(&self, patch: serde_json::Value) -> Result<()>;
}

pub struct Machine<S> {
    state: S,
    persist: Arc<dyn Persist>,
}

// === impl Transition ===

impl<S: State> Transition<S> {
    pub const fn new(name: &'static str, edges: &'static [Edge<S>]) -> Self {
        Self { name, edges }
    }

    /// The state this transition leads to from `from`, if allowed.
    pub fn target(&self, from: S) -> Option<S> {
        self.edges
            .iter()
            .find(|e| e.from.contains(&from))
            .map(|e| e.to)
    }
}

impl<S: 'static> Edge<S> {
    pub const fn new(from: &'static [S], to: S) -> Self {
        Self { from, to }
    }
}

// === impl Machine ===

impl<S: State> Machine<S> {
    pub fn new(state: S, persist: Arc<dyn Persist>) -> Self {
        Self { state, persist }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn persist(&self) -> &Arc<dyn Persist> {
        &self.persist
    }

    pub fn allows(&self, transition: &Transition<S>) -> bool {
        transition.target(self.state).is_some()
    }

    /// Applies `transition`, returning the state it was applied from.
    ///
    /// Self-loops succeed without persisting anything.
    pub async fn apply(&mut self, transition: &Transition<S>) -> Result<S> {
        let from = self.state;
        let to = transition
            .target(from)
            .ok_or(Error::InvalidTransition {
                transition: transition.name,
                from: from.name(),
            })?;
        if to != from {
            self.persist.record_state(to.name(), Utc::now()).await?;
            self.state = to;
        }
        debug!(transition = transition.name, %from, %to, "Applied");
        Ok(from)
    }
}

impl<S: fmt::Debug> fmt::Debug for Machine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine").field("state", &self.state).finish()
    }
}

macro_rules! impl_state {
    ($($ty:ty),+) => {
        $(
            impl State for $ty {
                fn name(&self) -> &'static str {
                    self.as_str()
                }

                fn all() -> &'static [Self] {
                    Self::ALL
                }
            }
        )+
    };
}

impl_state!(ClientState, MountState, BridgeState);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryPersist;
    use pretty_assertions::assert_eq;

    const FORWARD: Transition<MountState> = Transition::new(
        "forward",
        &[
            Edge::new(&[MountState::Requested], MountState::Preparing),
            Edge::new(&[MountState::Preparing], MountState::Preparing),
            Edge::new(&[MountState::Error], MountState::Installing),
        ],
    );

    #[tokio::test]
    async fn persists_state_changes() {
        let persist = MemoryPersist::new();
        let mut machine = Machine::new(MountState::Requested, persist.clone());

        let from = machine.apply(&FORWARD).await.unwrap();
        assert_eq!(from, MountState::Requested);
        assert_eq!(machine.state(), MountState::Preparing);
        assert_eq!(persist.states(), vec!["PREPARING"]);

        // Self-loops retry without recording a new entry.
        machine.apply(&FORWARD).await.unwrap();
        assert_eq!(persist.states(), vec!["PREPARING"]);
    }

    #[tokio::test]
    async fn rejects_missing_edges() {
        let persist = MemoryPersist::new();
        let mut machine = Machine::new(MountState::Active, persist.clone());
        assert!(!machine.allows(&FORWARD));

        let error = machine.apply(&FORWARD).await.unwrap_err();
        assert!(matches!(
            error,
            Error::InvalidTransition {
                transition: "forward",
                from: "ACTIVE"
            }
        ));
        assert_eq!(machine.state(), MountState::Active);
        assert!(persist.states().is_empty());
    }

    #[test]
    fn edges_may_diverge() {
        assert_eq!(FORWARD.target(MountState::Requested), Some(MountState::Preparing));
        assert_eq!(FORWARD.target(MountState::Error), Some(MountState::Installing));
        assert_eq!(FORWARD.target(MountState::Terminated), None);
        assert_eq!(MountState::all().len(), 7);
    }
}
