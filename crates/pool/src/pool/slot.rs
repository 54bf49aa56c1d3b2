//! Per-slot atomic state and transition guards.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No VM bound.
    Empty,
    /// Token issued; clone, inject, start and bootstrap in flight.
    Creating,
    /// VM up, runner registered, awaiting a job.
    Ready,
    /// Runner accepted a job. Advisory; treated like `Ready` by the logic.
    Running,
    /// Power-off and disk removal in flight.
    Destroying,
}

impl SlotState {
    fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Empty, Creating)
                | (Creating, Ready)
                | (Creating, Destroying)
                | (Ready, Running)
                | (Ready, Destroying)
                | (Running, Destroying)
                | (Destroying, Empty)
                | (Destroying, Creating)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("slot {name}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        name: String,
        from: SlotState,
        to: SlotState,
    },

    #[error("slot {name}: creation superseded by a newer incarnation")]
    Superseded { name: String },
}

/// Outcome of claiming a slot for teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyClaim {
    /// The caller owns the teardown.
    Claimed,
    /// Another worker is already destroying this slot.
    AlreadyDestroying,
    /// Nothing bound to the slot; skip straight to creation.
    NothingToDestroy,
}

#[derive(Debug)]
struct SlotInner {
    state: SlotState,
    generation: u64,
    token: Option<String>,
    created_at: Option<Instant>,
    last_health_check: Option<Instant>,
    health_failures: u32,
}

/// A stable named position in the pool, successively bound to short-lived
/// VMs. All mutation goes through the mutex; transitions are linearizable.
#[derive(Debug)]
pub struct Slot {
    name: String,
    inner: Mutex<SlotInner>,
}

impl Slot {
    pub fn new(name: String) -> Self {
        Self {
            name,
            inner: Mutex::new(SlotInner {
                state: SlotState::Empty,
                generation: 0,
                token: None,
                created_at: None,
                last_health_check: None,
                health_failures: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().unwrap().state
    }

    /// Incarnation counter, bumped on every entry into `Creating` and on
    /// every claimed teardown.
    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    pub fn transition(&self, to: SlotState) -> Result<(), SlotError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.can_transition_to(to) {
            return Err(SlotError::InvalidTransition {
                name: self.name.clone(),
                from: inner.state,
                to,
            });
        }
        inner.state = to;
        Ok(())
    }

    /// Enter `Creating`: stamp the creation time, reset health counters and
    /// return the incarnation to present to [`Slot::mark_ready`].
    pub fn begin_creating(&self) -> Result<u64, SlotError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.can_transition_to(SlotState::Creating) {
            return Err(SlotError::InvalidTransition {
                name: self.name.clone(),
                from: inner.state,
                to: SlotState::Creating,
            });
        }
        inner.state = SlotState::Creating;
        inner.generation += 1;
        inner.created_at = Some(Instant::now());
        inner.health_failures = 0;
        inner.last_health_check = None;
        Ok(inner.generation)
    }

    /// Move `Creating` to `Ready`, unless a newer incarnation took the slot
    /// in the meantime (a hung creation recreated by the monitor).
    pub fn mark_ready(&self, generation: u64) -> Result<(), SlotError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            return Err(SlotError::Superseded {
                name: self.name.clone(),
            });
        }
        if !inner.state.can_transition_to(SlotState::Ready) {
            return Err(SlotError::InvalidTransition {
                name: self.name.clone(),
                from: inner.state,
                to: SlotState::Ready,
            });
        }
        inner.state = SlotState::Ready;
        Ok(())
    }

    /// Claim the slot for teardown; at most one worker wins. Claiming bumps
    /// the incarnation so the slot's monitor and any in-flight creator stand
    /// down instead of touching a VM that is being torn away under them.
    pub fn begin_destroying(&self) -> DestroyClaim {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SlotState::Destroying => DestroyClaim::AlreadyDestroying,
            SlotState::Empty => DestroyClaim::NothingToDestroy,
            _ => {
                inner.state = SlotState::Destroying;
                inner.generation += 1;
                DestroyClaim::Claimed
            }
        }
    }

    pub fn set_token(&self, token: String) {
        self.inner.lock().unwrap().token = Some(token);
    }

    /// Tokens are single-use; drop ours once it is inside the image.
    pub fn clear_token(&self) {
        self.inner.lock().unwrap().token = None;
    }

    pub fn token(&self) -> Option<String> {
        self.inner.lock().unwrap().token.clone()
    }

    /// Time since this incarnation entered `Creating`.
    pub fn since_created(&self) -> Option<Duration> {
        self.inner.lock().unwrap().created_at.map(|at| at.elapsed())
    }

    pub fn note_health_ok(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.health_failures = 0;
        inner.last_health_check = Some(Instant::now());
    }

    /// Count a transient check error; returns the consecutive-failure count.
    pub fn note_health_failure(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.health_failures += 1;
        inner.health_failures
    }

    pub fn health_failures(&self) -> u32 {
        self.inner.lock().unwrap().health_failures
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.inner.lock().unwrap().last_health_check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_the_dag() {
        let slot = Slot::new("r-1".into());
        assert_eq!(slot.state(), SlotState::Empty);

        let generation = slot.begin_creating().unwrap();
        assert_eq!(slot.state(), SlotState::Creating);
        slot.mark_ready(generation).unwrap();
        slot.transition(SlotState::Running).unwrap();
        assert_eq!(slot.begin_destroying(), DestroyClaim::Claimed);
        let generation = slot.begin_creating().unwrap();
        slot.mark_ready(generation).unwrap();
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let slot = Slot::new("r-1".into());
        let generation = slot.begin_creating().unwrap();
        slot.mark_ready(generation).unwrap();

        assert!(matches!(
            slot.transition(SlotState::Creating),
            Err(SlotError::InvalidTransition { .. })
        ));
        assert!(matches!(
            slot.transition(SlotState::Empty),
            Err(SlotError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn stale_creator_cannot_mark_the_new_incarnation_ready() {
        let slot = Slot::new("r-1".into());
        let stale = slot.begin_creating().unwrap();

        // Monitor recreated the slot while the first create hung.
        assert_eq!(slot.begin_destroying(), DestroyClaim::Claimed);
        let fresh = slot.begin_creating().unwrap();

        assert!(matches!(
            slot.mark_ready(stale),
            Err(SlotError::Superseded { .. })
        ));
        slot.mark_ready(fresh).unwrap();
        assert_eq!(slot.state(), SlotState::Ready);
    }

    #[test]
    fn destroy_claim_is_exclusive() {
        let slot = Slot::new("r-1".into());
        assert_eq!(slot.begin_destroying(), DestroyClaim::NothingToDestroy);

        slot.begin_creating().unwrap();
        assert_eq!(slot.begin_destroying(), DestroyClaim::Claimed);
        assert_eq!(slot.begin_destroying(), DestroyClaim::AlreadyDestroying);
    }

    #[test]
    fn destroy_claim_supersedes_the_incarnation() {
        let slot = Slot::new("r-1".into());
        let generation = slot.begin_creating().unwrap();
        slot.mark_ready(generation).unwrap();

        assert_eq!(slot.begin_destroying(), DestroyClaim::Claimed);
        assert_ne!(slot.generation(), generation);
    }

    #[test]
    fn health_counters_reset_on_recreation() {
        let slot = Slot::new("r-1".into());
        slot.begin_creating().unwrap();
        slot.note_health_failure();
        slot.note_health_failure();
        assert_eq!(slot.health_failures(), 2);

        slot.note_health_ok();
        assert_eq!(slot.health_failures(), 0);
        assert!(slot.last_health_check().is_some());

        slot.begin_destroying();
        slot.begin_creating().unwrap();
        assert_eq!(slot.health_failures(), 0);
        assert!(slot.last_health_check().is_none());
    }
}
