use pulse_config::StatesConfig;
use pulse_core::{PulseError, Result, RuntimeState, StateTransitionRequest};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// Why a transition request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    NotInAdjacency {
        from: RuntimeState,
        to: RuntimeState,
    },
    TargetDisabled(RuntimeState),
    Malformed(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NotInAdjacency { from, to } => {
                write!(f, "{from} → {to} is not an allowed transition")
            }
            RejectionReason::TargetDisabled(s) => write!(f, "state '{s}' is disabled"),
            RejectionReason::Malformed(reason) => write!(f, "malformed request: {reason}"),
        }
    }
}

/// Holds the single active lifecycle state and enforces the adjacency table.
///
/// Pure: no storage, no network, no clock.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: RuntimeState,
    initial: RuntimeState,
    table: BTreeMap<RuntimeState, BTreeSet<RuntimeState>>,
    disabled: BTreeSet<RuntimeState>,
}

impl StateMachine {
    pub fn new(
        initial: RuntimeState,
        table: BTreeMap<RuntimeState, BTreeSet<RuntimeState>>,
        disabled: impl IntoIterator<Item = RuntimeState>,
    ) -> Self {
        let mut disabled: BTreeSet<RuntimeState> = disabled.into_iter().collect();
        disabled.extend(RuntimeState::ALL.into_iter().filter(|s| s.is_reserved()));
        Self {
            current: initial,
            initial,
            table,
            disabled,
        }
    }

    pub fn from_config(config: &StatesConfig) -> Result<Self> {
        let table = config.transition_table().map_err(PulseError::Config)?;
        Ok(Self::new(config.initial, table, config.disabled.iter().copied()))
    }

    pub fn current_state(&self) -> RuntimeState {
        self.current
    }

    /// Pure adjacency lookup. Self-moves are legal only if listed.
    pub fn validate(&self, from: RuntimeState, to: RuntimeState) -> bool {
        !self.disabled.contains(&to) && self.table.get(&from).is_some_and(|t| t.contains(&to))
    }

    /// Apply a request. On rejection the current state is left untouched.
    pub fn apply(
        &mut self,
        request: &StateTransitionRequest,
    ) -> std::result::Result<RuntimeState, RejectionReason> {
        request
            .validate_fields()
            .map_err(RejectionReason::Malformed)?;
        let to = request.desired_state;
        if self.disabled.contains(&to) {
            return Err(RejectionReason::TargetDisabled(to));
        }
        if !self.validate(self.current, to) {
            return Err(RejectionReason::NotInAdjacency {
                from: self.current,
                to,
            });
        }
        self.current = to;
        Ok(to)
    }

    /// Re-seat from a loaded checkpoint. A state that is no longer enterable
    /// falls back to the initial state.
    pub fn restore(&mut self, state: RuntimeState) -> RuntimeState {
        if self.disabled.contains(&state) {
            warn!(%state, initial = %self.initial, "checkpointed state is disabled, starting from initial");
            self.current = self.initial;
        } else {
            self.current = state;
        }
        self.current
    }

    pub fn allowed_from(&self, from: RuntimeState) -> Vec<RuntimeState> {
        self.table
            .get(&from)
            .map(|t| t.iter().copied().filter(|s| !self.disabled.contains(s)).collect())
            .unwrap_or_default()
    }
}
