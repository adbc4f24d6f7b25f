//! Observable, individually stateful value slots.
//!
//! Each [`PropertyCell`] runs its own four state machine:
//!
//! ```text
//!            change            changed
//!   ready ───────────▶ changing ───────▶ ready
//!     │  ▲
//!     │  │ report          silent: values apply, nothing bubbles
//!     ▼  │                 disabled: assignments are discarded
//!   silent / disabled ── enable ──▶ ready
//! ```
//!
//! The value only swaps while `changing` handles `changed`, so entry hooks on
//! `changing` see the old value next to the pending one and exit hooks see
//! the result.

use serde_json::Value;

use crate::state::{Next, StateMachine, StateSpec, Transition};

/// The values a cell's state machine operates on.
#[derive(Debug, Clone)]
pub struct CellSlot {
    name: String,
    current: Value,
    previous: Value,
    pending: Option<Value>,
    bubbled: usize,
}

impl CellSlot {
    fn new(name: String, value: Value) -> Self {
        Self {
            name,
            previous: value.clone(),
            current: value,
            pending: None,
            bubbled: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_value(&self) -> &Value {
        &self.current
    }

    pub fn previous_value(&self) -> &Value {
        &self.previous
    }

    pub fn pending_new_value(&self) -> Option<&Value> {
        self.pending.as_ref()
    }

    /// Replace the value about to be stored. Only meaningful inside an
    /// `on_change` hook.
    pub fn set_pending_new_value(&mut self, value: Value) {
        if self.pending.is_some() {
            self.pending = Some(value);
        }
    }

    /// Record a change notification for the owner to collect.
    pub(crate) fn bubble(&mut self) {
        self.bubbled += 1;
    }

    fn swap(&mut self) {
        if let Some(next) = self.pending.take() {
            self.previous = std::mem::replace(&mut self.current, next);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Ready,
    Changing,
    Silent,
    Disabled,
}

impl CellState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Changing => "changing",
            Self::Silent => "silent",
            Self::Disabled => "disabled",
        }
    }
}

/// What happened to a requested value change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Full `ready → changing → ready` cycle; hooks ran.
    Changed,
    /// Applied without notifications.
    Silent,
    /// Discarded because the cell is disabled.
    Reverted,
    /// Arrived while the cell was mid-change.
    Ignored,
}

fn cell_states() -> StateSpec<CellSlot> {
    StateSpec::root()
        .child(
            StateSpec::new("ready")
                .on("change", "/changing")
                .on("silence", "/silent")
                .on("disable", "/disabled"),
        )
        .child(StateSpec::new("changing").handle("changed", |slot: &mut CellSlot| {
            slot.swap();
            Next::goto("/ready")
        }))
        .child(
            StateSpec::new("silent")
                .handle("change", |slot: &mut CellSlot| {
                    slot.swap();
                    Next::Stay
                })
                .on("report", "/ready")
                .on("disable", "/disabled"),
        )
        .child(
            StateSpec::new("disabled")
                .handle("change", |slot: &mut CellSlot| {
                    slot.pending = None;
                    Next::Stay
                })
                .on("enable", "/ready"),
        )
}

/// A single observable value backing one schema property.
#[derive(Debug)]
pub struct PropertyCell {
    machine: StateMachine<CellSlot>,
    slot: CellSlot,
    is_read_only: bool,
    is_required: bool,
}

impl PropertyCell {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        let mut slot = CellSlot::new(name.into(), value);
        let mut machine =
            StateMachine::define(cell_states()).expect("cell state tree is static");
        machine.start(&mut slot);
        Self {
            machine,
            slot,
            is_read_only: false,
            is_required: false,
        }
    }

    pub fn read_only(mut self, is_read_only: bool) -> Self {
        self.is_read_only = is_read_only;
        self
    }

    pub fn required(mut self, is_required: bool) -> Self {
        self.is_required = is_required;
        self
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn value(&self) -> &Value {
        &self.slot.current
    }

    pub fn previous_value(&self) -> &Value {
        &self.slot.previous
    }

    pub fn pending_new_value(&self) -> Option<&Value> {
        self.slot.pending.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    pub fn is_required(&self) -> bool {
        self.is_required
    }

    pub fn state(&self) -> CellState {
        if self.machine.is_in("/changing") {
            CellState::Changing
        } else if self.machine.is_in("/silent") {
            CellState::Silent
        } else if self.machine.is_in("/disabled") {
            CellState::Disabled
        } else {
            CellState::Ready
        }
    }

    /// Request a value change; the outcome depends on the cell state.
    pub fn set(&mut self, value: Value) -> Assignment {
        let before = self.state();
        if before == CellState::Changing {
            return Assignment::Ignored;
        }

        self.slot.pending = Some(value);
        self.machine.send(&mut self.slot, "change");

        match before {
            CellState::Ready => {
                self.machine.send(&mut self.slot, "changed");
                Assignment::Changed
            }
            CellState::Silent => Assignment::Silent,
            CellState::Disabled => Assignment::Reverted,
            CellState::Changing => Assignment::Ignored,
        }
    }

    /// Deliver a state machine event (`silence`, `report`, `disable`, `enable`).
    pub fn send(&mut self, event: &str) -> Transition {
        self.machine.send(&mut self.slot, event)
    }

    /// Run `hook` before each value swap.
    pub fn on_change(&mut self, hook: impl Fn(&mut CellSlot) + 'static) {
        if let Some(state) = self.machine.resolve_mut("/changing") {
            state.enter(hook);
        }
    }

    /// Run `hook` after each value swap.
    pub fn on_changed(&mut self, hook: impl Fn(&mut CellSlot) + 'static) {
        if let Some(state) = self.machine.resolve_mut("/changing") {
            state.exit(hook);
        }
    }

    /// Number of change notifications raised since the last call.
    pub(crate) fn take_bubbled(&mut self) -> usize {
        std::mem::take(&mut self.slot.bubbled)
    }

    pub fn state_machine(&self) -> &StateMachine<CellSlot> {
        &self.machine
    }
}
