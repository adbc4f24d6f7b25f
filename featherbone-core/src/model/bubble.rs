use crate::property::{CellSlot, PropertyCell};
use crate::state::StateMachine;

use super::Properties;

/// Turns "some property changed" into one `changed` event on the owning
/// model.
///
/// Each cell gets an exit hook on its `changing` state that records a
/// notification in the cell slot. After every write the model flushes the
/// recorded notifications into its own machine. Silent and disabled cells
/// never pass through `changing`, so they never bubble.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeBubbler;

impl ChangeBubbler {
    pub fn wire(cell: &mut PropertyCell) {
        cell.on_changed(CellSlot::bubble);
    }

    /// Send one `changed` per recorded notification. Returns how many were
    /// sent.
    pub fn flush(machine: &mut StateMachine<Properties>, props: &mut Properties) -> usize {
        let pending: usize = props
            .cells
            .values_mut()
            .map(PropertyCell::take_bubbled)
            .sum();
        for _ in 0..pending {
            machine.send(props, "changed");
        }
        pending
    }
}
