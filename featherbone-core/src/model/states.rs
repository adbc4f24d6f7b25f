//! Lifecycle of a model instance.
//!
//! ```text
//! /ready
//!     /new                    fetch, save (POST), delete (local)
//!     /fetched                lock
//!         /clean              changed, fetch, delete (DELETE)
//!         /dirty              save (PATCH), fetch
//!         /locked             unlock; properties disabled while here
//! /busy
//!     /fetching
//!     /saving
//!         /posting
//!         /patching
//!         /deleting
//! /deleted                    final
//! /error                      final
//! ```
//!
//! A conflict answer returns a save to the state it started from.
//!
//! A locked record takes no commands until it is unlocked. Pushed updates
//! still reach it through silent sets. Unlocking lands in `clean`, and the
//! instance moves on to `dirty` when it still holds unsaved edits.

use super::Properties;
use crate::state::{Next, StateSpec};

pub(crate) const NEW: &str = "/ready/new";
pub(crate) const CLEAN: &str = "/ready/fetched/clean";
pub(crate) const DIRTY: &str = "/ready/fetched/dirty";
pub(crate) const LOCKED: &str = "/ready/fetched/locked";
pub(crate) const FETCHING: &str = "/busy/fetching";
pub(crate) const SAVING: &str = "/busy/saving";
pub(crate) const POSTING: &str = "/busy/saving/posting";
pub(crate) const PATCHING: &str = "/busy/saving/patching";
pub(crate) const DELETING: &str = "/busy/saving/deleting";
pub(crate) const DELETED: &str = "/deleted";
pub(crate) const ERROR: &str = "/error";

fn ready() -> StateSpec<Properties> {
    StateSpec::new("ready")
        .child(
            StateSpec::new("new")
                .on("fetch", FETCHING)
                .on("save", POSTING)
                .on("delete", DELETED)
                .handle("changed", |_| Next::Stay),
        )
        .child(
            StateSpec::new("fetched")
                .on("lock", LOCKED)
                .child(
                    StateSpec::new("clean")
                        .on("changed", DIRTY)
                        .on("fetch", FETCHING)
                        .on("delete", DELETING),
                )
                .child(
                    StateSpec::new("dirty")
                        .on("save", PATCHING)
                        .on("fetch", FETCHING)
                        .handle("changed", |_| Next::Stay),
                )
                .child(
                    StateSpec::new("locked")
                        .enter(|props: &mut Properties| props.broadcast("disable"))
                        .exit(|props: &mut Properties| props.broadcast("enable"))
                        .handle("lock", |_| Next::Stay)
                        .on("unlock", CLEAN),
                ),
        )
}

fn busy() -> StateSpec<Properties> {
    StateSpec::new("busy")
        .on("error", ERROR)
        .child(StateSpec::new("fetching").on("fetched", CLEAN))
        .child(
            StateSpec::new("saving")
                .child(
                    StateSpec::new("posting")
                        .on("fetched", CLEAN)
                        .on("conflict", NEW),
                )
                .child(
                    StateSpec::new("patching")
                        .on("fetched", CLEAN)
                        .on("conflict", DIRTY),
                )
                .child(
                    StateSpec::new("deleting")
                        .on("deleted", DELETED)
                        .on("conflict", CLEAN),
                ),
        )
}

pub(crate) fn lifecycle() -> StateSpec<Properties> {
    StateSpec::root()
        .child(ready())
        .child(busy())
        .child(StateSpec::new("deleted").final_state())
        .child(StateSpec::new("error").final_state())
}
