//! Hierarchical state machine engine.
//!
//! A machine is a tree of named states built from a declarative
//! [`StateSpec`]. Events are delivered to the active leaf and bubble through
//! its ancestors until some state declares a reaction; an event nobody
//! handles is dropped. Leaving a state consults its `can_exit` guard, and a
//! veto anywhere on the exit path aborts the whole transition.
//!
//! Hooks and handlers receive the owner's context `C` by mutable reference,
//! so owners keep the machine and its context in separate fields:
//!
//! ```
//! use featherbone_core::state::{StateMachine, StateSpec};
//!
//! let mut machine = StateMachine::define(
//!     StateSpec::root()
//!         .child(StateSpec::new("off").on("toggle", "/on"))
//!         .child(StateSpec::new("on").on("toggle", "/off")),
//! )
//! .unwrap();
//! let mut ctx = ();
//! machine.start(&mut ctx);
//! assert_eq!(machine.current(), vec!["/off"]);
//! machine.send(&mut ctx, "toggle");
//! assert!(machine.is_in("/on"));
//! ```
//!
//! Every `send` runs to completion before returning; there is no queue.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::StateError;

/// Callback run when a state is entered or exited.
pub type Hook<C> = Rc<dyn Fn(&mut C)>;

/// Predicate deciding whether a state may be left.
pub type Guard<C> = Rc<dyn Fn(&C) -> bool>;

/// Event handler; the returned [`Next`] decides whether the machine moves.
pub type Handler<C> = Rc<dyn Fn(&mut C) -> Next>;

type StateId = usize;

const ROOT: StateId = 0;

/// What a handler asks the machine to do after it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Stay,
    Goto(String),
}

impl Next {
    pub fn goto(path: impl Into<String>) -> Self {
        Self::Goto(path.into())
    }
}

/// Result of delivering an event or forcing a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// No active state declares the event.
    Unhandled,
    /// A handler ran but the configuration did not change.
    Handled,
    /// The active configuration moved.
    Moved { from: Vec<String>, to: Vec<String> },
    /// A state on the exit path refused to be left.
    Blocked { state: String },
}

impl Transition {
    pub fn is_moved(&self) -> bool {
        matches!(self, Self::Moved { .. })
    }

    pub fn is_handled(&self) -> bool {
        !matches!(self, Self::Unhandled)
    }
}

enum EventSpec<C> {
    Goto(String),
    Handle(Handler<C>),
}

/// Declarative description of one state and its subtree.
pub struct StateSpec<C> {
    name: String,
    children: Vec<StateSpec<C>>,
    initial: Option<String>,
    concurrent: bool,
    is_final: bool,
    events: Vec<(String, EventSpec<C>)>,
    enters: Vec<Hook<C>>,
    exits: Vec<Hook<C>>,
    can_exit: Option<Guard<C>>,
}

impl<C> StateSpec<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            initial: None,
            concurrent: false,
            is_final: false,
            events: Vec::new(),
            enters: Vec::new(),
            exits: Vec::new(),
            can_exit: None,
        }
    }

    /// The unnamed top of a machine.
    pub fn root() -> Self {
        Self::new("")
    }

    pub fn child(mut self, child: StateSpec<C>) -> Self {
        self.children.push(child);
        self
    }

    /// Child entered by default. Without one the first child is used.
    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.initial = Some(name.into());
        self
    }

    /// Every child is an independent region active at the same time.
    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    /// Absorbing state: it can never be exited once entered.
    pub fn final_state(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Move to `target` (an absolute path) when `event` arrives.
    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.events
            .push((event.into(), EventSpec::Goto(target.into())));
        self
    }

    pub fn handle(
        mut self,
        event: impl Into<String>,
        handler: impl Fn(&mut C) -> Next + 'static,
    ) -> Self {
        self.events
            .push((event.into(), EventSpec::Handle(Rc::new(handler))));
        self
    }

    pub fn enter(mut self, hook: impl Fn(&mut C) + 'static) -> Self {
        self.enters.push(Rc::new(hook));
        self
    }

    pub fn exit(mut self, hook: impl Fn(&mut C) + 'static) -> Self {
        self.exits.push(Rc::new(hook));
        self
    }

    pub fn can_exit(mut self, guard: impl Fn(&C) -> bool + 'static) -> Self {
        self.can_exit = Some(Rc::new(guard));
        self
    }
}

enum Reaction<C> {
    Goto(StateId),
    Handle(Handler<C>),
}

/// A node of a running machine, reachable through [`StateMachine::resolve`].
pub struct State<C> {
    name: String,
    path: String,
    parent: Option<StateId>,
    children: Vec<StateId>,
    initial: Option<StateId>,
    concurrent: bool,
    is_final: bool,
    events: HashMap<String, Reaction<C>>,
    enters: Vec<Hook<C>>,
    exits: Vec<Hook<C>>,
    can_exit: Option<Guard<C>>,
    active: bool,
}

impl<C> State<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    pub fn handles(&self, event: &str) -> bool {
        self.events.contains_key(event)
    }

    /// Attach an entry hook after definition.
    pub fn enter(&mut self, hook: impl Fn(&mut C) + 'static) -> &mut Self {
        self.enters.push(Rc::new(hook));
        self
    }

    /// Attach an exit hook after definition.
    pub fn exit(&mut self, hook: impl Fn(&mut C) + 'static) -> &mut Self {
        self.exits.push(Rc::new(hook));
        self
    }

    /// Remove the most recently attached entry hook.
    pub fn pop_enter(&mut self) -> bool {
        self.enters.pop().is_some()
    }

    pub fn set_can_exit(&mut self, guard: impl Fn(&C) -> bool + 'static) -> &mut Self {
        self.can_exit = Some(Rc::new(guard));
        self
    }

    /// Install or replace the handler for `event`.
    pub fn handle(
        &mut self,
        event: impl Into<String>,
        handler: impl Fn(&mut C) -> Next + 'static,
    ) -> &mut Self {
        self.events
            .insert(event.into(), Reaction::Handle(Rc::new(handler)));
        self
    }

    fn may_exit(&self, ctx: &C) -> bool {
        !self.is_final && self.can_exit.as_ref().map_or(true, |guard| guard(ctx))
    }
}

impl<C> fmt::Debug for State<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("path", &self.path)
            .field("active", &self.active)
            .field("final", &self.is_final)
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A running hierarchical state machine over context `C`.
pub struct StateMachine<C> {
    nodes: Vec<State<C>>,
}

impl<C> StateMachine<C> {
    /// Build the state tree, resolving every `on` target up front.
    pub fn define(root: StateSpec<C>) -> Result<Self, StateError> {
        let mut machine = Self { nodes: Vec::new() };
        let mut targets = Vec::new();
        machine.build(root, None, &mut targets)?;

        for (id, event, target) in targets {
            let target_id = machine
                .lookup(&target)
                .ok_or_else(|| StateError::UnknownTarget {
                    state: machine.nodes[id].path.clone(),
                    event: event.clone(),
                    target,
                })?;
            machine.nodes[id]
                .events
                .insert(event, Reaction::Goto(target_id));
        }

        Ok(machine)
    }

    fn build(
        &mut self,
        spec: StateSpec<C>,
        parent: Option<StateId>,
        targets: &mut Vec<(StateId, String, String)>,
    ) -> Result<StateId, StateError> {
        let path = match parent {
            None => "/".to_string(),
            Some(ROOT) => format!("/{}", spec.name),
            Some(p) => format!("{}/{}", self.nodes[p].path, spec.name),
        };
        if parent.is_some() && (spec.name.is_empty() || spec.name.contains(['/', '.'])) {
            return Err(StateError::InvalidName(path));
        }

        let id = self.nodes.len();
        let mut events = HashMap::new();
        for (event, reaction) in spec.events {
            match reaction {
                EventSpec::Goto(target) => targets.push((id, event, target)),
                EventSpec::Handle(handler) => {
                    events.insert(event, Reaction::Handle(handler));
                }
            }
        }

        self.nodes.push(State {
            name: spec.name,
            path,
            parent,
            children: Vec::new(),
            initial: None,
            concurrent: spec.concurrent,
            is_final: spec.is_final,
            events,
            enters: spec.enters,
            exits: spec.exits,
            can_exit: spec.can_exit,
            active: false,
        });

        for child in spec.children {
            let duplicate = self.nodes[id]
                .children
                .iter()
                .any(|&c| self.nodes[c].name == child.name);
            if duplicate {
                let path = match id {
                    ROOT => format!("/{}", child.name),
                    _ => format!("{}/{}", self.nodes[id].path, child.name),
                };
                return Err(StateError::DuplicateState(path));
            }
            let child_id = self.build(child, Some(id), targets)?;
            self.nodes[id].children.push(child_id);
        }

        if let Some(initial) = spec.initial {
            let found = self.nodes[id]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].name == initial);
            match found {
                Some(child) => self.nodes[id].initial = Some(child),
                None => {
                    return Err(StateError::UnknownInitial {
                        state: self.nodes[id].path.clone(),
                        child: initial,
                    })
                }
            }
        }

        Ok(id)
    }

    /// Whether the machine has been entered at all.
    pub fn is_started(&self) -> bool {
        self.nodes[ROOT].active
    }

    /// Enter the root and its default descendants.
    pub fn start(&mut self, ctx: &mut C) -> Transition {
        if self.is_started() {
            return Transition::Handled;
        }
        self.activate(ctx, ROOT);
        self.enter_default(ctx, ROOT);
        Transition::Moved {
            from: Vec::new(),
            to: self.current(),
        }
    }

    /// Force the machine into the state at `path`.
    ///
    /// Exit guards still apply, so a final state is never left.
    pub fn goto(&mut self, ctx: &mut C, path: &str) -> Transition {
        match self.lookup(path) {
            Some(target) => self.transition(ctx, target),
            None => {
                tracing::warn!(path, "goto unknown state");
                Transition::Unhandled
            }
        }
    }

    /// Deliver `event` to every active leaf, bubbling towards the root.
    ///
    /// A reaction declared on a state shared by several active regions runs
    /// once.
    pub fn send(&mut self, ctx: &mut C, event: &str) -> Transition {
        let mut handlers: Vec<StateId> = Vec::new();
        for leaf in self.active_leaves() {
            let mut cursor = Some(leaf);
            while let Some(id) = cursor {
                if self.nodes[id].events.contains_key(event) {
                    if !handlers.contains(&id) {
                        handlers.push(id);
                    }
                    break;
                }
                cursor = self.nodes[id].parent;
            }
        }

        if handlers.is_empty() {
            tracing::trace!(event, current = ?self.current(), "event dropped");
            return Transition::Unhandled;
        }

        let mut outcome = Transition::Handled;
        for id in handlers {
            // An earlier reaction may have left this region already.
            if !self.nodes[id].active {
                continue;
            }
            let target = match self.nodes[id].events.get(event) {
                Some(Reaction::Goto(target)) => Some(*target),
                Some(Reaction::Handle(handler)) => {
                    let handler = Rc::clone(handler);
                    match handler(ctx) {
                        Next::Stay => None,
                        Next::Goto(path) => {
                            let target = self.lookup(&path);
                            if target.is_none() {
                                tracing::warn!(event, path, "handler targeted unknown state");
                            }
                            target
                        }
                    }
                }
                None => None,
            };
            if let Some(target) = target {
                outcome = self.transition(ctx, target);
            }
        }
        outcome
    }

    /// Whether sending `event` now would reach some handler.
    pub fn can_handle(&self, event: &str) -> bool {
        self.nodes
            .iter()
            .any(|node| node.active && node.events.contains_key(event))
    }

    /// Active leaf paths, one per concurrent region.
    pub fn current(&self) -> Vec<String> {
        self.active_leaves()
            .into_iter()
            .map(|id| self.nodes[id].path.clone())
            .collect()
    }

    /// Whether the state at `path` (or any ancestor-qualified prefix) is active.
    pub fn is_in(&self, path: &str) -> bool {
        self.lookup(path).is_some_and(|id| self.nodes[id].active)
    }

    pub fn resolve(&self, path: &str) -> Option<&State<C>> {
        self.lookup(path).map(|id| &self.nodes[id])
    }

    pub fn resolve_mut(&mut self, path: &str) -> Option<&mut State<C>> {
        self.lookup(path).map(move |id| &mut self.nodes[id])
    }

    fn lookup(&self, path: &str) -> Option<StateId> {
        let mut id = ROOT;
        for segment in path.split(['/', '.']).filter(|s| !s.is_empty()) {
            id = self.nodes[id]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].name == segment)?;
        }
        Some(id)
    }

    fn transition(&mut self, ctx: &mut C, target: StateId) -> Transition {
        let from = self.current();

        if !self.is_started() {
            self.activate(ctx, ROOT);
            if target == ROOT {
                self.enter_default(ctx, ROOT);
            } else {
                self.enter_down(ctx, ROOT, target);
            }
            return Transition::Moved {
                from,
                to: self.current(),
            };
        }

        // Resetting to the root exits everything below it.
        if target == ROOT {
            let exiting: Vec<StateId> = self.nodes[ROOT]
                .children
                .iter()
                .copied()
                .filter(|&c| self.nodes[c].active)
                .collect();
            if let Err(blocked) = self.exit_all(ctx, &exiting) {
                return blocked;
            }
            self.enter_default(ctx, ROOT);
            return Transition::Moved {
                from,
                to: self.current(),
            };
        }

        let (domain, exit_root) = if self.nodes[target].active {
            // External self transition: leave and re-enter the target.
            let parent = self.nodes[target].parent.unwrap_or(ROOT);
            (parent, Some(target))
        } else {
            let domain = self.deepest_active_ancestor(target);
            let exit_root = self.nodes[domain]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].active);
            (domain, exit_root)
        };

        if let Some(exit_root) = exit_root {
            if let Err(blocked) = self.exit_all(ctx, &[exit_root]) {
                return blocked;
            }
        }

        self.enter_down(ctx, domain, target);
        Transition::Moved {
            from,
            to: self.current(),
        }
    }

    /// Check every guard on the exit path first, then run exits leaf-first.
    fn exit_all(&mut self, ctx: &mut C, roots: &[StateId]) -> Result<(), Transition> {
        let mut exiting = Vec::new();
        for &root in roots {
            self.active_postorder(root, &mut exiting);
        }
        for &id in &exiting {
            if !self.nodes[id].may_exit(ctx) {
                tracing::debug!(state = %self.nodes[id].path, "exit refused");
                return Err(Transition::Blocked {
                    state: self.nodes[id].path.clone(),
                });
            }
        }
        for id in exiting {
            self.deactivate(ctx, id);
        }
        Ok(())
    }

    fn deepest_active_ancestor(&self, target: StateId) -> StateId {
        let mut cursor = self.nodes[target].parent;
        while let Some(id) = cursor {
            if self.nodes[id].active {
                return id;
            }
            cursor = self.nodes[id].parent;
        }
        ROOT
    }

    /// Enter every state strictly below `domain` down to `target`, then the
    /// target's default descendants.
    fn enter_down(&mut self, ctx: &mut C, domain: StateId, target: StateId) {
        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(id) = cursor {
            if id == domain {
                break;
            }
            path.push(id);
            cursor = self.nodes[id].parent;
        }
        path.reverse();

        for (i, &id) in path.iter().enumerate() {
            self.activate(ctx, id);
            if self.nodes[id].concurrent {
                if let Some(&next) = path.get(i + 1) {
                    let siblings: Vec<StateId> = self.nodes[id]
                        .children
                        .iter()
                        .copied()
                        .filter(|&c| c != next)
                        .collect();
                    for region in siblings {
                        self.activate(ctx, region);
                        self.enter_default(ctx, region);
                    }
                }
            }
        }
        self.enter_default(ctx, target);
    }

    fn enter_default(&mut self, ctx: &mut C, id: StateId) {
        if self.nodes[id].children.is_empty() {
            return;
        }
        if self.nodes[id].concurrent {
            let regions = self.nodes[id].children.clone();
            for region in regions {
                self.activate(ctx, region);
                self.enter_default(ctx, region);
            }
        } else {
            let child = self.nodes[id]
                .initial
                .unwrap_or(self.nodes[id].children[0]);
            self.activate(ctx, child);
            self.enter_default(ctx, child);
        }
    }

    fn activate(&mut self, ctx: &mut C, id: StateId) {
        self.nodes[id].active = true;
        let hooks = self.nodes[id].enters.clone();
        for hook in hooks {
            hook(ctx);
        }
    }

    fn deactivate(&mut self, ctx: &mut C, id: StateId) {
        let hooks = self.nodes[id].exits.clone();
        for hook in hooks {
            hook(ctx);
        }
        self.nodes[id].active = false;
    }

    fn active_leaves(&self) -> Vec<StateId> {
        let mut leaves = Vec::new();
        if self.is_started() {
            self.collect_leaves(ROOT, &mut leaves);
        }
        leaves
    }

    fn collect_leaves(&self, id: StateId, out: &mut Vec<StateId>) {
        let mut any = false;
        for &child in &self.nodes[id].children {
            if self.nodes[child].active {
                any = true;
                self.collect_leaves(child, out);
            }
        }
        if !any {
            out.push(id);
        }
    }

    fn active_postorder(&self, id: StateId, out: &mut Vec<StateId>) {
        for &child in &self.nodes[id].children {
            if self.nodes[child].active {
                self.active_postorder(child, out);
            }
        }
        out.push(id);
    }
}

impl<C> fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("states", &self.nodes.len())
            .field("current", &self.current())
            .finish()
    }
}
