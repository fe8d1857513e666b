//! Expand/collapse state for every node of a [`MenuTree`].
//!
//! The machine never sleeps or animates: it records where children start and
//! where they should end up, queues a [`MenuEvent`] describing the move, and
//! waits for [`MenuStateMachine::finish`] from whatever drives the visuals.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

use crate::menu::layout::{centered, ring_centers, Point};
use crate::menu::node::{ActionPayload, MenuTree, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Collapsed,
    Expanding,
    Expanded,
    Collapsing,
}

impl NodeState {
    pub fn is_transitioning(&self) -> bool {
        matches!(self, NodeState::Expanding | NodeState::Collapsing)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, NodeState::Expanding | NodeState::Expanded)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Collapsed => write!(f, "collapsed"),
            NodeState::Expanding => write!(f, "expanding"),
            NodeState::Expanded => write!(f, "expanded"),
            NodeState::Collapsing => write!(f, "collapsing"),
        }
    }
}

/// One child travelling between its parent's center and its ring slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildMove {
    pub child: NodeId,
    pub from: Point,
    pub to: Point,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MenuEvent {
    Expanding { node: NodeId, moves: Vec<ChildMove> },
    Expanded(NodeId),
    Collapsing { node: NodeId, moves: Vec<ChildMove> },
    Collapsed(NodeId),
    Activated { node: NodeId, payload: ActionPayload },
}

pub struct MenuStateMachine {
    tree: MenuTree,
    states: Vec<NodeState>,
    visible: Vec<bool>,
    positions: Vec<Point>,
    /// Nodes marked `Expanding` whose children wait for these siblings to finish collapsing.
    waiting: BTreeMap<NodeId, BTreeSet<NodeId>>,
    events: VecDeque<MenuEvent>,
}

impl MenuStateMachine {
    /// Places the root centered on `origin`; every child starts hidden on top of it.
    pub fn new(tree: MenuTree, origin: Point) -> Self {
        let count = tree.len();
        let root = tree.root();
        let mut positions = Vec::with_capacity(count);
        for node in tree.iter() {
            positions.push(centered(origin, node.icon_size));
        }
        let mut visible = vec![false; count];
        visible[root.0] = true;

        Self {
            tree,
            states: vec![NodeState::Collapsed; count],
            visible,
            positions,
            waiting: BTreeMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Same as [`new`](Self::new) with the root already open and settled.
    pub fn with_root_expanded(tree: MenuTree, origin: Point) -> Self {
        let mut machine = Self::new(tree, origin);
        let root = machine.tree.root();
        machine.expand(root);
        machine.settle();
        machine.events.clear();
        machine
    }

    pub fn tree(&self) -> &MenuTree {
        &self.tree
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        self.states
            .get(id.0)
            .copied()
            .unwrap_or(NodeState::Collapsed)
    }

    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.state(id).is_open()
    }

    pub fn is_visible(&self, id: NodeId) -> bool {
        self.visible.get(id.0).copied().unwrap_or(false)
    }

    /// Resting top-left position: where the node is, or is heading.
    pub fn position(&self, id: NodeId) -> Point {
        self.positions.get(id.0).copied().unwrap_or_default()
    }

    pub fn center(&self, id: NodeId) -> Point {
        let size = self.tree.get(id).map(|n| n.icon_size).unwrap_or(0.0);
        self.position(id).offset(size / 2.0, size / 2.0)
    }

    pub fn is_idle(&self) -> bool {
        !self.states.iter().any(|s| s.is_transitioning())
    }

    /// Open nodes from the root down along the single active branch.
    pub fn active_path(&self) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cursor = self.root();
        while self.state(cursor).is_open() {
            path.push(cursor);
            match self
                .tree
                .children(cursor)
                .iter()
                .copied()
                .find(|c| self.state(*c).is_open())
            {
                Some(next) => cursor = next,
                None => break,
            }
        }
        path
    }

    pub fn drain_events(&mut self) -> Vec<MenuEvent> {
        self.events.drain(..).collect()
    }

    /// Returns `true` when the call changed anything.
    pub fn toggle(&mut self, id: NodeId) -> bool {
        if !self.tree.contains(id) {
            debug!("Toggle for unknown node {}, ignoring", id);
            return false;
        }
        let state = self.state(id);
        if state.is_transitioning() {
            debug!("Toggle on {} while {}, ignoring", id, state);
            return false;
        }
        if !self.is_interactive(id) {
            debug!("Toggle on hidden or closing node {}, ignoring", id);
            return false;
        }

        let node = self.tree.node(id);
        if node.is_leaf() {
            if node.action.is_structural() {
                return false;
            }
            self.activate(id);
            return true;
        }

        match state {
            NodeState::Collapsed => self.expand(id),
            _ => self.collapse(id),
        }
        true
    }

    /// Emits the leaf's payload and closes the whole menu.
    pub fn activate(&mut self, id: NodeId) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        debug!("Activating {} ({})", id, node.name);
        self.events.push_back(MenuEvent::Activated {
            node: id,
            payload: node.action.clone(),
        });
        let root = self.root();
        self.collapse(root);
    }

    fn is_interactive(&self, id: NodeId) -> bool {
        if !self.is_visible(id) {
            return false;
        }
        match self.tree.parent(id) {
            Some(parent) => self.state(parent).is_open(),
            None => true,
        }
    }

    fn expand(&mut self, id: NodeId) {
        if self.tree.children(id).is_empty() || self.state(id) != NodeState::Collapsed {
            return;
        }

        let siblings: Vec<NodeId> = self.tree.siblings(id).collect();
        let mut blockers = BTreeSet::new();
        for sibling in siblings {
            if self.state(sibling).is_open() {
                self.collapse(sibling);
            }
            if self.state(sibling) == NodeState::Collapsing {
                blockers.insert(sibling);
            }
        }

        self.states[id.0] = NodeState::Expanding;
        if blockers.is_empty() {
            self.start_expansion(id);
        } else {
            debug!("Expansion of {} waits for {} sibling(s)", id, blockers.len());
            self.waiting.insert(id, blockers);
        }
    }

    fn start_expansion(&mut self, id: NodeId) {
        let center = self.center(id);
        let node = self.tree.node(id);
        let children = node.children.clone();
        let targets = ring_centers(center, node.distance_to_center, node.span, children.len());

        let mut moves = Vec::with_capacity(children.len());
        for (child, target) in children.into_iter().zip(targets) {
            let size = self.tree.node(child).icon_size;
            let from = centered(center, size);
            let to = centered(target, size);
            self.positions[child.0] = to;
            self.visible[child.0] = true;
            moves.push(ChildMove { child, from, to });
        }
        self.events.push_back(MenuEvent::Expanding { node: id, moves });
    }

    fn collapse(&mut self, id: NodeId) {
        if !self.state(id).is_open() {
            return;
        }

        if self.waiting.remove(&id).is_some() {
            // Children never left the parent's center.
            self.states[id.0] = NodeState::Collapsed;
            self.events.push_back(MenuEvent::Collapsed(id));
            return;
        }

        let children = self.tree.children(id).to_vec();
        for child in &children {
            if self.state(*child).is_open() {
                self.collapse(*child);
            }
        }

        let center = self.center(id);
        let mut moves = Vec::with_capacity(children.len());
        for child in children {
            let size = self.tree.node(child).icon_size;
            let to = centered(center, size);
            moves.push(ChildMove {
                child,
                from: self.positions[child.0],
                to,
            });
            self.positions[child.0] = to;
        }
        self.states[id.0] = NodeState::Collapsing;
        self.events.push_back(MenuEvent::Collapsing { node: id, moves });
    }

    /// Completion signal for the transition `id` is in. Anything else is ignored.
    pub fn finish(&mut self, id: NodeId) {
        match self.state(id) {
            NodeState::Expanding if !self.waiting.contains_key(&id) => {
                self.states[id.0] = NodeState::Expanded;
                self.events.push_back(MenuEvent::Expanded(id));
            }
            NodeState::Collapsing => {
                self.states[id.0] = NodeState::Collapsed;
                for child in self.tree.descendants(id) {
                    self.visible[child.0] = false;
                }
                self.events.push_back(MenuEvent::Collapsed(id));
                self.release_waiting(id);
            }
            _ => {}
        }
    }

    fn release_waiting(&mut self, finished: NodeId) {
        let mut ready = Vec::new();
        for (node, blockers) in self.waiting.iter_mut() {
            blockers.remove(&finished);
            if blockers.is_empty() {
                ready.push(*node);
            }
        }
        for node in ready {
            self.waiting.remove(&node);
            self.start_expansion(node);
        }
    }

    /// Completes every transition in flight, including expansions they unblock.
    pub fn settle(&mut self) {
        loop {
            let in_flight: Vec<NodeId> = self
                .states
                .iter()
                .enumerate()
                .filter(|(i, s)| {
                    **s == NodeState::Collapsing
                        || (**s == NodeState::Expanding && !self.waiting.contains_key(&NodeId(*i)))
                })
                .map(|(i, _)| NodeId(i))
                .collect();
            if in_flight.is_empty() {
                break;
            }
            for id in in_flight {
                self.finish(id);
            }
        }
    }

    /// Topmost visible node under `point`, using resting positions.
    pub fn hit_test(&self, point: Point) -> Option<NodeId> {
        self.hit_test_with(point, |id| self.position(id))
    }

    /// Hit test with caller-supplied positions, e.g. mid-animation ones.
    pub fn hit_test_with<F>(&self, point: Point, position_of: F) -> Option<NodeId>
    where
        F: Fn(NodeId) -> Point,
    {
        let mut hits: Vec<(usize, NodeId)> = self
            .tree
            .iter()
            .filter(|n| self.is_visible(n.id))
            .filter(|n| {
                let pos = position_of(n.id);
                point.x >= pos.x
                    && point.x <= pos.x + n.icon_size
                    && point.y >= pos.y
                    && point.y <= pos.y + n.icon_size
            })
            .map(|n| (self.tree.depth(n.id), n.id))
            .collect();
        hits.sort();
        hits.last().map(|(_, id)| *id)
    }
}
