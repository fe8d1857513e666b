use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Quack2TexError;
use crate::menu::layout::AngularSpan;

/// Index of a node inside its [`MenuTree`]. Only meaningful for the tree that
/// produced it; a rebuilt tree hands out fresh ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Screen,
    Clipboard,
    Text,
    Voice,
}

impl CaptureMode {
    pub const ALL: [CaptureMode; 4] = [
        CaptureMode::Screen,
        CaptureMode::Clipboard,
        CaptureMode::Text,
        CaptureMode::Voice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Screen => "screen",
            CaptureMode::Clipboard => "clipboard",
            CaptureMode::Text => "text",
            CaptureMode::Voice => "voice",
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureMode {
    type Err = Quack2TexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "screen" => Ok(CaptureMode::Screen),
            "clipboard" => Ok(CaptureMode::Clipboard),
            "text" => Ok(CaptureMode::Text),
            "voice" => Ok(CaptureMode::Voice),
            other => Err(Quack2TexError::Config(format!(
                "unknown capture mode '{}' (expected screen, clipboard, text or voice)",
                other
            ))),
        }
    }
}

/// Everything a prompt item needs once activated; workers get their own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptAction {
    pub item_id: Option<i64>,
    pub name: String,
    pub model_ids: Vec<String>,
    pub system_instruction: String,
    pub guidance_prompt: String,
    pub capture_mode: CaptureMode,
}

/// Entries the menu adds on its own, next to the persisted items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuCommand {
    Exit,
    Settings,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ActionPayload {
    #[default]
    Structural,
    Actionable(PromptAction),
    Command(MenuCommand),
}

impl ActionPayload {
    pub fn is_structural(&self) -> bool {
        matches!(self, ActionPayload::Structural)
    }
}

#[derive(Debug, Clone)]
pub struct MenuNode {
    pub id: NodeId,
    pub name: String,
    pub icon_ref: String,
    pub icon_size: f64,
    pub span: AngularSpan,
    pub distance_to_center: f64,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    pub action: ActionPayload,
    pub source_id: Option<i64>,
}

impl MenuNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Parameters for a node about to be inserted; ids and links are assigned by the tree.
#[derive(Debug, Clone)]
pub struct NodeTemplate {
    pub name: String,
    pub icon_ref: String,
    pub icon_size: f64,
    pub span: AngularSpan,
    pub distance_to_center: f64,
    pub action: ActionPayload,
    pub source_id: Option<i64>,
}

impl NodeTemplate {
    pub fn new(name: impl Into<String>, icon_ref: impl Into<String>, icon_size: f64) -> Self {
        Self {
            name: name.into(),
            icon_ref: icon_ref.into(),
            icon_size,
            span: AngularSpan::full(),
            distance_to_center: 0.0,
            action: ActionPayload::Structural,
            source_id: None,
        }
    }

    pub fn distance(mut self, distance: f64) -> Self {
        self.distance_to_center = distance;
        self
    }

    pub fn span(mut self, span: AngularSpan) -> Self {
        self.span = span;
        self
    }

    pub fn action(mut self, action: ActionPayload) -> Self {
        self.action = action;
        self
    }

    pub fn source(mut self, id: i64) -> Self {
        self.source_id = Some(id);
        self
    }
}

/// Arena holding every node of one menu. Children are only ever added under an
/// existing node, so the structure cannot form a cycle.
#[derive(Debug, Clone)]
pub struct MenuTree {
    nodes: Vec<MenuNode>,
}

impl MenuTree {
    pub fn new(root: NodeTemplate) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.push(root, None);
        tree
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn add_child(&mut self, parent: NodeId, template: NodeTemplate) -> NodeId {
        let id = self.push(template, Some(parent));
        self.nodes[parent.0].children.push(id);
        id
    }

    fn push(&mut self, template: NodeTemplate, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(MenuNode {
            id,
            name: template.name,
            icon_ref: template.icon_ref,
            icon_size: template.icon_size,
            span: template.span,
            distance_to_center: template.distance_to_center,
            children: Vec::new(),
            parent,
            action: template.action,
            source_id: template.source_id,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn get(&self, id: NodeId) -> Option<&MenuNode> {
        self.nodes.get(id.0)
    }

    /// Panics on an id from another tree.
    pub fn node(&self, id: NodeId) -> &MenuNode {
        &self.nodes[id.0]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|n| n.parent)
    }

    pub fn siblings(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let parent_children: &[NodeId] = match self.parent(id) {
            Some(parent) => self.children(parent),
            None => &[],
        };
        parent_children.iter().copied().filter(move |c| *c != id)
    }

    /// Ancestors from the direct parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.parent(id);
        while let Some(node) = cursor {
            out.push(node);
            cursor = self.parent(node);
        }
        out
    }

    pub fn depth(&self, id: NodeId) -> usize {
        self.ancestors(id).len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MenuNode> {
        self.nodes.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
            .map(|n| n.id)
    }

    /// Pre-order walk starting at `from`.
    pub fn descendants(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(from).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }
}
