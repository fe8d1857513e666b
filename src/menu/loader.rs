use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::MenuConfig;
use crate::dispatcher::{Callbacks, Dispatcher, TaskHandle, WorkError};
use crate::menu::layout::AngularSpan;
use crate::menu::node::{ActionPayload, MenuCommand, MenuTree, NodeId, NodeTemplate, PromptAction};
use crate::storage::PersistedItem;

pub const ROOT_NAME: &str = "Quack2Tex";
const CLOSE_ICON: &str = "icons/close.png";
const SETTINGS_ICON: &str = "icons/gears.png";

/// Where persisted menu items come from. Called on a worker thread.
pub trait MenuSource: Send + Sync {
    fn fetch_tree(&self) -> Result<Vec<PersistedItem>>;
}

impl MenuSource for crate::storage::Storage {
    fn fetch_tree(&self) -> Result<Vec<PersistedItem>> {
        crate::storage::Storage::fetch_tree(self)
    }
}

#[derive(Debug)]
pub struct LoadedMenu {
    pub tree: MenuTree,
    /// Structural nodes without children. Valid but useless to click.
    pub dead_ends: Vec<NodeId>,
    /// Persisted item ids that could not be placed (parent cycles).
    pub skipped: Vec<i64>,
}

pub struct MenuTreeLoader {
    source: Arc<dyn MenuSource>,
    config: MenuConfig,
}

impl MenuTreeLoader {
    pub fn new(source: Arc<dyn MenuSource>, config: MenuConfig) -> Self {
        Self { source, config }
    }

    /// Fetches items on a worker and builds the tree back on the interactive thread.
    pub fn load<F>(&self, dispatcher: &Dispatcher, on_loaded: F) -> TaskHandle
    where
        F: FnOnce(Result<LoadedMenu, WorkError>) + 'static,
    {
        let source = Arc::clone(&self.source);
        let config = self.config.clone();
        dispatcher.submit(
            move |progress| {
                progress.report("Loading menu items");
                source.fetch_tree()
            },
            Callbacks::outcome(move |result: Result<Vec<PersistedItem>, WorkError>| {
                on_loaded(result.map(|items| build(items, &config)));
            }),
        )
    }
}

fn parse_models(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// The prompt an item runs, if it has both a guidance prompt and a capture mode.
pub fn action_for(item: &PersistedItem) -> Option<PromptAction> {
    let guidance = item.guidance_prompt.as_deref().map(str::trim).unwrap_or_default();
    let capture_mode = item.capture_mode?;
    if guidance.is_empty() {
        return None;
    }
    Some(PromptAction {
        item_id: Some(item.id),
        name: item.name.clone(),
        model_ids: parse_models(item.models.as_deref()),
        system_instruction: item.system_instruction.clone().unwrap_or_default(),
        guidance_prompt: guidance.to_string(),
        capture_mode,
    })
}

fn payload_for(item: &PersistedItem) -> ActionPayload {
    action_for(item).map_or(ActionPayload::Structural, ActionPayload::Actionable)
}

/// Builds a fresh tree from persisted rows. Input order does not matter.
pub fn build(mut items: Vec<PersistedItem>, config: &MenuConfig) -> LoadedMenu {
    items.sort_by_key(|item| (item.position, item.id));

    let span = AngularSpan::new(config.start_angle, config.end_angle);
    let root_distance = config.distance_to_center;
    let mut tree = MenuTree::new(
        NodeTemplate::new(ROOT_NAME, config.root_icon.clone(), config.root_size)
            .distance(root_distance)
            .span(span),
    );
    let root = tree.root();

    let builtin_size = config.root_size / 2.0;
    let builtin_distance = root_distance / 2.0;
    tree.add_child(
        root,
        NodeTemplate::new("Close", CLOSE_ICON, builtin_size)
            .distance(builtin_distance)
            .action(ActionPayload::Command(MenuCommand::Exit)),
    );
    tree.add_child(
        root,
        NodeTemplate::new("Settings", SETTINGS_ICON, builtin_size)
            .distance(builtin_distance)
            .action(ActionPayload::Command(MenuCommand::Settings)),
    );

    let known: HashSet<i64> = items.iter().map(|i| i.id).collect();
    let mut by_parent: HashMap<Option<i64>, Vec<&PersistedItem>> = HashMap::new();
    for item in &items {
        let parent = match item.parent_id {
            Some(parent) if !known.contains(&parent) => {
                warn!(
                    "Menu item {} ('{}') points at missing parent {}, attaching to root",
                    item.id, item.name, parent
                );
                None
            }
            other => other,
        };
        by_parent.entry(parent).or_default().push(item);
    }

    let mut placed: HashSet<i64> = HashSet::new();
    let mut stack: Vec<(NodeId, Option<i64>, f64)> = vec![(root, None, root_distance)];
    while let Some((parent_node, parent_id, parent_distance)) = stack.pop() {
        let Some(children) = by_parent.get(&parent_id) else {
            continue;
        };
        let distance = parent_distance / 2.0;
        for item in children {
            if !placed.insert(item.id) {
                continue;
            }
            let icon = if item.icon.trim().is_empty() {
                config.fallback_icon.clone()
            } else {
                item.icon.clone()
            };
            let node = tree.add_child(
                parent_node,
                NodeTemplate::new(item.name.clone(), icon, config.item_size)
                    .distance(distance)
                    .action(payload_for(item))
                    .source(item.id),
            );
            stack.push((node, Some(item.id), distance));
        }
    }

    let mut skipped: Vec<i64> = items
        .iter()
        .map(|i| i.id)
        .filter(|id| !placed.contains(id))
        .collect();
    skipped.sort();
    for id in &skipped {
        warn!("Menu item {} is part of a parent cycle, skipping", id);
    }

    let dead_ends: Vec<NodeId> = tree
        .iter()
        .filter(|n| n.parent.is_some() && n.is_leaf() && n.action.is_structural())
        .map(|n| n.id)
        .collect();
    if !dead_ends.is_empty() {
        debug!("{} structural menu item(s) have no children", dead_ends.len());
    }

    info!("Built menu with {} node(s)", tree.len());
    LoadedMenu {
        tree,
        dead_ends,
        skipped,
    }
}
