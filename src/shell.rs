//! Terminal front end for the radial menu.
//!
//! Owns the interactive thread: menu state, animation clock, dispatcher
//! deliveries and the display all live here. Commands arrive as text lines.

use anyhow::Result;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::io::BufRead;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::CaptureSource;
use crate::config::{Config, MenuConfig};
use crate::dispatcher::{Dispatcher, TaskHandle, WorkError};
use crate::display::DisplaySink;
use crate::error::Quack2TexError;
use crate::llm::LlmClient;
use crate::menu::animation::Animator;
use crate::menu::layout::Point;
use crate::menu::loader::{LoadedMenu, MenuTreeLoader};
use crate::menu::node::{ActionPayload, CaptureMode, MenuCommand, MenuTree, NodeId, PromptAction};
use crate::menu::state::{MenuEvent, MenuStateMachine};
use crate::pipeline::{Pipeline, Predictions};
use crate::storage::Storage;
use crate::ui::UiManager;

const TICK: Duration = Duration::from_millis(16);

/// Maximum accepted command line length.
pub const MAX_LINE_LENGTH: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Show,
    Toggle(String),
    Text(String),
    Reload,
    Help,
    Quit,
}

impl FromStr for ShellCommand {
    type Err = Quack2TexError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.len() > MAX_LINE_LENGTH {
            return Err(Quack2TexError::Ui("command line too long".to_string()));
        }
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match (verb.to_ascii_lowercase().as_str(), rest) {
            ("show" | "ls", "") => Ok(ShellCommand::Show),
            ("toggle" | "t", target) if !target.is_empty() => Ok(ShellCommand::Toggle(target.to_string())),
            ("text", text) => Ok(ShellCommand::Text(text.to_string())),
            ("reload", "") => Ok(ShellCommand::Reload),
            ("help" | "?", "") => Ok(ShellCommand::Help),
            ("quit" | "exit" | "q", "") => Ok(ShellCommand::Quit),
            ("toggle" | "t", _) => Err(Quack2TexError::Ui("toggle needs a node id or name".to_string())),
            _ => Err(Quack2TexError::Ui(format!("unknown command: {}", line))),
        }
    }
}

const HELP: &str = "commands: show | toggle <#id|name> | text <input> | reload | help | quit";

struct Session {
    menu: Option<MenuStateMachine>,
    animator: Animator,
    display: Box<dyn DisplaySink>,
    ui: UiManager,
    awaiting_text: Option<PromptAction>,
    quit: bool,
}

impl Session {
    fn show_text(&mut self, text: &str) {
        if let Err(e) = self.display.show_text(text) {
            warn!("Display failed: {}", e);
        }
    }

    fn report_error(&mut self, title: &str, message: &str) {
        if let Err(e) = self.display.show_error(title, message) {
            warn!("Display failed: {}", e);
        }
        self.ui.spawn_error(title, message);
    }

    fn install(&mut self, loaded: LoadedMenu, origin: Point) {
        for id in &loaded.dead_ends {
            warn!("'{}' has no children and no prompt", loaded.tree.node(*id).name);
        }
        for id in &loaded.skipped {
            warn!("Menu item {} could not be placed", id);
        }
        let count = loaded.tree.len();
        self.menu = Some(MenuStateMachine::new(loaded.tree, origin));
        self.animator = Animator::new(self.animator.duration());
        self.awaiting_text = None;
        self.show_text(&format!("Menu loaded ({} entries). Type `toggle #0` to open it.", count));
    }
}

pub struct Shell {
    menu_config: MenuConfig,
    dispatcher: Dispatcher,
    loader: MenuTreeLoader,
    pipeline: Pipeline,
    session: Rc<RefCell<Session>>,
    loading: Option<TaskHandle>,
}

impl Shell {
    pub fn new(
        config: &Config,
        storage: Arc<Storage>,
        capture: Arc<dyn CaptureSource>,
        llm: Arc<dyn LlmClient>,
        display: Box<dyn DisplaySink>,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.workers.pool_size)?;
        let loader = MenuTreeLoader::new(storage.clone(), config.menu.clone());
        let pipeline = Pipeline::new(
            dispatcher.clone(),
            capture,
            llm,
            Some(storage),
            config.llm.default_model.clone(),
        );
        let session = Session {
            menu: None,
            animator: Animator::new(Duration::from_millis(config.menu.animation_ms)),
            display,
            ui: UiManager::with_config(&config.ui),
            awaiting_text: None,
            quit: false,
        };

        Ok(Self {
            menu_config: config.menu.clone(),
            dispatcher,
            loader,
            pipeline,
            session: Rc::new(RefCell::new(session)),
            loading: None,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_finished(&self) -> bool {
        self.session.borrow().quit
    }

    pub fn is_awaiting_text(&self) -> bool {
        self.session.borrow().awaiting_text.is_some()
    }

    /// Runs `f` against the current menu, if one is loaded.
    pub fn with_menu<R>(&self, f: impl FnOnce(&MenuStateMachine) -> R) -> Option<R> {
        self.session.borrow().menu.as_ref().map(f)
    }

    fn origin(&self) -> Point {
        Point::new(self.menu_config.center_x, self.menu_config.center_y)
    }

    /// Rebuilds the menu from storage. A load still in flight is abandoned.
    pub fn reload(&mut self) {
        if let Some(previous) = self.loading.take() {
            previous.cancel();
            self.dispatcher.detach(&previous);
        }
        let session = Rc::clone(&self.session);
        let origin = self.origin();
        let handle = self
            .loader
            .load(&self.dispatcher, move |result: Result<LoadedMenu, WorkError>| {
                let mut session = session.borrow_mut();
                match result {
                    Ok(loaded) => session.install(loaded, origin),
                    Err(e) => session.report_error("Menu load failed", &e.to_string()),
                }
            });
        self.loading = Some(handle);
    }

    pub fn handle_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match line.parse::<ShellCommand>() {
            Ok(command) => self.handle_command(command),
            Err(e) => {
                let mut session = self.session.borrow_mut();
                session.show_text(&format!("{}\n{}", e, HELP));
            }
        }
    }

    pub fn handle_command(&mut self, command: ShellCommand) {
        debug!("Shell command: {:?}", command);
        match command {
            ShellCommand::Show => {
                let mut session = self.session.borrow_mut();
                let now = Instant::now();
                let text = match session.menu.as_ref() {
                    Some(menu) => render_menu(menu, |id| {
                        session
                            .animator
                            .current_position(id, now)
                            .unwrap_or_else(|| menu.position(id))
                    }),
                    None => "Menu is still loading.".to_string(),
                };
                session.show_text(&text);
            }
            ShellCommand::Toggle(target) => self.toggle(&target),
            ShellCommand::Text(text) => self.answer_text(text),
            ShellCommand::Reload => self.reload(),
            ShellCommand::Help => self.session.borrow_mut().show_text(HELP),
            ShellCommand::Quit => self.session.borrow_mut().quit = true,
        }
    }

    fn toggle(&mut self, target: &str) {
        let changed = {
            let mut guard = self.session.borrow_mut();
            let session = &mut *guard;
            let Some(menu) = session.menu.as_mut() else {
                session.show_text("Menu is still loading.");
                return;
            };
            match resolve_node(menu.tree(), target) {
                Some(id) => menu.toggle(id),
                None => {
                    session.show_text(&format!("No menu entry matches '{}'.", target));
                    false
                }
            }
        };
        if changed {
            self.process_events();
        }
    }

    fn process_events(&mut self) {
        let now = Instant::now();
        let activations = {
            let mut guard = self.session.borrow_mut();
            let session = &mut *guard;
            let Some(menu) = session.menu.as_mut() else {
                return;
            };
            let mut activations = Vec::new();
            for event in menu.drain_events() {
                session.animator.apply(&event, now);
                match event {
                    MenuEvent::Activated { node, payload } => activations.push((node, payload)),
                    other => debug!("Menu event: {:?}", other),
                }
            }
            activations
        };
        for (node, payload) in activations {
            self.on_activated(node, payload);
        }
    }

    fn on_activated(&mut self, node: NodeId, payload: ActionPayload) {
        match payload {
            ActionPayload::Structural => debug!("Structural node {} activated", node),
            ActionPayload::Command(MenuCommand::Exit) => {
                info!("Close selected");
                self.session.borrow_mut().quit = true;
            }
            ActionPayload::Command(MenuCommand::Settings) => {
                let mut session = self.session.borrow_mut();
                let text = match session.menu.as_ref() {
                    Some(menu) => render_tree(menu.tree()),
                    None => String::new(),
                };
                session.show_text(&text);
            }
            ActionPayload::Actionable(action) => {
                if action.capture_mode == CaptureMode::Text {
                    let mut session = self.session.borrow_mut();
                    session.show_text(&format!("'{}' needs input: text <your input>", action.name));
                    session.awaiting_text = Some(action);
                } else {
                    self.run_action(action, None);
                }
            }
        }
    }

    fn answer_text(&mut self, text: String) {
        let pending = self.session.borrow_mut().awaiting_text.take();
        match pending {
            Some(action) => self.run_action(action, Some(text)),
            None => self
                .session
                .borrow_mut()
                .show_text("Nothing is waiting for text input."),
        }
    }

    fn run_action(&mut self, action: PromptAction, typed_text: Option<String>) {
        let session = Rc::clone(&self.session);
        let title = action.name.clone();
        self.session
            .borrow_mut()
            .show_text(&format!("Running '{}'...", title));
        self.pipeline.run(action, typed_text, move |result: Result<Predictions, WorkError>| {
            let mut session = session.borrow_mut();
            match result {
                Ok(predictions) => {
                    if let Err(e) = session.display.show(&title, &predictions) {
                        warn!("Display failed: {}", e);
                    }
                    let failures = predictions.failures();
                    if failures > 0 {
                        let message = format!("{} of {} model(s) failed", failures, predictions.outputs.len());
                        session.ui.spawn_error(title.as_str(), message);
                    }
                }
                Err(e) => session.report_error(&format!("'{}' failed", title), &e.to_string()),
            }
        });
    }

    /// Advances animations to `now` and completes finished transitions.
    pub fn tick(&mut self, now: Instant) {
        {
            let mut guard = self.session.borrow_mut();
            let session = &mut *guard;
            let finished = session.animator.tick(now);
            if finished.is_empty() {
                return;
            }
            if let Some(menu) = session.menu.as_mut() {
                for node in finished {
                    menu.finish(node);
                }
            }
        }
        self.process_events();
    }

    fn is_animating(&self) -> bool {
        self.session.borrow().animator.is_running()
    }

    /// Interactive loop until `quit`, Close, or the end of input.
    pub async fn run(mut self, mut lines: mpsc::Receiver<String>) -> Result<()> {
        info!("Quack2Tex shell started");
        self.session.borrow_mut().show_text(HELP);
        self.reload();

        let dispatcher = self.dispatcher.clone();
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.is_finished() {
            let animating = self.is_animating();
            tokio::select! {
                line = lines.recv() => match line {
                    Some(line) => self.handle_line(&line),
                    None => {
                        info!("Input closed, shutting down");
                        break;
                    }
                },
                _ = dispatcher.next() => {}
                _ = ticker.tick(), if animating => {
                    self.tick(Instant::now());
                }
            }
        }

        info!("Quack2Tex shell stopped");
        Ok(())
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        // Pending callbacks hold the session and pipeline, which hold the dispatcher.
        self.dispatcher.shutdown();
    }
}

/// Reads stdin on a helper thread so the interactive loop never blocks on it.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// `#3`, `3` or a case-insensitive name.
pub fn resolve_node(tree: &MenuTree, target: &str) -> Option<NodeId> {
    let target = target.trim();
    let numeric = target.strip_prefix('#').unwrap_or(target);
    if let Ok(index) = numeric.parse::<usize>() {
        let id = NodeId(index);
        return tree.contains(id).then_some(id);
    }
    tree.find_by_name(target)
}

fn payload_tag(payload: &ActionPayload) -> String {
    match payload {
        ActionPayload::Structural => String::new(),
        ActionPayload::Actionable(action) => format!(" [{}]", action.capture_mode),
        ActionPayload::Command(command) => format!(" [{:?}]", command).to_lowercase(),
    }
}

/// Visible part of the menu, one line per node, drawn at `position_of`.
pub fn render_menu<F>(menu: &MenuStateMachine, position_of: F) -> String
where
    F: Fn(NodeId) -> Point,
{
    let tree = menu.tree();
    let mut out = String::new();
    let mut stack = vec![tree.root()];
    while let Some(id) = stack.pop() {
        if !menu.is_visible(id) {
            continue;
        }
        let node = tree.node(id);
        let pos = position_of(id);
        let _ = write!(
            out,
            "{}{} {}{} @ ({:.0}, {:.0})",
            "  ".repeat(tree.depth(id)),
            id,
            node.name,
            payload_tag(&node.action),
            pos.x,
            pos.y
        );
        if !node.is_leaf() {
            let _ = write!(out, " {}", menu.state(id));
        }
        out.push('\n');
        stack.extend(node.children.iter().rev().copied());
    }
    out
}

/// The whole tree, hidden entries included.
pub fn render_tree(tree: &MenuTree) -> String {
    let mut out = String::new();
    for id in std::iter::once(tree.root()).chain(tree.descendants(tree.root())) {
        let node = tree.node(id);
        let _ = write!(out, "{}{} {}{}", "  ".repeat(tree.depth(id)), id, node.name, payload_tag(&node.action));
        if let ActionPayload::Actionable(action) = &node.action {
            let models = if action.model_ids.is_empty() {
                "default model".to_string()
            } else {
                action.model_ids.join(", ")
            };
            let _ = write!(out, " -> {}", models);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menu::loader::build;
    use crate::storage::PersistedItem;

    #[test]
    fn test_parse_commands() {
        assert_eq!("show".parse::<ShellCommand>().unwrap(), ShellCommand::Show);
        assert_eq!(
            "  toggle  Math tools ".parse::<ShellCommand>().unwrap(),
            ShellCommand::Toggle("Math tools".to_string())
        );
        assert_eq!("t #3".parse::<ShellCommand>().unwrap(), ShellCommand::Toggle("#3".to_string()));
        assert_eq!(
            "text x = 1 + 2".parse::<ShellCommand>().unwrap(),
            ShellCommand::Text("x = 1 + 2".to_string())
        );
        assert_eq!("QUIT".parse::<ShellCommand>().unwrap(), ShellCommand::Quit);
        assert_eq!("reload".parse::<ShellCommand>().unwrap(), ShellCommand::Reload);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("toggle".parse::<ShellCommand>().is_err());
        assert!("dance".parse::<ShellCommand>().is_err());
        assert!("show me".parse::<ShellCommand>().is_err());
        let long = format!("text {}", "x".repeat(MAX_LINE_LENGTH));
        assert!(long.parse::<ShellCommand>().is_err());
    }

    fn sample_tree() -> MenuTree {
        let item = |id, parent_id, name: &str| PersistedItem {
            id,
            parent_id,
            position: 0,
            name: name.to_string(),
            icon: String::new(),
            system_instruction: None,
            guidance_prompt: Some("go".to_string()),
            models: Some("gpt-4o".to_string()),
            capture_mode: parent_id.map(|_| CaptureMode::Clipboard),
        };
        build(vec![item(1, None, "Math"), item(2, Some(1), "Latex")], &MenuConfig::default()).tree
    }

    #[test]
    fn test_resolve_node() {
        let tree = sample_tree();
        assert_eq!(resolve_node(&tree, "#0"), Some(tree.root()));
        assert_eq!(resolve_node(&tree, "3"), Some(NodeId(3)));
        assert_eq!(resolve_node(&tree, "latex"), Some(NodeId(4)));
        assert_eq!(resolve_node(&tree, "#42"), None);
        assert_eq!(resolve_node(&tree, "nope"), None);
    }

    #[test]
    fn test_render_menu_shows_only_visible() {
        let menu = MenuStateMachine::with_root_expanded(sample_tree(), Point::new(200.0, 200.0));
        let text = render_menu(&menu, |id| menu.position(id));
        assert!(text.starts_with("#0 Quack2Tex @ (168, 168) expanded\n"));
        assert!(text.contains("  #1 Close [exit]"));
        assert!(text.contains("  #3 Math"));
        assert!(!text.contains("Latex"));
    }

    #[test]
    fn test_render_tree_lists_everything() {
        let text = render_tree(&sample_tree());
        assert!(text.contains("    #4 Latex [clipboard] -> gpt-4o"));
        assert!(text.contains("  #2 Settings [settings]"));
    }
}
