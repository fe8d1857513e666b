use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::TempDir;

use quack2tex::capture::{typed_text_input, CaptureSource, CapturedInput};
use quack2tex::config::Config;
use quack2tex::display::{render_markdown, DisplaySink};
use quack2tex::llm::{LlmClient, PromptPart};
use quack2tex::menu::{CaptureMode, NodeState};
use quack2tex::pipeline::Predictions;
use quack2tex::shell::Shell;
use quack2tex::storage::{NewItem, Storage};

struct TypedOnly;

impl CaptureSource for TypedOnly {
    fn capture(&self, mode: CaptureMode, typed_text: Option<&str>) -> Result<CapturedInput> {
        match mode {
            CaptureMode::Text => typed_text_input(typed_text),
            other => anyhow::bail!("{} capture unavailable in tests", other),
        }
    }
}

struct EchoLlm;

impl LlmClient for EchoLlm {
    fn ask(&self, model_id: &str, _: &str, parts: &[PromptPart]) -> Result<String> {
        if model_id == "broken" {
            anyhow::bail!("model offline");
        }
        match parts.last() {
            Some(PromptPart::Text(text)) => Ok(format!("{} says {}", model_id, text)),
            _ => Ok(format!("{} saw an image", model_id)),
        }
    }
}

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<String>>>);

impl Recorder {
    fn joined(&self) -> String {
        self.0.borrow().join("\n")
    }
}

impl DisplaySink for Recorder {
    fn show(&mut self, title: &str, predictions: &Predictions) -> Result<()> {
        self.0.borrow_mut().push(render_markdown(title, predictions));
        Ok(())
    }

    fn show_error(&mut self, title: &str, message: &str) -> Result<()> {
        self.0.borrow_mut().push(format!("ERROR {}: {}", title, message));
        Ok(())
    }

    fn show_text(&mut self, text: &str) -> Result<()> {
        self.0.borrow_mut().push(text.to_string());
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    storage: Arc<Storage>,
    shell: Shell,
    display: Recorder,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.menu.animation_ms = 0;
    config.workers.pool_size = 2;
    config.ui.show_notifications = false;

    let storage = Arc::new(Storage::open(dir.path().join("quack2tex.db").as_path(), 50).unwrap());
    let math = storage
        .add_item(&NewItem {
            name: "Math".to_string(),
            ..Default::default()
        })
        .unwrap();
    storage
        .add_item(&NewItem {
            parent_id: Some(math),
            name: "Latex".to_string(),
            system_instruction: Some("typeset".to_string()),
            guidance_prompt: Some("to latex".to_string()),
            models: Some("m1, broken".to_string()),
            capture_mode: Some(CaptureMode::Text),
            ..Default::default()
        })
        .unwrap();
    storage
        .add_item(&NewItem {
            name: "Screenshot".to_string(),
            guidance_prompt: Some("describe".to_string()),
            capture_mode: Some(CaptureMode::Screen),
            ..Default::default()
        })
        .unwrap();

    let display = Recorder::default();
    let mut shell = Shell::new(
        &config,
        Arc::clone(&storage),
        Arc::new(TypedOnly),
        Arc::new(EchoLlm),
        Box::new(display.clone()),
    )
    .unwrap();
    shell.reload();
    shell.dispatcher().wait_idle();

    Fixture {
        _dir: dir,
        storage,
        shell,
        display,
    }
}

fn settle(shell: &mut Shell) {
    for _ in 0..8 {
        shell.tick(Instant::now() + Duration::from_millis(1));
    }
}

fn state_of(shell: &Shell, name: &str) -> NodeState {
    shell
        .with_menu(|menu| menu.state(menu.tree().find_by_name(name).unwrap()))
        .unwrap()
}

#[test]
fn test_text_item_runs_all_models_and_records_history() {
    let Fixture {
        _dir,
        storage,
        mut shell,
        display,
    } = fixture();

    shell.handle_line("toggle #0");
    settle(&mut shell);
    assert_eq!(state_of(&shell, "Quack2Tex"), NodeState::Expanded);

    shell.handle_line("toggle math");
    settle(&mut shell);
    assert_eq!(state_of(&shell, "Math"), NodeState::Expanded);
    assert_eq!(shell.with_menu(|m| m.active_path().len()), Some(2));

    shell.handle_line("toggle latex");
    settle(&mut shell);
    assert!(shell.is_awaiting_text());
    assert_eq!(shell.with_menu(|m| m.active_path().is_empty()), Some(true));
    assert_eq!(state_of(&shell, "Math"), NodeState::Collapsed);

    shell.handle_line("text x squared");
    shell.dispatcher().wait_idle();
    assert!(!shell.is_awaiting_text());

    let shown = display.joined();
    assert!(shown.contains("# Latex"));
    assert!(shown.contains("## m1\n\nm1 says x squared"));
    assert!(shown.contains("## broken\n\nError: "));

    let history = storage.list_prompts(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].guidance_prompt, "to latex");
    assert_eq!(history[0].responses.len(), 2);
    assert!(!history[0].responses[0].failed);
    assert!(history[0].responses[1].failed);
}

#[test]
fn test_capture_failure_is_reported_without_history() {
    let Fixture {
        _dir,
        storage,
        mut shell,
        display,
    } = fixture();

    shell.handle_line("toggle #0");
    settle(&mut shell);
    shell.handle_line("toggle screenshot");
    settle(&mut shell);
    shell.dispatcher().wait_idle();

    assert!(display.joined().contains("ERROR 'Screenshot' failed: screen capture unavailable"));
    assert!(storage.list_prompts(10).unwrap().is_empty());
}

#[test]
fn test_settings_lists_tree_and_close_quits() {
    let Fixture {
        _dir,
        mut shell,
        display,
        ..
    } = fixture();

    shell.handle_line("toggle #0");
    settle(&mut shell);
    shell.handle_line("toggle settings");
    settle(&mut shell);
    assert!(display.joined().contains("    #5 Latex [text] -> m1, broken"));
    assert!(!shell.is_finished());

    shell.handle_line("toggle #0");
    settle(&mut shell);
    shell.handle_line("toggle close");
    assert!(shell.is_finished());
}

#[test]
fn test_hidden_entries_and_unknown_commands_are_ignored() {
    let Fixture {
        _dir,
        mut shell,
        display,
        ..
    } = fixture();

    shell.handle_line("toggle latex");
    assert!(!shell.is_awaiting_text());
    assert_eq!(state_of(&shell, "Quack2Tex"), NodeState::Collapsed);

    shell.handle_line("juggle");
    shell.handle_line("toggle nowhere");
    let shown = display.joined();
    assert!(shown.contains("unknown command: juggle"));
    assert!(shown.contains("No menu entry matches 'nowhere'."));
}

#[test]
fn test_reload_picks_up_new_items() {
    let Fixture {
        _dir,
        storage,
        mut shell,
        ..
    } = fixture();

    storage
        .add_item(&NewItem {
            name: "Code".to_string(),
            ..Default::default()
        })
        .unwrap();
    shell.handle_line("reload");
    shell.dispatcher().wait_idle();

    let names: Vec<String> = shell
        .with_menu(|m| {
            m.tree()
                .children(m.root())
                .iter()
                .map(|id| m.tree().node(*id).name.clone())
                .collect()
        })
        .unwrap();
    assert_eq!(names, vec!["Close", "Settings", "Math", "Screenshot", "Code"]);
}
