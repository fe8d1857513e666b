use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use quack2tex::capture::SystemCapture;
use quack2tex::config::Config;
use quack2tex::dispatcher::Dispatcher;
use quack2tex::display::{DisplaySink, TerminalDisplay};
use quack2tex::llm::{LlmClient, LlmRouter};
use quack2tex::menu::loader::{action_for, build};
use quack2tex::menu::{ActionPayload, CaptureMode};
use quack2tex::pipeline::Pipeline;
use quack2tex::shell::{spawn_stdin_reader, Shell};
use quack2tex::storage::{NewItem, Storage};

#[derive(Parser)]
#[command(name = "quack2tex")]
#[command(about = "Radial prompt menu: capture the screen, clipboard or text and ask LLMs about it")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive menu (default)
    Menu,
    /// Manage menu items
    Items {
        #[command(subcommand)]
        action: ItemsCommand,
    },
    /// Show prompt history
    History {
        #[command(subcommand)]
        action: Option<HistoryCommand>,
        /// Maximum number of prompts to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Clear all prompt history
    HistoryClear,
    /// List the models every configured provider can serve
    Models,
    /// Run one menu item without the menu
    Ask {
        /// Id of the item to run
        #[arg(long)]
        item: i64,
        /// Input for items that capture typed text
        #[arg(long)]
        text: Option<String>,
    },
}

#[derive(Subcommand)]
enum ItemsCommand {
    /// List menu items as a tree
    List,
    /// Add a menu item
    Add {
        name: String,
        #[command(flatten)]
        fields: ItemFields,
    },
    /// Change fields of an existing item
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        /// Move the item to the top level
        #[arg(long, conflicts_with = "parent")]
        to_root: bool,
        #[command(flatten)]
        fields: ItemFields,
    },
    /// Remove items and everything below them
    Remove {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// Delete single prompts and their responses
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

#[derive(Args)]
struct ItemFields {
    #[arg(long)]
    parent: Option<i64>,
    #[arg(long)]
    icon: Option<String>,
    #[arg(long = "system")]
    system_instruction: Option<String>,
    #[arg(long = "prompt")]
    guidance_prompt: Option<String>,
    /// Comma separated model ids
    #[arg(long)]
    models: Option<String>,
    /// screen, clipboard, text or voice
    #[arg(long)]
    capture: Option<CaptureMode>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| dirs::config_dir().map(|d| d.join("quack2tex/config.toml")))
        .ok_or_else(|| anyhow::anyhow!("Could not determine config path"))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let config = rt.block_on(Config::load(&config_path))?;

    match cli.command {
        None | Some(Commands::Menu) => {
            let storage = open_storage(&config)?;
            let shell = Shell::new(
                &config,
                storage,
                Arc::new(SystemCapture::new(&config.capture)),
                Arc::new(LlmRouter::new(&config.llm)),
                Box::new(TerminalDisplay::stdout()),
            )?;
            info!("Starting Quack2Tex menu");
            rt.block_on(shell.run(spawn_stdin_reader()))?;
        }
        Some(Commands::Items { action }) => {
            drop(rt);
            let storage = open_storage(&config)?;
            manage_items(&config, &storage, action)?;
        }
        Some(Commands::History { action, limit }) => {
            drop(rt);
            let storage = open_storage(&config)?;
            match action {
                None => show_history(&storage, limit)?,
                Some(HistoryCommand::Delete { ids }) => {
                    for id in ids {
                        storage.delete_prompt(id)?;
                        println!("Deleted prompt {}", id);
                    }
                }
            }
        }
        Some(Commands::HistoryClear) => {
            drop(rt);
            open_storage(&config)?.clear_prompts()?;
            println!("History cleared.");
        }
        Some(Commands::Models) => {
            drop(rt);
            show_models(&config)?;
        }
        Some(Commands::Ask { item, text }) => {
            drop(rt);
            ask(&config, item, text)?;
        }
    }

    Ok(())
}

fn open_storage(config: &Config) -> Result<Arc<Storage>> {
    let path = PathBuf::from(&config.storage.db_path);
    Ok(Arc::new(Storage::open(&path, config.storage.max_prompts)?))
}

fn manage_items(config: &Config, storage: &Storage, action: ItemsCommand) -> Result<()> {
    match action {
        ItemsCommand::List => {
            let loaded = build(storage.fetch_tree()?, &config.menu);
            let tree = &loaded.tree;
            let mut shown = 0;
            for id in tree.descendants(tree.root()) {
                let node = tree.node(id);
                let Some(source) = node.source_id else {
                    continue;
                };
                let kind = match &node.action {
                    ActionPayload::Actionable(a) => {
                        format!(" ({}, {})", a.capture_mode, a.model_ids.join(", "))
                    }
                    _ => String::new(),
                };
                println!("{}[{}] {}{}", "  ".repeat(tree.depth(id) - 1), source, node.name, kind);
                shown += 1;
            }
            if shown == 0 {
                println!("No menu items yet. Add one with `quack2tex items add <name>`.");
            }
            for id in &loaded.skipped {
                println!("! item {} is part of a parent cycle", id);
            }
        }
        ItemsCommand::Add { name, fields } => {
            let id = storage.add_item(&NewItem {
                parent_id: fields.parent,
                name,
                icon: fields.icon.unwrap_or_default(),
                system_instruction: fields.system_instruction,
                guidance_prompt: fields.guidance_prompt,
                models: fields.models,
                capture_mode: fields.capture,
            })?;
            println!("Added item {}", id);
        }
        ItemsCommand::Update {
            id,
            name,
            to_root,
            fields,
        } => {
            let mut item = storage
                .get_item(id)?
                .with_context(|| format!("No menu item with id {}", id))?;
            if let Some(name) = name {
                item.name = name;
            }
            if to_root {
                item.parent_id = None;
            } else if fields.parent.is_some() {
                item.parent_id = fields.parent;
            }
            if let Some(icon) = fields.icon {
                item.icon = icon;
            }
            if fields.system_instruction.is_some() {
                item.system_instruction = fields.system_instruction;
            }
            if fields.guidance_prompt.is_some() {
                item.guidance_prompt = fields.guidance_prompt;
            }
            if fields.models.is_some() {
                item.models = fields.models;
            }
            if fields.capture.is_some() {
                item.capture_mode = fields.capture;
            }
            storage.update_item(&item)?;
            println!("Updated item {}", id);
        }
        ItemsCommand::Remove { ids } => {
            let removed = storage.delete_items(&ids)?;
            println!("Removed {} item(s)", removed);
        }
    }
    Ok(())
}

fn show_history(storage: &Storage, limit: u32) -> Result<()> {
    let prompts = storage.list_prompts(limit)?;
    if prompts.is_empty() {
        println!("No prompt history.");
        return Ok(());
    }

    for prompt in &prompts {
        let input = match prompt.capture_mode.as_str() {
            "screen" => format!("<{} byte screenshot>", prompt.input.len()),
            _ => String::from_utf8_lossy(&prompt.input).to_string(),
        };
        println!("[{}] #{} ({}) {}", prompt.created_at, prompt.id, prompt.capture_mode, prompt.guidance_prompt);
        println!("  input: {}", input);
        for response in &prompt.responses {
            println!("  {}: {}", response.model, response.output);
        }
    }

    println!("\n{} prompt(s) shown.", prompts.len());
    Ok(())
}

fn show_models(config: &Config) -> Result<()> {
    let models = LlmRouter::new(&config.llm).list_models()?;
    if models.is_empty() {
        println!("No models available. Check the API keys and the Ollama endpoint.");
        return Ok(());
    }
    for model in &models {
        if model.display_name == model.name {
            println!("{:<8} {}", model.provider, model.name);
        } else {
            println!("{:<8} {} ({})", model.provider, model.name, model.display_name);
        }
    }
    println!("\n{} model(s) available.", models.len());
    Ok(())
}

fn ask(config: &Config, item_id: i64, text: Option<String>) -> Result<()> {
    let storage = open_storage(config)?;
    let item = storage
        .get_item(item_id)?
        .with_context(|| format!("No menu item with id {}", item_id))?;
    let action = action_for(&item)
        .with_context(|| format!("Item {} ('{}') has no prompt or capture mode", item.id, item.name))?;

    let dispatcher = Dispatcher::new(config.workers.pool_size)?;
    let pipeline = Pipeline::new(
        dispatcher.clone(),
        Arc::new(SystemCapture::new(&config.capture)),
        Arc::new(LlmRouter::new(&config.llm)),
        Some(storage),
        config.llm.default_model.clone(),
    );

    let outcome = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);
    let title = action.name.clone();
    pipeline.run(action, text, move |result| {
        *sink.borrow_mut() = Some(result);
    });
    dispatcher.wait_idle();

    let mut display = TerminalDisplay::stdout();
    let result = outcome.borrow_mut().take();
    match result {
        Some(Ok(predictions)) => display.show(&title, &predictions),
        Some(Err(e)) => {
            display.show_error(&format!("'{}' failed", title), &e.to_string())?;
            Err(e.into())
        }
        None => anyhow::bail!("'{}' produced no result", title),
    }
}
