pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod display;
pub mod error;
pub mod llm;
pub mod menu;
pub mod pipeline;
pub mod shell;
pub mod storage;
pub mod ui;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::Quack2TexError;
pub use shell::Shell;
pub use storage::Storage;
pub use ui::UiManager;
