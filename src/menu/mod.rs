pub mod animation;
pub mod layout;
pub mod loader;
pub mod node;
pub mod state;

pub use loader::{LoadedMenu, MenuSource, MenuTreeLoader};
pub use node::{ActionPayload, CaptureMode, MenuCommand, MenuTree, NodeId, PromptAction};
pub use state::{MenuEvent, MenuStateMachine, NodeState};
