pub mod agents;
pub mod model;
pub mod registry;

pub use agents::{AgentProfile, AgentRole, setup_agents};
pub use model::{GeneralConfig, ModelError, ModelRunner, load_config};
pub use registry::{CallOptions, Tool, ToolRegistry};
