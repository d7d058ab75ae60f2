pub mod fanout;
pub mod handler;
pub mod registry;

pub use fanout::{execute_tool_calls, LoopDetector};
pub use handler::ToolHandler;
pub use registry::ToolRegistry;
