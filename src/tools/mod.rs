//! Tool declarations, dispatch and the external-action boundary

pub mod actions;
pub mod dispatcher;
pub mod handlers;
pub mod schema;

pub use actions::{ActionExecutor, ExternalAction, PermissionSet, PermissionStore};
pub use dispatcher::{ActionLogEntry, Dispatched, RecentActions, ToolDispatcher};
pub use handlers::{ActionStatus, ToolContext, ToolHandler, ToolOutcome};
pub use schema::{ParamType, ToolCall, ToolDeclaration, ToolResult};
