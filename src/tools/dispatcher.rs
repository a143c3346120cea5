//! Tool-call dispatch
//!
//! Every call is answered exactly once: unknown names, argument errors,
//! permission denials and handler panics all become a result string.

use crate::error::EngineError;
use crate::tools::actions::{ActionExecutor, PermissionStore};
use crate::tools::handlers::{builtin_handlers, ActionStatus, ToolContext, ToolHandler};
use crate::tools::schema::{ToolCall, ToolDeclaration, ToolResult};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

const CRASHED_RESULT: &str = "Error: the action crashed before completing";

/// One line of the recent-actions log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionLogEntry {
    pub tool: String,
    pub status: ActionStatus,
    pub description: String,
}

/// Fixed-capacity log, newest entry first.
#[derive(Debug)]
pub struct RecentActions {
    entries: VecDeque<ActionLogEntry>,
    capacity: usize,
}

impl RecentActions {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: ActionLogEntry) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> Vec<ActionLogEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// Outcome of a dispatch, including the answer for the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub result: ToolResult,
    pub status: ActionStatus,
    pub log: String,
}

pub struct ToolDispatcher {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    executor: Arc<dyn ActionExecutor>,
    permissions: Arc<dyn PermissionStore>,
    recent: Mutex<RecentActions>,
}

impl ToolDispatcher {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        permissions: Arc<dyn PermissionStore>,
        log_capacity: usize,
    ) -> Self {
        Self {
            handlers: HashMap::new(),
            executor,
            permissions,
            recent: Mutex::new(RecentActions::new(log_capacity)),
        }
    }

    /// Dispatcher with every built-in tool registered.
    pub fn with_builtin_tools(
        executor: Arc<dyn ActionExecutor>,
        permissions: Arc<dyn PermissionStore>,
        log_capacity: usize,
    ) -> Self {
        let mut dispatcher = Self::new(executor, permissions, log_capacity);
        for handler in builtin_handlers() {
            dispatcher.register(handler);
        }
        dispatcher
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.declaration().name;
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!("Tool {} registered twice, keeping the latest handler", name);
        }
    }

    /// Declarations for session setup, sorted by name.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<ToolDeclaration> =
            self.handlers.values().map(|h| h.declaration()).collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    pub fn recent_actions(&self) -> Vec<ActionLogEntry> {
        self.recent.lock().entries()
    }

    /// Run the handler for `call` and produce its single result.
    pub async fn dispatch(&self, call: ToolCall) -> Dispatched {
        let ToolCall { id, name, args } = call;
        info!("Dispatching tool call {} ({})", name, id);

        let (status, result, log) = match self.handlers.get(&name) {
            None => {
                warn!("Model called unknown function {}", name);
                (
                    ActionStatus::Unknown,
                    format!("Error: {}", EngineError::UnknownTool(name.clone())),
                    format!("Unknown function {}", name),
                )
            }
            Some(handler) => {
                let ctx = ToolContext {
                    executor: self.executor.as_ref(),
                    permissions: self.permissions.as_ref(),
                };
                match AssertUnwindSafe(handler.handle(args, &ctx)).catch_unwind().await {
                    Ok(Ok(outcome)) => (outcome.status, outcome.result, outcome.log),
                    Ok(Err(e)) => {
                        warn!("Tool {} failed: {}", name, e);
                        (
                            ActionStatus::Failed,
                            format!("Error: {}", e),
                            format!("{} failed: {}", name, e),
                        )
                    }
                    Err(_) => {
                        warn!("Tool {} panicked", name);
                        (
                            ActionStatus::Failed,
                            CRASHED_RESULT.to_string(),
                            format!("{} crashed", name),
                        )
                    }
                }
            }
        };

        self.recent.lock().push(ActionLogEntry {
            tool: name.clone(),
            status,
            description: log.clone(),
        });

        Dispatched {
            result: ToolResult { id, name, result },
            status,
            log,
        }
    }

    /// [`dispatch`](Self::dispatch) that answers `call` even if the dispatch
    /// path itself unwinds.
    pub async fn dispatch_answered(&self, call: ToolCall) -> Dispatched {
        let id = call.id.clone();
        let name = call.name.clone();
        answer_unwinding(id, name, self.dispatch(call)).await
    }
}

async fn answer_unwinding<F>(id: String, name: String, dispatch: F) -> Dispatched
where
    F: Future<Output = Dispatched>,
{
    match AssertUnwindSafe(dispatch).catch_unwind().await {
        Ok(dispatched) => dispatched,
        Err(_) => {
            error!("Dispatch of {} ({}) panicked", name, id);
            let log = format!("{} crashed", name);
            Dispatched {
                result: ToolResult {
                    id,
                    name,
                    result: CRASHED_RESULT.to_string(),
                },
                status: ActionStatus::Failed,
                log,
            }
        }
    }
}
