//! Prompt routing: raw prompt payload to dispatch context.

use agp_protocol::{Correlation, PromptPayload};
use uuid::Uuid;

use super::DispatchContext;

/// Turns an accepted prompt into the context handed to the runtime.
///
/// Must be pure and synchronous; it runs on the inbound dispatch path.
pub trait PromptRouter: Send + Sync {
    fn route(&self, prompt: &PromptPayload, correlation: &Correlation) -> DispatchContext;
}

/// Joins the prompt's text blocks and keys the session as
/// `agp:<agent_app>:<session_id>`.
#[derive(Debug, Clone)]
pub struct DefaultRouter {
    default_agent_app: String,
}

impl Default for DefaultRouter {
    fn default() -> Self {
        Self::new("main")
    }
}

impl DefaultRouter {
    /// `default_agent_app` is used when a prompt does not name one.
    pub fn new(default_agent_app: impl Into<String>) -> Self {
        Self {
            default_agent_app: default_agent_app.into(),
        }
    }
}

impl PromptRouter for DefaultRouter {
    fn route(&self, prompt: &PromptPayload, correlation: &Correlation) -> DispatchContext {
        let agent_app = prompt
            .agent_app
            .as_deref()
            .filter(|app| !app.is_empty())
            .unwrap_or(&self.default_agent_app)
            .to_string();

        DispatchContext {
            run_id: Uuid::new_v4().to_string(),
            session_key: format!("agp:{}:{}", agent_app, prompt.session_id),
            session_id: prompt.session_id.clone(),
            prompt_id: prompt.prompt_id.clone(),
            agent_app,
            body: prompt.text(),
            device_id: correlation.guid.clone(),
            account_id: correlation.user_id.clone(),
        }
    }
}
