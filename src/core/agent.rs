//! Agent factory: binds a provider, tools, runtime, store, and defaults,
//! and mints sessions (new or resumed).

use std::sync::Arc;

use crate::core::session::{SendMode, Session};
use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::runtime::{LocalRuntime, Runtime};
use crate::store::{MemoryStore, SessionStore};
use crate::tools::Tool;

const DEFAULT_MAX_STEPS: u32 = 100;

pub(crate) struct AgentConfig {
    pub provider: Arc<dyn Provider>,
    pub system_prompt: Option<String>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub runtime: Arc<dyn Runtime>,
    pub store: Arc<dyn SessionStore>,
    pub max_steps: u32,
}

/// Options for [`Agent::create_session`].
#[derive(Default)]
pub struct SessionOptions {
    /// Session id; generated when absent.
    pub id: Option<String>,
    /// Default send mode for the session.
    pub send_mode: Option<SendMode>,
}

/// Options for [`Agent::resume_session`].
#[derive(Default)]
pub struct ResumeOptions {
    /// Default send mode for the session.
    pub send_mode: Option<SendMode>,
    /// Entry to resume from; defaults to the last loaded entry. Resuming
    /// from a mid-tree entry forks a new branch.
    pub leaf_id: Option<String>,
}

/// Factory for sessions sharing one provider/tool/runtime/store binding.
#[derive(Clone)]
pub struct Agent {
    config: Arc<AgentConfig>,
    send_mode: SendMode,
}

impl Agent {
    pub fn builder(provider: Arc<dyn Provider>) -> AgentBuilder {
        AgentBuilder {
            provider,
            system_prompt: None,
            tools: Vec::new(),
            runtime: None,
            store: None,
            max_steps: DEFAULT_MAX_STEPS,
            send_mode: SendMode::default(),
        }
    }

    /// Creates an empty session.
    pub fn create_session(&self) -> Session {
        self.create_session_with(SessionOptions::default())
    }

    pub fn create_session_with(&self, opts: SessionOptions) -> Session {
        let id = opts
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let send_mode = opts.send_mode.unwrap_or(self.send_mode);
        Session::new(id, self.config.clone(), send_mode, Vec::new(), None)
    }

    /// Loads a persisted session and resumes it at its last entry.
    pub async fn resume_session(&self, id: &str) -> Result<Session> {
        self.resume_session_with(id, ResumeOptions::default()).await
    }

    pub async fn resume_session_with(&self, id: &str, opts: ResumeOptions) -> Result<Session> {
        let entries = self.config.store.load(id).await?;
        if entries.is_empty() && !self.config.store.exists(id).await? {
            return Err(Error::SessionNotFound(id.to_string()));
        }

        let leaf_id = match opts.leaf_id {
            Some(leaf_id) => {
                if !entries.iter().any(|entry| entry.id() == leaf_id) {
                    return Err(Error::EntryNotFound(leaf_id));
                }
                Some(leaf_id)
            }
            None => entries.last().map(|entry| entry.id().to_string()),
        };

        let send_mode = opts.send_mode.unwrap_or(self.send_mode);
        Ok(Session::new(
            id.to_string(),
            self.config.clone(),
            send_mode,
            entries,
            leaf_id,
        ))
    }
}

/// Builder for [`Agent`]. Unset collaborators fall back to explicit
/// defaults: a local runtime rooted at the current directory and an
/// in-memory store.
pub struct AgentBuilder {
    provider: Arc<dyn Provider>,
    system_prompt: Option<String>,
    tools: Vec<Arc<dyn Tool>>,
    runtime: Option<Arc<dyn Runtime>>,
    store: Option<Arc<dyn SessionStore>>,
    max_steps: u32,
    send_mode: SendMode,
}

impl AgentBuilder {
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Default send mode for sessions minted by this agent.
    pub fn send_mode(mut self, mode: SendMode) -> Self {
        self.send_mode = mode;
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            config: Arc::new(AgentConfig {
                provider: self.provider,
                system_prompt: self.system_prompt,
                tools: self.tools,
                runtime: self
                    .runtime
                    .unwrap_or_else(|| Arc::new(LocalRuntime::current_dir())),
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                max_steps: self.max_steps,
            }),
            send_mode: self.send_mode,
        }
    }
}
