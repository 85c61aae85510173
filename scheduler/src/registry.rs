//! `Registry` is an explicit, caller-owned collection of named contexts —
//! there is no process-global registry. A `Context` bundles per-resource
//! settings with lazily-initialized services (the connection pool backed
//! session pair, the hook set, the `data`-field codec).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use chrono_tz::Tz;
use serde_json::Value as Json;
pub use session::RetryConfig;
use session::Sessions;
use store::Db;
use tokio::sync::OnceCell;

use crate::events::{NoopHooks, SchedulerHooks};

/// Extension point replacing the source system's subclassable entity
/// classes: callers that need a richer `data` shape supply a codec rather
/// than substituting the entity type itself.
pub trait DataCodec: Send + Sync {
    fn encode(&self, value: &Json) -> anyhow::Result<Json> {
        Ok(value.clone())
    }

    fn decode(&self, value: &Json) -> anyhow::Result<Json> {
        Ok(value.clone())
    }
}

#[derive(Default)]
pub struct DefaultCodec;
impl DataCodec for DefaultCodec {}

#[derive(Clone)]
pub struct ContextSettings {
    pub timezone: Tz,
    pub dsn: String,
    pub retry: RetryConfig,
}

pub struct Context {
    pub name: String,
    pub settings: ContextSettings,
    sessions: OnceCell<Sessions>,
    pub hooks: Arc<dyn SchedulerHooks>,
    pub codec: Arc<dyn DataCodec>,
}

impl Context {
    fn new(name: String, settings: ContextSettings) -> Self {
        Self {
            name,
            settings,
            sessions: OnceCell::new(),
            hooks: Arc::new(NoopHooks),
            codec: Arc::new(DefaultCodec),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SchedulerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn DataCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Connects (once) and returns the context's session pair.
    pub async fn sessions(&self) -> anyhow::Result<&Sessions> {
        self.sessions
            .get_or_try_init(|| async {
                let db = Db::connect(&self.settings.dsn).await?;
                db.migrate().await?;
                Ok::<_, anyhow::Error>(Sessions::new(db, self.settings.retry))
            })
            .await
    }
}

#[derive(Default)]
pub struct Registry {
    contexts: RwLock<HashMap<String, Arc<Context>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_context(&self, name: impl Into<String>, settings: ContextSettings) -> Arc<Context> {
        let name = name.into();
        let ctx = Arc::new(Context::new(name.clone(), settings));
        self.contexts.write().unwrap().insert(name, ctx.clone());
        ctx
    }

    pub fn add_context_with(
        &self,
        name: impl Into<String>,
        settings: ContextSettings,
        hooks: Arc<dyn SchedulerHooks>,
        codec: Arc<dyn DataCodec>,
    ) -> Arc<Context> {
        let name = name.into();
        let ctx = Arc::new(Context::new(name.clone(), settings).with_hooks(hooks).with_codec(codec));
        self.contexts.write().unwrap().insert(name, ctx.clone());
        ctx
    }

    pub fn context(&self, name: &str) -> Option<Arc<Context>> {
        self.contexts.read().unwrap().get(name).cloned()
    }
}

static DEFAULT_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// A process-wide registry for callers that don't want to thread one
/// through explicitly. Prefer constructing your own `Registry` and passing
/// it down; this exists only for convenience.
pub fn default_registry() -> &'static Registry {
    DEFAULT_REGISTRY.get_or_init(Registry::new)
}
