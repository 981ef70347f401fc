//! Asynchronous middleware pipeline.
//!
//! A [`Pipeline`] is an ordered list of [`Middleware`] handlers sharing one
//! mutable context. Each handler receives a [`Next`] continuation; awaiting
//! `next.run(ctx)` resumes the chain at the following handler, and returning
//! without calling it short-circuits everything after.
//!
//! ```rust,ignore
//! use prometheus_orchestra::core::{ErrorBoundary, Logging, Pipeline, PipelineContext, Timing};
//!
//! let pipeline = Pipeline::new()
//!     .with(ErrorBoundary)
//!     .with(Timing)
//!     .with(Logging::new("orders"))
//!     .with(LoadOrder);
//!
//! let ctx = pipeline.run(PipelineContext::new()).await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::AppResult;

/// One step of a [`Pipeline`].
#[async_trait]
pub trait Middleware<C>: Send + Sync {
    /// Process `ctx`, optionally resuming the rest of the chain through
    /// `next`.
    ///
    /// # Errors
    ///
    /// Any error aborts the rest of the chain and propagates to the caller
    /// unless an outer handler (such as [`ErrorBoundary`]) contains it.
    async fn handle(&self, ctx: &mut C, next: Next<'_, C>) -> AppResult<()>;
}

/// Continuation handed to a [`Middleware`]: the handlers after it.
///
/// Consumed by [`run`](Self::run), so the rest of the chain runs at most
/// once per handler invocation.
pub struct Next<'a, C> {
    chain: &'a [Arc<dyn Middleware<C>>],
}

impl<C: Send> Next<'_, C> {
    /// Run the remaining handlers.
    ///
    /// # Errors
    ///
    /// The first uncaught handler error.
    pub async fn run(self, ctx: &mut C) -> AppResult<()> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(ctx, Next { chain: rest }).await,
            None => Ok(()),
        }
    }

    /// Handlers left in the chain.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.chain.len()
    }
}

/// Ordered chain of middleware over a context of type `C`.
pub struct Pipeline<C> {
    handlers: Vec<Arc<dyn Middleware<C>>>,
}

impl<C> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<C> Default for Pipeline<C> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<C> fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl<C: Send> Pipeline<C> {
    /// Empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler.
    #[must_use]
    pub fn with<M>(mut self, middleware: M) -> Self
    where
        M: Middleware<C> + 'static,
    {
        self.push(middleware);
        self
    }

    /// Append a handler in place.
    pub fn push<M>(&mut self, middleware: M) -> &mut Self
    where
        M: Middleware<C> + 'static,
    {
        self.handlers.push(Arc::new(middleware));
        self
    }

    /// Append a handler that is shared with other pipelines.
    pub fn push_shared(&mut self, middleware: Arc<dyn Middleware<C>>) -> &mut Self {
        self.handlers.push(middleware);
        self
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the pipeline has no handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the chain over `ctx` in place.
    ///
    /// # Errors
    ///
    /// The first uncaught handler error.
    pub async fn execute(&self, ctx: &mut C) -> AppResult<()> {
        Next {
            chain: &self.handlers,
        }
        .run(ctx)
        .await
    }

    /// Run the chain and hand the context back once it settles.
    ///
    /// # Errors
    ///
    /// The first uncaught handler error; the context is dropped.
    pub async fn run(&self, mut ctx: C) -> AppResult<C> {
        self.execute(&mut ctx).await?;
        Ok(ctx)
    }
}

/// A pipeline nested inside another runs its own chain, then resumes the
/// outer one.
#[async_trait]
impl<C: Send> Middleware<C> for Pipeline<C> {
    async fn handle(&self, ctx: &mut C, next: Next<'_, C>) -> AppResult<()> {
        self.execute(ctx).await?;
        next.run(ctx).await
    }
}

/// Context that can hold an error caught by [`ErrorBoundary`].
pub trait RecordError {
    /// Store `error` on the context.
    fn record_error(&mut self, error: anyhow::Error);
}

/// Context that can hold a duration measured by [`Timing`].
pub trait RecordDuration {
    /// Store `elapsed` on the context.
    fn record_duration(&mut self, elapsed: Duration);
}

/// Catches errors from the rest of the chain and records them on the
/// context instead of propagating.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorBoundary;

#[async_trait]
impl<C: RecordError + Send> Middleware<C> for ErrorBoundary {
    async fn handle(&self, ctx: &mut C, next: Next<'_, C>) -> AppResult<()> {
        if let Err(e) = next.run(ctx).await {
            warn!(error = %e, "pipeline error contained");
            ctx.record_error(e);
        }
        Ok(())
    }
}

/// Records how long the rest of the chain took. Nothing is recorded when
/// the chain fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing;

#[async_trait]
impl<C: RecordDuration + Send> Middleware<C> for Timing {
    async fn handle(&self, ctx: &mut C, next: Next<'_, C>) -> AppResult<()> {
        let started = Instant::now();
        next.run(ctx).await?;
        ctx.record_duration(started.elapsed());
        Ok(())
    }
}

/// Emits request/response events around the rest of the chain.
#[derive(Debug, Clone)]
pub struct Logging {
    label: String,
}

impl Logging {
    /// Logger tagging its events with `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl<C: fmt::Debug + Send> Middleware<C> for Logging {
    async fn handle(&self, ctx: &mut C, next: Next<'_, C>) -> AppResult<()> {
        info!(pipeline = %self.label, "request");
        debug!(pipeline = %self.label, context = ?ctx, "request context");
        let started = Instant::now();
        next.run(ctx).await?;
        info!(pipeline = %self.label, elapsed = ?started.elapsed(), "response");
        debug!(pipeline = %self.label, context = ?ctx, "response context");
        Ok(())
    }
}

/// General-purpose pipeline context: a JSON key/value map plus the slots
/// used by the built-in handlers.
#[derive(Debug, Default)]
pub struct PipelineContext {
    /// Free-form values shared between handlers.
    pub values: Map<String, Value>,
    /// Error caught by an [`ErrorBoundary`].
    pub error: Option<anyhow::Error>,
    /// Duration measured by [`Timing`].
    pub duration: Option<Duration>,
}

impl PipelineContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw JSON value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    /// Serialize `value` and store it under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be represented as JSON.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> AppResult<()> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Raw value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Value stored under `key`, deserialized into `T`. `None` if absent or
    /// of a different shape.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| T::deserialize(v).ok())
    }

    /// Whether an error was recorded.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Take the recorded error, leaving none.
    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }
}

impl RecordError for PipelineContext {
    fn record_error(&mut self, error: anyhow::Error) {
        self.error = Some(error);
    }
}

impl RecordDuration for PipelineContext {
    fn record_duration(&mut self, elapsed: Duration) {
        self.duration = Some(elapsed);
    }
}
