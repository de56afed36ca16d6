//! Handler pipeline: registration, ordering and chain materialization.
//!
//! A [`Pipeline`] is a registry of [`Handler`]s, each tagged with a lifecycle
//! [`Step`] and a priority. [`Pipeline::to_chain`] sorts the registrations and
//! folds them into a single tower service where every handler wraps the one
//! that runs after it, down to the terminal send handler.
//!
//! # Ordering
//!
//! Each entry has a weight `step.base_weight() + priority`. Entries run by
//! weight, highest first. Among equal weights the most recently registered
//! entry runs first.
//!
//! # Example
//!
//! ```ignore
//! use rigging::{Handler, HandlerOptions, Pipeline, Step};
//!
//! let pipeline = Pipeline::new();
//! pipeline.add(
//!     Handler::around("user-agent", |mut ctx, next| async move {
//!         ctx.http_request_mut()
//!             .headers_mut()
//!             .insert("User-Agent".into(), "rigging".into());
//!         next.oneshot(ctx).await
//!     }),
//!     HandlerOptions::new(Step::Build).priority(10),
//! )?;
//! pipeline.add(Handler::send("http", send_handler), HandlerOptions::new(Step::Send))?;
//!
//! let chain = pipeline.for_operation("ListTables").to_chain()?;
//! let response = chain.call(context).await?;
//! ```

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use derive_more::Display;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};
use tracing::trace;

use crate::{Error, RequestContext, Response, Result, ServiceFuture};

/// Type-erased handler service.
///
/// Every handler in a chain is stored as this type, which lets handlers be
/// composed at runtime without exposing their concrete types.
pub type BoxedService = BoxCloneService<RequestContext, Response, Error>;

/// Default handler priority.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Coarse lifecycle phase a handler belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Step {
    /// Runs first: request setup, logging.
    #[display("initialize")]
    Initialize,
    /// Parameter validation.
    #[display("validate")]
    Validate,
    /// Building the HTTP request (endpoint, headers, body).
    #[display("build")]
    Build,
    /// Signing, retries and error translation around the transport.
    #[display("sign")]
    Sign,
    /// The terminal transport handler.
    #[display("send")]
    Send,
}

impl Step {
    /// All steps, in execution order.
    pub const ALL: [Self; 5] = [
        Self::Initialize,
        Self::Validate,
        Self::Build,
        Self::Sign,
        Self::Send,
    ];

    /// Base ordering weight of the step.
    #[must_use]
    pub const fn base_weight(self) -> i32 {
        match self {
            Self::Initialize => 400,
            Self::Validate => 300,
            Self::Build => 200,
            Self::Sign => 100,
            Self::Send => 0,
        }
    }
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|step| step.to_string() == value)
            .ok_or_else(|| Error::InvalidStep(format!("unknown step `{value}`")))
    }
}

/// Registration options: step, priority and an optional operation filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    step: Step,
    priority: i32,
    operations: Option<HashSet<String>>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::new(Step::Build)
    }
}

impl HandlerOptions {
    /// Options for the given step with the default priority, applying to all operations.
    #[must_use]
    pub const fn new(step: Step) -> Self {
        Self {
            step,
            priority: DEFAULT_PRIORITY,
            operations: None,
        }
    }

    /// Set the priority; must be in `0..=99`.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict the handler to the named operations.
    #[must_use]
    pub fn operations<I, S>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations = Some(operations.into_iter().map(Into::into).collect());
        self
    }
}

type WrapFn = dyn Fn(BoxedService) -> BoxedService + Send + Sync;

#[derive(Clone)]
enum HandlerKind {
    /// Wraps the next handler of the chain.
    Wrap(Arc<WrapFn>),
    /// Terminal handler with no next.
    Send(Arc<Mutex<BoxedService>>),
}

/// One unit of middleware.
///
/// Handlers compare equal when they are clones of the same registration
/// value, which is what [`Pipeline::remove`] matches on.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    kind: HandlerKind,
}

impl Handler {
    /// Handler from a function turning the next service into a wrapping service.
    pub fn from_fn<F>(name: impl Into<Arc<str>>, wrap: F) -> Self
    where
        F: Fn(BoxedService) -> BoxedService + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: HandlerKind::Wrap(Arc::new(wrap)),
        }
    }

    /// Handler from a tower [`Layer`].
    pub fn layer<L>(name: impl Into<Arc<str>>, layer: L) -> Self
    where
        L: Layer<BoxedService> + Send + Sync + 'static,
        L::Service: Service<RequestContext, Response = Response, Error = Error>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<RequestContext>>::Future: Send,
    {
        Self::from_fn(name, move |next| BoxCloneService::new(layer.layer(next)))
    }

    /// Handler from an async closure receiving the context and the next service.
    ///
    /// The closure may short-circuit by not calling `next`.
    pub fn around<F, Fut>(name: impl Into<Arc<str>>, handle: F) -> Self
    where
        F: Fn(RequestContext, BoxedService) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        Self::from_fn(name, move |next| {
            let handle = handle.clone();
            BoxCloneService::new(tower::service_fn(move |ctx| handle(ctx, next.clone())))
        })
    }

    /// Terminal handler for the send step.
    pub fn send<S>(name: impl Into<Arc<str>>, service: S) -> Self
    where
        S: Service<RequestContext, Response = Response, Error = Error> + Clone + Send + 'static,
        S::Future: Send,
    {
        Self {
            name: name.into(),
            kind: HandlerKind::Send(Arc::new(Mutex::new(BoxCloneService::new(service)))),
        }
    }

    /// Handler name, used in logs and chain introspection.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` for terminal send handlers.
    #[must_use]
    pub const fn is_send(&self) -> bool {
        matches!(self.kind, HandlerKind::Send(_))
    }

    fn wrap(&self, next: BoxedService) -> Result<BoxedService> {
        match &self.kind {
            HandlerKind::Wrap(wrap) => Ok(wrap(next)),
            HandlerKind::Send(_) => Err(Error::InvalidStep(format!(
                "send handler `{}` cannot wrap another handler",
                self.name
            ))),
        }
    }

    fn terminal(&self) -> Result<BoxedService> {
        match &self.kind {
            HandlerKind::Send(service) => Ok(service
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
            HandlerKind::Wrap(_) => Err(Error::MissingSendHandler),
        }
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (HandlerKind::Wrap(a), HandlerKind::Wrap(b)) => Arc::ptr_eq(a, b),
            (HandlerKind::Send(a), HandlerKind::Send(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("send", &self.is_send())
            .finish()
    }
}

/// A single handler registration.
///
/// Entries are immutable; filtering or merging pipelines produces copies.
#[derive(Debug, Clone)]
pub struct PipelineEntry {
    handler: Handler,
    step: Step,
    priority: i32,
    insertion_order: u64,
    operations: Option<Arc<HashSet<String>>>,
}

impl PipelineEntry {
    /// Registered handler.
    #[must_use]
    pub const fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Lifecycle step.
    #[must_use]
    pub const fn step(&self) -> Step {
        self.step
    }

    /// Priority within the step.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Registration counter value, unique within the owning pipeline.
    #[must_use]
    pub const fn insertion_order(&self) -> u64 {
        self.insertion_order
    }

    /// Operation filter; `None` applies to every operation.
    #[must_use]
    pub fn operations(&self) -> Option<&HashSet<String>> {
        self.operations.as_deref()
    }

    /// Ordering weight: step base weight plus priority.
    #[must_use]
    pub const fn weight(&self) -> i32 {
        self.step.base_weight() + self.priority
    }

    /// Returns `true` if the entry applies to `operation`.
    #[must_use]
    pub fn applies_to(&self, operation: &str) -> bool {
        self.operations
            .as_ref()
            .is_none_or(|operations| operations.contains(operation))
    }

    /// Execution order: heavier first, later registration first on ties.
    fn execution_order(a: &Self, b: &Self) -> Ordering {
        b.weight()
            .cmp(&a.weight())
            .then_with(|| b.insertion_order.cmp(&a.insertion_order))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EntryKey {
    /// Reserved slot shared by every send registration.
    Send,
    Entry(u64),
}

#[derive(Debug, Clone, Default)]
struct PipelineState {
    entries: HashMap<EntryKey, PipelineEntry>,
    next_insertion: u64,
}

impl PipelineState {
    fn insert(
        &mut self,
        handler: Handler,
        step: Step,
        priority: i32,
        operations: Option<Arc<HashSet<String>>>,
    ) {
        let insertion_order = self.next_insertion;
        self.next_insertion += 1;

        let key = if step == Step::Send {
            EntryKey::Send
        } else {
            EntryKey::Entry(insertion_order)
        };
        self.entries.insert(
            key,
            PipelineEntry {
                handler,
                step,
                priority,
                insertion_order,
                operations,
            },
        );
    }

    fn by_insertion(&self) -> Vec<PipelineEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(PipelineEntry::insertion_order);
        entries
    }
}

/// Thread-safe ordered collection of handler registrations.
///
/// A pipeline is owned by one client configuration. A child configuration
/// starts from [`Pipeline::derive`] and registers its own handlers on top
/// without affecting the parent.
#[derive(Default)]
pub struct Pipeline {
    state: Mutex<PipelineState>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler.
    ///
    /// Registering a send handler replaces the current one. Returns the
    /// handler so it can later be passed to [`Pipeline::remove`].
    pub fn add(&self, handler: Handler, options: HandlerOptions) -> Result<Handler> {
        let HandlerOptions {
            step,
            priority,
            operations,
        } = options;

        if !(0..=99).contains(&priority) {
            return Err(Error::InvalidPriority(priority));
        }
        match (step, handler.is_send()) {
            (Step::Send, false) => {
                return Err(Error::InvalidStep(format!(
                    "handler `{}` wraps a next handler and cannot be registered at the send step",
                    handler.name()
                )));
            }
            (other, true) if other != Step::Send => {
                return Err(Error::InvalidStep(format!(
                    "send handler `{}` must be registered at the send step, not {other}",
                    handler.name()
                )));
            }
            _ => {}
        }

        trace!(handler = handler.name(), %step, priority, "registering handler");
        self.lock()
            .insert(handler.clone(), step, priority, operations.map(Arc::new));
        Ok(handler)
    }

    /// Remove every registration of `handler`.
    pub fn remove(&self, handler: &Handler) {
        self.lock()
            .entries
            .retain(|_, entry| entry.handler != *handler);
    }

    /// Snapshot of the registrations, in registration order.
    #[must_use]
    pub fn entries(&self) -> Vec<PipelineEntry> {
        self.lock().by_insertion()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Import every registration of `other`.
    pub fn copy_from(&self, other: &Self) {
        self.copy_from_filtered(other, |_| true);
    }

    /// Import the registrations of `other` accepted by `predicate`.
    ///
    /// Imported entries get fresh insertion order values from this pipeline,
    /// keeping their relative order.
    pub fn copy_from_filtered<P>(&self, other: &Self, predicate: P)
    where
        P: Fn(&PipelineEntry) -> bool,
    {
        let imported: Vec<_> = other
            .entries()
            .into_iter()
            .filter(|entry| predicate(entry))
            .collect();

        let mut state = self.lock();
        for entry in imported {
            state.insert(entry.handler, entry.step, entry.priority, entry.operations);
        }
    }

    /// Child pipeline holding a copy of every registration.
    #[must_use]
    pub fn derive(&self) -> Self {
        let child = Self::new();
        child.copy_from(self);
        child
    }

    /// Per-operation view: unfiltered entries plus entries whose filter names
    /// `operation`, with the filter cleared on the copies.
    #[must_use]
    pub fn for_operation(&self, operation: &str) -> Self {
        let view = Self::new();
        {
            let mut state = view.lock();
            for entry in self.entries() {
                if entry.applies_to(operation) {
                    state.insert(entry.handler, entry.step, entry.priority, None);
                }
            }
        }
        view
    }

    /// Materialize the ordered call chain.
    ///
    /// Works on a snapshot: registrations made afterwards do not affect the
    /// returned chain.
    pub fn to_chain(&self) -> Result<Chain> {
        let mut entries: Vec<_> = self.lock().entries.values().cloned().collect();
        entries.sort_by(PipelineEntry::execution_order);

        let Some((terminal, wrappers)) = entries.split_last() else {
            return Err(Error::MissingSendHandler);
        };
        if terminal.step != Step::Send {
            return Err(Error::MissingSendHandler);
        }

        let service = wrappers
            .iter()
            .rev()
            .try_fold(terminal.handler.terminal()?, |next, entry| {
                entry.handler.wrap(next)
            })?;

        let handlers: Vec<Arc<str>> = entries
            .iter()
            .map(|entry| Arc::clone(&entry.handler.name))
            .collect();
        trace!(handlers = ?handlers, "materialized chain");

        Ok(Chain {
            service: Arc::new(Mutex::new(service)),
            handlers: handlers.into(),
        })
    }
}

impl Clone for Pipeline {
    fn clone(&self) -> Self {
        Self {
            state: Mutex::new(self.lock().clone()),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .entries()
            .iter()
            .map(|entry| format!("{}@{}:{}", entry.handler.name(), entry.step, entry.priority))
            .collect();
        f.debug_struct("Pipeline").field("entries", &names).finish()
    }
}

/// Materialized handler chain for one request.
///
/// Cheap to clone; calls may run concurrently.
#[derive(Clone)]
pub struct Chain {
    service: Arc<Mutex<BoxedService>>,
    handlers: Arc<[Arc<str>]>,
}

impl Chain {
    /// Handler names in execution order, outermost first.
    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(AsRef::as_ref)
    }

    /// Run the chain: invoke the outermost handler with `context`.
    pub fn call(&self, context: RequestContext) -> ServiceFuture {
        // Lock, clone the service, and release the lock immediately
        let service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        Box::pin(service.oneshot(context))
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}
