//! Resolution Engine
//!
//! The engine owns every registry (triggers, deps cache, result nodes,
//! client values, tasks) and runs the derived-variable pipeline:
//!
//! 1. Resolve the variable into its request shape, registering trigger
//!    handles and result nodes on the way.
//! 2. Snapshot the trigger list and ask the deps cache whether the relevant
//!    inputs moved.
//! 3. Unchanged: hand back the cached result. Changed: join or start the
//!    in-flight fetch for the key, which goes through the debounce window
//!    and, for offloaded computations, the task manager.
//! 4. Store the result if the fetch is still the current generation.
//!
//! Several engines can live side by side; nothing here is process-global.

mod context;

pub use context::ResolutionContext;

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn, Instrument};

use crate::cache::{
    DepsCache, DepsCacheEntry, DerivedResolution, NodeStatus, Observation, ResultNode,
    ResultRegistry, TriggerSnapshot,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, TransportError, UsageError};
use crate::fetch::{
    DebouncedFetcher, DerivedRequest, InFlight, Notification, RemoteResponse, TaskFailure,
    TaskGuard, TaskManager, TaskStart, TaskStatus, Transport,
};
use crate::materialize::{extract_nested, insert_nested};
use crate::reactive::{Signal, Subscriber};
use crate::resolve::{
    build_trigger_list, ResolveHost, ResolvedVariable, Resolver, TriggerHandle, TriggerRegistry,
};
use crate::variable::{
    DerivedVariable, Dependency, Operand, PlainDefault, PlainVariable, StateProperty,
    StateVariable, Uid, Variable,
};

/// Handle to one resolution engine. Cloning shares the registries.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Builds an [`Engine`] with a non-default configuration.
pub struct EngineBuilder {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        let fetcher = DebouncedFetcher::new(self.config.debounce_window());
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                transport: self.transport,
                triggers: TriggerRegistry::new(),
                deps: DepsCache::new(),
                results: ResultRegistry::new(),
                values: DashMap::new(),
                sequences: DashMap::new(),
                tasks: TaskManager::new(),
                fetcher,
                inflight: InFlight::new(),
                pollers: DashMap::new(),
            }),
        }
    }
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    triggers: TriggerRegistry,
    deps: DepsCache,
    results: ResultRegistry,
    /// Client-written plain values, by instance key.
    values: DashMap<String, Signal<Option<Value>>>,
    /// Server variable sequence numbers, by instance key.
    sequences: DashMap<String, u64>,
    tasks: TaskManager,
    fetcher: DebouncedFetcher,
    inflight: InFlight,
    pollers: DashMap<String, JoinHandle<()>>,
}

/// Everything a spawned fetch needs, owned.
struct FetchJob {
    key: String,
    uid: Uid,
    ctx: ResolutionContext,
    node: Arc<ResultNode>,
    generation: u64,
    inputs: Vec<Value>,
    request: DerivedRequest,
}

impl Engine {
    /// Engine with the default configuration.
    pub fn new<T: Transport>(transport: Arc<T>) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder<T: Transport>(transport: Arc<T>) -> EngineBuilder {
        EngineBuilder {
            transport,
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Resolve `variable` to its current value under `ctx`.
    ///
    /// Derived variables are fetched when their relevant inputs changed and
    /// served from the deps cache otherwise. State and stream variables are
    /// rejected; use [`Engine::read_state`] for the former.
    pub async fn resolve(&self, variable: &Variable, ctx: &ResolutionContext) -> Result<Value> {
        Resolver::new(&self.inner, ctx).evaluate(variable, &[]).await
    }

    /// Advance the trigger of a derived or server variable. A forced
    /// trigger bypasses the cache on the next resolution and cancels the
    /// variable's running tasks. Triggering a server variable also moves its
    /// sequence number, so dependents send a request the server has not seen.
    pub fn trigger(&self, variable: &Variable, ctx: &ResolutionContext, force: bool) -> Result<()> {
        match variable {
            Variable::Derived(_) | Variable::Server(_) => {
                let key = ctx.instance_key(variable.uid());
                if force {
                    let cancelled = self.inner.tasks.cleanup_running_tasks(&key);
                    self.inner.cancel_remote(cancelled, ctx);
                }
                if let Variable::Server(_) = variable {
                    self.inner.advance_sequence(&key);
                }
                self.inner.triggers.bump(&key, force);
                Ok(())
            }
            _ => Err(UsageError::NotTriggerable {
                kind: variable.kind(),
                uid: variable.uid().to_string(),
            }
            .into()),
        }
    }

    /// Whether `variable` has been resolved (or written) under `ctx`.
    pub fn is_registered(&self, variable: &Variable, ctx: &ResolutionContext) -> bool {
        let key = ctx.instance_key(variable.uid());
        match variable {
            Variable::Derived(_) | Variable::Server(_) => self.inner.triggers.is_registered(&key),
            Variable::Plain(_) => self.inner.values.contains_key(&key),
            Variable::State(state) => self
                .inner
                .results
                .is_registered(&ctx.instance_key(state.parent().uid())),
            Variable::Switch(_) | Variable::Stream(_) => false,
        }
    }

    /// Write the client value of a plain variable. A nested handle writes
    /// into its path of the stored value.
    pub fn set_value(&self, variable: &PlainVariable, ctx: &ResolutionContext, value: Value) {
        let signal = self
            .inner
            .values
            .entry(ctx.instance_key(variable.uid()))
            .or_insert_with(|| Signal::new(None))
            .clone();

        let next = if variable.nested().is_empty() {
            value
        } else {
            let mut base = signal
                .get()
                .or_else(|| match variable.default_value() {
                    PlainDefault::Value(default) => Some(default.clone()),
                    PlainDefault::Derived(_) => None,
                })
                .unwrap_or(Value::Null);
            insert_nested(&mut base, variable.nested(), value);
            base
        };
        if signal.set_if_changed(Some(next)) {
            debug!(uid = %variable.uid(), context = ctx.id(), "client value changed");
        }
    }

    /// The client-written value of a plain variable, if any.
    pub fn value_of(&self, variable: &PlainVariable, ctx: &ResolutionContext) -> Option<Value> {
        self.inner
            .client_value(variable, ctx)
            .map(|value| extract_nested(&value, variable.nested()))
    }

    /// Loading / error flag of the parent derived variable.
    pub fn read_state(&self, variable: &StateVariable, ctx: &ResolutionContext) -> Result<Value> {
        let key = ctx.instance_key(variable.parent().uid());
        let status = self.inner.results.get(&key).map(|node| node.status());
        let flag = match variable.property() {
            StateProperty::Loading => status == Some(NodeStatus::Pending),
            StateProperty::Error => status == Some(NodeStatus::Failed),
        };
        Ok(Value::Bool(flag))
    }

    /// Call `callback` whenever what `variable` resolves to may have
    /// changed. The subscription lasts as long as the returned
    /// [`Observation`].
    pub fn subscribe<F>(
        &self,
        variable: &Variable,
        ctx: &ResolutionContext,
        callback: F,
    ) -> Result<Observation>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let subscriber = Subscriber::new(callback);
        let mut observations = Vec::new();
        self.observe(variable, ctx, &subscriber, true, &mut observations)?;
        Ok(Observation::merge(observations))
    }

    fn observe(
        &self,
        variable: &Variable,
        ctx: &ResolutionContext,
        subscriber: &Subscriber,
        root: bool,
        observations: &mut Vec<Observation>,
    ) -> Result<()> {
        match variable {
            Variable::Plain(plain) => {
                observations.push(self.observe_value(plain, ctx, subscriber));
                Ok(())
            }
            Variable::Server(server) => {
                observations.push(self.observe_trigger(ctx.instance_key(server.uid()), subscriber));
                Ok(())
            }
            Variable::Derived(derived) => {
                for entry in build_trigger_list(derived)? {
                    let key = ctx.instance_key(entry.variable.uid());
                    observations.push(self.observe_trigger(key, subscriber));
                }
                if root {
                    observations.push(self.observe_node(derived, ctx, subscriber));
                }
                self.observe_dependencies(derived.dependencies(), ctx, subscriber, observations)
            }
            Variable::Switch(switch) => {
                for operand in [switch.value(), switch.value_map(), switch.default_value()] {
                    match operand {
                        Operand::Variable(variable) => {
                            self.observe(variable, ctx, subscriber, false, observations)?
                        }
                        Operand::Condition(condition) => {
                            self.observe(&condition.variable, ctx, subscriber, false, observations)?;
                            if let Dependency::Variable(other) = &condition.other {
                                self.observe(other, ctx, subscriber, false, observations)?;
                            }
                        }
                        Operand::Constant(_) => {}
                    }
                }
                Ok(())
            }
            Variable::State(state) => {
                let parent = Variable::Derived(state.parent().clone());
                self.observe(&parent, ctx, subscriber, true, observations)
            }
            Variable::Stream(_) => Err(UsageError::Unsupported {
                kind: variable.kind(),
                uid: variable.uid().to_string(),
                accessor: "the stream subsystem",
            }
            .into()),
        }
    }

    /// Plain inputs below a derived variable. Nested derived variables are
    /// already covered by the trigger list.
    fn observe_dependencies(
        &self,
        dependencies: &[Dependency],
        ctx: &ResolutionContext,
        subscriber: &Subscriber,
        observations: &mut Vec<Observation>,
    ) -> Result<()> {
        for dependency in dependencies {
            match dependency.as_variable() {
                Some(Variable::Derived(derived)) => {
                    self.observe_dependencies(derived.dependencies(), ctx, subscriber, observations)?
                }
                Some(Variable::Server(_)) | None => {}
                Some(other) => self.observe(other, ctx, subscriber, false, observations)?,
            }
        }
        Ok(())
    }

    fn observe_value(
        &self,
        plain: &PlainVariable,
        ctx: &ResolutionContext,
        subscriber: &Subscriber,
    ) -> Observation {
        let signal = self
            .inner
            .values
            .entry(ctx.instance_key(plain.uid()))
            .or_insert_with(|| Signal::new(None))
            .clone();
        let id = signal.subscribe(subscriber.clone());
        Observation::new(move || signal.unsubscribe(id))
    }

    fn observe_trigger(&self, key: String, subscriber: &Subscriber) -> Observation {
        let id = self.inner.triggers.subscribe(&key, subscriber.clone());
        let inner = Arc::downgrade(&self.inner);
        Observation::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.triggers.unsubscribe(&key, id);
            }
        })
    }

    fn observe_node(
        &self,
        derived: &DerivedVariable,
        ctx: &ResolutionContext,
        subscriber: &Subscriber,
    ) -> Observation {
        let key = ctx.instance_key(derived.uid());
        let node = self.inner.results.node(derived.uid(), &key);
        self.inner.results.retain(&node);
        let id = node.subscribe(subscriber.clone());
        let inner = Arc::downgrade(&self.inner);
        Observation::new(move || {
            node.unsubscribe(id);
            if let Some(inner) = inner.upgrade() {
                inner.results.release(node.key());
            }
        })
    }

    /// Apply one server push.
    pub fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::TaskCompleted { task_id } => {
                self.inner.tasks.notify(&task_id, TaskStatus::Completed)
            }
            Notification::TaskFailed { task_id, error } => {
                self.inner.tasks.notify(&task_id, TaskStatus::Failed(error))
            }
            Notification::TaskCancelled { task_id } => {
                self.inner.tasks.notify(&task_id, TaskStatus::Cancelled)
            }
            Notification::ServerTrigger { uid, context } => {
                let key = ResolutionContext::new(context).instance_key(&Uid::from(uid));
                self.inner.advance_sequence(&key);
                self.inner.triggers.bump(&key, false);
            }
        }
    }

    /// Drain `notifications` in a background task until the sender side
    /// closes or the engine is dropped.
    pub fn listen(&self, mut notifications: mpsc::UnboundedReceiver<Notification>) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Engine { inner }.handle_notification(notification);
            }
            debug!("notification listener stopped");
        })
    }

    /// Drop the cached result of one resolution-instance key, typically the
    /// [`EngineError::cache_key`] of a failure. The next read refetches.
    pub fn evict(&self, key: &str) -> bool {
        self.inner.inflight.supersede(key);
        let had_entry = self.inner.deps.remove(key).is_some();
        let had_node = self.inner.results.evict(key);
        debug!(key, "evicted");
        had_entry || had_node
    }

    /// Clear every registry, stop pollers and forget tracked tasks.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.abort_pollers();
        let cancelled = inner.tasks.clear();
        inner.fetcher.clear();
        inner.inflight.clear();
        inner.triggers.clear();
        inner.deps.clear();
        inner.results.clear();
        inner.values.clear();
        inner.sequences.clear();
        debug!(cancelled = cancelled.len(), "engine reset");
    }

    pub fn instance_key(&self, variable: &Variable, ctx: &ResolutionContext) -> String {
        ctx.instance_key(variable.uid())
    }

    pub fn deps_entry(&self, variable: &Variable, ctx: &ResolutionContext) -> Option<DepsCacheEntry> {
        self.inner.deps.get(&ctx.instance_key(variable.uid()))
    }

    pub fn trigger_handle(
        &self,
        variable: &Variable,
        ctx: &ResolutionContext,
    ) -> Option<TriggerHandle> {
        self.inner.triggers.get(&ctx.instance_key(variable.uid()))
    }

    pub fn active_tasks(&self, variable: &Variable, ctx: &ResolutionContext) -> Vec<String> {
        self.inner.tasks.active_tasks(&ctx.instance_key(variable.uid()))
    }

    /// The result node of a derived variable, if it was ever registered.
    pub fn result_node(&self, variable: &Variable, ctx: &ResolutionContext) -> Option<Arc<ResultNode>> {
        self.inner.results.get(&ctx.instance_key(variable.uid()))
    }
}

impl EngineInner {
    /// Full value of a derived variable, before nested extraction.
    async fn resolve_derived(
        self: &Arc<Self>,
        variable: &DerivedVariable,
        ctx: &ResolutionContext,
        ancestors: &[Uid],
    ) -> Result<Value> {
        let span = tracing::debug_span!(
            "resolve_derived",
            uid = %variable.uid(),
            context = ctx.id()
        );
        async move {
            let key = ctx.instance_key(variable.uid());
            let resolved = Resolver::new(self, ctx)
                .resolve_derived(variable, ancestors)
                .await?;
            let triggers: Vec<TriggerSnapshot> = build_trigger_list(variable)?
                .into_iter()
                .map(|entry| TriggerSnapshot {
                    handle: self.triggers.ensure(&ctx.instance_key(entry.variable.uid())),
                    path: entry.path,
                })
                .collect();

            let deps = resolved.deps.unwrap_or_default();
            let node = self.results.node(variable.uid(), &key);
            match self
                .deps
                .resolve_derived_value(&key, &deps, resolved.values, &triggers)?
            {
                DerivedResolution::Previous(result) => {
                    node.commit(result.clone());
                    Ok(result)
                }
                DerivedResolution::Current {
                    relevant_inputs,
                    force_key,
                    values,
                } => {
                    if let Some(error) = node.failure_for(&relevant_inputs) {
                        debug!(key = %key, "inputs unchanged since failure, not retrying");
                        return Err(error);
                    }
                    let request = DerivedRequest {
                        values: values.iter().map(ResolvedVariable::strip_deps).collect(),
                        force_key,
                        channel_id: ctx.channel_id().map(str::to_string),
                    };
                    let fetch = self.inflight.join_or_start(
                        &key,
                        relevant_inputs.clone(),
                        |generation| {
                            let job = FetchJob {
                                key: key.clone(),
                                uid: variable.uid().clone(),
                                ctx: ctx.clone(),
                                node,
                                generation,
                                inputs: relevant_inputs,
                                request,
                            };
                            Arc::clone(self).fetch_and_store(job).boxed()
                        },
                    );
                    fetch.await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_and_store(self: Arc<Self>, job: FetchJob) -> Result<Value> {
        let FetchJob {
            key,
            uid,
            ctx,
            node,
            generation,
            inputs,
            request,
        } = job;

        node.mark_pending();
        let outcome = self.fetch_value(&key, &uid, &ctx, generation, request).await;
        let current = self.inflight.is_current(&key, generation);

        let result = match outcome {
            Ok(value) => {
                if current {
                    self.deps.store(&key, inputs, value.clone());
                    node.commit(value.clone());
                } else {
                    warn!(key = %key, generation, "dropping superseded result");
                }
                Ok(value)
            }
            Err(err) if err.is_cancelled() => {
                let fallback = self
                    .deps
                    .get(&key)
                    .map(|entry| entry.result)
                    .or_else(|| node.value())
                    .unwrap_or(Value::Null);
                if current {
                    node.settle();
                }
                debug!(key = %key, "task cancelled, serving previous value");
                Ok(fallback)
            }
            Err(err) => {
                if current {
                    node.fail(err.clone(), inputs);
                }
                Err(err)
            }
        };
        self.inflight.finish(&key, generation);
        result
    }

    async fn fetch_value(
        &self,
        key: &str,
        uid: &Uid,
        ctx: &ResolutionContext,
        generation: u64,
        request: DerivedRequest,
    ) -> Result<Value> {
        let endpoint = self.config.derived_endpoint(uid.as_str());
        let call = {
            let transport = Arc::clone(&self.transport);
            let ctx = ctx.clone();
            let key = key.to_string();
            move |request: DerivedRequest| async move {
                transport
                    .remote_call(&endpoint, &request, &ctx)
                    .await
                    .map_err(|err| EngineError::remote(&key, ctx.id(), err))
            }
        };

        let fetched = self.fetcher.fetch(key, ctx.id(), request, call).await?;
        match fetched.response {
            RemoteResponse::Value { value } => Ok(value),
            RemoteResponse::Task { task_id } => {
                self.run_task(key, ctx, &task_id, generation, fetched.own_request)
                    .await
            }
        }
    }

    /// Track and await `task_id`. A fetch that was superseded while its
    /// remote call ran never displaces the newer generation's task; it drops
    /// its own task instead. A task answering another caller's request is
    /// left to that caller.
    async fn run_task(
        &self,
        key: &str,
        ctx: &ResolutionContext,
        task_id: &str,
        generation: u64,
        own_request: bool,
    ) -> Result<Value> {
        let start = if self.inflight.is_current(key, generation) {
            self.tasks.start_task(task_id, key, generation)
        } else {
            TaskStart::Stale
        };
        match start {
            TaskStart::Joined => debug!(key, task_id, "joined running task"),
            TaskStart::Started { superseded } => {
                debug!(key, task_id, "task started");
                self.cancel_remote(superseded, ctx);
            }
            TaskStart::Stale => {
                debug!(key, task_id, generation, "task of a superseded fetch");
                if own_request {
                    self.cancel_remote(vec![task_id.to_string()], ctx);
                }
                return Err(EngineError::TaskCancelled {
                    task_id: task_id.to_string(),
                });
            }
        }
        let _guard = TaskGuard::new(&self.tasks, task_id);

        let failed = |message: &str| EngineError::Task {
            key: key.to_string(),
            context: ctx.id().to_string(),
            task_id: task_id.to_string(),
            message: message.into(),
        };
        match self.tasks.wait_for_task(task_id).await {
            Ok(()) => match self.transport.await_task(task_id, ctx).await {
                Ok(value) => Ok(value),
                Err(TransportError::TaskFailed { message, .. }) => Err(failed(&message)),
                Err(err) => Err(EngineError::remote(key, ctx.id(), err)),
            },
            Err(TaskFailure::Cancelled) => Err(EngineError::TaskCancelled {
                task_id: task_id.to_string(),
            }),
            Err(TaskFailure::Failed(message)) => Err(failed(&message)),
        }
    }

    fn advance_sequence(&self, key: &str) {
        *self.sequences.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Ask the server to stop superseded tasks, in the background.
    fn cancel_remote(&self, task_ids: Vec<String>, ctx: &ResolutionContext) {
        if task_ids.is_empty() || !self.config.cancel_remote_tasks {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(count = task_ids.len(), "no runtime, superseded tasks only cancelled locally");
            return;
        };
        let transport = Arc::clone(&self.transport);
        let ctx = ctx.clone();
        runtime.spawn(async move {
            for task_id in task_ids {
                if let Err(err) = transport.cancel_task(&task_id, &ctx).await {
                    warn!(task_id = %task_id, error = %err, "failed to cancel superseded task");
                }
            }
        });
    }

    fn spawn_poller(self: &Arc<Self>, variable: &DerivedVariable, key: &str) {
        let Some(interval) = variable.polling_interval().filter(|i| !i.is_zero()) else {
            return;
        };
        let Entry::Vacant(slot) = self.pollers.entry(key.to_string()) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let engine: Weak<EngineInner> = Arc::downgrade(self);
        let poll_key = key.to_string();
        debug!(key, ?interval, "polling");
        slot.insert(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.triggers.bump(&poll_key, false);
            }
        }));
    }

    fn abort_pollers(&self) {
        for poller in self.pollers.iter() {
            poller.abort();
        }
        self.pollers.clear();
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.abort_pollers();
    }
}

impl ResolveHost for Arc<EngineInner> {
    fn register_derived(&self, variable: &DerivedVariable, ctx: &ResolutionContext) {
        let key = ctx.instance_key(variable.uid());
        self.triggers.ensure(&key);
        self.results.node(variable.uid(), &key);
        self.spawn_poller(variable, &key);
    }

    fn register_server(&self, uid: &Uid, ctx: &ResolutionContext) {
        self.triggers.ensure(&ctx.instance_key(uid));
    }

    fn client_value(&self, variable: &PlainVariable, ctx: &ResolutionContext) -> Option<Value> {
        self.values
            .get(&ctx.instance_key(variable.uid()))
            .and_then(|signal| signal.get())
    }

    fn sequence_number(&self, uid: &Uid, ctx: &ResolutionContext) -> u64 {
        self.sequences
            .get(&ctx.instance_key(uid))
            .map_or(0, |sequence| *sequence)
    }

    fn materialize<'a>(
        &'a self,
        variable: &'a DerivedVariable,
        ctx: &'a ResolutionContext,
        ancestors: &'a [Uid],
    ) -> BoxFuture<'a, Result<Value>> {
        async move {
            let value = self.resolve_derived(variable, ctx, ancestors).await?;
            Ok(extract_nested(&value, variable.nested()))
        }
        .boxed()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("triggers", &self.inner.triggers.len())
            .field("results", &self.inner.results.len())
            .finish()
    }
}
