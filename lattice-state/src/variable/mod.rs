//! Variable Graph
//!
//! Variables describe UI state as a graph. A variable is declared once, is
//! immutable afterwards, and is cheap to clone: every variant keeps its
//! definition behind an `Arc` and only the nested path is per-handle.
//!
//! # Variants
//!
//! - `Plain`: a client-held value, optionally defaulting to a derived value.
//! - `Derived`: computed remotely from an ordered list of dependencies.
//! - `Server`: backed by an external store; identified by a sequence number.
//! - `Switch`: picks a value from a map using a selector, locally.
//! - `State`: the loading/error state of a derived variable.
//! - `Stream`: incrementally streamed by the server.
//!
//! Dispatch over variants is always an exhaustive `match`.

mod condition;
mod uid;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use smallvec::SmallVec;

pub use condition::{select_case, switch_key, Condition, Operator};
pub use uid::Uid;

/// Path into a structured value, one object key or array index per segment.
pub type NestedPath = SmallVec<[String; 2]>;

/// One entry of a derived variable's dependency list.
#[derive(Debug, Clone)]
pub enum Dependency {
    Variable(Variable),
    Constant(Value),
}

impl Dependency {
    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Dependency::Variable(variable) => Some(variable),
            Dependency::Constant(_) => None,
        }
    }
}

impl From<Variable> for Dependency {
    fn from(variable: Variable) -> Self {
        Dependency::Variable(variable)
    }
}

impl From<Value> for Dependency {
    fn from(value: Value) -> Self {
        Dependency::Constant(value)
    }
}

macro_rules! dependency_from {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Dependency {
            fn from(variable: $ty) -> Self {
                Dependency::Variable(variable.into())
            }
        }

        impl From<$ty> for Operand {
            fn from(variable: $ty) -> Self {
                Operand::Variable(variable.into())
            }
        }
    )*};
}

dependency_from!(PlainVariable, DerivedVariable, ServerVariable, SwitchVariable);

/// A switch input: a variable, a condition over a variable, or a constant.
#[derive(Debug, Clone)]
pub enum Operand {
    Variable(Variable),
    Condition(Condition),
    Constant(Value),
}

impl From<Variable> for Operand {
    fn from(variable: Variable) -> Self {
        Operand::Variable(variable)
    }
}

impl From<Condition> for Operand {
    fn from(condition: Condition) -> Self {
        Operand::Condition(condition)
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Constant(value)
    }
}

/// A node in the variable graph.
#[derive(Debug, Clone)]
pub enum Variable {
    Plain(PlainVariable),
    Derived(DerivedVariable),
    Server(ServerVariable),
    Switch(SwitchVariable),
    State(StateVariable),
    Stream(StreamVariable),
}

impl Variable {
    pub fn uid(&self) -> &Uid {
        match self {
            Variable::Plain(v) => &v.def.uid,
            Variable::Derived(v) => &v.def.uid,
            Variable::Server(v) => &v.uid,
            Variable::Switch(v) => &v.def.uid,
            Variable::State(v) => &v.uid,
            Variable::Stream(v) => &v.def.uid,
        }
    }

    /// Human-readable variant name, used in errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Variable::Plain(_) => "plain",
            Variable::Derived(_) => "derived",
            Variable::Server(_) => "server",
            Variable::Switch(_) => "switch",
            Variable::State(_) => "state",
            Variable::Stream(_) => "stream",
        }
    }

    /// The nested path applied when this handle is materialized.
    pub fn nested(&self) -> &[String] {
        match self {
            Variable::Plain(v) => &v.nested,
            Variable::Derived(v) => &v.nested,
            _ => &[],
        }
    }

    /// Returns a handle reading `key` below this variable's value.
    ///
    /// Only plain and derived variables carry nested paths; other variants
    /// are returned unchanged.
    pub fn get(&self, key: impl Into<String>) -> Variable {
        match self {
            Variable::Plain(v) => Variable::Plain(v.get(key)),
            Variable::Derived(v) => Variable::Derived(v.get(key)),
            other => other.clone(),
        }
    }

    pub fn as_derived(&self) -> Option<&DerivedVariable> {
        match self {
            Variable::Derived(derived) => Some(derived),
            _ => None,
        }
    }
}

/// The default of a plain variable.
#[derive(Debug, Clone)]
pub enum PlainDefault {
    Value(Value),
    Derived(DerivedVariable),
}

#[derive(Debug)]
struct PlainDef {
    uid: Uid,
    default: PlainDefault,
}

/// A value owned by the client.
#[derive(Debug, Clone)]
pub struct PlainVariable {
    def: Arc<PlainDef>,
    nested: NestedPath,
}

impl PlainVariable {
    pub fn new(uid: impl Into<Uid>, default: Value) -> Self {
        Self::with_default(uid, PlainDefault::Value(default))
    }

    /// A plain variable whose value starts out as a derived variable's value.
    pub fn from_derived(uid: impl Into<Uid>, default: DerivedVariable) -> Self {
        Self::with_default(uid, PlainDefault::Derived(default))
    }

    fn with_default(uid: impl Into<Uid>, default: PlainDefault) -> Self {
        Self {
            def: Arc::new(PlainDef {
                uid: uid.into(),
                default,
            }),
            nested: NestedPath::new(),
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.def.uid
    }

    pub fn default_value(&self) -> &PlainDefault {
        &self.def.default
    }

    pub fn nested(&self) -> &[String] {
        &self.nested
    }

    pub fn get(&self, key: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.nested.push(key.into());
        next
    }
}

#[derive(Debug)]
struct DerivedDef {
    uid: Uid,
    dependencies: Vec<Dependency>,
    deps: Option<Vec<(Uid, NestedPath)>>,
    polling_interval: Option<Duration>,
}

/// A value computed remotely from other variables.
#[derive(Debug, Clone)]
pub struct DerivedVariable {
    def: Arc<DerivedDef>,
    nested: NestedPath,
}

impl DerivedVariable {
    /// Every dependency is cache-relevant until [`with_deps`](Self::with_deps)
    /// narrows the set.
    pub fn new<I, D>(uid: impl Into<Uid>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dependency>,
    {
        Self {
            def: Arc::new(DerivedDef {
                uid: uid.into(),
                dependencies: dependencies.into_iter().map(Into::into).collect(),
                deps: None,
                polling_interval: None,
            }),
            nested: NestedPath::new(),
        }
    }

    /// Declare which dependencies matter for caching.
    ///
    /// Matched against the dependency list by uid and nested path; variables
    /// that are not dependencies are ignored.
    pub fn with_deps<'a>(self, deps: impl IntoIterator<Item = &'a Variable>) -> Self {
        let deps = deps
            .into_iter()
            .map(|v| (v.uid().clone(), v.nested().iter().cloned().collect()))
            .collect();
        self.rebuild(|def| def.deps = Some(deps))
    }

    /// Recompute on a timer, in addition to trigger and dependency changes.
    pub fn with_polling(self, interval: Duration) -> Self {
        self.rebuild(|def| def.polling_interval = Some(interval))
    }

    fn rebuild(self, edit: impl FnOnce(&mut DerivedDef)) -> Self {
        let mut def = DerivedDef {
            uid: self.def.uid.clone(),
            dependencies: self.def.dependencies.clone(),
            deps: self.def.deps.clone(),
            polling_interval: self.def.polling_interval,
        };
        edit(&mut def);
        Self {
            def: Arc::new(def),
            nested: self.nested,
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.def.uid
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.def.dependencies
    }

    pub fn polling_interval(&self) -> Option<Duration> {
        self.def.polling_interval
    }

    pub fn nested(&self) -> &[String] {
        &self.nested
    }

    pub fn get(&self, key: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.nested.push(key.into());
        next
    }

    /// Positions of the cache-relevant dependencies.
    ///
    /// Each declared dep maps to the dependency with the same uid and nested
    /// path, or else to the first one with the same uid. Constants are never
    /// relevant.
    pub fn dep_indices(&self) -> Vec<usize> {
        let dependencies = &self.def.dependencies;
        match &self.def.deps {
            None => dependencies
                .iter()
                .enumerate()
                .filter(|(_, dep)| dep.as_variable().is_some())
                .map(|(idx, _)| idx)
                .collect(),
            Some(declared) => {
                let mut indices: Vec<usize> = declared
                    .iter()
                    .filter_map(|(uid, nested)| {
                        let candidates = || {
                            dependencies.iter().enumerate().filter_map(|(idx, dep)| {
                                dep.as_variable()
                                    .filter(|v| v.uid() == uid)
                                    .map(|v| (idx, v.nested()))
                            })
                        };
                        candidates()
                            .find(|(_, path)| *path == &nested[..])
                            .or_else(|| candidates().next())
                            .map(|(idx, _)| idx)
                    })
                    .collect();
                indices.sort_unstable();
                indices.dedup();
                indices
            }
        }
    }
}

impl From<DerivedVariable> for Variable {
    fn from(variable: DerivedVariable) -> Self {
        Variable::Derived(variable)
    }
}

impl From<PlainVariable> for Variable {
    fn from(variable: PlainVariable) -> Self {
        Variable::Plain(variable)
    }
}

/// A value held by an external store, versioned by a sequence number that
/// the server bumps through push notifications.
#[derive(Debug, Clone)]
pub struct ServerVariable {
    uid: Uid,
}

impl ServerVariable {
    pub fn new(uid: impl Into<Uid>) -> Self {
        Self { uid: uid.into() }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }
}

impl From<ServerVariable> for Variable {
    fn from(variable: ServerVariable) -> Self {
        Variable::Server(variable)
    }
}

#[derive(Debug)]
struct SwitchDef {
    uid: Uid,
    value: Operand,
    value_map: Operand,
    default: Operand,
}

/// Chooses `value_map[selector]`, falling back to `default`.
#[derive(Debug, Clone)]
pub struct SwitchVariable {
    def: Arc<SwitchDef>,
}

impl SwitchVariable {
    pub fn new(
        uid: impl Into<Uid>,
        value: impl Into<Operand>,
        value_map: impl Into<Operand>,
        default: impl Into<Operand>,
    ) -> Self {
        Self {
            def: Arc::new(SwitchDef {
                uid: uid.into(),
                value: value.into(),
                value_map: value_map.into(),
                default: default.into(),
            }),
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.def.uid
    }

    pub fn value(&self) -> &Operand {
        &self.def.value
    }

    pub fn value_map(&self) -> &Operand {
        &self.def.value_map
    }

    pub fn default_value(&self) -> &Operand {
        &self.def.default
    }
}

impl From<SwitchVariable> for Variable {
    fn from(variable: SwitchVariable) -> Self {
        Variable::Switch(variable)
    }
}

/// Which facet of a derived variable a [`StateVariable`] exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateProperty {
    Loading,
    Error,
}

/// The loading or error state of a derived variable.
#[derive(Debug, Clone)]
pub struct StateVariable {
    uid: Uid,
    parent: DerivedVariable,
    property: StateProperty,
}

impl StateVariable {
    pub fn new(uid: impl Into<Uid>, parent: DerivedVariable, property: StateProperty) -> Self {
        Self {
            uid: uid.into(),
            parent,
            property,
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn parent(&self) -> &DerivedVariable {
        &self.parent
    }

    pub fn property(&self) -> StateProperty {
        self.property
    }
}

impl From<StateVariable> for Variable {
    fn from(variable: StateVariable) -> Self {
        Variable::State(variable)
    }
}

#[derive(Debug)]
struct StreamDef {
    uid: Uid,
    dependencies: Vec<Dependency>,
}

/// A value the server streams incrementally. Read by the stream subsystem,
/// never by the resolver.
#[derive(Debug, Clone)]
pub struct StreamVariable {
    def: Arc<StreamDef>,
}

impl StreamVariable {
    pub fn new<I, D>(uid: impl Into<Uid>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dependency>,
    {
        Self {
            def: Arc::new(StreamDef {
                uid: uid.into(),
                dependencies: dependencies.into_iter().map(Into::into).collect(),
            }),
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.def.uid
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.def.dependencies
    }
}

impl From<StreamVariable> for Variable {
    fn from(variable: StreamVariable) -> Self {
        Variable::Stream(variable)
    }
}
