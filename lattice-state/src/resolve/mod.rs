//! Dependency Resolution
//!
//! Turns a variable into the request shape sent to the server
//! ([`ResolvedVariable`]) and, for local reads, into a plain value.
//!
//! # How Resolution Works
//!
//! 1. Derived variables resolve each dependency recursively. Constants pass
//!    through unchanged, nested derived variables become nested requests.
//!
//! 2. Plain variables resolve to the client value, or to the materialized
//!    value of their derived default when no client value was written.
//!
//! 3. Server variables resolve to their current sequence number.
//!
//! 4. Switch variables resolve selector, map and default independently.
//!
//! Resolution performs no I/O of its own: the only suspension point is a
//! plain variable waiting on its derived default. The graph must be acyclic;
//! a derived variable reached again below itself is rejected with
//! [`UsageError::Cycle`].

mod triggers;

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::engine::ResolutionContext;
use crate::error::{Result, UsageError};
use crate::materialize::extract_nested;
use crate::variable::{
    select_case, Dependency, DerivedVariable, Operand, Operator, PlainDefault, PlainVariable,
    Uid, Variable,
};

pub use triggers::{build_trigger_list, PathSegment, TriggerEntry, TriggerHandle, TriggerRegistry};

/// Serialized request form of a variable subtree.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedVariable {
    Derived(ResolvedDerived),
    Server(ResolvedServer),
    Switch(ResolvedSwitch),
    Condition(ResolvedCondition),
    /// Constants and plain values pass through as-is.
    Value(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedDerived {
    pub uid: Uid,
    pub values: Vec<ResolvedVariable>,
    /// Positions of cache-relevant values. `None` once stripped for the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deps: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedServer {
    pub uid: Uid,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSwitch {
    pub uid: Uid,
    pub value: Box<ResolvedVariable>,
    pub value_map: Box<ResolvedVariable>,
    pub default: Box<ResolvedVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedCondition {
    pub variable: Box<ResolvedVariable>,
    pub operator: Operator,
    pub other: Box<ResolvedVariable>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Tagged<'a> {
    Derived(&'a ResolvedDerived),
    Server(&'a ResolvedServer),
    Switch(&'a ResolvedSwitch),
    Condition(&'a ResolvedCondition),
}

impl Serialize for ResolvedVariable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ResolvedVariable::Derived(d) => Tagged::Derived(d).serialize(serializer),
            ResolvedVariable::Server(s) => Tagged::Server(s).serialize(serializer),
            ResolvedVariable::Switch(s) => Tagged::Switch(s).serialize(serializer),
            ResolvedVariable::Condition(c) => Tagged::Condition(c).serialize(serializer),
            ResolvedVariable::Value(v) => v.serialize(serializer),
        }
    }
}

impl ResolvedVariable {
    /// Copy of this subtree without `deps` markers; the server never needs them.
    pub fn strip_deps(&self) -> ResolvedVariable {
        match self {
            ResolvedVariable::Derived(derived) => ResolvedVariable::Derived(ResolvedDerived {
                deps: None,
                values: derived.values.iter().map(Self::strip_deps).collect(),
                ..derived.clone()
            }),
            ResolvedVariable::Switch(switch) => ResolvedVariable::Switch(ResolvedSwitch {
                uid: switch.uid.clone(),
                value: Box::new(switch.value.strip_deps()),
                value_map: Box::new(switch.value_map.strip_deps()),
                default: Box::new(switch.default.strip_deps()),
            }),
            ResolvedVariable::Condition(condition) => {
                ResolvedVariable::Condition(ResolvedCondition {
                    variable: Box::new(condition.variable.strip_deps()),
                    operator: condition.operator,
                    other: Box::new(condition.other.strip_deps()),
                })
            }
            other => other.clone(),
        }
    }

    /// Follow `path` down to a nested node.
    pub fn node_at_mut(&mut self, path: &[PathSegment]) -> Option<&mut ResolvedVariable> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };
        let child = match (self, first) {
            (ResolvedVariable::Derived(d), PathSegment::Value(idx)) => d.values.get_mut(*idx)?,
            (ResolvedVariable::Switch(s), PathSegment::Selector) => s.value.as_mut(),
            (ResolvedVariable::Switch(s), PathSegment::ValueMap) => s.value_map.as_mut(),
            (ResolvedVariable::Switch(s), PathSegment::Default) => s.default.as_mut(),
            (ResolvedVariable::Condition(c), PathSegment::Operand) => c.variable.as_mut(),
            (ResolvedVariable::Condition(c), PathSegment::Other) => c.other.as_mut(),
            _ => return None,
        };
        child.node_at_mut(rest)
    }
}

/// Embed `force_key` into the derived request found at `path` below `values`.
///
/// Returns false when the path does not lead to a derived request.
pub fn set_nested_force_key(
    values: &mut [ResolvedVariable],
    path: &[PathSegment],
    force_key: &str,
) -> bool {
    let Some((PathSegment::Value(idx), rest)) = path.split_first() else {
        return false;
    };
    match values.get_mut(*idx).and_then(|node| node.node_at_mut(rest)) {
        Some(ResolvedVariable::Derived(derived)) => {
            derived.force_key = Some(force_key.to_string());
            true
        }
        _ => false,
    }
}

/// What the resolver needs from the engine that owns the registries.
pub(crate) trait ResolveHost: Send + Sync {
    /// Lazily create the trigger handle and result node of a derived variable.
    fn register_derived(&self, variable: &DerivedVariable, ctx: &ResolutionContext);

    /// Lazily create the trigger handle of a server variable.
    fn register_server(&self, uid: &Uid, ctx: &ResolutionContext);

    /// The value written by the client, if any.
    fn client_value(&self, variable: &PlainVariable, ctx: &ResolutionContext) -> Option<Value>;

    fn sequence_number(&self, uid: &Uid, ctx: &ResolutionContext) -> u64;

    /// Resolve a derived variable all the way to its (nested) value.
    fn materialize<'a>(
        &'a self,
        variable: &'a DerivedVariable,
        ctx: &'a ResolutionContext,
        ancestors: &'a [Uid],
    ) -> BoxFuture<'a, Result<Value>>;
}

/// Resolves variables under one context.
pub(crate) struct Resolver<'a, H: ?Sized> {
    host: &'a H,
    ctx: &'a ResolutionContext,
}

impl<'a, H: ResolveHost + ?Sized> Resolver<'a, H> {
    pub fn new(host: &'a H, ctx: &'a ResolutionContext) -> Self {
        Self { host, ctx }
    }

    /// Request shape of `variable`.
    pub fn resolve<'v>(
        &'v self,
        variable: &'v Variable,
        ancestors: &'v [Uid],
    ) -> BoxFuture<'v, Result<ResolvedVariable>> {
        async move {
            match variable {
                Variable::Plain(plain) => {
                    Ok(ResolvedVariable::Value(self.plain_value(plain, ancestors).await?))
                }
                Variable::Derived(derived) => Ok(ResolvedVariable::Derived(
                    self.resolve_derived(derived, ancestors).await?,
                )),
                Variable::Server(server) => {
                    self.host.register_server(server.uid(), self.ctx);
                    Ok(ResolvedVariable::Server(ResolvedServer {
                        uid: server.uid().clone(),
                        sequence_number: self.host.sequence_number(server.uid(), self.ctx),
                    }))
                }
                Variable::Switch(switch) => Ok(ResolvedVariable::Switch(ResolvedSwitch {
                    uid: switch.uid().clone(),
                    value: Box::new(self.resolve_operand(switch.value(), ancestors).await?),
                    value_map: Box::new(
                        self.resolve_operand(switch.value_map(), ancestors).await?,
                    ),
                    default: Box::new(
                        self.resolve_operand(switch.default_value(), ancestors).await?,
                    ),
                })),
                Variable::State(_) | Variable::Stream(_) => Err(unsupported(variable).into()),
            }
        }
        .boxed()
    }

    /// Request shape of a derived variable, with `deps` still attached.
    pub fn resolve_derived<'v>(
        &'v self,
        variable: &'v DerivedVariable,
        ancestors: &'v [Uid],
    ) -> BoxFuture<'v, Result<ResolvedDerived>> {
        async move {
            let chain = descend(ancestors, variable.uid())?;
            self.host.register_derived(variable, self.ctx);

            let mut values = Vec::with_capacity(variable.dependencies().len());
            for dependency in variable.dependencies() {
                values.push(self.resolve_dependency(dependency, &chain).await?);
            }

            Ok(ResolvedDerived {
                uid: variable.uid().clone(),
                values,
                deps: Some(variable.dep_indices()),
                force_key: None,
                nested: variable.nested().to_vec(),
            })
        }
        .boxed()
    }

    /// Local value of `variable`. Switches are combined here, never fetched.
    pub fn evaluate<'v>(
        &'v self,
        variable: &'v Variable,
        ancestors: &'v [Uid],
    ) -> BoxFuture<'v, Result<Value>> {
        async move {
            match variable {
                Variable::Plain(plain) => self.plain_value(plain, ancestors).await,
                Variable::Derived(derived) => {
                    self.host.materialize(derived, self.ctx, ancestors).await
                }
                Variable::Server(server) => {
                    self.host.register_server(server.uid(), self.ctx);
                    Ok(Value::from(self.host.sequence_number(server.uid(), self.ctx)))
                }
                Variable::Switch(switch) => {
                    let selector = self.evaluate_operand(switch.value(), ancestors).await?;
                    let value_map = self.evaluate_operand(switch.value_map(), ancestors).await?;
                    let default = self.evaluate_operand(switch.default_value(), ancestors).await?;
                    Ok(select_case(&selector, &value_map, &default))
                }
                Variable::State(_) | Variable::Stream(_) => Err(unsupported(variable).into()),
            }
        }
        .boxed()
    }

    async fn resolve_dependency(
        &self,
        dependency: &Dependency,
        ancestors: &[Uid],
    ) -> Result<ResolvedVariable> {
        match dependency {
            Dependency::Constant(value) => Ok(ResolvedVariable::Value(value.clone())),
            Dependency::Variable(variable) => self.resolve(variable, ancestors).await,
        }
    }

    async fn resolve_operand(&self, operand: &Operand, ancestors: &[Uid]) -> Result<ResolvedVariable> {
        match operand {
            Operand::Variable(variable) => self.resolve(variable, ancestors).await,
            Operand::Condition(condition) => Ok(ResolvedVariable::Condition(ResolvedCondition {
                variable: Box::new(self.resolve(&condition.variable, ancestors).await?),
                operator: condition.operator,
                other: Box::new(self.resolve_dependency(&condition.other, ancestors).await?),
            })),
            Operand::Constant(value) => Ok(ResolvedVariable::Value(value.clone())),
        }
    }

    async fn evaluate_operand(&self, operand: &Operand, ancestors: &[Uid]) -> Result<Value> {
        match operand {
            Operand::Variable(variable) => self.evaluate(variable, ancestors).await,
            Operand::Condition(condition) => {
                let value = self.evaluate(&condition.variable, ancestors).await?;
                let other = match &condition.other {
                    Dependency::Constant(other) => other.clone(),
                    Dependency::Variable(other) => self.evaluate(other, ancestors).await?,
                };
                Ok(Value::Bool(condition.operator.evaluate(&value, &other)))
            }
            Operand::Constant(value) => Ok(value.clone()),
        }
    }

    async fn plain_value(&self, plain: &PlainVariable, ancestors: &[Uid]) -> Result<Value> {
        let value = match self.host.client_value(plain, self.ctx) {
            Some(value) => value,
            None => match plain.default_value() {
                PlainDefault::Value(value) => value.clone(),
                PlainDefault::Derived(derived) => {
                    if ancestors.contains(derived.uid()) {
                        return Err(UsageError::Cycle {
                            uid: derived.uid().to_string(),
                        }
                        .into());
                    }
                    self.host.materialize(derived, self.ctx, ancestors).await?
                }
            },
        };
        Ok(extract_nested(&value, plain.nested()))
    }
}

fn descend(ancestors: &[Uid], uid: &Uid) -> Result<Vec<Uid>, UsageError> {
    if ancestors.contains(uid) {
        return Err(UsageError::Cycle {
            uid: uid.to_string(),
        });
    }
    let mut chain = ancestors.to_vec();
    chain.push(uid.clone());
    Ok(chain)
}

fn unsupported(variable: &Variable) -> UsageError {
    let accessor = match variable {
        Variable::State(_) => "Engine::read_state",
        _ => "the stream subsystem",
    };
    UsageError::Unsupported {
        kind: variable.kind(),
        uid: variable.uid().to_string(),
        accessor,
    }
}
