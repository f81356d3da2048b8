//! Lattice State
//!
//! This crate provides the derived-variable resolution engine for the
//! Lattice reactive UI framework. It implements:
//!
//! - A variable model (plain, derived, server-backed, switch, state, stream)
//! - Dependency resolution into request shapes with trigger tracking
//! - Change detection against a per-instance deps cache
//! - Debounced, deduplicated remote fetches and background task tracking
//! - Result nodes that observers can subscribe to
//!
//! The network is not part of this crate: hosts plug in a
//! [`Transport`](fetch::Transport) and feed server pushes in as
//! [`Notification`](fetch::Notification)s.
//!
//! # Architecture
//!
//! - `variable`: The variable graph hosts declare
//! - `resolve`: Request shapes, trigger handles and the trigger list walk
//! - `cache`: Deps cache and result registry
//! - `fetch`: Transport seam, debouncing, in-flight generations, tasks
//! - `engine`: The [`Engine`] tying the registries together
//! - `reactive`: Signals used for observation
//!
//! # Example
//!
//! ```rust,ignore
//! use lattice_state::{DerivedVariable, Engine, PlainVariable, ResolutionContext, Variable};
//! use serde_json::json;
//!
//! let engine = Engine::new(transport);
//! let ctx = ResolutionContext::new("session-1");
//!
//! let x = PlainVariable::new("x", json!(1));
//! let total: Variable = DerivedVariable::new("total", [x.clone()]).into();
//!
//! let value = engine.resolve(&total, &ctx).await?; // fetched
//! let again = engine.resolve(&total, &ctx).await?; // served from cache
//!
//! engine.set_value(&x, &ctx, json!(2));
//! let fresh = engine.resolve(&total, &ctx).await?; // inputs moved, fetched
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod materialize;
pub mod reactive;
pub mod resolve;
pub mod variable;

pub use cache::{DepsCacheEntry, NodeStatus, Observation};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, ResolutionContext};
pub use error::{EngineError, Result, TransportError, UsageError};
pub use fetch::{DerivedRequest, Notification, RemoteResponse, Transport};
pub use resolve::{ResolvedVariable, TriggerHandle};
pub use variable::{
    Condition, Dependency, DerivedVariable, Operand, Operator, PlainVariable, ServerVariable,
    StateProperty, StateVariable, StreamVariable, SwitchVariable, Uid, Variable,
};
