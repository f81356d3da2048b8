//! In-flight fetch tracking.
//!
//! One derived fetch per resolution-instance key is "current". A caller whose
//! inputs match the current call joins it; different inputs start a newer
//! generation, and only the newest generation may write to the caches.

use std::collections::HashMap;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::Result;

pub type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

struct Call {
    generation: u64,
    inputs: Vec<Value>,
    future: SharedFetch,
}

#[derive(Default)]
pub struct InFlight {
    calls: Mutex<HashMap<String, Call>>,
    generations: DashMap<String, u64>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the current call for `key` if it was started with the same
    /// inputs, otherwise start a new generation with `start`.
    pub fn join_or_start<F>(&self, key: &str, inputs: Vec<Value>, start: F) -> SharedFetch
    where
        F: FnOnce(u64) -> BoxFuture<'static, Result<Value>>,
    {
        let mut calls = self.calls.lock();
        if let Some(call) = calls.get(key) {
            if call.inputs == inputs && self.is_current(key, call.generation) {
                trace!(key, generation = call.generation, "joining in-flight fetch");
                return call.future.clone();
            }
        }

        let generation = self.advance(key);
        let future = start(generation).shared();
        calls.insert(
            key.to_string(),
            Call {
                generation,
                inputs,
                future: future.clone(),
            },
        );
        future
    }

    pub fn is_current(&self, key: &str, generation: u64) -> bool {
        self.generations
            .get(key)
            .map_or(false, |current| *current == generation)
    }

    /// Forget the call of `generation` once it has settled.
    pub fn finish(&self, key: &str, generation: u64) {
        let mut calls = self.calls.lock();
        if calls
            .get(key)
            .map_or(false, |call| call.generation == generation)
        {
            calls.remove(key);
        }
    }

    /// Make whatever is in flight for `key` stale.
    pub fn supersede(&self, key: &str) {
        self.advance(key);
        self.calls.lock().remove(key);
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
        for mut generation in self.generations.iter_mut() {
            *generation += 1;
        }
    }

    fn advance(&self, key: &str) -> u64 {
        let mut generation = self.generations.entry(key.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }
}
