//! Programmable agent service for engine tests.

use agentflow_core::{AgentError, AgentService};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// What an invocation should do. Behaviors are registered under
/// `"<agent_id>:<function>"` or just `"<function>"`; the specific key wins.
#[derive(Clone)]
pub enum Behavior {
    /// Echo the invocation back as the output.
    Echo,
    /// Return a fixed value.
    Return(Value),
    /// Always fail with the given message.
    Fail(String),
    /// Fail the first `n` calls, then return the value.
    FailTimes(u32, Value),
    /// Sleep, then return the value.
    Sleep(Duration, Value),
    /// Block until a permit is released on the gate.
    Gated(Arc<Semaphore>),
}

#[derive(Default)]
pub struct MockAgentService {
    behaviors: DashMap<String, Behavior>,
    calls: DashMap<String, u32>,
    last_params: DashMap<String, Value>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl MockAgentService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, key: &str, behavior: Behavior) {
        self.behaviors.insert(key.to_string(), behavior);
    }

    /// Registers a gate and returns the release handle for it.
    pub fn set_gated(&self, key: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.behaviors
            .insert(key.to_string(), Behavior::Gated(gate.clone()));
        gate
    }

    /// Number of invocations of a function (across agents).
    pub fn calls(&self, function: &str) -> u32 {
        self.calls.get(function).map(|c| *c).unwrap_or(0)
    }

    /// Parameters of the most recent invocation of a function.
    pub fn last_params(&self, function: &str) -> Option<Value> {
        self.last_params.get(function).map(|p| p.value().clone())
    }

    /// High-water mark of concurrent invocations.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentService for MockAgentService {
    async fn execute(
        &self,
        agent_id: &str,
        function_name: &str,
        params: Value,
        _deadline: Duration,
    ) -> Result<Value, AgentError> {
        let call_index = {
            let mut count = self.calls.entry(function_name.to_string()).or_insert(0);
            let index = *count;
            *count += 1;
            index
        };
        self.last_params
            .insert(function_name.to_string(), params.clone());

        let live = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(live, Ordering::SeqCst);

        let specific = format!("{}:{}", agent_id, function_name);
        let behavior = self
            .behaviors
            .get(&specific)
            .map(|r| r.value().clone())
            .or_else(|| self.behaviors.get(function_name).map(|r| r.value().clone()));

        let result = match behavior {
            None | Some(Behavior::Echo) => Ok(json!({
                "ok": true,
                "agent": agent_id,
                "function": function_name,
                "params": params,
            })),
            Some(Behavior::Return(value)) => Ok(value),
            Some(Behavior::Fail(message)) => Err(AgentError::Execution(message)),
            Some(Behavior::FailTimes(n, value)) => {
                if call_index < n {
                    Err(AgentError::Execution(format!(
                        "induced failure {}",
                        call_index
                    )))
                } else {
                    Ok(value)
                }
            }
            Some(Behavior::Sleep(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Some(Behavior::Gated(gate)) => match gate.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    Ok(json!({"ok": true, "gated": true}))
                }
                Err(_) => Err(AgentError::Execution("gate closed".to_string())),
            },
        };

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
