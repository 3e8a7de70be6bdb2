use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};
use weft_types::{CandidateEvent, Context};

use crate::backend::StepBackend;
use crate::error::{InvocationError, InvokeError, InvokeResult};
use crate::step::{InFlightKey, RetryPolicy, StepRef};

/// Configuration for the step invoker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    /// Upper bound on backend calls running at once, across all instances.
    pub max_concurrency: usize,
    /// Per-attempt deadline for steps that do not declare their own.
    pub default_timeout_ms: Option<u64>,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            default_timeout_ms: Some(30_000),
        }
    }
}

/// One request to run a step.
#[derive(Clone, Debug)]
pub struct StepCall {
    pub key: InFlightKey,
    pub step: StepRef,
    /// The frozen context the step sees for its whole invocation.
    pub context: Context,
    pub input: Value,
    pub retry: RetryPolicy,
    /// Overrides [`InvokerConfig::default_timeout_ms`].
    pub timeout_ms: Option<u64>,
}

impl StepCall {
    pub fn new(key: InFlightKey, step: StepRef, context: Context, input: Value) -> Self {
        Self {
            key,
            step,
            context,
            input,
            retry: RetryPolicy::default(),
            timeout_ms: None,
        }
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Successful output of a step.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub events: Vec<CandidateEvent>,
    pub attempts: u32,
    /// Version of the context the step ran against.
    pub context_version: u64,
}

/// Removes its key from the in-flight set when dropped.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
    key: InFlightKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

enum Attempt {
    Done(Result<Vec<CandidateEvent>, InvocationError>),
    TimedOut(u64),
}

/// Runs agent and tool steps against a [`StepBackend`].
///
/// Guarantees at most one outstanding call per [`InFlightKey`] and bounds
/// the number of concurrent backend calls.
pub struct StepInvoker {
    backend: Arc<dyn StepBackend>,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
    permits: Semaphore,
    config: InvokerConfig,
}

impl StepInvoker {
    pub fn new(backend: Arc<dyn StepBackend>, config: InvokerConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrency.max(1));
        Self {
            backend,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits,
            config,
        }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    pub fn is_in_flight(&self, key: &InFlightKey) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn claim(&self, key: &InFlightKey) -> InvokeResult<InFlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(key.clone()) {
            return Err(InvokeError::AlreadyInFlight(key.clone()));
        }
        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.clone(),
        })
    }

    /// Run a step to completion, including retries.
    ///
    /// A second call for a key that is still outstanding fails immediately
    /// with [`InvokeError::AlreadyInFlight`] and does not reach the backend.
    #[instrument(skip_all, fields(step = %call.step, key = %call.key, version = call.context.version()))]
    pub async fn invoke(&self, call: StepCall) -> InvokeResult<Invocation> {
        let _guard = self.claim(&call.key)?;
        let _permit = self.permits.acquire().await.map_err(|_| InvokeError::Closed)?;

        let StepCall {
            step,
            context,
            input,
            retry,
            timeout_ms,
            ..
        } = call;
        let timeout_ms = timeout_ms.or(self.config.default_timeout_ms);
        let max_attempts = retry.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let fut = self.backend.invoke(&step, &context, &input);
            let outcome = match timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                    Ok(result) => Attempt::Done(result),
                    Err(_) => Attempt::TimedOut(ms),
                },
                None => Attempt::Done(fut.await),
            };

            match outcome {
                Attempt::Done(Ok(events)) if events.is_empty() => {
                    return Err(InvokeError::EmptyOutput(step));
                }
                Attempt::Done(Ok(events)) => {
                    debug!(events = events.len(), attempt, "Step completed");
                    return Ok(Invocation {
                        events,
                        attempts: attempt,
                        context_version: context.version(),
                    });
                }
                Attempt::Done(Err(error)) if error.is_transient() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %error.message, "Transient step failure, retrying");
                }
                Attempt::Done(Err(error)) => {
                    return Err(InvokeError::Failed {
                        step,
                        attempts: attempt,
                        source: error,
                    });
                }
                Attempt::TimedOut(ms) if attempt < max_attempts => {
                    warn!(attempt, max_attempts, timeout_ms = ms, "Step timed out, retrying");
                }
                Attempt::TimedOut(ms) => {
                    return Err(InvokeError::Timeout {
                        step,
                        timeout_ms: ms,
                        attempts: attempt,
                    });
                }
            }

            if retry.backoff_ms > 0 {
                tokio::time::sleep(retry.backoff(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HandlerRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use weft_types::{Event, EventData, EventId, EventType, Timestamp};

    fn response() -> CandidateEvent {
        CandidateEvent::parse("tool.response").unwrap().with("ok", true)
    }

    fn call(node: &str) -> StepCall {
        StepCall::new(
            InFlightKey::new("i-1", node),
            StepRef::tool("t"),
            Context::empty(),
            json!({}),
        )
    }

    struct Gated {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl StepBackend for Gated {
        async fn invoke(
            &self,
            _step: &StepRef,
            _context: &Context,
            _input: &Value,
        ) -> Result<Vec<CandidateEvent>, InvocationError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(vec![response()])
        }
    }

    #[tokio::test]
    async fn second_call_for_same_key_is_rejected_while_outstanding() {
        let backend = Arc::new(Gated {
            started: Notify::new(),
            release: Notify::new(),
        });
        let invoker = Arc::new(StepInvoker::new(backend.clone(), InvokerConfig::default()));

        let first = tokio::spawn({
            let invoker = Arc::clone(&invoker);
            async move { invoker.invoke(call("search")).await }
        });
        backend.started.notified().await;

        let second = invoker.invoke(call("search")).await;
        assert!(matches!(second, Err(InvokeError::AlreadyInFlight(_))));
        assert!(invoker.is_in_flight(&InFlightKey::new("i-1", "search")));

        backend.release.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(invoker.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        {
            let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
            registry.register_tool("t", move |_ctx, _input| {
                let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(vec![response()])
                }
            });
        }
        let invoker = StepInvoker::new(
            Arc::new(registry),
            InvokerConfig {
                max_concurrency: 2,
                default_timeout_ms: None,
            },
        );

        let calls = (0..6).map(|i| invoker.invoke(call(&format!("n{i}"))));
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_times_out() {
        let registry = HandlerRegistry::new();
        registry.register_tool("t", |_ctx, _input| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec![response()])
        });
        let invoker = StepInvoker::new(Arc::new(registry), InvokerConfig::default());

        let err = invoker
            .invoke(call("slow").timeout_ms(Some(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.attempts(), 1);
    }

    fn flaky(failures: u32, transient: bool) -> (HandlerRegistry, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = HandlerRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register_tool("t", move |_ctx, _input| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(if transient {
                        InvocationError::transient("busy")
                    } else {
                        InvocationError::permanent("bad input")
                    })
                } else {
                    Ok(vec![response()])
                }
            }
        });
        (registry, calls)
    }

    #[tokio::test]
    async fn transient_failures_are_retried_up_to_the_limit() {
        let (registry, calls) = flaky(2, true);
        let invoker = StepInvoker::new(Arc::new(registry), InvokerConfig::default());
        let ok = invoker
            .invoke(call("a").retry(RetryPolicy::attempts(3)))
            .await
            .unwrap();
        assert_eq!(ok.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let (registry, _) = flaky(2, true);
        let invoker = StepInvoker::new(Arc::new(registry), InvokerConfig::default());
        let err = invoker
            .invoke(call("a").retry(RetryPolicy::attempts(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Failed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn no_retry_by_default_or_for_permanent_failures() {
        let (registry, calls) = flaky(1, true);
        let invoker = StepInvoker::new(Arc::new(registry), InvokerConfig::default());
        assert!(invoker.invoke(call("a")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (registry, calls) = flaky(1, false);
        let invoker = StepInvoker::new(Arc::new(registry), InvokerConfig::default());
        assert!(invoker
            .invoke(call("a").retry(RetryPolicy::attempts(5)))
            .await
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_output_is_an_error() {
        let registry = HandlerRegistry::new();
        registry.register_tool("t", |_ctx, _input| async { Ok(Vec::new()) });
        let invoker = StepInvoker::new(Arc::new(registry), InvokerConfig::default());
        assert!(matches!(
            invoker.invoke(call("a")).await,
            Err(InvokeError::EmptyOutput(_))
        ));
    }

    #[tokio::test]
    async fn step_sees_the_snapshot_it_was_given() {
        let registry = HandlerRegistry::new();
        registry.register_tool("t", |ctx: Context, _input| async move {
            Ok(vec![response().with("seen", ctx.version())])
        });
        let invoker = StepInvoker::new(Arc::new(registry), InvokerConfig::default());

        let event = Event::seal(
            EventId::new(),
            EventType::parse("user.query").unwrap(),
            Timestamp::from_millis(1),
            EventData::new(),
        );
        let context = Context::from_events(vec![event.clone(), event]);
        let mut step = call("a");
        step.context = context.clone();

        let out = invoker.invoke(step).await.unwrap();
        assert_eq!(out.context_version, 2);
        assert_eq!(out.events[0].data["seen"], json!(2));
        assert_eq!(context.version(), 2);
    }
}
