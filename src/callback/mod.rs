//! 生命周期回调注册表
//!
//! Four hook lists, one per [`Stage`]. Executions copy the list for their stage
//! under a short read lock and invoke the copy after releasing it, so a callback
//! may register further callbacks without deadlocking. Registrations made during
//! an execution are seen by later executions only.

mod event;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::LLMError;

pub use event::{
    BeforeRequestEvent, EventMeta, FailureEvent, LifecycleEvent, Stage, StreamEvent, SuccessEvent,
};

/// Runs before the request is sent; an `Err` or a panic vetoes the request.
pub type BeforeRequestHook =
    Arc<dyn Fn(&RequestContext, &BeforeRequestEvent) -> anyhow::Result<()> + Send + Sync>;
/// 成功回调
pub type SuccessHook =
    Arc<dyn Fn(&RequestContext, &SuccessEvent) -> anyhow::Result<()> + Send + Sync>;
/// 失败回调
pub type FailureHook =
    Arc<dyn Fn(&RequestContext, &FailureEvent) -> anyhow::Result<()> + Send + Sync>;
/// 流式分片回调
pub type StreamHook =
    Arc<dyn Fn(&RequestContext, &StreamEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default, Clone)]
struct Hooks {
    before_request: Vec<BeforeRequestHook>,
    success: Vec<SuccessHook>,
    failure: Vec<FailureHook>,
    stream: Vec<StreamHook>,
}

/// Thread-safe registry of lifecycle callbacks.
///
/// Callbacks cannot be removed once registered.
#[derive(Default)]
pub struct CallbackRegistry {
    hooks: RwLock<Hooks>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_before_request<F>(&self, hook: F)
    where
        F: Fn(&RequestContext, &BeforeRequestEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.write().before_request.push(Arc::new(hook));
    }

    pub fn register_success<F>(&self, hook: F)
    where
        F: Fn(&RequestContext, &SuccessEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.write().success.push(Arc::new(hook));
    }

    pub fn register_failure<F>(&self, hook: F)
    where
        F: Fn(&RequestContext, &FailureEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.write().failure.push(Arc::new(hook));
    }

    pub fn register_stream<F>(&self, hook: F)
    where
        F: Fn(&RequestContext, &StreamEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.write().stream.push(Arc::new(hook));
    }

    /// Number of callbacks registered for `stage`.
    pub fn len(&self, stage: Stage) -> usize {
        let hooks = self.hooks.read();
        match stage {
            Stage::BeforeRequest => hooks.before_request.len(),
            Stage::Success => hooks.success.len(),
            Stage::Failure => hooks.failure.len(),
            Stage::Stream => hooks.stream.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let hooks = self.hooks.read();
        hooks.before_request.is_empty()
            && hooks.success.is_empty()
            && hooks.failure.is_empty()
            && hooks.stream.is_empty()
    }

    /// Runs every before-request callback in registration order.
    ///
    /// A failing or panicking callback does not stop the others. When any of them
    /// failed the request is vetoed with [`LLMError::Vetoed`], whose failures keep
    /// registration order. If `ctx` ends before a callback is reached, the
    /// remaining callbacks are skipped and the cancellation error is returned as is.
    pub fn execute_before_request(
        &self,
        ctx: &RequestContext,
        event: &BeforeRequestEvent,
    ) -> Result<(), LLMError> {
        let hooks = self.hooks.read().before_request.clone();
        if hooks.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for (position, hook) in hooks.iter().enumerate() {
            ctx.check()?;
            if let Err(message) = invoke(|| hook(ctx, event)) {
                debug!(
                    stage = %Stage::BeforeRequest,
                    request_id = %event.meta.request_id,
                    position,
                    error = %message,
                    "before-request callback rejected the request"
                );
                failures.push(message);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LLMError::Vetoed { failures })
        }
    }

    /// Runs success callbacks; their failures are logged and dropped.
    pub fn execute_success(&self, ctx: &RequestContext, event: &SuccessEvent) {
        let hooks = self.hooks.read().success.clone();
        observe(Stage::Success, ctx, &event.meta, &hooks, |hook| hook(ctx, event));
    }

    /// Runs failure callbacks; their failures are logged and dropped.
    pub fn execute_failure(&self, ctx: &RequestContext, event: &FailureEvent) {
        let hooks = self.hooks.read().failure.clone();
        observe(Stage::Failure, ctx, &event.meta, &hooks, |hook| hook(ctx, event));
    }

    /// Runs stream callbacks for one chunk; their failures are logged and dropped.
    pub fn execute_stream(&self, ctx: &RequestContext, event: &StreamEvent) {
        let hooks = self.hooks.read().stream.clone();
        observe(Stage::Stream, ctx, &event.meta, &hooks, |hook| hook(ctx, event));
    }

    /// Routes an event to the executor of its stage.
    ///
    /// Only [`LifecycleEvent::BeforeRequest`] can return an error.
    pub fn dispatch(&self, ctx: &RequestContext, event: &LifecycleEvent) -> Result<(), LLMError> {
        match event {
            LifecycleEvent::BeforeRequest(event) => self.execute_before_request(ctx, event),
            LifecycleEvent::Success(event) => {
                self.execute_success(ctx, event);
                Ok(())
            }
            LifecycleEvent::Failure(event) => {
                self.execute_failure(ctx, event);
                Ok(())
            }
            LifecycleEvent::Stream(event) => {
                self.execute_stream(ctx, event);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.read();
        f.debug_struct("CallbackRegistry")
            .field("before_request", &hooks.before_request.len())
            .field("success", &hooks.success.len())
            .field("failure", &hooks.failure.len())
            .field("stream", &hooks.stream.len())
            .finish()
    }
}

fn observe<H>(
    stage: Stage,
    ctx: &RequestContext,
    meta: &EventMeta,
    hooks: &[H],
    call: impl Fn(&H) -> anyhow::Result<()>,
) {
    for (position, hook) in hooks.iter().enumerate() {
        if let Some(reason) = ctx.err() {
            debug!(
                %stage,
                request_id = %meta.request_id,
                skipped = hooks.len() - position,
                %reason,
                "context ended, skipping remaining callbacks"
            );
            return;
        }
        if let Err(message) = invoke(|| call(hook)) {
            warn!(
                %stage,
                request_id = %meta.request_id,
                position,
                error = %message,
                "callback failed"
            );
        }
    }
}

/// Calls one callback, turning both its error and a panic into a message.
fn invoke(call: impl FnOnce() -> anyhow::Result<()>) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(format!("callback panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, Weak};

    use anyhow::anyhow;
    use chrono::Utc;

    use super::*;
    use crate::error::CancelReason;
    use crate::types::{CompletionChunk, CompletionRequest, CompletionResponse};

    fn meta() -> EventMeta {
        EventMeta::new("gpt-test", "openai_chat")
    }

    fn before_event() -> BeforeRequestEvent {
        BeforeRequestEvent::new(meta(), Arc::new(CompletionRequest::new("gpt-test")))
    }

    fn success_event() -> SuccessEvent {
        SuccessEvent::new(
            meta(),
            Arc::new(CompletionRequest::new("gpt-test")),
            Arc::new(CompletionResponse::default()),
            Utc::now(),
        )
    }

    fn failure_event() -> FailureEvent {
        FailureEvent::new(
            meta(),
            Arc::new(CompletionRequest::new("gpt-test")),
            LLMError::transport("down"),
            Utc::now(),
        )
    }

    fn stream_event(index: usize) -> StreamEvent {
        StreamEvent::new(meta(), CompletionChunk::default(), index)
    }

    #[test]
    fn empty_registry_is_a_no_op() {
        let registry = CallbackRegistry::new();
        let ctx = RequestContext::background();
        assert!(registry.is_empty());
        assert!(registry.execute_before_request(&ctx, &before_event()).is_ok());
        registry.execute_success(&ctx, &success_event());
        registry.execute_failure(&ctx, &failure_event());
        registry.execute_stream(&ctx, &stream_event(0));
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let registry = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for id in 0..5 {
            let seen = seen.clone();
            registry.register_success(move |_, _| {
                seen.lock().unwrap().push(id);
                Ok(())
            });
        }
        registry.execute_success(&RequestContext::background(), &success_event());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(registry.len(Stage::Success), 5);
        assert_eq!(registry.len(Stage::Failure), 0);
    }

    #[test]
    fn before_request_runs_every_callback_and_aggregates_failures() {
        let registry = CallbackRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        registry.register_before_request(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("e1"))
        });
        let counter = runs.clone();
        registry.register_before_request(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = runs.clone();
        registry.register_before_request(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("e2"))
        });

        let err = registry
            .execute_before_request(&RequestContext::background(), &before_event())
            .unwrap_err();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        match &err {
            LLMError::Vetoed { failures } => assert_eq!(failures, &["e1", "e2"]),
            other => panic!("unexpected error: {other:?}"),
        }
        let text = err.to_string();
        assert!(text.contains("e1") && text.contains("e2"));
    }

    #[test]
    fn panicking_before_request_callback_becomes_a_veto() {
        let registry = CallbackRegistry::new();
        let after = Arc::new(AtomicUsize::new(0));
        registry.register_before_request(|_, _| panic!("boom"));
        let counter = after.clone();
        registry.register_before_request(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = registry
            .execute_before_request(&RequestContext::background(), &before_event())
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
        assert!(err.to_string().contains("panicked"), "{err}");
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_failures_and_panics_are_absorbed() {
        let registry = CallbackRegistry::new();
        let after = Arc::new(AtomicUsize::new(0));
        registry.register_stream(|_, _| Err(anyhow!("ignored")));
        registry.register_stream(|_, _| panic!("{}", String::from("owned boom")));
        let counter = after.clone();
        registry.register_stream(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.execute_stream(&RequestContext::background(), &stream_event(0));
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_context_runs_nothing() {
        let registry = CallbackRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        registry.register_before_request(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = runs.clone();
        registry.register_success(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = runs.clone();
        registry.register_failure(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = runs.clone();
        registry.register_stream(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let ctx = RequestContext::background();
        ctx.cancel();
        let err = registry.execute_before_request(&ctx, &before_event()).unwrap_err();
        assert_eq!(err.cancel_reason(), Some(CancelReason::Cancelled));

        registry.execute_success(&ctx, &success_event());
        registry.execute_failure(&ctx, &failure_event());
        registry.execute_stream(&ctx, &stream_event(0));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_mid_run_stops_later_callbacks() {
        let registry = CallbackRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        registry.register_before_request(|ctx, _| {
            ctx.cancel();
            Err(anyhow!("first"))
        });
        let counter = runs.clone();
        registry.register_before_request(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let ctx = RequestContext::background();
        let err = registry.execute_before_request(&ctx, &before_event()).unwrap_err();
        assert!(matches!(err, LLMError::Cancelled(CancelReason::Cancelled)));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_registration_loses_nothing() {
        let registry = CallbackRegistry::new();
        let ctx = RequestContext::background();
        std::thread::scope(|scope| {
            for _ in 0..100 {
                scope.spawn(|| {
                    registry.register_before_request(|_, _| Ok(()));
                    registry.register_success(|_, _| Ok(()));
                    registry.register_failure(|_, _| Ok(()));
                    registry.register_stream(|_, _| Ok(()));
                });
                scope.spawn(|| {
                    let _ = registry.execute_before_request(&ctx, &before_event());
                    registry.execute_success(&ctx, &success_event());
                    registry.execute_failure(&ctx, &failure_event());
                    registry.execute_stream(&ctx, &stream_event(1));
                });
            }
        });
        for stage in [Stage::BeforeRequest, Stage::Success, Stage::Failure, Stage::Stream] {
            assert_eq!(registry.len(stage), 100, "{stage}");
        }
    }

    #[test]
    fn callbacks_may_register_callbacks() {
        let registry = Arc::new(CallbackRegistry::new());
        let weak: Weak<CallbackRegistry> = Arc::downgrade(&registry);
        registry.register_success(move |_, _| {
            if let Some(registry) = weak.upgrade() {
                registry.register_success(|_, _| Ok(()));
            }
            Ok(())
        });

        let ctx = RequestContext::background();
        registry.execute_success(&ctx, &success_event());
        assert_eq!(registry.len(Stage::Success), 2);
        registry.execute_success(&ctx, &success_event());
        assert_eq!(registry.len(Stage::Success), 3);
    }

    #[test]
    fn dispatch_routes_by_stage() {
        let registry = CallbackRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        registry.register_stream(move |_, event| {
            counter.fetch_add(event.index, Ordering::SeqCst);
            Ok(())
        });
        registry.register_before_request(|_, _| Err(anyhow!("no")));

        let ctx = RequestContext::background();
        assert!(registry.dispatch(&ctx, &stream_event(4).into()).is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert!(registry.dispatch(&ctx, &before_event().into()).is_err());
    }
}
