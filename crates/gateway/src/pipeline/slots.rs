//! Custom middleware slots.
//!
//! The engine exposes named positions in the pipeline (`pre`,
//! `auth_check`, `post_key_auth`, `post`, `response`) into which handler
//! descriptors are declared. Drivers are opaque: a registered
//! [`MiddlewareDriver`] receives the descriptor and the request view and
//! decides. The engine guarantees declared order, lets any handler
//! terminate the pipeline with its own response, and isolates panics.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

use gantry_common::GatewayResult;
use gantry_config::{MiddlewareHook, SessionState};

use crate::gateway::context::RequestContext;

use super::{PipelineDeps, RequestParts, StageDecision, TerminalResponse};

/// What a handler decided.
pub enum SlotOutcome {
    /// Keep going
    Continue,
    /// Terminate the pipeline with this response
    Respond(TerminalResponse),
    /// Install a session (auth_check drivers)
    Authenticated(Box<SessionState>),
}

/// What a `response` slot handler decided.
pub enum ResponseSlotOutcome {
    Continue,
    /// Headers to set on the outgoing response
    SetHeaders(Vec<(String, String)>),
}

/// A black-box middleware host.
#[async_trait]
pub trait MiddlewareDriver: Send + Sync {
    async fn invoke(
        &self,
        hook: &MiddlewareHook,
        parts: &RequestParts,
        session: Option<&SessionState>,
    ) -> GatewayResult<SlotOutcome>;

    /// Response-slot entry point; the default leaves the response alone.
    async fn invoke_response(
        &self,
        _hook: &MiddlewareHook,
        _status: u16,
        _headers: &[(String, String)],
    ) -> GatewayResult<ResponseSlotOutcome> {
        Ok(ResponseSlotOutcome::Continue)
    }
}

/// Registry of middleware drivers by name.
pub struct DriverRegistry {
    drivers: DashMap<String, Arc<dyn MiddlewareDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: DashMap::new(),
        }
    }

    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn MiddlewareDriver>) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MiddlewareDriver>> {
        self.drivers.get(name).map(|d| Arc::clone(&d))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one slot's handlers in declared order. A panicking handler yields
/// 500; the response pipeline still records analytics because the terminal
/// response flows through the normal exit path.
pub async fn run_slot(
    hooks: &[MiddlewareHook],
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    for hook in hooks {
        let Some(driver) = deps.drivers.get(&hook.driver) else {
            warn!(
                trace_id = %ctx.trace_id,
                driver = %hook.driver,
                handler = %hook.name,
                "No driver registered for middleware, skipping"
            );
            continue;
        };

        if hook.requires_session && ctx.session.is_none() {
            warn!(
                trace_id = %ctx.trace_id,
                handler = %hook.name,
                "Handler requires a session but none is set, skipping"
            );
            continue;
        }

        let invocation = AssertUnwindSafe(driver.invoke(hook, parts, ctx.session.as_ref()))
            .catch_unwind()
            .await;

        match invocation {
            Ok(Ok(SlotOutcome::Continue)) => {}
            Ok(Ok(SlotOutcome::Respond(response))) => {
                return Ok(StageDecision::Terminate(response));
            }
            Ok(Ok(SlotOutcome::Authenticated(session))) => {
                ctx.session = Some(*session);
            }
            Ok(Err(err)) => {
                error!(
                    trace_id = %ctx.trace_id,
                    handler = %hook.name,
                    error = %err,
                    "Middleware handler failed"
                );
                return Ok(StageDecision::Terminate(TerminalResponse::json_error(
                    500,
                    "Middleware error",
                )));
            }
            Err(_) => {
                error!(
                    trace_id = %ctx.trace_id,
                    handler = %hook.name,
                    "Middleware handler panicked"
                );
                deps.metrics.record_blocked("middleware_panic");
                return Ok(StageDecision::Terminate(TerminalResponse::json_error(
                    500,
                    "Middleware error",
                )));
            }
        }
    }
    Ok(StageDecision::Continue)
}

/// Run the `response` slot: handlers see the response status and headers
/// and may set headers of their own. Panics are captured and skipped so a
/// broken handler never corrupts the response path.
pub async fn run_response_slot(
    hooks: &[MiddlewareHook],
    drivers: &DriverRegistry,
    status: u16,
    headers: &[(String, String)],
    trace_id: &str,
) -> Vec<(String, String)> {
    let mut injected = Vec::new();
    for hook in hooks {
        let Some(driver) = drivers.get(&hook.driver) else {
            warn!(
                trace_id = %trace_id,
                driver = %hook.driver,
                handler = %hook.name,
                "No driver registered for response middleware, skipping"
            );
            continue;
        };

        let invocation = AssertUnwindSafe(driver.invoke_response(hook, status, headers))
            .catch_unwind()
            .await;
        match invocation {
            Ok(Ok(ResponseSlotOutcome::Continue)) => {}
            Ok(Ok(ResponseSlotOutcome::SetHeaders(set))) => {
                injected.extend(set);
            }
            Ok(Err(err)) => {
                error!(
                    trace_id = %trace_id,
                    handler = %hook.name,
                    error = %err,
                    "Response middleware handler failed, skipping"
                );
            }
            Err(_) => {
                error!(
                    trace_id = %trace_id,
                    handler = %hook.name,
                    "Response middleware handler panicked, skipping"
                );
            }
        }
    }
    injected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{deps_for_tests, parts_for};
    use parking_lot::Mutex;

    struct OrderDriver {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MiddlewareDriver for OrderDriver {
        async fn invoke(
            &self,
            hook: &MiddlewareHook,
            _parts: &RequestParts,
            _session: Option<&SessionState>,
        ) -> GatewayResult<SlotOutcome> {
            self.calls.lock().push(hook.name.clone());
            Ok(SlotOutcome::Continue)
        }
    }

    struct PanickingDriver;

    #[async_trait]
    impl MiddlewareDriver for PanickingDriver {
        async fn invoke(
            &self,
            _hook: &MiddlewareHook,
            _parts: &RequestParts,
            _session: Option<&SessionState>,
        ) -> GatewayResult<SlotOutcome> {
            panic!("handler blew up");
        }
    }

    struct RespondingDriver;

    #[async_trait]
    impl MiddlewareDriver for RespondingDriver {
        async fn invoke(
            &self,
            _hook: &MiddlewareHook,
            _parts: &RequestParts,
            _session: Option<&SessionState>,
        ) -> GatewayResult<SlotOutcome> {
            Ok(SlotOutcome::Respond(TerminalResponse::json_error(
                418,
                "short-circuit",
            )))
        }
    }

    fn hook(driver: &str, name: &str) -> MiddlewareHook {
        MiddlewareHook {
            driver: driver.to_string(),
            name: name.to_string(),
            path: String::new(),
            requires_session: false,
        }
    }

    #[tokio::test]
    async fn handlers_run_in_declared_order() {
        let deps = deps_for_tests();
        let calls = Arc::new(Mutex::new(Vec::new()));
        deps.drivers.register(
            "order",
            Arc::new(OrderDriver {
                calls: Arc::clone(&calls),
            }),
        );

        let hooks = vec![hook("order", "first"), hook("order", "second")];
        let parts = parts_for("GET", "/x", &[]);
        let mut ctx = RequestContext::new();

        run_slot(&hooks, &deps, &parts, &mut ctx).await.unwrap();
        assert_eq!(*calls.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn panicking_handler_yields_500() {
        let deps = deps_for_tests();
        deps.drivers.register("boom", Arc::new(PanickingDriver));

        let hooks = vec![hook("boom", "exploder")];
        let parts = parts_for("GET", "/x", &[]);
        let mut ctx = RequestContext::new();

        let StageDecision::Terminate(response) =
            run_slot(&hooks, &deps, &parts, &mut ctx).await.unwrap()
        else {
            panic!("panic must terminate the pipeline");
        };
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn responding_handler_terminates() {
        let deps = deps_for_tests();
        deps.drivers.register("teapot", Arc::new(RespondingDriver));

        let hooks = vec![hook("teapot", "respond"), hook("teapot", "never-reached")];
        let parts = parts_for("GET", "/x", &[]);
        let mut ctx = RequestContext::new();

        let StageDecision::Terminate(response) =
            run_slot(&hooks, &deps, &parts, &mut ctx).await.unwrap()
        else {
            panic!("must terminate");
        };
        assert_eq!(response.status, 418);
    }

    struct HeaderSettingDriver;

    #[async_trait]
    impl MiddlewareDriver for HeaderSettingDriver {
        async fn invoke(
            &self,
            _hook: &MiddlewareHook,
            _parts: &RequestParts,
            _session: Option<&SessionState>,
        ) -> GatewayResult<SlotOutcome> {
            Ok(SlotOutcome::Continue)
        }

        async fn invoke_response(
            &self,
            hook: &MiddlewareHook,
            status: u16,
            _headers: &[(String, String)],
        ) -> GatewayResult<ResponseSlotOutcome> {
            Ok(ResponseSlotOutcome::SetHeaders(vec![(
                format!("X-{}", hook.name),
                status.to_string(),
            )]))
        }
    }

    #[tokio::test]
    async fn response_slot_collects_header_mutations() {
        let deps = deps_for_tests();
        deps.drivers.register("headers", Arc::new(HeaderSettingDriver));

        let hooks = vec![hook("headers", "first"), hook("headers", "second")];
        let injected =
            run_response_slot(&hooks, &deps.drivers, 200, &[], "trace-1").await;

        assert_eq!(
            injected,
            vec![
                ("X-first".to_string(), "200".to_string()),
                ("X-second".to_string(), "200".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn response_slot_default_is_a_noop() {
        let deps = deps_for_tests();
        deps.drivers.register("plain", Arc::new(RespondingDriver));

        let hooks = vec![hook("plain", "untouched")];
        let injected =
            run_response_slot(&hooks, &deps.drivers, 200, &[], "trace-2").await;
        assert!(injected.is_empty());
    }

    #[tokio::test]
    async fn unknown_driver_is_skipped() {
        let deps = deps_for_tests();
        let hooks = vec![hook("missing", "ghost")];
        let parts = parts_for("GET", "/x", &[]);
        let mut ctx = RequestContext::new();

        assert!(matches!(
            run_slot(&hooks, &deps, &parts, &mut ctx).await.unwrap(),
            StageDecision::Continue
        ));
    }
}
