//! Middleware composition: folds an ordered list of async handlers into a
//! single asynchronous function via continuation passing.
//!
//! Each handler receives an [`Context`] value and a [`Next`] continuation.
//! A handler may call `next` to continue the chain, optionally passing a
//! modified context, or it may return directly to end the chain early. The
//! chain's overall result is whatever the outermost handler's returned
//! future resolves to.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde_json::Value;

use crate::{error::DispatchError, server::Server, server::client::Client};

/// A boxed future, as returned by handlers and the composed chain.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The result of a composed handler chain: the invocation's return value,
/// or absent for a handler that produced no value (an absent value still
/// produces a `Result` frame, just with no body).
pub type HandlerResult = Result<Option<Value>, DispatchError>;

/// The invocation context passed through the middleware chain.
///
/// Mirrors the recognized keys from the protocol's data model: the owning
/// server, the invoking client, the pattern actually matched, named
/// parameter and splat captures, and the invoke payload. Each layer may
/// replace the context it passes to `next`, but never mutates one in place.
#[derive(Clone)]
pub struct Context {
    /// The server instance dispatching this invocation.
    pub server: Arc<Server>,
    /// The client that sent the invocation.
    pub client: Arc<Client>,
    /// The pattern that was matched, not the concrete invoked path.
    pub path: String,
    /// Named parameter captures.
    pub params: HashMap<String, String>,
    /// Ordered wildcard captures.
    pub splats: Vec<String>,
    /// The invoke payload, if any.
    pub body: Option<Value>,
}

/// The continuation passed to each handler in a composed chain.
#[derive(Clone)]
pub struct Next(NextFn);

type NextFn = Arc<dyn Fn(Context) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

impl Next {
    /// Invoke the remainder of the chain with (possibly modified) `context`.
    pub fn call(&self, context: Context) -> BoxFuture<'static, HandlerResult> { (self.0.as_ref())(context) }
}

/// A single middleware handler.
pub type HandlerFn = dyn Fn(Context, Next) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A reference-counted handler, as supplied to [`compose`].
pub type BoxedHandlerFn = Arc<HandlerFn>;

/// A composed chain: a single async function equivalent to the full
/// middleware list.
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Error returned when composing a zero-length handler chain.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("registerRoute requires at least one handler")]
pub struct EmptyHandlerChain;

/// Fold an ordered handler list into a single composed [`Handler`].
///
/// # Errors
///
/// Returns [`EmptyHandlerChain`] if `handlers` is empty.
pub fn compose(handlers: Vec<BoxedHandlerFn>) -> Result<Handler, EmptyHandlerChain> {
    if handlers.is_empty() {
        return Err(EmptyHandlerChain);
    }

    let mut next: NextFn = Arc::new(|_ctx: Context| -> BoxFuture<'static, HandlerResult> {
        Box::pin(async { Ok(None) })
    });

    for handler in handlers.into_iter().rev() {
        let inner_next = next.clone();
        next = Arc::new(move |ctx: Context| {
            let handler = handler.clone();
            let next = Next(inner_next.clone());
            (handler.as_ref())(ctx, next)
        });
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc as StdArc,
        atomic::{AtomicUsize, Ordering},
    };

    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{registry::Registry, router::Router, server::ServerConfig};

    fn test_context(body: Option<Value>) -> Context {
        let server = Server::new(ServerConfig::default());
        let (client, _rx) = Client::new_for_test();
        Context {
            server,
            client,
            path: "/test".to_owned(),
            params: HashMap::new(),
            splats: Vec::new(),
            body,
        }
    }

    fn handler_returning(value: Value) -> BoxedHandlerFn {
        StdArc::new(move |_ctx: Context, _next: Next| {
            let value = value.clone();
            Box::pin(async move { Ok(Some(value)) }) as BoxFuture<'static, HandlerResult>
        })
    }

    #[rstest]
    fn single_handler_chain_returns_its_value() {
        let chain = compose(vec![handler_returning(json!("hi"))]).unwrap();
        let result = tokio_test_block_on((chain.as_ref())(test_context(None)));
        assert_eq!(result.unwrap(), Some(json!("hi")));
    }

    #[rstest]
    fn handler_not_calling_next_ends_chain_early() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let calls_second = calls.clone();
        let first: BoxedHandlerFn = StdArc::new(move |_ctx, _next| {
            Box::pin(async { Ok(Some(json!("short-circuited"))) }) as BoxFuture<'static, HandlerResult>
        });
        let second: BoxedHandlerFn = StdArc::new(move |_ctx, next: Next| {
            let calls = calls_second.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                next.call(test_context(None)).await
            }) as BoxFuture<'static, HandlerResult>
        });

        let chain = compose(vec![first, second]).unwrap();
        let result = tokio_test_block_on((chain.as_ref())(test_context(None)));

        assert_eq!(result.unwrap(), Some(json!("short-circuited")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    fn handler_can_call_next_and_forward_modified_context() {
        let chain = compose(vec![
            StdArc::new(|ctx: Context, next: Next| {
                Box::pin(async move {
                    let mut ctx = ctx;
                    ctx.params.insert("injected".to_owned(), "yes".to_owned());
                    next.call(ctx).await
                }) as BoxFuture<'static, HandlerResult>
            }),
            StdArc::new(|ctx: Context, _next: Next| {
                Box::pin(async move { Ok(ctx.params.get("injected").cloned().map(Value::from)) })
                    as BoxFuture<'static, HandlerResult>
            }),
        ])
        .unwrap();

        let result = tokio_test_block_on((chain.as_ref())(test_context(None)));
        assert_eq!(result.unwrap(), Some(json!("yes")));
    }

    #[rstest]
    fn terminal_continuation_returns_none() {
        let chain = compose(vec![StdArc::new(|ctx: Context, next: Next| {
            Box::pin(async move { next.call(ctx).await }) as BoxFuture<'static, HandlerResult>
        })])
        .unwrap();

        let result = tokio_test_block_on((chain.as_ref())(test_context(None)));
        assert_eq!(result.unwrap(), None);
    }

    #[rstest]
    fn empty_chain_is_rejected() {
        assert_eq!(compose(vec![]).unwrap_err(), EmptyHandlerChain);
    }

    fn tokio_test_block_on<F: Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(f)
    }
}
