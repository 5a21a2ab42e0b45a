//! Command handler registry.
//!
//! Descriptors in the catalog name handler functions; this registry maps
//! those names to boxed async callbacks.  It is populated once at startup
//! and read-only afterwards: an explicit table where older gateways walked
//! the filesystem for plugins.

use crate::session::FrameWriter;
use crate::store::StoreClient;
use cs_resp::Frame;
use futures_util::SinkExt;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Handler plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("reply write failed: {0}")]
    Write(String),
    #[error("{0}")]
    Other(String),
}

pub type HandlerResult = Result<(), HandlerError>;

type BoxedFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type BoxedHandler = Arc<dyn Fn(HandlerContext, Vec<String>) -> BoxedFuture + Send + Sync>;

/// Everything a handler may touch: the session's shared frame writer, the
/// store client, and the peer address.
#[derive(Clone)]
pub struct HandlerContext {
    pub writer: FrameWriter,
    pub store: Arc<StoreClient>,
    pub peer: SocketAddr,
}

impl HandlerContext {
    /// Write one frame back to the peer.
    pub async fn reply(&self, frame: Frame) -> HandlerResult {
        let mut writer = self.writer.lock().await;
        writer
            .send(frame)
            .await
            .map_err(|e| HandlerError::Write(e.to_string()))
    }

    /// Run a store command and relay the reply; store failures become an
    /// error frame for the peer instead of a session failure.
    async fn proxy_to_store(&self, tokens: Vec<String>) -> HandlerResult {
        match self.store.execute(tokens).await {
            Ok(frame) => self.reply(frame).await,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "store command failed; reporting to peer");
                self.reply(Frame::array_of(["ERR".to_owned(), "store".to_owned(), e.to_string()]))
                    .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// The built-in handler set matching the shipped command descriptors.
    pub fn builtin() -> Self {
        let mut registry = HandlerRegistry::new();
        registry.register("ping", ping);
        registry.register("echo", echo);
        registry.register("store_get", store_get);
        registry.register("store_set", store_set);
        registry.register("store_del", store_del);
        registry.register("store_info", store_info);
        registry
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(HandlerContext, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.insert(
            name.to_owned(),
            Arc::new(move |ctx, args| Box::pin(handler(ctx, args))),
        );
    }

    pub fn get(&self, name: &str) -> Option<BoxedHandler> {
        self.handlers.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

fn wrong_arity(function: &str) -> Frame {
    Frame::Error(format!("ERR wrong number of arguments for '{function}'"))
}

async fn ping(ctx: HandlerContext, _args: Vec<String>) -> HandlerResult {
    ctx.reply(Frame::Simple("PONG".to_owned())).await
}

async fn echo(ctx: HandlerContext, args: Vec<String>) -> HandlerResult {
    ctx.reply(Frame::array_of(args)).await
}

async fn store_get(ctx: HandlerContext, args: Vec<String>) -> HandlerResult {
    match args.as_slice() {
        [key] => {
            let tokens = vec!["GET".to_owned(), key.clone()];
            ctx.proxy_to_store(tokens).await
        }
        _ => ctx.reply(wrong_arity("store_get")).await,
    }
}

async fn store_set(ctx: HandlerContext, args: Vec<String>) -> HandlerResult {
    match args.as_slice() {
        [key, value] => {
            let tokens = vec!["SET".to_owned(), key.clone(), value.clone()];
            ctx.proxy_to_store(tokens).await
        }
        _ => ctx.reply(wrong_arity("store_set")).await,
    }
}

async fn store_del(ctx: HandlerContext, args: Vec<String>) -> HandlerResult {
    if args.is_empty() {
        return ctx.reply(wrong_arity("store_del")).await;
    }
    let mut tokens = Vec::with_capacity(args.len() + 1);
    tokens.push("DEL".to_owned());
    tokens.extend(args);
    ctx.proxy_to_store(tokens).await
}

async fn store_info(ctx: HandlerContext, _args: Vec<String>) -> HandlerResult {
    let pool = ctx.store.pool_size().to_string();
    ctx.reply(Frame::array_of(["store".to_owned(), "pool".to_owned(), pool]))
        .await
}
