//! Process-wide supervisor.
//!
//! Owns everything shared across sessions: configuration, the live-session
//! registry, the store client pool, the gatehouse, the command catalog, and
//! the handler registry.  The accept path funnels every connection through
//! [`Supervisor::create_session`]: admission first, then a registry entry
//! keyed by a uuid3 of the instance id and the session's in-process
//! identity, then the session task itself.

use crate::catalog::{CommandTable, Deserializer};
use crate::config::{Config, ConfigError, parse_store_url};
use crate::gatehouse::rules::builtin_rules;
use crate::gatehouse::{AdmissionRule, GateError, Gatehouse};
use crate::handlers::HandlerRegistry;
use crate::heartbeat::HeartbeatState;
use crate::session::Session;
use crate::store::StoreClient;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

/// What the registry keeps per live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub peer: SocketAddr,
}

/// Process-wide map of admitted, not-yet-terminated sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub fn insert(&self, id: String, peer: SocketAddr) {
        self.inner.lock().unwrap().insert(id, SessionHandle { peer });
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    config: Config,
    instance_id: Uuid,
    registry: SessionRegistry,
    store: Arc<StoreClient>,
    gatehouse: Arc<Gatehouse>,
    deserializer: Arc<Deserializer>,
    handlers: Arc<HandlerRegistry>,
    session_permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    /// Build the supervisor with the default rule chain.
    pub fn new(
        config: Config,
        table: Arc<CommandTable>,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Arc<Self>, ConfigError> {
        let registry = SessionRegistry::new();
        let rules = builtin_rules(&config, registry.clone());
        Supervisor::with_rules(config, table, handlers, registry, rules)
    }

    /// Build the supervisor with an explicit rule chain (tests inject deny
    /// or instrumented rules here).
    pub fn with_rules(
        config: Config,
        table: Arc<CommandTable>,
        handlers: Arc<HandlerRegistry>,
        registry: SessionRegistry,
        rules: Vec<Arc<dyn AdmissionRule>>,
    ) -> Result<Arc<Self>, ConfigError> {
        let target = parse_store_url(&config.redis.url)?;
        let store = StoreClient::start(target, config.redis.max_connections);
        let gatehouse = Gatehouse::start(rules, config.gatehouse.thread_count);
        let deserializer = Arc::new(Deserializer::new(table, config.caching.size));
        let session_permits = Arc::new(Semaphore::new(config.threading.thread_limit));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Supervisor {
            config,
            instance_id: Uuid::new_v4(),
            registry,
            store,
            gatehouse,
            deserializer,
            handlers,
            session_permits,
            shutdown_tx,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<StoreClient> {
        &self.store
    }

    /// Admit one connection and, if it passes, run its session to completion
    /// in a spawned task.
    pub async fn create_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (stream, verdict) = match self.gatehouse.admit(stream, peer).await {
            Ok(outcome) => outcome,
            Err(GateError::Closed) => {
                warn!(%peer, "gatehouse closed; dropping connection");
                return;
            }
        };
        if !verdict.admitted() {
            info!(%peer, verdict = ?verdict, "connection denied");
            // Dropping the stream closes the socket.
            return;
        }

        // Bounds concurrent live sessions (`threading.thread-limit`).
        let permit = match self.session_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let session = Arc::new(Session::new(
            peer,
            HeartbeatState::new(&self.config.heartbeat),
            Duration::from_millis(self.config.heartbeat.timeout_ms),
            self.deserializer.clone(),
            self.handlers.clone(),
            self.store.clone(),
        ));
        // uuid3 over the instance id and the session's allocation identity:
        // unique for the session's lifetime without a central counter.
        let registry_id = Uuid::new_v3(
            &self.instance_id,
            format!("{:p}", Arc::as_ptr(&session)).as_bytes(),
        )
        .to_string();
        self.registry.insert(registry_id.clone(), peer);
        info!(%peer, session = %registry_id, "session started");

        let supervisor = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match session.run(stream).await {
                Ok(()) => info!(%peer, session = %registry_id, "session closed by peer"),
                Err(e) => info!(%peer, session = %registry_id, reason = %e, "session terminated"),
            }
            supervisor.registry.remove(&registry_id);
        });
    }

    /// Accept connections until shutdown.  Each connection is admitted and
    /// served on its own task so a slow rule chain never stalls the accept
    /// loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let supervisor = self.clone();
                            tokio::spawn(async move {
                                supervisor.create_session(stream, peer).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
        info!("accept loop stopped");
        Ok(())
    }

    /// Bind the configured address and serve in a background task.  Returns
    /// the bound address (useful when the config asks for port 0).
    pub async fn bind_and_serve(
        self: &Arc<Self>,
    ) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<std::io::Result<()>>)> {
        let listener = TcpListener::bind((
            self.config.network.host.as_str(),
            self.config.network.port,
        ))
        .await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(self.clone().serve(listener));
        Ok((addr, handle))
    }

    /// Stop accepting, then close the pool queues so workers drain and exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.store.shutdown().await;
        self.gatehouse.shutdown().await;
        info!("supervisor shut down");
    }
}
