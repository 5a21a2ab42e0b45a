//! Admission rules.
//!
//! Rules are registered explicitly at startup and evaluated in declared
//! order.  A rule sees the raw stream and peer address before any session
//! exists, and answers `Ok(true)` to admit, `Ok(false)` to deny.

use crate::config::Config;
use crate::supervisor::SessionRegistry;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// A rule raised an error while evaluating; treated as deny.
#[derive(Debug, thiserror::Error)]
#[error("rule '{rule}' failed: {reason}")]
pub struct RuleError {
    pub rule: &'static str,
    pub reason: String,
}

#[async_trait]
pub trait AdmissionRule: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<bool, RuleError>;
}

/// Admits everything.  Keeps the chain non-empty so rule evaluation and its
/// telemetry always run.
pub struct BaselineRule;

#[async_trait]
impl AdmissionRule for BaselineRule {
    fn name(&self) -> &'static str {
        "baseline"
    }

    async fn handle(&self, _stream: &mut TcpStream, _peer: SocketAddr) -> Result<bool, RuleError> {
        Ok(true)
    }
}

/// Denies new connections once the live-session registry reaches a cap.
pub struct SessionCapacityRule {
    registry: SessionRegistry,
    max_sessions: usize,
}

impl SessionCapacityRule {
    pub fn new(registry: SessionRegistry, max_sessions: usize) -> Self {
        SessionCapacityRule {
            registry,
            max_sessions,
        }
    }
}

#[async_trait]
impl AdmissionRule for SessionCapacityRule {
    fn name(&self) -> &'static str {
        "session-capacity"
    }

    async fn handle(&self, _stream: &mut TcpStream, _peer: SocketAddr) -> Result<bool, RuleError> {
        Ok(self.registry.len() < self.max_sessions)
    }
}

/// The default rule chain: baseline, plus the capacity rule when
/// `gatehouse.max-sessions` is configured.
pub fn builtin_rules(cfg: &Config, registry: SessionRegistry) -> Vec<Arc<dyn AdmissionRule>> {
    let mut rules: Vec<Arc<dyn AdmissionRule>> = vec![Arc::new(BaselineRule)];
    if let Some(max) = cfg.gatehouse.max_sessions {
        rules.push(Arc::new(SessionCapacityRule::new(registry, max)));
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_side, peer) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let mut c = client.await.unwrap();
            let mut buf = [0u8; 1];
            let _ = c.read(&mut buf).await;
        });
        (server_side, peer)
    }

    #[tokio::test]
    async fn baseline_rule_admits() {
        let (mut stream, peer) = socket_pair().await;
        assert!(BaselineRule.handle(&mut stream, peer).await.unwrap());
    }

    #[tokio::test]
    async fn capacity_rule_tracks_registry_size() {
        let registry = SessionRegistry::new();
        let rule = SessionCapacityRule::new(registry.clone(), 2);
        let (mut stream, peer) = socket_pair().await;

        assert!(rule.handle(&mut stream, peer).await.unwrap());

        registry.insert("a".to_owned(), peer);
        registry.insert("b".to_owned(), peer);
        assert!(!rule.handle(&mut stream, peer).await.unwrap());

        registry.remove("a");
        assert!(rule.handle(&mut stream, peer).await.unwrap());
    }
}
