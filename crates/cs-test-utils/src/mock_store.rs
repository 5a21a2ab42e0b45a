//! In-process mock RESP key/value store.
//!
//! Speaks just enough of the store dialect for the server's upstream pool:
//! `AUTH`, `SELECT`, `PING`, `GET`, `SET`, `DEL`.  Every connection shares
//! one key space so tests can seed fixtures through [`MockStoreServer::insert`]
//! and observe writes made over the wire.

use cs_resp::{Frame, RespCodec};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio_util::codec::Framed;
use tracing::debug;

/// A handle to a running mock store.
pub struct MockStoreServer {
    addr: SocketAddr,
    data: Arc<Mutex<HashMap<String, String>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MockStoreServer {
    /// Bind on an OS-assigned loopback port and start accepting connections.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let data: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let accept_data = data.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    accept = listener.accept() => {
                        match accept {
                            Ok((stream, peer)) => {
                                debug!(%peer, "mock store connection");
                                tokio::spawn(serve_connection(stream, accept_data.clone()));
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(MockStoreServer {
            addr,
            data,
            shutdown_tx,
        })
    }

    /// The bound loopback address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// A `redis://` URL pointing at this mock, suitable for server config.
    pub fn url(&self) -> String {
        format!("redis://{}/0", self.addr)
    }

    /// Seed a key directly, bypassing the wire.
    pub async fn insert(&self, key: &str, value: &str) {
        self.data.lock().await.insert(key.to_owned(), value.to_owned());
    }

    /// Read a key directly, bypassing the wire.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.data.lock().await.get(key).cloned()
    }

    /// Stop accepting new connections.  Existing connections run until their
    /// peers disconnect.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Drive one client connection: decode command arrays, apply them to the
/// shared map, reply per command.
async fn serve_connection(stream: TcpStream, data: Arc<Mutex<HashMap<String, String>>>) {
    let mut framed = Framed::new(stream, RespCodec::new());
    while let Some(decoded) = framed.next().await {
        let Ok(frame) = decoded else { return };
        let Ok(tokens) = frame.tokens() else {
            let _ = framed
                .send(Frame::Error("ERR protocol: expected command array".to_owned()))
                .await;
            continue;
        };
        let reply = apply_command(&tokens, &data).await;
        if framed.send(reply).await.is_err() {
            return;
        }
    }
}

async fn apply_command(tokens: &[String], data: &Mutex<HashMap<String, String>>) -> Frame {
    let Some(verb) = tokens.first() else {
        return Frame::Error("ERR empty command".to_owned());
    };
    match (verb.to_uppercase().as_str(), &tokens[1..]) {
        ("PING", _) => Frame::Simple("PONG".to_owned()),
        ("AUTH" | "SELECT", _) => Frame::Simple("OK".to_owned()),
        ("GET", [key]) => match data.lock().await.get(key) {
            Some(value) => Frame::Bulk(value.clone()),
            None => Frame::Null,
        },
        ("SET", [key, value]) => {
            data.lock().await.insert(key.clone(), value.clone());
            Frame::Simple("OK".to_owned())
        }
        ("DEL", keys) if !keys.is_empty() => {
            let mut map = data.lock().await;
            let removed = keys.iter().filter(|k| map.remove(*k).is_some()).count();
            Frame::Integer(i64::try_from(removed).unwrap_or(i64::MAX))
        }
        _ => Frame::Error(format!("ERR unknown command '{verb}'")),
    }
}
