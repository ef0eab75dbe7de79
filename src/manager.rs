/*! Owns the listening socket and the set of live connections.

The [`Manager`] is an explicitly constructed, explicitly owned value: bind a
listener, hand it to [`Manager::run`] (or [`Manager::run_until`] for a
controlled shutdown) and every accepted connection gets its own driver task.
The task's slab handle doubles as the connection half of every
[`FullId`](crate::FullId) on that connection.
*/
use std::io;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use slab::Slab;
use tokio::sync::Semaphore;

use crate::connection::Connection;
use crate::request::Application;
use crate::stream::{FCGIAddr, Listener, Stream};

/// Tunables, also the source of the `GetValues` management answers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Concurrent connections accepted before new ones are turned away.
    /// Advertised as `FCGI_MAX_CONNS`.
    pub max_conns: usize,
    /// Concurrent requests per connection, advertised as `FCGI_MAX_REQS`.
    /// A `BeginRequest` beyond it is answered with
    /// `ProtocolStatus::Overloaded`.
    pub max_reqs_per_conn: usize,
    /// Whether several requests may be in flight on one connection.
    /// Advertised as `FCGI_MPXS_CONNS`; when false a second concurrent
    /// `BeginRequest` is answered with
    /// `ProtocolStatus::CantMultiplexConnections`.
    pub mpxs_conns: bool,
    /// Bound on concurrently running application callbacks.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ServerConfig {
            max_conns: 64,
            max_reqs_per_conn: 16,
            mpxs_conns: true,
            workers: parallelism,
        }
    }
}

/// The process-wide engine: accepts connections and spawns their drivers.
pub struct Manager<A> {
    app: Arc<A>,
    config: Arc<ServerConfig>,
    workers: Arc<Semaphore>,
    connections: Arc<Mutex<Slab<()>>>,
}

impl<A: Application> Manager<A> {
    pub fn new(app: A, config: ServerConfig) -> Manager<A> {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Manager {
            app: Arc::new(app),
            config: Arc::new(config),
            workers,
            connections: Arc::new(Mutex::new(Slab::new())),
        }
    }

    /// Bind the socket a web server will connect to.
    pub async fn bind(addr: &FCGIAddr) -> io::Result<Listener> {
        let listener = Listener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept and serve until the listener fails.
    pub async fn run(&self, listener: Listener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            self.accept(stream, peer);
        }
    }

    /// Like [`run`](Manager::run), but winds down when `shutdown` resolves.
    /// Connections already accepted finish on their own tasks.
    pub async fn run_until<F>(&self, listener: Listener, shutdown: F) -> io::Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            r = self.run(listener) => r,
            _ = shutdown => {
                info!("shutdown requested");
                Ok(())
            }
        }
    }

    fn accept(&self, stream: Stream, peer: FCGIAddr) {
        let handle = {
            let mut slab = self.connections.lock().expect("registry poisoned");
            if slab.len() >= self.config.max_conns.min(u16::MAX as usize) {
                warn!("connection from {} refused, at capacity", peer);
                return; // dropping the stream closes it
            }
            slab.insert(()) as u16
        };
        info!("con #{} accepted from {}", handle, peer);
        let conn = Connection::new(
            handle,
            stream,
            Arc::clone(&self.app),
            Arc::clone(&self.config),
            Arc::clone(&self.workers),
        );
        let registry = Arc::clone(&self.connections);
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                error!("con #{}: {}", handle, e);
            }
            registry
                .lock()
                .expect("registry poisoned")
                .remove(handle as usize);
        });
    }
}
