// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Agent task driving the pool.
//!
//! All pool transitions happen on one tokio task, one message at a time.
//! Requests, leases, connection attempts and idle timers talk to it over an
//! unbounded channel, so no lock is ever held around pool state.
//!
//! ```rust,ignore
//! use spacey_agent::{Agent, AgentOptions, ConnectOptions, TcpTransport};
//!
//! let agent = Agent::spawn(AgentOptions::keep_alive(), TcpTransport::new())?;
//! let lease = agent.request(ConnectOptions::new("example.com", 80)).await?;
//! // ... write the request, read the response ...
//! lease.release();
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::key::EndpointKey;
use crate::options::{AgentOptions, ConnectOptions};
use crate::pool::{Action, FreeInfo, Pool, PoolStats, RequestId, SocketEvent, SocketId};
use crate::session::{SessionCache, SharedSessionCache};
use crate::transport::{Connection, Transport};

type Reply<C> = oneshot::Sender<Result<Lease<C>>>;

/// Events the host can raise on sockets it does not hand back through a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The socket's timeout elapsed
    Timeout,
    /// The socket reported an error
    Error,
    /// The socket closed
    Close,
}

enum Message<C> {
    AddRequest {
        request: RequestId,
        options: ConnectOptions,
        reply: Reply<C>,
    },
    Cancel {
        request: RequestId,
        reply: Option<oneshot::Sender<bool>>,
    },
    Connected {
        request: RequestId,
        result: io::Result<C>,
    },
    Free {
        socket: SocketId,
        conn: C,
        info: FreeInfo,
    },
    Closed {
        socket: SocketId,
    },
    Remove {
        socket: SocketId,
    },
    IdleTimeout {
        socket: SocketId,
        generation: u64,
    },
    Host {
        socket: SocketId,
        event: HostEvent,
    },
    Stats(oneshot::Sender<PoolStats>),
    Destroy(oneshot::Sender<()>),
}

/// The agent task: owns the pool, the transport and every connection not
/// currently leased to a request
pub struct Agent<T: Transport> {
    pool: Pool,
    transport: Arc<T>,
    rx: mpsc::UnboundedReceiver<Message<T::Conn>>,
    tx: mpsc::WeakUnboundedSender<Message<T::Conn>>,
    replies: HashMap<RequestId, Reply<T::Conn>>,
    /// Connections owned by the free list
    idle: HashMap<SocketId, T::Conn>,
    /// Connections handed back to the task while an event is processed
    staged: HashMap<SocketId, T::Conn>,
    /// Current idle timer generation per socket
    timers: HashMap<SocketId, u64>,
    next_generation: u64,
    followups: VecDeque<(SocketId, SocketEvent)>,
}

impl<T: Transport> Agent<T> {
    /// Validate `options` and start the agent task on the current tokio runtime
    pub fn spawn(options: AgentOptions, transport: T) -> Result<AgentHandle<T::Conn>> {
        let pool = Pool::new(options)?;
        let options = pool.options().clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let agent = Agent {
            pool,
            transport: Arc::new(transport),
            rx,
            tx: tx.downgrade(),
            replies: HashMap::new(),
            idle: HashMap::new(),
            staged: HashMap::new(),
            timers: HashMap::new(),
            next_generation: 0,
            followups: VecDeque::new(),
        };
        tokio::spawn(agent.run());

        Ok(AgentHandle {
            inner: Arc::new(HandleInner {
                tx,
                next_request: AtomicU64::new(1),
                sessions: SessionCache::shared(options.max_cached_sessions),
                options,
            }),
        })
    }

    async fn run(mut self) {
        debug!("agent task started");
        while let Some(message) = self.rx.recv().await {
            self.handle(message);
            self.drain_followups();
            self.drop_unclaimed();
        }
        debug!(idle = self.idle.len(), "agent task stopped");
        for (_, mut conn) in self.idle.drain() {
            conn.destroy();
        }
    }

    fn handle(&mut self, message: Message<T::Conn>) {
        match message {
            Message::AddRequest {
                request,
                options,
                reply,
            } => {
                self.reap_idle();
                self.replies.insert(request, reply);
                let actions = self.pool.add_request(request, options);
                self.execute(actions);
            }
            Message::Cancel { request, reply } => {
                let cancelled = self.pool.cancel_request(request);
                if cancelled {
                    self.replies.remove(&request);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(cancelled);
                }
            }
            Message::Connected { request, result } => {
                let result = result.map(|conn| {
                    let socket = self.pool.allocate_socket_id();
                    self.staged.insert(socket, conn);
                    socket
                });
                let actions = self.pool.connect_completed(request, result);
                self.execute(actions);
            }
            Message::Free { socket, conn, info } => {
                self.staged.insert(socket, conn);
                let actions = self.pool.socket_freed(socket, info);
                self.execute(actions);
            }
            Message::Closed { socket } => {
                let actions = self.pool.socket_closed(socket);
                self.execute(actions);
            }
            Message::Remove { socket } => {
                let actions = self.pool.remove_socket(socket);
                self.execute(actions);
            }
            Message::IdleTimeout { socket, generation } => {
                if self.timers.get(&socket) == Some(&generation) {
                    self.timers.remove(&socket);
                    let actions = self.pool.socket_timeout(socket);
                    self.execute(actions);
                }
            }
            Message::Host { socket, event } => {
                let event = match event {
                    HostEvent::Timeout => SocketEvent::Timeout,
                    HostEvent::Error => SocketEvent::Error,
                    HostEvent::Close => {
                        if let Some(mut conn) = self.idle.remove(&socket) {
                            conn.destroy();
                        }
                        SocketEvent::Close
                    }
                };
                let actions = self.pool.on_socket_event(socket, event);
                self.execute(actions);
            }
            Message::Stats(reply) => {
                let _ = reply.send(self.pool.stats());
            }
            Message::Destroy(reply) => {
                let actions = self.pool.destroy();
                self.execute(actions);
                self.drain_followups();
                let _ = reply.send(());
            }
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect {
                    request,
                    key,
                    options,
                } => self.connect(request, key, options),
                Action::Assign { request, socket } => {
                    let Some(conn) = self.staged.remove(&socket) else {
                        warn!(%socket, %request, "no connection to assign");
                        continue;
                    };
                    self.deliver(request, socket, conn, false);
                }
                Action::Reuse { request, socket } => {
                    self.timers.remove(&socket);
                    let Some(mut conn) = self.idle.remove(&socket) else {
                        warn!(%socket, %request, "no idle connection to reuse");
                        continue;
                    };
                    conn.set_timeout(None);
                    conn.set_ref(true);
                    self.deliver(request, socket, conn, true);
                }
                Action::Fail { request, error } => {
                    if let Some(reply) = self.replies.remove(&request) {
                        let _ = reply.send(Err(error));
                    }
                }
                Action::KeepAlive {
                    socket,
                    delay,
                    timeout,
                } => {
                    let Some(mut conn) = self.staged.remove(&socket) else {
                        warn!(%socket, "no connection to keep alive");
                        continue;
                    };
                    conn.set_keep_alive(true, delay);
                    conn.set_timeout(timeout);
                    conn.set_ref(false);
                    self.idle.insert(socket, conn);
                    if let Some(timeout) = timeout {
                        self.arm_idle_timer(socket, timeout);
                    }
                }
                Action::Destroy { socket } => {
                    self.timers.remove(&socket);
                    let owned = self
                        .staged
                        .remove(&socket)
                        .or_else(|| self.idle.remove(&socket));
                    // Leased connections are destroyed when they come back
                    if let Some(mut conn) = owned {
                        conn.destroy();
                        self.followups.push_back((socket, SocketEvent::Close));
                    }
                }
                Action::Detach { socket } => {
                    self.timers.remove(&socket);
                }
            }
        }
    }

    fn connect(&mut self, request: RequestId, key: EndpointKey, options: ConnectOptions) {
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = transport.connect(&options).await;
            if let Err(err) = &result {
                debug!(%key, %request, error = %err, "connect failed");
            }
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::Connected { request, result });
            }
        });
    }

    fn deliver(&mut self, request: RequestId, socket: SocketId, conn: T::Conn, reused: bool) {
        let key = self
            .pool
            .key_of(socket)
            .cloned()
            .unwrap_or_else(|| EndpointKey::from(""));
        let lease = Lease {
            socket,
            key,
            reused,
            conn: Some(conn),
            tx: self.tx.upgrade(),
        };
        let Some(reply) = self.replies.remove(&request) else {
            warn!(%socket, %request, "assigned socket to unknown request");
            lease.release();
            return;
        };
        if let Err(Ok(lease)) = reply.send(Ok(lease)) {
            // The caller went away; the socket goes back through `free`
            debug!(%socket, %request, "request abandoned, freeing socket");
            lease.release();
        }
    }

    fn arm_idle_timer(&mut self, socket: SocketId, timeout: std::time::Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.timers.insert(socket, generation);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::IdleTimeout { socket, generation });
            }
        });
    }

    /// Idle connections that died while parked are closed out before a
    /// request can pick them
    fn reap_idle(&mut self) {
        let dead: Vec<SocketId> = self
            .idle
            .iter()
            .filter(|(_, conn)| conn.is_destroyed())
            .map(|(socket, _)| *socket)
            .collect();
        for socket in dead {
            self.idle.remove(&socket);
            self.timers.remove(&socket);
            self.pool.mark_destroyed(socket);
            self.followups.push_back((socket, SocketEvent::Close));
        }
        self.drain_followups();
    }

    fn drain_followups(&mut self) {
        while let Some((socket, event)) = self.followups.pop_front() {
            let actions = self.pool.on_socket_event(socket, event);
            self.execute(actions);
        }
    }

    fn drop_unclaimed(&mut self) {
        for (socket, mut conn) in self.staged.drain() {
            debug!(%socket, "dropping connection the pool did not claim");
            conn.destroy();
        }
    }
}

struct HandleInner<C> {
    tx: mpsc::UnboundedSender<Message<C>>,
    next_request: AtomicU64,
    options: AgentOptions,
    sessions: SharedSessionCache,
}

/// Cloneable handle to a running agent
pub struct AgentHandle<C> {
    inner: Arc<HandleInner<C>>,
}

impl<C> Clone for AgentHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> std::fmt::Debug for AgentHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> AgentHandle<C> {
    /// Acquire a socket for `options`, waiting in the queue if needed
    pub async fn request(&self, options: ConnectOptions) -> Result<Lease<C>> {
        self.enqueue(options)?.await
    }

    /// Acquire a socket using the positional `(host, port, localAddress)` form
    pub async fn request_legacy(
        &self,
        host: &str,
        port: Option<u16>,
        local_address: Option<&str>,
    ) -> Result<Lease<C>> {
        self.request(ConnectOptions::legacy(host, port, local_address))
            .await
    }

    /// Submit a request and return a future for its socket.
    ///
    /// Dropping the returned [`PendingLease`] before it resolves cancels the
    /// request.
    pub fn enqueue(&self, options: ConnectOptions) -> Result<PendingLease<C>> {
        let request = RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed));
        let (reply, rx) = oneshot::channel();
        self.send(Message::AddRequest {
            request,
            options,
            reply,
        })?;
        Ok(PendingLease {
            request,
            rx,
            tx: self.inner.tx.clone(),
            done: false,
        })
    }

    /// Withdraw a request still waiting for a socket
    pub async fn cancel(&self, request: RequestId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Cancel {
            request,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| AgentError::Closed)
    }

    /// Deliver a host-side event for a pooled socket
    pub fn notify(&self, socket: SocketId, event: HostEvent) -> Result<()> {
        self.send(Message::Host { socket, event })
    }

    /// The idle timeout of `socket` elapsed
    pub fn socket_timeout(&self, socket: SocketId) -> Result<()> {
        self.notify(socket, HostEvent::Timeout)
    }

    /// `socket` reported an error while idle
    pub fn socket_error(&self, socket: SocketId) -> Result<()> {
        self.notify(socket, HostEvent::Error)
    }

    /// `socket` was closed by the peer
    pub fn socket_closed(&self, socket: SocketId) -> Result<()> {
        self.notify(socket, HostEvent::Close)
    }

    /// Snapshot of the pool
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Stats(reply))?;
        rx.await.map_err(|_| AgentError::Closed)
    }

    /// Destroy every pooled socket and fail waiting requests
    pub async fn destroy(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Destroy(reply))?;
        rx.await.map_err(|_| AgentError::Closed)
    }

    /// Endpoint key a request with `options` would use
    pub fn get_name(&self, options: &ConnectOptions) -> EndpointKey {
        let mut options = options.clone();
        options.apply_agent(&self.inner.options);
        EndpointKey::derive(&options)
    }

    /// Options the agent was built with
    pub fn options(&self) -> &AgentOptions {
        &self.inner.options
    }

    /// TLS session cache of this agent
    pub fn sessions(&self) -> &SharedSessionCache {
        &self.inner.sessions
    }

    fn send(&self, message: Message<C>) -> Result<()> {
        self.inner.tx.send(message).map_err(|_| AgentError::Closed)
    }
}

/// A request waiting for its socket
pub struct PendingLease<C: Connection> {
    request: RequestId,
    rx: oneshot::Receiver<Result<Lease<C>>>,
    tx: mpsc::UnboundedSender<Message<C>>,
    done: bool,
}

impl<C: Connection> PendingLease<C> {
    /// Identifier of the queued request
    pub fn id(&self) -> RequestId {
        self.request
    }
}

impl<C: Connection> Future for PendingLease<C> {
    type Output = Result<Lease<C>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                // A dropped reply means the request was cancelled or the
                // agent stopped
                Poll::Ready(result.unwrap_or(Err(AgentError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<C: Connection> Drop for PendingLease<C> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        match self.rx.try_recv() {
            // Assigned but never picked up; the socket can still be reused
            Ok(Ok(lease)) => lease.release(),
            Ok(Err(_)) | Err(oneshot::error::TryRecvError::Closed) => {}
            Err(oneshot::error::TryRecvError::Empty) => {
                let _ = self.tx.send(Message::Cancel {
                    request: self.request,
                    reply: None,
                });
            }
        }
    }
}

/// A socket assigned to a request.
///
/// Call [`Lease::release`] when the exchange is over so the socket can be
/// reused; dropping the lease closes the socket instead.
pub struct Lease<C> {
    socket: SocketId,
    key: EndpointKey,
    reused: bool,
    conn: Option<C>,
    tx: Option<mpsc::UnboundedSender<Message<C>>>,
}

impl<C> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("socket", &self.socket)
            .field("key", &self.key)
            .field("reused", &self.reused)
            .finish()
    }
}

impl<C> Lease<C> {
    /// Pool identifier of the socket
    pub fn id(&self) -> SocketId {
        self.socket
    }

    /// Endpoint the socket belongs to
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Whether the socket came from the free list
    pub fn reused(&self) -> bool {
        self.reused
    }
}

impl<C: Connection> Lease<C> {
    /// Hand the socket back; it is reused if the agent keeps connections alive
    pub fn release(self) {
        self.release_with(FreeInfo::reusable());
    }

    /// Hand the socket back with the state of the finished exchange
    pub fn release_with(mut self, info: FreeInfo) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let info = FreeInfo {
            writable: info.writable && conn.is_writable(),
            ..info
        };
        if let Some(tx) = &self.tx {
            let _ = tx.send(Message::Free {
                socket: self.socket,
                conn,
                info,
            });
        }
    }

    /// Take the socket out of the pool, e.g. after a protocol upgrade
    pub fn detach(mut self) -> C {
        let conn = self.conn.take();
        if let Some(tx) = &self.tx {
            let _ = tx.send(Message::Remove {
                socket: self.socket,
            });
        }
        match conn {
            Some(conn) => conn,
            // `conn` is only taken by consuming methods
            None => unreachable!("lease without connection"),
        }
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("lease without connection"),
        }
    }
}

impl<C> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("lease without connection"),
        }
    }
}

impl<C> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            if let Some(tx) = &self.tx {
                let _ = tx.send(Message::Closed {
                    socket: self.socket,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct MockConn {
        serial: usize,
        destroyed: bool,
        referenced: bool,
    }

    impl Connection for MockConn {
        fn is_writable(&self) -> bool {
            !self.destroyed
        }

        fn is_destroyed(&self) -> bool {
            self.destroyed
        }

        fn destroy(&mut self) {
            self.destroyed = true;
        }

        fn set_keep_alive(&mut self, _enable: bool, _initial_delay: Duration) {}

        fn set_ref(&mut self, referenced: bool) {
            self.referenced = referenced;
        }
    }

    #[derive(Default)]
    struct MockTransport {
        connects: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        type Conn = MockConn;

        async fn connect(&self, options: &ConnectOptions) -> io::Result<MockConn> {
            if options.host_or_default() == "unreachable" {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MockConn {
                serial,
                destroyed: false,
                referenced: true,
            })
        }
    }

    fn spawn(options: AgentOptions) -> (AgentHandle<MockConn>, Arc<AtomicUsize>) {
        let transport = MockTransport::default();
        let connects = Arc::clone(&transport.connects);
        (Agent::spawn(options, transport).unwrap(), connects)
    }

    fn target() -> ConnectOptions {
        ConnectOptions::new("localhost", 80)
    }

    #[tokio::test]
    async fn test_release_reuses_connection() {
        let (agent, connects) = spawn(AgentOptions::keep_alive());

        let first = agent.request(target()).await.unwrap();
        assert!(!first.reused());
        assert_eq!(first.serial, 1);
        assert_eq!(first.key().as_str(), "localhost:80:");
        first.release();

        let second = agent.request(target()).await.unwrap();
        assert!(second.reused());
        assert_eq!(second.serial, 1);
        assert!(second.referenced);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_closes_connection() {
        let (agent, connects) = spawn(AgentOptions::keep_alive());

        drop(agent.request(target()).await.unwrap());
        let lease = agent.request(target()).await.unwrap();
        assert!(!lease.reused());
        assert_eq!(lease.serial, 2);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(agent.stats().await.unwrap().total_socket_count, 1);
    }

    #[tokio::test]
    async fn test_without_keep_alive_release_closes() {
        let (agent, _) = spawn(AgentOptions::default());

        agent.request(target()).await.unwrap().release();
        let stats = agent.stats().await.unwrap();
        assert_eq!(stats.total_socket_count, 0);
        assert!(stats.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_connect_error() {
        let (agent, _) = spawn(AgentOptions::keep_alive());

        let err = agent
            .request(ConnectOptions::new("unreachable", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Connect { .. }));
        assert_eq!(agent.stats().await.unwrap().pending_connects, 0);
    }

    #[tokio::test]
    async fn test_queued_request_gets_released_socket() {
        let options = AgentOptions {
            max_sockets: Some(1),
            ..AgentOptions::keep_alive()
        };
        let (agent, connects) = spawn(options);

        let first = agent.request(target()).await.unwrap();
        let pending = agent.enqueue(target()).unwrap();
        assert_eq!(agent.stats().await.unwrap().total_queued(), 1);

        first.release();
        let second = pending.await.unwrap();
        assert_eq!(second.serial, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_pending_lease_cancels() {
        let options = AgentOptions {
            max_sockets: Some(1),
            ..AgentOptions::keep_alive()
        };
        let (agent, _) = spawn(options);

        let _held = agent.request(target()).await.unwrap();
        let pending = agent.enqueue(target()).unwrap();
        let id = pending.id();
        drop(pending);

        assert_eq!(agent.stats().await.unwrap().total_queued(), 0);
        assert!(!agent.cancel(id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_socket() {
        let options = AgentOptions {
            timeout: Some(1000),
            ..AgentOptions::keep_alive()
        };
        let (agent, _) = spawn(options);

        agent.request(target()).await.unwrap().release();
        assert_eq!(agent.stats().await.unwrap().endpoint("localhost:80:").free, 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(agent.stats().await.unwrap().total_socket_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_disarms_idle_timer() {
        let options = AgentOptions {
            timeout: Some(1000),
            ..AgentOptions::keep_alive()
        };
        let (agent, _) = spawn(options);

        agent.request(target()).await.unwrap().release();
        let lease = agent.request(target()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(agent.stats().await.unwrap().endpoint("localhost:80:").in_use, 1);
        drop(lease);
    }

    #[tokio::test]
    async fn test_destroy_fails_waiting_requests() {
        let options = AgentOptions {
            max_sockets: Some(1),
            ..AgentOptions::keep_alive()
        };
        let (agent, _) = spawn(options);

        let held = agent.request(target()).await.unwrap();
        let pending = agent.enqueue(target()).unwrap();
        agent.destroy().await.unwrap();

        assert!(matches!(pending.await, Err(AgentError::Destroyed)));
        held.release();
        assert!(matches!(
            agent.request(target()).await,
            Err(AgentError::Destroyed)
        ));
        assert_eq!(agent.stats().await.unwrap().total_socket_count, 0);
    }

    #[tokio::test]
    async fn test_detach_removes_from_pool() {
        let (agent, _) = spawn(AgentOptions::keep_alive());

        let lease = agent.request(target()).await.unwrap();
        let conn = lease.detach();
        assert!(!conn.destroyed);

        let stats = agent.stats().await.unwrap();
        assert_eq!(stats.total_socket_count, 0);
        assert!(stats.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_host_close_of_idle_socket() {
        let (agent, _) = spawn(AgentOptions::keep_alive());

        let lease = agent.request(target()).await.unwrap();
        let id = lease.id();
        lease.release();
        agent.socket_closed(id).unwrap();

        let next = agent.request(target()).await.unwrap();
        assert!(!next.reused());
        assert_eq!(next.serial, 2);
    }

    #[tokio::test]
    async fn test_idle_error_destroys_socket() {
        let (agent, _) = spawn(AgentOptions::keep_alive());

        let lease = agent.request(target()).await.unwrap();
        let id = lease.id();
        lease.release();
        agent.notify(id, HostEvent::Error).unwrap();

        assert_eq!(agent.stats().await.unwrap().total_socket_count, 0);
    }

    #[tokio::test]
    async fn test_unpolled_lease_is_freed_on_drop() {
        let options = AgentOptions {
            max_sockets: Some(1),
            ..AgentOptions::keep_alive()
        };
        let (agent, connects) = spawn(options);

        let held = agent.request(target()).await.unwrap();
        let pending = agent.enqueue(target()).unwrap();
        held.release();
        // The socket has been handed to `pending` once stats answer
        assert_eq!(agent.stats().await.unwrap().total_queued(), 0);
        drop(pending);

        let stats = agent.stats().await.unwrap();
        assert_eq!(stats.endpoint("localhost:80:").free, 1);
        assert!(agent.request(target()).await.unwrap().reused());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    struct GatedTransport {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl Transport for GatedTransport {
        type Conn = MockConn;

        async fn connect(&self, _options: &ConnectOptions) -> io::Result<MockConn> {
            self.gate.notified().await;
            Ok(MockConn {
                serial: 1,
                destroyed: false,
                referenced: true,
            })
        }
    }

    #[tokio::test]
    async fn test_destroy_fails_request_still_connecting() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let transport = GatedTransport {
            gate: Arc::clone(&gate),
        };
        let agent = Agent::spawn(AgentOptions::keep_alive(), transport).unwrap();

        let pending = agent.enqueue(target()).unwrap();
        assert_eq!(agent.stats().await.unwrap().pending_connects, 1);
        agent.destroy().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("request left without a reply");
        assert!(matches!(result, Err(AgentError::Destroyed)));

        // The connection that lands afterwards is torn down
        gate.notify_one();
        for _ in 0..100 {
            if agent.stats().await.unwrap().pending_connects == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(agent.stats().await.unwrap(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_get_name_applies_agent_defaults() {
        let (agent, _) = spawn(AgentOptions::keep_alive());
        let key = agent.get_name(&ConnectOptions::new("localhost", 80).with_family(6));
        assert_eq!(key.as_str(), "localhost:80::6");
    }
}
