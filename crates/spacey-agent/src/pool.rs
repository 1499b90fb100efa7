// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Socket pool state machine.
//!
//! [`Pool`] holds the bookkeeping of an agent: in-use sockets, idle sockets
//! and waiting requests per [`EndpointKey`]. It performs no I/O. Every
//! operation takes the triggering event and returns the [`Action`]s the
//! driver has to carry out (open a connection, hand a socket to a request,
//! destroy a socket, ...). Handlers run to completion, so the counting
//! invariants hold between any two calls:
//!
//! - `total_socket_count` equals the number of sockets in all in-use and
//!   free lists
//! - a socket is listed at most once, under exactly one key
//! - empty per-key lists and queues are removed

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::key::EndpointKey;
use crate::options::{AgentOptions, ConnectOptions, Scheduling};

/// Pool-assigned socket identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Caller-assigned request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

/// Side effect requested by the pool
#[derive(Debug)]
pub enum Action {
    /// Open a new connection for `request`
    Connect {
        /// Request waiting for the connection
        request: RequestId,
        /// Partition the socket will belong to
        key: EndpointKey,
        /// Where to connect
        options: ConnectOptions,
    },
    /// Hand a socket to a request
    Assign {
        /// Receiving request
        request: RequestId,
        /// Socket handed over
        socket: SocketId,
    },
    /// Hand an idle socket to a request; the socket must be re-referenced
    /// and lose its idle error handler
    Reuse {
        /// Receiving request
        request: RequestId,
        /// Socket taken from the free list
        socket: SocketId,
    },
    /// Deliver an error to a request
    Fail {
        /// Failed request
        request: RequestId,
        /// Reason
        error: AgentError,
    },
    /// Park a socket: enable TCP keep-alive, unref it and arm its idle timeout
    KeepAlive {
        /// Idle socket
        socket: SocketId,
        /// Keep-alive probe delay
        delay: Duration,
        /// Idle timeout, if any
        timeout: Option<Duration>,
    },
    /// Destroy a socket; a `close` event is expected afterwards
    Destroy {
        /// Socket to destroy
        socket: SocketId,
    },
    /// Remove every pool listener from a socket
    Detach {
        /// Socket leaving the pool
        socket: SocketId,
    },
}

/// Lifecycle events the pool listens for on its sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The owning request finished with the socket
    Free(FreeInfo),
    /// The socket closed
    Close,
    /// The socket timed out
    Timeout,
    /// The socket is being taken out of the pool (protocol upgrade)
    AgentRemove,
    /// The socket reported an error
    Error,
}

impl SocketEvent {
    /// Event name as emitted on Node sockets
    pub fn name(&self) -> &'static str {
        match self {
            SocketEvent::Free(_) => "free",
            SocketEvent::Close => "close",
            SocketEvent::Timeout => "timeout",
            SocketEvent::AgentRemove => "agentRemove",
            SocketEvent::Error => "error",
        }
    }
}

/// State reported with a `free` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeInfo {
    /// The socket can still be written to
    pub writable: bool,
    /// The finished request allows the connection to be reused
    pub keep_alive: bool,
    /// `Keep-Alive` response header, if the server sent one
    pub keep_alive_hint: Option<String>,
}

impl FreeInfo {
    /// A writable socket whose request allows reuse
    pub fn reusable() -> Self {
        Self {
            writable: true,
            keep_alive: true,
            keep_alive_hint: None,
        }
    }

    /// A socket whose request asked for `Connection: close`
    pub fn close() -> Self {
        Self {
            keep_alive: false,
            ..Self::reusable()
        }
    }

    /// Attach the server's `Keep-Alive` header
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.keep_alive_hint = Some(hint.into());
        self
    }
}

impl Default for FreeInfo {
    fn default() -> Self {
        Self::reusable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    InUse,
    Free,
    /// Destroyed and dropped from every list, waiting for `close`
    Dead,
}

#[derive(Debug)]
struct SocketEntry {
    key: EndpointKey,
    state: SocketState,
    destroyed: bool,
    /// idle `error` handler
    swallow_errors: bool,
}

#[derive(Debug)]
struct QueuedRequest {
    id: RequestId,
    options: ConnectOptions,
}

#[derive(Debug)]
struct Connecting {
    key: EndpointKey,
    cancelled: bool,
}

/// Per-endpoint counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    /// Sockets assigned to requests
    pub in_use: usize,
    /// Idle sockets
    pub free: usize,
    /// Requests waiting for a socket
    pub queued: usize,
    /// Connections being opened
    pub connecting: usize,
}

/// Snapshot of the pool bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Sockets in all in-use and free lists
    pub total_socket_count: usize,
    /// Connections being opened
    pub pending_connects: usize,
    /// Counters per endpoint
    pub endpoints: BTreeMap<EndpointKey, EndpointStats>,
}

impl PoolStats {
    /// Counters for one endpoint
    pub fn endpoint(&self, key: &str) -> EndpointStats {
        self.endpoints.get(key).cloned().unwrap_or_default()
    }

    /// Queued requests across all endpoints
    pub fn total_queued(&self) -> usize {
        self.endpoints.values().map(|e| e.queued).sum()
    }
}

/// Connection pool bookkeeping for one agent
#[derive(Debug)]
pub struct Pool {
    options: AgentOptions,
    sockets: HashMap<EndpointKey, Vec<SocketId>>,
    free_sockets: HashMap<EndpointKey, VecDeque<SocketId>>,
    requests: HashMap<EndpointKey, VecDeque<QueuedRequest>>,
    /// Keys of `requests` in the order their queues were created
    request_order: Vec<EndpointKey>,
    entries: HashMap<SocketId, SocketEntry>,
    connecting: HashMap<RequestId, Connecting>,
    pending: HashMap<EndpointKey, usize>,
    total_socket_count: usize,
    next_socket_id: u64,
    destroyed: bool,
}

impl Pool {
    /// Create a pool, validating the agent options
    pub fn new(options: AgentOptions) -> crate::Result<Self> {
        Ok(Self {
            options: options.validate()?,
            sockets: HashMap::new(),
            free_sockets: HashMap::new(),
            requests: HashMap::new(),
            request_order: Vec::new(),
            entries: HashMap::new(),
            connecting: HashMap::new(),
            pending: HashMap::new(),
            total_socket_count: 0,
            next_socket_id: 1,
            destroyed: false,
        })
    }

    /// Agent options in effect
    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Sockets currently tracked in the in-use and free lists
    pub fn total_socket_count(&self) -> usize {
        self.total_socket_count
    }

    /// Whether [`Pool::destroy`] has been called
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Key for a set of request options, after agent defaults are applied
    pub fn get_name(&self, options: &ConnectOptions) -> EndpointKey {
        let mut options = options.clone();
        options.apply_agent(&self.options);
        EndpointKey::derive(&options)
    }

    /// Reserve an id for a freshly connected socket
    pub fn allocate_socket_id(&mut self) -> SocketId {
        let id = SocketId(self.next_socket_id);
        self.next_socket_id += 1;
        id
    }

    /// Whether the pool's listeners are attached to `socket`.
    ///
    /// Listeners live from connection until `close` or `agentRemove`.
    pub fn is_attached(&self, socket: SocketId) -> bool {
        self.entries.contains_key(&socket)
    }

    /// Whether `socket` sits in a free list
    pub fn is_free(&self, socket: SocketId) -> bool {
        self.entries
            .get(&socket)
            .is_some_and(|e| e.state == SocketState::Free)
    }

    /// Endpoint `socket` was opened for
    pub fn key_of(&self, socket: SocketId) -> Option<&EndpointKey> {
        self.entries.get(&socket).map(|e| &e.key)
    }

    /// Idle sockets, oldest first per key
    pub fn free_socket_ids(&self) -> Vec<SocketId> {
        self.free_sockets.values().flatten().copied().collect()
    }

    /// Admit a request: reuse an idle socket, open a new one, or queue it.
    pub fn add_request(&mut self, request: RequestId, options: ConnectOptions) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.destroyed {
            actions.push(Action::Fail {
                request,
                error: AgentError::Destroyed,
            });
            return actions;
        }

        let mut options = options;
        options.apply_agent(&self.options);
        let key = EndpointKey::derive(&options);

        if let Some(socket) = self.take_free_socket(&key) {
            debug!(%key, %socket, %request, "reusing free socket");
            if let Some(entry) = self.entries.get_mut(&socket) {
                entry.state = SocketState::InUse;
                entry.swallow_errors = false;
            }
            self.sockets.entry(key).or_default().push(socket);
            actions.push(Action::Reuse { request, socket });
        } else if self.has_capacity(&key) {
            self.start_connect(request, key, options, &mut actions);
        } else {
            debug!(%key, %request, "wait for socket");
            self.enqueue(key, QueuedRequest { id: request, options });
        }
        actions
    }

    /// Record the outcome of a connection attempt started by [`Action::Connect`].
    pub fn connect_completed(
        &mut self,
        request: RequestId,
        result: std::io::Result<SocketId>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(connecting) = self.connecting.remove(&request) else {
            warn!(%request, "connection completed for unknown request");
            if let Ok(socket) = result {
                actions.push(Action::Destroy { socket });
            }
            return actions;
        };
        let key = connecting.key;
        if let Some(count) = self.pending.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(&key);
            }
        }

        let socket = match result {
            Ok(socket) => socket,
            Err(err) => {
                debug!(%key, %request, error = %err, "connection failed");
                if !connecting.cancelled {
                    actions.push(Action::Fail {
                        request,
                        error: AgentError::connect(key, err),
                    });
                }
                return actions;
            }
        };

        debug!(%key, %socket, %request, "socket created");
        self.sockets.entry(key.clone()).or_default().push(socket);
        self.total_socket_count += 1;
        self.entries.insert(
            socket,
            SocketEntry {
                key,
                state: SocketState::InUse,
                destroyed: false,
                swallow_errors: false,
            },
        );

        if self.destroyed {
            if !connecting.cancelled {
                actions.push(Action::Fail {
                    request,
                    error: AgentError::Destroyed,
                });
            }
            self.destroy_socket(socket, &mut actions);
        } else if connecting.cancelled {
            // Nobody is waiting; offer the socket as if it had just been freed
            self.handle_free(socket, FreeInfo::reusable(), &mut actions);
        } else {
            actions.push(Action::Assign { request, socket });
        }
        actions
    }

    /// Dispatch a socket event through the pool's listeners.
    ///
    /// Events for sockets without attached listeners are ignored. `error`
    /// only has a listener while the socket is idle.
    pub fn on_socket_event(&mut self, socket: SocketId, event: SocketEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_attached(socket) {
            debug!(%socket, event = event.name(), "event for detached socket");
            return actions;
        }
        match event {
            SocketEvent::Free(info) => self.handle_free(socket, info, &mut actions),
            SocketEvent::Close => self.handle_remove(socket, false, &mut actions),
            SocketEvent::AgentRemove => self.handle_remove(socket, true, &mut actions),
            SocketEvent::Timeout => self.handle_timeout(socket, &mut actions),
            SocketEvent::Error => self.handle_error(socket, &mut actions),
        }
        actions
    }

    /// A request finished with `socket`
    pub fn socket_freed(&mut self, socket: SocketId, info: FreeInfo) -> Vec<Action> {
        self.on_socket_event(socket, SocketEvent::Free(info))
    }

    /// `socket` closed
    pub fn socket_closed(&mut self, socket: SocketId) -> Vec<Action> {
        self.on_socket_event(socket, SocketEvent::Close)
    }

    /// `socket` timed out
    pub fn socket_timeout(&mut self, socket: SocketId) -> Vec<Action> {
        self.on_socket_event(socket, SocketEvent::Timeout)
    }

    /// Take `socket` out of pool management without closing it
    pub fn remove_socket(&mut self, socket: SocketId) -> Vec<Action> {
        self.on_socket_event(socket, SocketEvent::AgentRemove)
    }

    /// Note that a socket was destroyed outside the pool.
    ///
    /// It stays counted until its `close` event, but will not be reused.
    pub fn mark_destroyed(&mut self, socket: SocketId) {
        if let Some(entry) = self.entries.get_mut(&socket) {
            entry.destroyed = true;
        }
    }

    /// Withdraw a request that has not received a socket yet.
    ///
    /// Returns `false` if the request is unknown or already served.
    pub fn cancel_request(&mut self, request: RequestId) -> bool {
        if let Some(connecting) = self.connecting.get_mut(&request) {
            debug!(%request, key = %connecting.key, "cancel while connecting");
            connecting.cancelled = true;
            return true;
        }

        let found = self.requests.iter_mut().find_map(|(key, queue)| {
            let index = queue.iter().position(|r| r.id == request)?;
            queue.remove(index);
            Some(key.clone())
        });
        match found {
            Some(key) => {
                debug!(%request, %key, "cancel queued request");
                self.drop_queue_if_empty(&key);
                true
            }
            None => false,
        }
    }

    /// Destroy every socket and fail every queued or connecting request
    pub fn destroy(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.destroyed = true;

        let mut sockets: Vec<SocketId> = self.free_socket_ids();
        sockets.extend(self.sockets.values().flatten().copied());
        sockets.sort();
        for socket in sockets {
            self.destroy_socket(socket, &mut actions);
        }

        for key in std::mem::take(&mut self.request_order) {
            if let Some(queue) = self.requests.remove(&key) {
                for request in queue {
                    actions.push(Action::Fail {
                        request: request.id,
                        error: AgentError::Destroyed,
                    });
                }
            }
        }
        // In-flight connects fail now; their sockets are destroyed on arrival
        let mut in_flight: Vec<RequestId> = self
            .connecting
            .iter()
            .filter(|(_, connecting)| !connecting.cancelled)
            .map(|(request, _)| *request)
            .collect();
        in_flight.sort();
        for connecting in self.connecting.values_mut() {
            connecting.cancelled = true;
        }
        for request in in_flight {
            actions.push(Action::Fail {
                request,
                error: AgentError::Destroyed,
            });
        }
        actions
    }

    /// Snapshot of the bookkeeping
    pub fn stats(&self) -> PoolStats {
        let mut endpoints: BTreeMap<EndpointKey, EndpointStats> = BTreeMap::new();
        for (key, sockets) in &self.sockets {
            endpoints.entry(key.clone()).or_default().in_use = sockets.len();
        }
        for (key, sockets) in &self.free_sockets {
            endpoints.entry(key.clone()).or_default().free = sockets.len();
        }
        for (key, queue) in &self.requests {
            endpoints.entry(key.clone()).or_default().queued = queue.len();
        }
        for (key, count) in &self.pending {
            endpoints.entry(key.clone()).or_default().connecting = *count;
        }
        PoolStats {
            total_socket_count: self.total_socket_count,
            pending_connects: self.pending_total(),
            endpoints,
        }
    }

    fn handle_free(&mut self, socket: SocketId, info: FreeInfo, actions: &mut Vec<Action>) {
        let Some(entry) = self.entries.get(&socket) else {
            return;
        };
        let key = entry.key.clone();
        let destroyed = entry.destroyed;
        debug!(%key, %socket, "agent.on(free)");
        if entry.state != SocketState::InUse {
            warn!(%key, %socket, state = ?entry.state, "free event for socket not in use");
            return;
        }

        if !info.writable || destroyed {
            self.destroy_socket(socket, actions);
            return;
        }

        if let Some(next) = self.dequeue(&key) {
            debug!(%key, %socket, request = %next.id, "handing socket to queued request");
            actions.push(Action::Assign {
                request: next.id,
                socket,
            });
            return;
        }

        if !info.keep_alive || !self.options.keep_alive {
            self.destroy_socket(socket, actions);
            return;
        }

        let free_len = self.free_sockets.get(&key).map_or(0, VecDeque::len);
        let count = free_len + self.sockets.get(&key).map_or(0, Vec::len);
        let timeout = self.keep_alive_timeout(info.keep_alive_hint.as_deref());

        let over_limit = self.total_socket_count > self.options.total_socket_limit()
            || count > self.options.socket_limit()
            || free_len >= self.options.max_free_sockets;
        let Some(timeout) = timeout.filter(|_| !over_limit) else {
            self.destroy_socket(socket, actions);
            return;
        };

        if !self.take_from_in_use(&key, socket) {
            warn!(%key, %socket, "freed socket missing from in-use list");
            self.destroy_socket(socket, actions);
            return;
        }
        self.free_sockets.entry(key).or_default().push_back(socket);
        if let Some(entry) = self.entries.get_mut(&socket) {
            entry.state = SocketState::Free;
            entry.swallow_errors = true;
        }
        actions.push(Action::KeepAlive {
            socket,
            delay: Duration::from_millis(self.options.keep_alive_msecs),
            timeout,
        });
    }

    fn handle_remove(&mut self, socket: SocketId, detach: bool, actions: &mut Vec<Action>) {
        let Some(entry) = self.entries.remove(&socket) else {
            return;
        };
        let key = entry.key;
        debug!(%key, %socket, detach, "removeSocket");

        if entry.state != SocketState::Dead {
            if self.take_from_in_use(&key, socket) || self.take_from_free(&key, socket) {
                self.total_socket_count -= 1;
            } else {
                warn!(%key, %socket, "removed socket missing from pool lists");
            }
        }
        if detach {
            actions.push(Action::Detach { socket });
        }

        if self.destroyed {
            return;
        }
        if self.requests.contains_key(&key) {
            if self.has_capacity(&key) {
                if let Some(next) = self.dequeue(&key) {
                    debug!(%key, request = %next.id, "removeSocket, have a request, make a socket");
                    self.start_connect(next.id, key, next.options, actions);
                }
            }
            return;
        }

        let candidate = self
            .request_order
            .iter()
            .find(|other| self.has_capacity(other))
            .cloned();
        if let Some(other) = candidate {
            if let Some(next) = self.dequeue(&other) {
                debug!(key = %other, request = %next.id, "removeSocket, have a request with different origin, make a socket");
                self.start_connect(next.id, other, next.options, actions);
            }
        }
    }

    fn handle_timeout(&mut self, socket: SocketId, actions: &mut Vec<Action>) {
        if self.is_free(socket) {
            debug!(%socket, "idle socket timed out");
            self.destroy_socket(socket, actions);
        }
    }

    fn handle_error(&mut self, socket: SocketId, actions: &mut Vec<Action>) {
        let swallow = self.entries.get(&socket).is_some_and(|e| e.swallow_errors);
        if swallow {
            debug!(%socket, "error on idle socket");
            self.destroy_socket(socket, actions);
        }
    }

    /// Idle timeout for a socket entering the free list, or `None` if the
    /// server asked for the connection not to be reused.
    fn keep_alive_timeout(&self, hint: Option<&str>) -> Option<Option<Duration>> {
        let mut timeout_ms = self.options.timeout.unwrap_or(0);
        if let Some(server_ms) = hint.and_then(parse_keep_alive_timeout) {
            if server_ms == 0 {
                return None;
            }
            if server_ms < timeout_ms {
                timeout_ms = server_ms;
            }
        }
        Some((timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)))
    }

    fn take_free_socket(&mut self, key: &EndpointKey) -> Option<SocketId> {
        let entries = &self.entries;
        let free = self.free_sockets.get_mut(key)?;
        let mut stale = Vec::new();
        free.retain(|socket| {
            let destroyed = entries.get(socket).is_none_or(|e| e.destroyed);
            if destroyed {
                stale.push(*socket);
            }
            !destroyed
        });
        let socket = match self.options.scheduling {
            Scheduling::Fifo => free.pop_front(),
            Scheduling::Lifo => free.pop_back(),
        };
        if free.is_empty() {
            self.free_sockets.remove(key);
        }

        // Destroyed sockets leave the lists now and only wait for `close`
        for socket in stale {
            self.total_socket_count -= 1;
            if let Some(entry) = self.entries.get_mut(&socket) {
                entry.state = SocketState::Dead;
            }
        }
        socket
    }

    /// Unlist `socket` from the in-use list; callers adjust the count
    fn take_from_in_use(&mut self, key: &EndpointKey, socket: SocketId) -> bool {
        let Some(list) = self.sockets.get_mut(key) else {
            return false;
        };
        let Some(index) = list.iter().position(|s| *s == socket) else {
            return false;
        };
        list.remove(index);
        if list.is_empty() {
            self.sockets.remove(key);
        }
        true
    }

    fn take_from_free(&mut self, key: &EndpointKey, socket: SocketId) -> bool {
        let Some(list) = self.free_sockets.get_mut(key) else {
            return false;
        };
        let Some(index) = list.iter().position(|s| *s == socket) else {
            return false;
        };
        list.remove(index);
        if list.is_empty() {
            self.free_sockets.remove(key);
        }
        true
    }

    fn has_capacity(&self, key: &EndpointKey) -> bool {
        let in_key = self.sockets.get(key).map_or(0, Vec::len)
            + self.free_sockets.get(key).map_or(0, VecDeque::len)
            + self.pending.get(key).copied().unwrap_or(0);
        in_key < self.options.socket_limit()
            && self.total_socket_count + self.pending_total() < self.options.total_socket_limit()
    }

    fn pending_total(&self) -> usize {
        self.pending.values().sum()
    }

    fn start_connect(
        &mut self,
        request: RequestId,
        key: EndpointKey,
        options: ConnectOptions,
        actions: &mut Vec<Action>,
    ) {
        debug!(%key, %request, "createConnection");
        *self.pending.entry(key.clone()).or_default() += 1;
        self.connecting.insert(
            request,
            Connecting {
                key: key.clone(),
                cancelled: false,
            },
        );
        actions.push(Action::Connect {
            request,
            key,
            options,
        });
    }

    fn destroy_socket(&mut self, socket: SocketId, actions: &mut Vec<Action>) {
        if let Some(entry) = self.entries.get_mut(&socket) {
            entry.destroyed = true;
        }
        actions.push(Action::Destroy { socket });
    }

    fn enqueue(&mut self, key: EndpointKey, request: QueuedRequest) {
        match self.requests.get_mut(&key) {
            Some(queue) => queue.push_back(request),
            None => {
                self.request_order.push(key.clone());
                self.requests.insert(key, VecDeque::from([request]));
            }
        }
    }

    fn dequeue(&mut self, key: &EndpointKey) -> Option<QueuedRequest> {
        let next = self.requests.get_mut(key)?.pop_front();
        self.drop_queue_if_empty(key);
        next
    }

    fn drop_queue_if_empty(&mut self, key: &EndpointKey) {
        if self.requests.get(key).is_some_and(VecDeque::is_empty) {
            self.requests.remove(key);
            self.request_order.retain(|k| k != key);
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let listed: usize = self.sockets.values().map(Vec::len).sum::<usize>()
            + self.free_sockets.values().map(VecDeque::len).sum::<usize>();
        assert_eq!(self.total_socket_count, listed, "socket count drifted");

        let mut seen = std::collections::HashSet::new();
        for socket in self
            .sockets
            .values()
            .flatten()
            .chain(self.free_sockets.values().flatten())
        {
            assert!(seen.insert(*socket), "{} listed twice", socket);
        }
        for (key, list) in &self.free_sockets {
            assert!(!list.is_empty(), "empty free list for {}", key);
            assert!(list.len() <= self.options.max_free_sockets);
        }
        assert!(self.sockets.values().all(|l| !l.is_empty()));
        assert!(self.requests.values().all(|q| !q.is_empty()));
        assert_eq!(self.request_order.len(), self.requests.len());
    }
}

/// Extract `timeout=N` (seconds) from a `Keep-Alive` header, in milliseconds
fn parse_keep_alive_timeout(header: &str) -> Option<u64> {
    header.split(',').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("timeout") {
            return None;
        }
        value.trim().parse::<u64>().ok().map(|secs| secs.saturating_mul(1000))
    })
}
