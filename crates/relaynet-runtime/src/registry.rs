//! Handle registry
//!
//! Bookkeeping for every handle the host holds: connections, listen sockets
//! and poll groups. The registry is the single place liveness is decided.
//! A connection stays registered after a terminal state is observed (so
//! `close` can still release it) but it is no longer live. Handles removed
//! by the host are remembered for a while so late use reports `Retired`
//! instead of `Unknown`.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use relaynet_core::{
    ConnectionHandle, ConnectionState, HandleFault, HandleKind, Identity, ListenSocketHandle,
    PollGroupHandle, RelayNetError, Result, Timestamp, VirtualPort,
};

// ----------------------------------------------------------------------------
// Entries
// ----------------------------------------------------------------------------

/// Runtime view of one connection
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub handle: ConnectionHandle,
    pub remote: Identity,
    /// Last state the runtime observed
    pub state: ConnectionState,
    /// Listen socket that produced this connection, for inbound ones
    pub listen_socket: Option<ListenSocketHandle>,
    /// Inbound and not yet accepted
    pub pending_request: bool,
    pub poll_group: Option<PollGroupHandle>,
    pub name: String,
    /// Opaque host value
    pub user_tag: i64,
    /// Last provider sequence returned by `send`
    pub last_sequence: Option<u64>,
    pub opened_at: Timestamp,
}

impl ConnectionEntry {
    /// Outbound connection created by `connect`
    pub fn outbound(handle: ConnectionHandle, remote: Identity, opened_at: Timestamp) -> Self {
        Self {
            handle,
            remote,
            state: ConnectionState::Connecting,
            listen_socket: None,
            pending_request: false,
            poll_group: None,
            name: String::new(),
            user_tag: 0,
            last_sequence: None,
            opened_at,
        }
    }

    /// Inbound connection announced by an incoming request
    pub fn inbound(
        handle: ConnectionHandle,
        remote: Identity,
        listen_socket: ListenSocketHandle,
        opened_at: Timestamp,
    ) -> Self {
        Self {
            listen_socket: Some(listen_socket),
            pending_request: true,
            ..Self::outbound(handle, remote, opened_at)
        }
    }

    /// Whether operations other than `close` may use this handle
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[derive(Debug, Clone)]
pub struct ListenSocketEntry {
    pub handle: ListenSocketHandle,
    pub port: VirtualPort,
    pub opened_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct PollGroupEntry {
    pub handle: PollGroupHandle,
    pub members: BTreeSet<ConnectionHandle>,
    pub created_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Retired Handle Memory
// ----------------------------------------------------------------------------

/// Bounded memory of handles the host closed or destroyed
#[derive(Debug)]
struct RetiredHandles {
    order: VecDeque<(HandleKind, u64)>,
    members: HashSet<(HandleKind, u64)>,
    capacity: usize,
}

impl RetiredHandles {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    fn retire(&mut self, kind: HandleKind, raw: u64) {
        if self.capacity == 0 || !self.members.insert((kind, raw)) {
            return;
        }
        self.order.push_back((kind, raw));
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, kind: HandleKind, raw: u64) -> bool {
        self.members.contains(&(kind, raw))
    }
}

// ----------------------------------------------------------------------------
// Handle Registry
// ----------------------------------------------------------------------------

/// Registry of every handle issued to the host
#[derive(Debug)]
pub struct HandleRegistry {
    connections: BTreeMap<ConnectionHandle, ConnectionEntry>,
    listen_sockets: BTreeMap<ListenSocketHandle, ListenSocketEntry>,
    poll_groups: BTreeMap<PollGroupHandle, PollGroupEntry>,
    retired: RetiredHandles,
}

impl HandleRegistry {
    pub fn new(retired_memory: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            listen_sockets: BTreeMap::new(),
            poll_groups: BTreeMap::new(),
            retired: RetiredHandles::new(retired_memory),
        }
    }

    /// Error for a handle that is not registered
    fn missing(&self, kind: HandleKind, raw: u64) -> RelayNetError {
        let fault = if self.retired.contains(kind, raw) {
            HandleFault::Retired
        } else {
            HandleFault::Unknown
        };
        RelayNetError::invalid_handle(kind, raw, fault)
    }

    // --- connections ---

    pub fn insert_connection(&mut self, entry: ConnectionEntry) {
        self.connections.insert(entry.handle, entry);
    }

    /// Registered entry, live or dead
    pub fn connection_entry(&self, handle: ConnectionHandle) -> Option<&ConnectionEntry> {
        self.connections.get(&handle)
    }

    pub fn connection_entry_mut(&mut self, handle: ConnectionHandle) -> Option<&mut ConnectionEntry> {
        self.connections.get_mut(&handle)
    }

    /// Registered entry, or the reason the handle is not registered
    pub fn connection(&self, handle: ConnectionHandle) -> Result<&ConnectionEntry> {
        self.connections
            .get(&handle)
            .ok_or_else(|| self.missing(HandleKind::Connection, handle.raw()))
    }

    /// Entry for a handle that is registered and has not reached a terminal state
    pub fn live_connection(&self, handle: ConnectionHandle) -> Result<&ConnectionEntry> {
        match self.connections.get(&handle) {
            Some(entry) if entry.is_live() => Ok(entry),
            Some(_) => Err(RelayNetError::invalid_handle(
                HandleKind::Connection,
                handle.raw(),
                HandleFault::Dead,
            )),
            None => Err(self.missing(HandleKind::Connection, handle.raw())),
        }
    }

    pub fn live_connection_mut(&mut self, handle: ConnectionHandle) -> Result<&mut ConnectionEntry> {
        self.live_connection(handle).map(|_| ())?;
        self.connections.get_mut(&handle).ok_or_else(|| {
            RelayNetError::invalid_handle(HandleKind::Connection, handle.raw(), HandleFault::Unknown)
        })
    }

    pub fn is_live(&self, handle: ConnectionHandle) -> bool {
        self.live_connection(handle).is_ok()
    }

    /// Remove and retire a connection, dropping its poll group membership
    pub fn remove_connection(&mut self, handle: ConnectionHandle) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&handle)?;
        if let Some(group) = entry.poll_group {
            if let Some(group_entry) = self.poll_groups.get_mut(&group) {
                group_entry.members.remove(&handle);
            }
        }
        self.retired.retire(HandleKind::Connection, handle.raw());
        Some(entry)
    }

    /// Registered connection handles in ascending order
    pub fn connection_handles(&self) -> Vec<ConnectionHandle> {
        self.connections.keys().copied().collect()
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.connections.values()
    }

    /// Connections that were produced by `socket`
    pub fn connections_from(&self, socket: ListenSocketHandle) -> Vec<ConnectionHandle> {
        self.connections
            .values()
            .filter(|entry| entry.listen_socket == Some(socket))
            .map(|entry| entry.handle)
            .collect()
    }

    pub fn live_connection_count(&self) -> usize {
        self.connections.values().filter(|e| e.is_live()).count()
    }

    // --- listen sockets ---

    pub fn insert_listen_socket(&mut self, entry: ListenSocketEntry) {
        self.listen_sockets.insert(entry.handle, entry);
    }

    pub fn listen_socket(&self, handle: ListenSocketHandle) -> Result<&ListenSocketEntry> {
        self.listen_sockets
            .get(&handle)
            .ok_or_else(|| self.missing(HandleKind::ListenSocket, handle.raw()))
    }

    pub fn has_listen_socket(&self, handle: ListenSocketHandle) -> bool {
        self.listen_sockets.contains_key(&handle)
    }

    pub fn remove_listen_socket(&mut self, handle: ListenSocketHandle) -> Option<ListenSocketEntry> {
        let entry = self.listen_sockets.remove(&handle)?;
        self.retired.retire(HandleKind::ListenSocket, handle.raw());
        Some(entry)
    }

    pub fn listen_socket_handles(&self) -> Vec<ListenSocketHandle> {
        self.listen_sockets.keys().copied().collect()
    }

    // --- poll groups ---

    pub fn insert_poll_group(&mut self, handle: PollGroupHandle, created_at: Timestamp) {
        self.poll_groups.insert(
            handle,
            PollGroupEntry {
                handle,
                members: BTreeSet::new(),
                created_at,
            },
        );
    }

    pub fn poll_group(&self, handle: PollGroupHandle) -> Result<&PollGroupEntry> {
        self.poll_groups
            .get(&handle)
            .ok_or_else(|| self.missing(HandleKind::PollGroup, handle.raw()))
    }

    /// Remove and retire a poll group; members must already be unassigned
    pub fn remove_poll_group(&mut self, handle: PollGroupHandle) -> Option<PollGroupEntry> {
        let entry = self.poll_groups.remove(&handle)?;
        for member in &entry.members {
            if let Some(connection) = self.connections.get_mut(member) {
                connection.poll_group = None;
            }
        }
        self.retired.retire(HandleKind::PollGroup, handle.raw());
        Some(entry)
    }

    pub fn poll_group_handles(&self) -> Vec<PollGroupHandle> {
        self.poll_groups.keys().copied().collect()
    }

    /// Make `group` the only group of `connection`, returning the previous one
    pub fn assign(
        &mut self,
        connection: ConnectionHandle,
        group: PollGroupHandle,
    ) -> Result<Option<PollGroupHandle>> {
        if !self.poll_groups.contains_key(&group) {
            return Err(self.missing(HandleKind::PollGroup, group.raw()));
        }
        let previous = self.unassign(connection)?;
        if let Some(entry) = self.connections.get_mut(&connection) {
            entry.poll_group = Some(group);
        }
        if let Some(group_entry) = self.poll_groups.get_mut(&group) {
            group_entry.members.insert(connection);
        }
        Ok(previous)
    }

    /// Drop the group membership of `connection`, returning the group it left
    pub fn unassign(&mut self, connection: ConnectionHandle) -> Result<Option<PollGroupHandle>> {
        let previous = match self.connections.get_mut(&connection) {
            Some(entry) => entry.poll_group.take(),
            None => return Err(self.missing(HandleKind::Connection, connection.raw())),
        };
        if let Some(group) = previous {
            if let Some(group_entry) = self.poll_groups.get_mut(&group) {
                group_entry.members.remove(&connection);
            }
        }
        Ok(previous)
    }
}
