//! Accounts and the live agent registry
//!
//! Presence in the registry means "this agent is online and has completed the
//! control handshake". The registry owns the write half of each control
//! connection; the read half stays with the broker's EOF watcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;

use crate::protocol::TunnelCommand;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable name-to-secret mapping, populated before the broker listens.
#[derive(Debug, Clone, Default)]
pub struct AccountTable {
    accounts: HashMap<String, String>,
}

impl AccountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, secret: impl Into<String>) {
        self.accounts.insert(name.into(), secret.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.accounts.contains_key(name)
    }

    /// True when the account exists and the secret matches.
    pub fn verify(&self, name: &str, secret: &str) -> bool {
        self.accounts.get(name).map(String::as_str) == Some(secret)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl<N: Into<String>, S: Into<String>> FromIterator<(N, S)> for AccountTable {
    fn from_iter<I: IntoIterator<Item = (N, S)>>(iter: I) -> Self {
        Self {
            accounts: iter
                .into_iter()
                .map(|(n, s)| (n.into(), s.into()))
                .collect(),
        }
    }
}

/// One registered control channel.
///
/// The handle id is process-unique and guards unregistration against the race
/// where a replacement registration for the same name already happened.
pub struct AgentHandle {
    name: String,
    id: u64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl AgentHandle {
    pub fn new(name: impl Into<String>, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            writer: tokio::sync::Mutex::new(writer),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write one encoded tunnel command onto the control channel.
    ///
    /// Writes are fallible at any time; the agent may have gone away without
    /// the broker noticing yet.
    pub async fn send_command(&self, command: &TunnelCommand) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(command.encode().as_bytes()).await
    }

    /// Shut down the write side so the agent observes EOF on its read loop.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

/// Concurrent mapping from account name to live control channel.
///
/// All map access is serialized under one mutex; I/O on returned handles
/// happens after the lock is released.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Arc<AgentHandle>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for the handle's name.
    ///
    /// Returns the displaced handle, if any, so the caller can close it. At
    /// most one agent is registered per name.
    pub fn register(&self, handle: Arc<AgentHandle>) -> Option<Arc<AgentHandle>> {
        let mut agents = self.agents.lock().unwrap();
        agents.insert(handle.name().to_string(), handle)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<AgentHandle>> {
        self.agents.lock().unwrap().get(name).cloned()
    }

    /// Remove the entry for `name` only if it still carries `id`.
    ///
    /// Returns whether an entry was removed. A mismatched id means a
    /// replacement registration already happened and the entry is left alone.
    pub fn unregister(&self, name: &str, id: u64) -> bool {
        let mut agents = self.agents.lock().unwrap();
        match agents.get(name) {
            Some(current) if current.id() == id => {
                agents.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.lock().unwrap().is_empty()
    }

    /// Remove all entries and close each control channel.
    ///
    /// Closing races benignly with in-flight command writes; those writes
    /// simply fail and their sessions error out.
    pub async fn drain(&self) {
        let handles: Vec<_> = {
            let mut agents = self.agents.lock().unwrap();
            agents.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            debug!(account = %handle.name(), "closing control channel");
            handle.close().await;
        }
    }
}
