use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{Result, WebSocketError};

/// Pings waiting for their pong, keyed by the ping payload.
pub(crate) struct PingTable {
    limit: usize,
    waiters: Mutex<HashMap<Bytes, oneshot::Sender<()>>>,
}

impl PingTable {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<Bytes, oneshot::Sender<()>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for `token`, refusing once `limit` pings are outstanding.
    pub(crate) fn register(&self, token: Bytes) -> Result<oneshot::Receiver<()>> {
        let mut waiters = self.waiters();
        if waiters.len() >= self.limit {
            return Err(WebSocketError::TooManyPings(self.limit));
        }

        let (tx, rx) = oneshot::channel();
        waiters.insert(token, tx);
        Ok(rx)
    }

    /// Wakes the ping waiting for `token`. Returns `false` for unsolicited pongs.
    pub(crate) fn resolve(&self, token: &[u8]) -> bool {
        match self.waiters().remove(token) {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel(&self, token: &[u8]) {
        self.waiters().remove(token);
    }

    /// Drops every waiter; their receivers observe the sender going away.
    pub(crate) fn clear(&self) {
        self.waiters().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters().len()
    }
}
