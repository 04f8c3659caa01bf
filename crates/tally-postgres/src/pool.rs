use std::{
    ops::{Deref, DerefMut},
    sync::Mutex,
};

use postgres::{Client, NoTls};

use tally_core::StoreError;

pub const DEFAULT_MAX_IDLE: usize = 8;

/// Keeps up to `max_idle` connected clients around for reuse. New clients
/// are opened on demand, so the number in use is unbounded.
pub struct ClientPool {
    url: String,
    max_idle: usize,
    idle: Mutex<Vec<Client>>,
}

impl ClientPool {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        Self::with_max_idle(url, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(url: &str, max_idle: usize) -> Result<Self, StoreError> {
        let pool = Self {
            url: url.to_string(),
            max_idle,
            idle: Mutex::new(Vec::new()),
        };
        // Fail at startup rather than on the first request.
        let client = pool.open()?;
        pool.release(client);
        Ok(pool)
    }

    fn open(&self) -> Result<Client, StoreError> {
        Client::connect(&self.url, NoTls)
            .map_err(|e| StoreError::Unavailable(format!("PostgreSQL connection failed: {}", e)))
    }

    pub fn get(&self) -> Result<PooledClient<'_>, StoreError> {
        let reused = self.idle.lock().unwrap().pop();
        let client = match reused {
            Some(client) if !client.is_closed() => client,
            _ => self.open()?,
        };
        Ok(PooledClient {
            client: Some(client),
            pool: self,
        })
    }

    fn release(&self, client: Client) {
        if client.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.max_idle {
            idle.push(client);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// A client on loan from the pool; returned on drop.
pub struct PooledClient<'a> {
    client: Option<Client>,
    pool: &'a ClientPool,
}

impl PooledClient<'_> {
    /// Closes the client instead of returning it, for connections left in an
    /// unknown transaction state.
    pub fn discard(&mut self) {
        self.client = None;
    }
}

impl Deref for PooledClient<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("pooled client used after discard")
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("pooled client used after discard")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_url;

    #[test]
    fn test_pool_reuses_clients() {
        let Some(url) = test_url() else { return };
        let pool = ClientPool::with_max_idle(&url, 2).unwrap();
        assert_eq!(pool.idle_count(), 1);
        {
            let mut a = pool.get().unwrap();
            let mut b = pool.get().unwrap();
            a.batch_execute("SELECT 1").unwrap();
            b.batch_execute("SELECT 1").unwrap();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 2);
        {
            let mut c = pool.get().unwrap();
            c.discard();
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_pool_rejects_bad_url() {
        let err = ClientPool::connect("postgres://nobody@127.0.0.1:1/none").err().unwrap();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
