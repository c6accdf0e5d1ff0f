//! Bounded pool of reusable browser sessions.
//!
//! A session is leased to exactly one task at a time and retired after a
//! configurable number of uses or after any crash report. Lease capacity is
//! guarded by a semaphore so concurrent tasks can never hold more sessions
//! than the pool allows.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::{BrowserAutomation, BrowserError, SessionHandle};

/// Pool sizing and retirement policy.
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    pub max_sessions: usize,
    /// Sessions are retired after this many leases.
    pub max_uses: u32,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            max_uses: 32,
        }
    }
}

struct IdleSession {
    id: String,
    handle: Box<dyn SessionHandle>,
    proxy: Option<String>,
    uses: u32,
    created_at: DateTime<Utc>,
}

/// An owned lease over one session. Return it with [`SessionPool::release`];
/// the embedded permit frees pool capacity even if the lease is dropped.
pub struct SessionLease {
    pub id: String,
    pub handle: Box<dyn SessionHandle>,
    proxy: Option<String>,
    uses: u32,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }
}

/// Bounded session pool over an automation backend.
pub struct SessionPool {
    automation: Arc<dyn BrowserAutomation>,
    config: SessionPoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
    next_id: AtomicU64,
}

impl SessionPool {
    pub fn new(automation: Arc<dyn BrowserAutomation>, config: SessionPoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self {
            automation,
            config,
            permits,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Lease a session bound to `proxy`. Reuses an idle session with the same
    /// proxy binding when one exists, otherwise opens a fresh one. Waits when
    /// all sessions are leased.
    pub async fn lease(&self, proxy: Option<&str>) -> Result<SessionLease, BrowserError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BrowserError::PoolClosed)?;

        let reusable = {
            let mut idle = self.idle.lock().await;
            let position = idle
                .iter()
                .position(|session| session.proxy.as_deref() == proxy);
            position.map(|i| idle.swap_remove(i))
        };

        let now = Utc::now();
        if let Some(session) = reusable {
            return Ok(SessionLease {
                id: session.id,
                handle: session.handle,
                proxy: session.proxy,
                uses: session.uses + 1,
                created_at: session.created_at,
                last_used_at: now,
                _permit: permit,
            });
        }

        let handle = self.automation.open_session(proxy).await?;
        let id = format!("sess-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        log::debug!("opened browser session {id} (proxy: {proxy:?})");
        Ok(SessionLease {
            id,
            handle,
            proxy: proxy.map(str::to_string),
            uses: 1,
            created_at: now,
            last_used_at: now,
            _permit: permit,
        })
    }

    /// Return a lease. Unhealthy or worn-out sessions are closed instead of
    /// going back to the idle list.
    pub async fn release(&self, mut lease: SessionLease, healthy: bool) {
        if !healthy || lease.uses >= self.config.max_uses {
            log::debug!(
                "retiring browser session {} (healthy={healthy}, uses={})",
                lease.id,
                lease.uses
            );
            if let Err(err) = lease.handle.close().await {
                log::warn!("session {} close failed: {err}", lease.id);
            }
            return;
        }

        let mut idle = self.idle.lock().await;
        idle.push(IdleSession {
            id: lease.id,
            handle: lease.handle,
            proxy: lease.proxy,
            uses: lease.uses,
            created_at: lease.created_at,
        });
        while idle.len() > self.config.max_sessions {
            let mut dropped = idle.remove(0);
            tokio::spawn(async move {
                let _ = dropped.handle.close().await;
            });
        }
    }

    /// Close every idle session. Held leases are unaffected; their permits
    /// return as they drop.
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        for mut session in idle.drain(..) {
            if let Err(err) = session.handle.close().await {
                log::warn!("session {} close failed: {err}", session.id);
            }
        }
    }
}
