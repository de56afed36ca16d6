//! Pool of persistent sessions, keyed by endpoint.
//!
//! A session is checked out for the duration of one exchange and checked
//! back in only if the exchange succeeded; a failed session is closed. Only
//! the idle-queue bookkeeping happens under the lock: connecting and the
//! exchange itself run outside of it.
//!
//! # Example
//!
//! ```ignore
//! use rigging::{ConnectionPool, PoolOptions};
//!
//! let pool = ConnectionPool::for_options(&PoolOptions::default())?;
//! let response = pool
//!     .session_for(request.url(), move |session| {
//!         Box::pin(async move { session.send(request, &target).await })
//!     })
//!     .await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::Display;
use rigging_core::BoxFuture;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::config::PoolOptions;
use crate::connector::HttpConnect;
use crate::{Error, Result};

/// Pool key: scheme, host and port of a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{scheme}://{host}:{port}")]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Endpoint of `url`; path, query and credentials are ignored.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_request(format!("URL {url} has no host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_request(format!("URL {url} has no port")))?;
        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// URL scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, explicit or the scheme default.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` for `https` endpoints.
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }
}

/// A reusable transport connection.
pub trait Session: Send + 'static {
    /// Returns `false` once the peer or the transport closed the session.
    fn is_open(&self) -> bool;

    /// Terminate the session. Errors are ignored.
    fn close(self);
}

/// Opens sessions.
pub trait Connect: Send + Sync + 'static {
    /// Session type produced.
    type Session: Session;

    /// Open a new session to `endpoint`.
    fn connect(&self, endpoint: &Endpoint) -> impl Future<Output = Result<Self::Session>> + Send;
}

struct IdleSession<S> {
    session: S,
    last_used: Instant,
}

type IdleQueues<S> = HashMap<Endpoint, VecDeque<IdleSession<S>>>;

/// Sessions pooled per endpoint.
pub struct ConnectionPool<C: Connect = HttpConnect> {
    connector: C,
    idle_timeout: Duration,
    idle: Mutex<IdleQueues<C::Session>>,
}

impl<C: Connect> ConnectionPool<C> {
    /// Create an empty pool.
    pub fn new(connector: C, idle_timeout: Duration) -> Self {
        Self {
            connector,
            idle_timeout,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Connector used on pool misses.
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    fn lock(&self) -> MutexGuard<'_, IdleQueues<C::Session>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `exchange` with a session to the endpoint of `url`.
    ///
    /// An idle session is reused when one is open, otherwise a new one is
    /// created. The session returns to the pool when `exchange` succeeds and
    /// is closed when it fails; the error is returned unchanged.
    pub async fn session_for<F, T>(&self, url: &Url, exchange: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut C::Session) -> BoxFuture<'s, Result<T>>,
    {
        let endpoint = Endpoint::from_url(url)?;

        let mut session = match self.checkout(&endpoint) {
            Some(session) => {
                debug!(%endpoint, "reusing pooled session");
                session
            }
            None => {
                debug!(%endpoint, "opening session");
                #[cfg(feature = "metrics")]
                metrics::counter!("rigging_pool_sessions_opened_total").increment(1);
                self.connector.connect(&endpoint).await?
            }
        };

        match exchange(&mut session).await {
            Ok(value) => {
                self.checkin(endpoint, session);
                Ok(value)
            }
            Err(error) => {
                debug!(%endpoint, error = %error, "discarding failed session");
                session.close();
                Err(error)
            }
        }
    }

    fn checkout(&self, endpoint: &Endpoint) -> Option<C::Session> {
        let mut idle = self.lock();
        Self::evict_idle(&mut idle, self.idle_timeout);

        let queue = idle.get_mut(endpoint)?;
        while let Some(entry) = queue.pop_front() {
            if entry.session.is_open() {
                return Some(entry.session);
            }
            debug!(%endpoint, "skipping closed session");
            entry.session.close();
        }
        None
    }

    fn checkin(&self, endpoint: Endpoint, session: C::Session) {
        if !session.is_open() {
            session.close();
            return;
        }
        self.lock().entry(endpoint).or_default().push_back(IdleSession {
            session,
            last_used: Instant::now(),
        });
    }

    fn evict_idle(idle: &mut IdleQueues<C::Session>, idle_timeout: Duration) {
        for (endpoint, queue) in idle.iter_mut() {
            while queue
                .front()
                .is_some_and(|entry| entry.last_used.elapsed() > idle_timeout)
            {
                if let Some(entry) = queue.pop_front() {
                    debug!(%endpoint, "closing idle session");
                    entry.session.close();
                }
            }
        }
        idle.retain(|_, queue| !queue.is_empty());
    }

    /// Number of idle sessions across all endpoints. Checked-out sessions are not counted.
    pub fn size(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    /// Close sessions idle for longer than the idle timeout.
    pub fn clean(&self) {
        Self::evict_idle(&mut self.lock(), self.idle_timeout);
    }

    /// Close every idle session.
    pub fn empty(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, queue) in drained {
            for entry in queue {
                entry.session.close();
            }
        }
    }
}

impl<C: Connect> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle_timeout", &self.idle_timeout)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

static POOLS: LazyLock<Mutex<HashMap<PoolOptions, Arc<ConnectionPool>>>> =
    LazyLock::new(Mutex::default);

impl ConnectionPool {
    /// Shared HTTP pool for `options`.
    ///
    /// Pools are memoized per distinct options for the whole process, so
    /// clients built with the same networking options share their sessions.
    ///
    /// The connector is built without holding the registry lock; when two
    /// callers race on the same options the first registered pool wins.
    pub fn for_options(options: &PoolOptions) -> Result<Arc<Self>> {
        if let Some(pool) = Self::registry().get(options) {
            return Ok(Arc::clone(pool));
        }

        let connector = HttpConnect::new(options)?;
        let mut pools = Self::registry();
        let pool = pools
            .entry(options.clone())
            .or_insert_with(|| Arc::new(Self::new(connector, options.http_idle_timeout)));
        Ok(Arc::clone(pool))
    }

    fn registry() -> MutexGuard<'static, HashMap<PoolOptions, Arc<Self>>> {
        POOLS.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every shared pool created so far.
    pub fn pools() -> Vec<Arc<Self>> {
        Self::registry()
            .values()
            .cloned()
            .collect()
    }
}
