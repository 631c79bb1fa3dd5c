//! Connection pool
//!
//! Maps (scheme, authority) to the HTTP/2 connections open to it. A caller
//! gets a connection with one stream slot already reserved; if none has
//! room, exactly one caller per key dials while the others wait for it.
//!
//! The pool lock is never held while calling into a connection, since a
//! dying connection calls back into the pool to remove itself.

use super::client::{lock, ClientConn, Reservation};
use super::error::{Error, Result};
use crate::http::cancel::CancelToken;
use crate::http::session::SessionOps;
use crate::http::{Request, Scheme};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::debug;

/// Pool key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub scheme: Scheme,
    /// `host:port`, with the scheme's default port filled in
    pub authority: String,
}

impl ConnKey {
    pub fn for_request(req: &Request) -> Self {
        ConnKey {
            scheme: req.scheme(),
            authority: req.addr(),
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Result of dialing a key
pub enum Dialed {
    /// HTTP/2 was negotiated
    H2(ClientConn),
    /// The peer chose another protocol; the session serves one request
    Http1(Box<dyn SessionOps>),
}

/// A connection handed out by the pool
pub enum PoolConn {
    /// Pooled HTTP/2 connection with one stream slot reserved
    H2(Reservation),
    /// Unpooled session for the HTTP/1 fallback
    Http1(Box<dyn SessionOps>),
}

/// One in-flight dial that other callers for the same key wait on
struct DialCall {
    /// None while dialing; Some(Ok) once the pool should be looked at again
    result: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl DialCall {
    fn new() -> Self {
        DialCall {
            result: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<()>) {
        *lock(&self.result) = Some(result);
        self.cond.notify_all();
    }

    fn wait(self: &Arc<Self>, token: &CancelToken) -> Result<()> {
        let waker = Arc::downgrade(self);
        let _wake = token.on_cancel(move || {
            if let Some(call) = waker.upgrade() {
                let _result = lock(&call.result);
                call.cond.notify_all();
            }
        });
        let mut result = lock(&self.result);
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            token.check()?;
            result = token.wait(&self.cond, result);
        }
    }
}

#[derive(Default)]
struct PoolState {
    conns: HashMap<ConnKey, Vec<ClientConn>>,
    dialing: HashMap<ConnKey, Arc<DialCall>>,
    closed: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
}

/// Pool of HTTP/2 client connections
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

enum Role {
    Leader(Arc<DialCall>),
    Follower(Arc<DialCall>),
}

impl ConnPool {
    pub fn new() -> Self {
        ConnPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Get a connection for `key` with a stream slot reserved, dialing with
    /// `dial` if no pooled connection has room
    pub fn get<F>(&self, key: &ConnKey, token: &CancelToken, mut dial: F) -> Result<PoolConn>
    where
        F: FnMut() -> Result<Dialed>,
    {
        loop {
            token.check()?;
            for conn in self.snapshot(key)? {
                if let Some(reservation) = conn.reserve_new_request() {
                    return Ok(PoolConn::H2(reservation));
                }
            }

            let role = {
                let mut st = lock(&self.inner.state);
                if st.closed {
                    return Err(Error::ClientConnClosed);
                }
                match st.dialing.get(key) {
                    Some(call) => Role::Follower(Arc::clone(call)),
                    None => {
                        let call = Arc::new(DialCall::new());
                        st.dialing.insert(key.clone(), Arc::clone(&call));
                        Role::Leader(call)
                    }
                }
            };

            match role {
                Role::Follower(call) => call.wait(token)?,
                Role::Leader(call) => {
                    let dialed = dial();
                    let shared = match &dialed {
                        Ok(Dialed::H2(conn)) => self.insert(key, conn),
                        Ok(Dialed::Http1(_)) => Ok(()),
                        Err(err) => Err(err.clone()),
                    };
                    lock(&self.inner.state).dialing.remove(key);
                    call.complete(shared.clone());
                    shared?;

                    match dialed? {
                        Dialed::H2(conn) => {
                            if let Some(reservation) = conn.reserve_new_request() {
                                return Ok(PoolConn::H2(reservation));
                            }
                        }
                        Dialed::Http1(session) => return Ok(PoolConn::Http1(session)),
                    }
                }
            }
        }
    }

    fn snapshot(&self, key: &ConnKey) -> Result<Vec<ClientConn>> {
        let st = lock(&self.inner.state);
        if st.closed {
            return Err(Error::ClientConnClosed);
        }
        Ok(st.conns.get(key).cloned().unwrap_or_default())
    }

    /// Add a freshly dialed connection
    fn insert(&self, key: &ConnKey, conn: &ClientConn) -> Result<()> {
        {
            let mut st = lock(&self.inner.state);
            if st.closed {
                drop(st);
                conn.close();
                return Err(Error::ClientConnClosed);
            }
            st.conns.entry(key.clone()).or_default().push(conn.clone());
        }
        debug!(conn = conn.id(), key = %key, "connection added to pool");

        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let key = key.clone();
        let id = conn.id();
        conn.on_dead(move || {
            if let Some(pool) = pool.upgrade() {
                mark_dead(&pool, &key, id);
            }
        });
        Ok(())
    }

    /// Close every pooled connection that has no streams in flight
    pub fn close_idle_connections(&self) {
        for conn in self.all() {
            conn.close_if_idle();
        }
    }

    /// Close every connection and refuse further use
    pub fn shutdown(&self) {
        let conns = {
            let mut st = lock(&self.inner.state);
            st.closed = true;
            st.conns.drain().flat_map(|(_, conns)| conns).collect::<Vec<_>>()
        };
        for conn in conns {
            conn.close();
        }
    }

    /// Number of pooled connections for `key`
    pub fn len(&self, key: &ConnKey) -> usize {
        lock(&self.inner.state).conns.get(key).map_or(0, Vec::len)
    }

    fn all(&self) -> Vec<ClientConn> {
        lock(&self.inner.state).conns.values().flatten().cloned().collect()
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = lock(&self.inner.state);
        f.debug_struct("ConnPool")
            .field("keys", &st.conns.len())
            .field("dialing", &st.dialing.len())
            .field("closed", &st.closed)
            .finish()
    }
}

fn mark_dead(pool: &PoolInner, key: &ConnKey, id: u64) {
    let mut st = lock(&pool.state);
    if let Some(conns) = st.conns.get_mut(key) {
        conns.retain(|c| c.id() != id);
        if conns.is_empty() {
            st.conns.remove(key);
        }
        debug!(conn = id, key = %key, "connection removed from pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn request(url: &str) -> Request {
        Request::builder().method(Method::Get).url(url).build().unwrap()
    }

    #[test]
    fn test_key_fills_default_port() {
        let a = ConnKey::for_request(&request("https://example.com/a"));
        let b = ConnKey::for_request(&request("https://example.com:443/b"));
        let c = ConnKey::for_request(&request("http://example.com/"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.authority, "example.com:443");
        assert_eq!(a.to_string(), "https://example.com:443");
    }

    #[test]
    fn test_dial_error_reaches_caller() {
        let pool = ConnPool::new();
        let key = ConnKey::for_request(&request("https://example.com/"));
        let token = CancelToken::new();
        let mut dials = 0;
        let result = pool.get(&key, &token, || {
            dials += 1;
            Err(Error::ClientConnUnusable)
        });
        assert!(matches!(result, Err(Error::ClientConnUnusable)));
        assert_eq!(dials, 1);
        assert_eq!(pool.len(&key), 0);
    }

    #[test]
    fn test_shutdown_refuses_requests() {
        let pool = ConnPool::new();
        pool.shutdown();
        let key = ConnKey::for_request(&request("https://example.com/"));
        let result = pool.get(&key, &CancelToken::new(), || Err(Error::ClientConnUnusable));
        assert!(matches!(result, Err(Error::ClientConnClosed)));
    }

    #[test]
    fn test_follower_sees_leader_error() {
        let call = Arc::new(DialCall::new());
        let waiter = Arc::clone(&call);
        let handle = std::thread::spawn(move || waiter.wait(&CancelToken::new()));
        call.complete(Err(Error::ConnectionLost));
        assert!(matches!(handle.join().unwrap(), Err(Error::ConnectionLost)));
    }

    #[test]
    fn test_follower_wait_cancelled() {
        let call = Arc::new(DialCall::new());
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(call.wait(&token), Err(Error::Cancelled)));
    }
}
