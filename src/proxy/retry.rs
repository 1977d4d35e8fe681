//! Retrying an exchange on a fresh upstream connection.

use std::future::Future;

use futures::future::BoxFuture;

use super::pool::{ConnectionPool, PooledConnection};
use crate::error::{ProxyError, Result};

/// Outcome of [`RetryPolicy::execute`].
#[derive(Debug)]
pub struct RetryResult {
    /// The connection the last attempt ran on, when one was established.
    pub connection: Option<PooledConnection>,
    /// Set when every attempt failed or the failure was not retryable.
    pub error: Option<ProxyError>,
    /// What the action asked for: whether the session may keep going.
    pub continue_session: bool,
}

impl RetryResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retries: u32,
    pool: ConnectionPool,
}

impl RetryPolicy {
    pub fn new(retries: u32, pool: ConnectionPool) -> Self {
        Self { retries, pool }
    }

    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Run `action` on `initial` (or a connection from `generator`), trying
    /// again on a new connection while the failure is retryable and
    /// attempts remain. Connections that failed are disposed.
    pub async fn execute<C, G, Fut, A>(
        &self,
        ctx: &mut C,
        initial: Option<PooledConnection>,
        mut generator: G,
        mut action: A,
    ) -> RetryResult
    where
        C: ?Sized,
        G: FnMut() -> Fut,
        Fut: Future<Output = Result<PooledConnection>>,
        A: for<'a> FnMut(&'a mut C, &'a mut PooledConnection) -> BoxFuture<'a, Result<bool>>,
    {
        let attempts = self.attempts();
        let mut current = initial;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let mut conn = match current.take() {
                Some(conn) => conn,
                None => match generator().await {
                    Ok(conn) => conn,
                    Err(err) if err.is_retryable() && attempt < attempts => {
                        tracing::debug!("attempt {}/{} could not connect: {}", attempt, attempts, err);
                        last_error = Some(err);
                        continue;
                    }
                    Err(err) => {
                        return RetryResult {
                            connection: None,
                            error: Some(err),
                            continue_session: false,
                        }
                    }
                },
            };

            match action(ctx, &mut conn).await {
                Ok(continue_session) => {
                    return RetryResult {
                        connection: Some(conn),
                        error: None,
                        continue_session,
                    }
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(
                        "attempt {}/{} failed on connection {}: {}",
                        attempt,
                        attempts,
                        conn.id,
                        err
                    );
                    self.pool.dispose(conn).await;
                    last_error = Some(err);
                }
                Err(err) => {
                    return RetryResult {
                        connection: Some(conn),
                        error: Some(err),
                        continue_session: false,
                    }
                }
            }
        }

        RetryResult {
            connection: None,
            error: last_error,
            continue_session: false,
        }
    }
}
