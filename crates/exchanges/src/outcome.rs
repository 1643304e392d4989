//! Single-resolution deferred results
//!
//! An operation that waits for a server acknowledgement returns an
//! [`Outcome`]; the expectation handler that sees the acknowledgement holds the
//! matching [`Completer`]. Resolving consumes the completer, so an outcome can
//! be settled at most once. A completer dropped unresolved (its expectation
//! was discarded with the connection) settles the outcome as
//! [`ExchangeError::ConnectionClosed`].
//!
//! There is no built-in timeout: race [`Outcome::wait`] against
//! `monoio::time::timeout` when a deadline is needed.

use crate::errors::{ExchangeError, Result};
use flume::{Receiver, Sender, TryRecvError};

/// Create a linked completer/outcome pair
pub fn outcome<T>() -> (Completer<T>, Outcome<T>) {
    let (tx, rx) = flume::bounded(1);
    (Completer { tx }, Outcome { rx })
}

#[derive(Debug)]
pub struct Completer<T> {
    tx: Sender<Result<T>>,
}

impl<T> Completer<T> {
    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn reject(self, error: ExchangeError) {
        self.complete(Err(error));
    }

    pub fn complete(self, result: Result<T>) {
        // The caller may have dropped its outcome; nothing is waiting then.
        let _ = self.tx.try_send(result);
    }
}

#[derive(Debug)]
pub struct Outcome<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Outcome<T> {
    /// Wait for the operation to settle.
    pub async fn wait(self) -> Result<T> {
        match self.rx.recv_async().await {
            Ok(result) => result,
            Err(_) => Err(abandoned()),
        }
    }

    /// Take the result if the operation has already settled.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(abandoned())),
        }
    }

    /// Whether a result (or abandonment) is waiting to be taken
    pub fn is_settled(&self) -> bool {
        !self.rx.is_empty() || self.rx.is_disconnected()
    }
}

fn abandoned() -> ExchangeError {
    ExchangeError::ConnectionClosed("operation abandoned before acknowledgement".to_string())
}
