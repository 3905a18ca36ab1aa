//! Turning unsatisfied targets into connections.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::client::conn::ClientConnection;
use crate::client::request::{FailureReason, MSG_INVALID_URL};
use crate::client::Client;
use crate::net::NetworkStack;
use crate::rt::Semaphore;

/// How long a connection attempt may take before it fails.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The callout a [`Client`] uses to get connections built.
///
/// An implementation should arrange for
/// [`Client::get_unsatisfied_target`] to be called to obtain a target,
/// a connection to be made, and on success
/// [`Client::add_new_connection`] (on error
/// [`Client::cancel_requests_by_target`]) to be called, all from its own
/// thread and never from inside `request_new_connection`, which runs on the
/// client's event loop and must not block.
///
/// There is not necessarily a 1:1 mapping between connection requests and
/// calls to this function: it may be called when several connections are
/// needed, or when the requests that needed one have been cancelled in the
/// meantime. Implementations should loop until
/// `get_unsatisfied_target` no longer returns a target.
pub trait ConnectionProvider: Send {
    /// Signals that the client has pending requests no existing
    /// connection can serve.
    fn request_new_connection(&self);
}

struct ProviderShared {
    wake: Semaphore,
    stop: AtomicBool,
}

/// A [`ConnectionProvider`] that suits most needs.
///
/// Supports a single URL scheme and builds connections on one background
/// thread using the supplied [`NetworkStack`]. The thread starts on
/// construction and is stopped and joined on drop.
pub struct DefaultConnectionProvider {
    shared: Arc<ProviderShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DefaultConnectionProvider {
    /// Creates the provider for `client`.
    ///
    /// The weak reference breaks the ownership cycle: the client owns the
    /// provider, and the provider thread exits by itself once the client
    /// is gone.
    pub fn new<S: Into<String>>(
        client: Weak<Client>,
        stack: Arc<dyn NetworkStack>,
        scheme: S,
    ) -> DefaultConnectionProvider {
        let shared = Arc::new(ProviderShared {
            wake: Semaphore::new(0),
            stop: AtomicBool::new(false),
        });
        let scheme = scheme.into();
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("http-connection-provider".to_string())
                .spawn(move || provider_loop(client, stack, scheme, shared))
                .expect("failed to spawn connection provider thread")
        };
        DefaultConnectionProvider {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }
}

fn provider_loop(
    client: Weak<Client>,
    stack: Arc<dyn NetworkStack>,
    scheme: String,
    shared: Arc<ProviderShared>,
) {
    loop {
        shared.wake.wait(None);
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        let client = match client.upgrade() {
            Some(client) => client,
            None => return,
        };
        while let Some((name, request_scheme)) = client.get_unsatisfied_target() {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            if request_scheme != scheme {
                trace!("rejecting target {} with scheme {}", name, request_scheme);
                client.cancel_requests_by_target(
                    &name,
                    &request_scheme,
                    FailureReason::UnsupportedProtocol,
                    MSG_INVALID_URL,
                );
                continue;
            }
            match stack.connect(&name, Some(CONNECT_TIMEOUT)) {
                Ok(socket) => {
                    debug!("connected to {}", name);
                    client.add_new_connection(ClientConnection::new(
                        name.clone(),
                        request_scheme,
                        socket,
                    ));
                }
                Err(e) => {
                    debug!("connection to {} failed: {}", name, e);
                    client.cancel_requests_by_target(
                        &name,
                        &request_scheme,
                        FailureReason::ConnectionFailed,
                        &e.to_string(),
                    );
                }
            }
        }
    }
}

impl ConnectionProvider for DefaultConnectionProvider {
    fn request_new_connection(&self) {
        self.shared.wake.post();
    }
}

impl Drop for DefaultConnectionProvider {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.post();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            // The last client reference can die on the provider thread
            // itself; joining would then deadlock, and the stop flag
            // already ends the loop.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl fmt::Debug for DefaultConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DefaultConnectionProvider")
    }
}
