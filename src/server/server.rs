//! SOCKS server: listener, accept tasks, session registry.

use crate::protocol::SocksVersion;
use crate::server::auth::Authenticator;
use crate::server::session::{SessionHandle, run_session};
use crate::util::{Result, configure_tcp_stream};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Number of accept tasks racing on the shared listener.
const ACCEPT_TASKS: usize = 32;

/// Process-wide monotonic connection id counter.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Server configuration, immutable once the server is built.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Local interface address literal for outbound connects; empty (or
    /// unparsable) disables binding.
    pub bind_addr: String,
    /// Expected credentials; an empty username disables authentication.
    pub username: String,
    pub password: String,
}

impl ServerOptions {
    /// The outbound bind interface, when one is configured and valid.
    pub fn bind_ip(&self) -> Option<IpAddr> {
        self.bind_addr.parse().ok()
    }
}

/// SOCKS server owning the listening endpoint and the registry of live
/// sessions. Sessions are owned by their own tasks; the registry holds weak
/// references only, so no reference cycle keeps a finished session alive.
pub struct SocksServer {
    options: ServerOptions,
    auth: Authenticator,
    listener: TcpListener,
    abort: AtomicBool,
    shutdown: Notify,
    sessions: Mutex<HashMap<u64, Weak<SessionHandle>>>,
}

impl SocksServer {
    /// Bind the listening endpoint. Accept tasks start with [`start`].
    ///
    /// [`start`]: SocksServer::start
    pub async fn bind(addr: &str, options: ServerOptions) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        info!("[Server] Listening on {}", listener.local_addr()?);

        let auth = Authenticator::new(options.username.clone(), options.password.clone());
        Ok(Arc::new(Self {
            options,
            auth,
            listener,
            abort: AtomicBool::new(false),
            shutdown: Notify::new(),
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub(crate) fn auth_required(&self) -> bool {
        self.auth.required()
    }

    pub(crate) fn authenticate(
        &self,
        username: &[u8],
        password: &[u8],
        version: SocksVersion,
    ) -> bool {
        self.auth.verify(username, password, version)
    }

    /// Spawn the accept tasks. All of them race on the one listener; each
    /// accepted connection becomes its own session task.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..ACCEPT_TASKS {
            let server = Arc::clone(self);
            tokio::spawn(async move { server.accept_loop().await });
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();

            if self.abort.load(Ordering::SeqCst) {
                break;
            }

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                res = self.listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        if self.abort.load(Ordering::SeqCst) {
                            break;
                        }
                        error!("[Server] Accept error: {}", err);
                        continue;
                    }
                }
            };

            configure_tcp_stream(&stream, &peer.to_string());

            let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            let handle = SessionHandle::new(id);
            self.sessions
                .lock()
                .expect("session registry poisoned")
                .insert(id, Arc::downgrade(&handle));

            debug!("[Server] id {}: client incoming from {}", id, peer);

            let span = info_span!("socks.session", id, peer = %peer);
            let server = Arc::downgrade(&self);
            tokio::spawn(run_session(server, handle, stream).instrument(span));
        }

        debug!("[Server] Accept task exit");
    }

    /// Shut the server down: stop the accept tasks and close every live
    /// session, unblocking whatever I/O each one is parked on.
    pub fn close(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let handles: Vec<_> = {
            let sessions = self.sessions.lock().expect("session registry poisoned");
            sessions.values().filter_map(Weak::upgrade).collect()
        };
        warn!("[Server] Shutting down, closing {} live sessions", handles.len());
        for handle in handles {
            handle.close();
        }
    }

    /// Number of sessions still alive in the registry.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }

    /// Called by each session when its task finishes.
    pub(crate) fn remove_session(&self, id: u64) {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .remove(&id);
    }
}
