//! Listener lifecycle.
//!
//! On every snapshot the manager diffs desired listeners against bound
//! sockets keyed by `(address, port)`. New keys are bound (TLS listeners
//! materialize an acceptor from the pushed PEMs first), removed keys stop
//! accepting and drain their in-flight connections, and a TLS-material change
//! is a remove-then-add. A listener whose TLS material is missing or invalid
//! never accepts traffic.

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::PrivateKeyDer;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::Service;
use tracing::{debug, info, warn};

use crate::errors::{AgwError, Result};
use crate::proto;

use super::proxy::GatewayService;

struct BoundListener {
    name: String,
    fingerprint: Option<u64>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns all listening sockets and reconciles them against snapshots.
pub struct ListenerManager {
    service: GatewayService,
    bound: HashMap<(String, u32), BoundListener>,
}

impl ListenerManager {
    pub fn new(service: GatewayService) -> Self {
        Self { service, bound: HashMap::new() }
    }

    /// Diff and converge. A zero-listener snapshot closes everything.
    pub async fn reconcile(&mut self, listeners: &[proto::Listener]) {
        let mut desired: HashMap<(String, u32), (&proto::Listener, Option<u64>)> = HashMap::new();
        for listener in listeners {
            if let Some(tls) = &listener.tls {
                if tls.cert_pem.is_empty() || tls.key_pem.is_empty() {
                    warn!(
                        listener = %listener.name,
                        "Skipping listener with unresolved TLS material"
                    );
                    continue;
                }
            }
            let fingerprint =
                listener.tls.as_ref().map(|t| tls_fingerprint(&t.cert_pem, &t.key_pem));
            desired.insert((listener.address.clone(), listener.port), (listener, fingerprint));
        }

        let stale: Vec<(String, u32)> = self
            .bound
            .iter()
            .filter(|(key, bound)| match desired.get(*key) {
                None => true,
                Some((_, fingerprint)) => *fingerprint != bound.fingerprint,
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            if let Some(bound) = self.bound.remove(&key) {
                info!(
                    listener = %bound.name,
                    address = %key.0,
                    port = key.1,
                    "Draining listener"
                );
                let _ = bound.shutdown.send(true);
                // Wait for the accept loop to release the socket; in-flight
                // connections keep draining in their own tasks.
                let _ = bound.task.await;
            }
        }

        for (key, (listener, fingerprint)) in desired {
            if !self.bound.contains_key(&key) {
                match self.bind(listener, fingerprint).await {
                    Ok(bound) => {
                        self.bound.insert(key, bound);
                    }
                    Err(e) => {
                        warn!(listener = %listener.name, error = %e, "Failed to bind listener");
                    }
                }
            }
        }
    }

    async fn bind(
        &self,
        listener: &proto::Listener,
        fingerprint: Option<u64>,
    ) -> Result<BoundListener> {
        let acceptor = match &listener.tls {
            Some(tls) => Some(build_acceptor(tls)?),
            None => None,
        };

        let addr = format!("{}:{}", listener.address, listener.port);
        let socket = TcpListener::bind(&addr).await.map_err(|e| {
            AgwError::transport(format!("failed to bind {}: {}", addr, e))
        })?;

        info!(
            listener = %listener.name,
            address = %addr,
            tls = acceptor.is_some(),
            "Listener bound"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener.name.clone(),
            socket,
            acceptor,
            self.service.clone(),
            shutdown_rx,
        ));

        Ok(BoundListener {
            name: listener.name.clone(),
            fingerprint,
            shutdown: shutdown_tx,
            task,
        })
    }

    #[cfg(test)]
    pub(crate) fn bound_keys(&self) -> Vec<(String, u32)> {
        let mut keys: Vec<(String, u32)> = self.bound.keys().cloned().collect();
        keys.sort();
        keys
    }
}

async fn accept_loop(
    name: String,
    socket: TcpListener,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    service: GatewayService,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = socket.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(listener = %name, peer = %peer, "Connection accepted");
                        let service = service.clone();
                        let acceptor = acceptor.clone();
                        let listener_name = name.clone();
                        tokio::spawn(async move {
                            match acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls_stream) => serve_connection(tls_stream, service).await,
                                    Err(e) => debug!(
                                        listener = %listener_name,
                                        peer = %peer,
                                        error = %e,
                                        "TLS handshake failed"
                                    ),
                                },
                                None => serve_connection(stream, service).await,
                            }
                        });
                    }
                    Err(e) => warn!(listener = %name, error = %e, "Accept failed"),
                }
            }
            _ = shutdown.changed() => {
                info!(listener = %name, "Listener stopped accepting");
                break;
            }
        }
    }
}

async fn serve_connection<S>(stream: S, service: GatewayService)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req| {
        let mut service = service.clone();
        async move { service.call(req).await }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
        debug!(error = %e, "Connection error");
    }
}

/// Build a TLS acceptor from PEM bytes pushed in the snapshot.
fn build_acceptor(tls: &proto::TlsConfig) -> Result<tokio_rustls::TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(tls.cert_pem.as_slice()))
        .filter_map(|cert| cert.ok())
        .collect();
    if certs.is_empty() {
        return Err(AgwError::config("no certificates found in TLS material".to_string()));
    }

    let key = load_private_key(&tls.key_pem)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AgwError::config(format!("failed to configure TLS: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

fn load_private_key(key_pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::read_all(&mut BufReader::new(key_pem))
        .filter_map(|item| match item.ok()? {
            rustls_pemfile::Item::Pkcs1Key(key) => Some(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => Some(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => Some(PrivateKeyDer::Sec1(key)),
            _ => None,
        })
        .collect();

    keys.into_iter()
        .next()
        .ok_or_else(|| AgwError::config("no private key found in TLS material".to_string()))
}

fn tls_fingerprint(cert_pem: &[u8], key_pem: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(cert_pem);
    hasher.update(key_pem);
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::snapshot::new_handle;
    use crate::dataplane::resources::ResourcePools;
    use crate::wasm::PluginEngine;

    fn manager() -> ListenerManager {
        let pools = Arc::new(ResourcePools::new());
        let engine = Arc::new(PluginEngine::new(pools).unwrap());
        ListenerManager::new(GatewayService::new(new_handle(), engine))
    }

    fn plain_listener(name: &str, port: u32) -> proto::Listener {
        proto::Listener {
            name: name.into(),
            address: "127.0.0.1".into(),
            port,
            tls: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconcile_binds_and_closes() {
        let mut manager = manager();

        // Bind to an ephemeral-ish pair of high ports.
        let listeners =
            vec![plain_listener("a", 36188), plain_listener("b", 36189)];
        manager.reconcile(&listeners).await;
        assert_eq!(manager.bound_keys().len(), 2);

        // Ports are actually accepting.
        assert!(tokio::net::TcpStream::connect("127.0.0.1:36188").await.is_ok());

        // A zero-listener snapshot closes everything previously bound.
        manager.reconcile(&[]).await;
        assert!(manager.bound_keys().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(tokio::net::TcpStream::connect("127.0.0.1:36188").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unresolved_tls_listener_never_binds() {
        let mut manager = manager();

        let listeners = vec![proto::Listener {
            name: "https".into(),
            address: "127.0.0.1".into(),
            port: 36443,
            tls: Some(proto::TlsConfig {
                secret_name: "my-tls".into(),
                cert_pem: Vec::new(),
                key_pem: Vec::new(),
            }),
        }];
        manager.reconcile(&listeners).await;
        assert!(manager.bound_keys().is_empty());
    }

    #[test]
    fn test_fingerprint_changes_with_material() {
        let a = tls_fingerprint(b"cert-a", b"key-a");
        let b = tls_fingerprint(b"cert-b", b"key-a");
        let c = tls_fingerprint(b"cert-a", b"key-a");
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_invalid_pem_rejected() {
        let tls = proto::TlsConfig {
            secret_name: "bad".into(),
            cert_pem: b"not a pem".to_vec(),
            key_pem: b"not a key".to_vec(),
        };
        assert!(build_acceptor(&tls).is_err());
    }
}
