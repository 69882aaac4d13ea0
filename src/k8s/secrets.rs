//! TLS Secret controller.
//!
//! Only secrets of type `kubernetes.io/tls` with non-empty `tls.crt` and
//! `tls.key` entries are stored; deletion removes them from the registry so
//! the next merged snapshot drops any listener that referenced them.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::registry::Registry;

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// Watch Secrets cluster-wide and mirror TLS material into the registry.
pub async fn run(client: Client, registry: Arc<Registry>) {
    let api: Api<Secret> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();

    info!("Starting Secret watcher");

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(secret)) | Ok(watcher::Event::InitApply(secret)) => {
                if let Some((name, cert, key)) = extract_tls(&secret) {
                    debug!(secret = %name, "TLS secret stored");
                    registry.upsert_secret(&name, cert, key);
                }
            }
            Ok(watcher::Event::Delete(secret)) => {
                let name = secret.name_any();
                debug!(secret = %name, "Secret deleted");
                registry.delete_secret(&name);
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(e) => warn!(error = %e, "Secret watch error, retrying"),
        }
    }
}

/// Pull usable TLS material out of a secret, if it carries any.
pub(crate) fn extract_tls(secret: &Secret) -> Option<(String, Vec<u8>, Vec<u8>)> {
    if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return None;
    }
    let data = secret.data.as_ref()?;
    let cert = data.get(TLS_CERT_KEY)?.0.clone();
    let key = data.get(TLS_KEY_KEY)?.0.clone();
    if cert.is_empty() || key.is_empty() {
        return None;
    }
    Some((secret.name_any(), cert, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn make_secret(type_: &str, entries: &[(&str, &[u8])]) -> Secret {
        let data: BTreeMap<String, ByteString> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
            .collect();
        Secret {
            metadata: ObjectMeta { name: Some("my-tls".to_string()), ..Default::default() },
            type_: Some(type_.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn test_tls_secret_extracted() {
        let secret = make_secret(TLS_SECRET_TYPE, &[("tls.crt", b"CERT"), ("tls.key", b"KEY")]);
        let (name, cert, key) = extract_tls(&secret).unwrap();
        assert_eq!(name, "my-tls");
        assert_eq!(cert, b"CERT");
        assert_eq!(key, b"KEY");
    }

    #[test]
    fn test_opaque_secret_ignored() {
        let secret = make_secret("Opaque", &[("tls.crt", b"CERT"), ("tls.key", b"KEY")]);
        assert!(extract_tls(&secret).is_none());
    }

    #[test]
    fn test_incomplete_tls_secret_ignored() {
        let secret = make_secret(TLS_SECRET_TYPE, &[("tls.crt", b"CERT")]);
        assert!(extract_tls(&secret).is_none());

        let secret = make_secret(TLS_SECRET_TYPE, &[("tls.crt", b"CERT"), ("tls.key", b"")]);
        assert!(extract_tls(&secret).is_none());
    }
}
