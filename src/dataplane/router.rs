//! Per-request route selection and endpoint picking.

use crate::proto;

use super::snapshot::ActiveSnapshot;

/// Why a request could not be forwarded.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteError {
    /// No route matched: the gateway answers 404.
    NoRoute,
    /// The matched route's cluster has no endpoints: 502.
    EmptyCluster,
}

/// First-match route selection in snapshot order: the route's `path_prefix`
/// must prefix the request path and its `domain`, when set, must equal the
/// request host. Longer prefixes get no special priority — precedence is
/// the snapshot's route order.
pub fn match_route<'a>(
    snapshot: &'a proto::ConfigSnapshot,
    path: &str,
    host: Option<&str>,
) -> Option<&'a proto::Route> {
    snapshot.routes.iter().find(|route| {
        path.starts_with(&route.path_prefix)
            && (route.domain.is_empty() || host == Some(route.domain.as_str()))
    })
}

/// Pick an upstream endpoint for the route's cluster by round-robin.
pub fn pick_endpoint(
    active: &ActiveSnapshot,
    cluster_id: &str,
) -> Result<proto::Endpoint, RouteError> {
    let cluster = active
        .snapshot
        .clusters
        .iter()
        .find(|c| c.name == cluster_id)
        .ok_or(RouteError::EmptyCluster)?;

    if cluster.endpoints.is_empty() {
        return Err(RouteError::EmptyCluster);
    }

    let index = active.next_index(cluster_id, cluster.endpoints.len());
    Ok(cluster.endpoints[index].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> proto::ConfigSnapshot {
        proto::ConfigSnapshot {
            version_id: "test".into(),
            routes: vec![
                proto::Route {
                    path_prefix: "/api".into(),
                    cluster_id: "c1".into(),
                    ..Default::default()
                },
                proto::Route {
                    path_prefix: "/api/v2".into(),
                    cluster_id: "c2".into(),
                    ..Default::default()
                },
                proto::Route {
                    path_prefix: "/tenant".into(),
                    domain: "example.com".into(),
                    cluster_id: "c1".into(),
                    ..Default::default()
                },
            ],
            clusters: vec![
                proto::Cluster {
                    name: "c1".into(),
                    endpoints: vec![
                        proto::Endpoint { address: "10.0.0.1".into(), port: 8080 },
                        proto::Endpoint { address: "10.0.0.2".into(), port: 8080 },
                    ],
                },
                proto::Cluster { name: "empty".into(), endpoints: Vec::new() },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_first_match_wins_over_longer_prefix() {
        let snapshot = snapshot();
        // "/api/v2/users" also matches the later, longer "/api/v2" prefix,
        // but declaration order decides.
        let route = match_route(&snapshot, "/api/v2/users", None).unwrap();
        assert_eq!(route.cluster_id, "c1");
    }

    #[test]
    fn test_no_route_is_none() {
        let snapshot = snapshot();
        assert!(match_route(&snapshot, "/other", None).is_none());
    }

    #[test]
    fn test_domain_filter() {
        let snapshot = snapshot();
        assert!(match_route(&snapshot, "/tenant/x", None).is_none());
        assert!(match_route(&snapshot, "/tenant/x", Some("other.com")).is_none());

        let route = match_route(&snapshot, "/tenant/x", Some("example.com")).unwrap();
        assert_eq!(route.domain, "example.com");
    }

    #[test]
    fn test_round_robin_endpoint_pick() {
        let active = ActiveSnapshot::new(snapshot());
        let first = pick_endpoint(&active, "c1").unwrap();
        let second = pick_endpoint(&active, "c1").unwrap();
        let third = pick_endpoint(&active, "c1").unwrap();

        assert_eq!(first.address, "10.0.0.1");
        assert_eq!(second.address, "10.0.0.2");
        assert_eq!(third.address, "10.0.0.1");
    }

    #[test]
    fn test_empty_and_unknown_clusters() {
        let active = ActiveSnapshot::new(snapshot());
        assert_eq!(pick_endpoint(&active, "empty").unwrap_err(), RouteError::EmptyCluster);
        assert_eq!(pick_endpoint(&active, "ghost").unwrap_err(), RouteError::EmptyCluster);
    }
}
