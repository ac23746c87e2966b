use crate::common::StringMatch;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

/// Defines which authentication methods are accepted on a set of workloads,
/// and which identity (peer or origin) sets the request principal.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "authentication.istio.io",
    version = "v1alpha1",
    kind = "Policy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Selects the workloads the policy applies to. When empty, the policy
    /// applies to all workloads in its namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetSelector>,

    /// Peer authentication methods, evaluated in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerAuthenticationMethod>,

    /// Accept requests even when no peer method is satisfied. Ignored when
    /// `peers` is empty.
    #[serde(default)]
    pub peer_is_optional: bool,

    /// Origin authentication methods, evaluated in order. A method may be
    /// skipped by its trigger rules; if all methods are skipped, origin
    /// authentication is ignored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<OriginAuthenticationMethod>,

    /// Accept requests even when no origin method is satisfied. Ignored when
    /// `origins` is empty.
    #[serde(default)]
    pub origin_is_optional: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_binding: Option<PrincipalBinding>,
}

/// Selects workloads by service name and, optionally, service ports.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelector {
    /// A short name from the service registry.
    pub name: String,

    /// Service (not workload) ports. Empty selects all exposed ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSelector>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PortSelector {
    Number(u32),
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PeerAuthenticationMethod {
    Mtls(MutualTls),
    /// Not yet supported by proxies.
    Jwt(Jwt),
}

/// Mutual TLS parameters. A null value, as in `- mtls:`, means the defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MutualTls {
    /// Deprecated; translates to `PERMISSIVE` mode when set.
    #[serde(default)]
    pub allow_tls: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<MtlsMode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutualTlsFields {
    #[serde(default)]
    allow_tls: bool,

    #[serde(default)]
    mode: Option<MtlsMode>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MtlsMode {
    /// Client cert must be presented, connection is in TLS.
    Strict,
    /// Connection can be either plaintext or TLS, and client cert can be
    /// omitted.
    Permissive,
}

impl<'de> Deserialize<'de> for MutualTls {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Option::<MutualTlsFields>::deserialize(deserializer)?;
        Ok(fields
            .map(|MutualTlsFields { allow_tls, mode }| Self { allow_tls, mode })
            .unwrap_or_default())
    }
}

/// JSON Web Token authentication parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Jwt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Accepted audiences. The service name is accepted when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// An inline JSON Web Key Set. Only one of `jwksUri` and `jwks` should be
    /// set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jwt_headers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jwt_params: Vec<String>,

    /// JWT validation happens if any one of the rules matches. Empty always
    /// triggers validation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger_rules: Vec<TriggerRule>,
}

/// Satisfied when the request path matches none of `excludedPaths` and, if
/// `includedPaths` is not empty, at least one of `includedPaths`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_paths: Vec<StringMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_paths: Vec<StringMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OriginAuthenticationMethod {
    pub jwt: Jwt,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum PrincipalBinding {
    #[default]
    #[serde(rename = "USE_PEER")]
    UsePeer,
    #[serde(rename = "USE_ORIGIN")]
    UseOrigin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespace_mtls_policy() {
        let policy: Policy = serde_yaml::from_str(
            r#"
apiVersion: authentication.istio.io/v1alpha1
kind: Policy
metadata:
  name: default
  namespace: frod
spec:
  peers:
  - mtls:
"#,
        )
        .expect("policy must parse");
        assert!(policy.spec.targets.is_empty());
        assert_eq!(
            policy.spec.peers,
            vec![PeerAuthenticationMethod::Mtls(MutualTls::default())]
        );
        assert_eq!(policy.spec.principal_binding, None);
    }

    #[test]
    fn parses_origin_jwt_policy() {
        let policy: Policy = serde_yaml::from_str(
            r#"
apiVersion: authentication.istio.io/v1alpha1
kind: Policy
metadata:
  name: productpage-mTLS-with-JWT
  namespace: frod
spec:
  targets:
  - name: productpage
    ports:
    - number: 9000
  peers:
  - mtls:
      mode: PERMISSIVE
  origins:
  - jwt:
      issuer: "https://securetoken.google.com"
      audiences:
      - "productpage"
      jwksUri: "https://www.googleapis.com/oauth2/v1/certs"
      jwtHeaders:
      - "x-goog-iap-jwt-assertion"
      triggerRules:
      - excludedPaths:
        - exact: /health_check
  principalBinding: USE_ORIGIN
"#,
        )
        .expect("policy must parse");

        let spec = policy.spec;
        assert_eq!(
            spec.targets,
            vec![TargetSelector {
                name: "productpage".to_string(),
                ports: vec![PortSelector::Number(9000)],
            }]
        );
        assert_eq!(
            spec.peers,
            vec![PeerAuthenticationMethod::Mtls(MutualTls {
                allow_tls: false,
                mode: Some(MtlsMode::Permissive),
            })]
        );
        assert_eq!(spec.principal_binding, Some(PrincipalBinding::UseOrigin));

        let jwt = &spec.origins[0].jwt;
        assert_eq!(jwt.issuer.as_deref(), Some("https://securetoken.google.com"));
        assert_eq!(
            jwt.jwks_uri.as_deref(),
            Some("https://www.googleapis.com/oauth2/v1/certs")
        );
        assert_eq!(jwt.jwt_headers, vec!["x-goog-iap-jwt-assertion"]);
        assert_eq!(
            jwt.trigger_rules,
            vec![TriggerRule {
                excluded_paths: vec![StringMatch::Exact("/health_check".to_string())],
                included_paths: vec![],
            }]
        );
    }

    #[test]
    fn null_and_empty_mtls_are_defaults() {
        for json in [r#"{"mtls": null}"#, r#"{"mtls": {}}"#] {
            let peer: PeerAuthenticationMethod = serde_json::from_str(json).unwrap();
            assert_eq!(peer, PeerAuthenticationMethod::Mtls(MutualTls::default()));
        }

        let peer: PeerAuthenticationMethod =
            serde_json::from_str(r#"{"mtls": {"allowTls": true}}"#).unwrap();
        assert_eq!(
            peer,
            PeerAuthenticationMethod::Mtls(MutualTls {
                allow_tls: true,
                mode: None,
            })
        );
    }

    #[test]
    fn peer_method_is_exactly_one_of() {
        let err = serde_json::from_str::<PeerAuthenticationMethod>(
            r#"{"mtls": {}, "jwt": {"issuer": "x"}}"#,
        );
        assert!(err.is_err());

        let jwt: PeerAuthenticationMethod =
            serde_json::from_str(r#"{"jwt": {"issuer": "x"}}"#).unwrap();
        assert!(matches!(jwt, PeerAuthenticationMethod::Jwt(Jwt { issuer: Some(_), .. })));
    }
}
