use crate::{
    trigger::TriggerRules,
    validation::{ConfigError, Validated},
};
use anyhow::{anyhow, Result};
use istio_config_k8s_api::{
    authentication::{self as api, MtlsMode, PrincipalBinding},
    ResourceExt,
};
use std::num::NonZeroU16;

/// A validated authentication `Policy`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub namespace: String,
    pub name: String,

    /// Empty selects every workload in the namespace.
    pub targets: Vec<Target>,
    pub peers: Vec<PeerMethod>,
    pub peer_is_optional: bool,
    pub origins: Vec<Jwt>,
    pub origin_is_optional: bool,
    pub principal_binding: PrincipalBinding,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub service: String,

    /// Empty selects every port.
    pub ports: Vec<PortRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PortRef {
    Number(NonZeroU16),
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMethod {
    Mtls(MtlsMode),
    Jwt(Jwt),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Jwt {
    pub issuer: Option<String>,
    pub audiences: Vec<String>,
    pub jwks: Option<JwksSource>,
    pub headers: Vec<String>,
    pub params: Vec<String>,
    pub trigger_rules: TriggerRules,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JwksSource {
    Uri(String),
    Inline(String),
}

// === impl Policy ===

impl Policy {
    /// Converts a `Policy` resource, collecting configuration errors.
    ///
    /// Malformed trigger rule patterns never match, so JWT validation is
    /// never skipped because of them.
    pub fn from_resource(policy: api::Policy) -> Result<Validated<Self>> {
        let namespace = policy
            .namespace()
            .ok_or_else(|| anyhow!("Policy must be namespaced"))?;
        let name = policy
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow!("Policy must have a name"))?;
        let api::PolicySpec {
            targets,
            peers,
            peer_is_optional,
            origins,
            origin_is_optional,
            principal_binding,
        } = policy.spec;

        let mut errors = Vec::new();
        let targets = targets
            .into_iter()
            .filter_map(|t| Target::from_api(t, &mut errors))
            .collect();
        let peers = peers
            .into_iter()
            .map(|peer| match peer {
                api::PeerAuthenticationMethod::Mtls(mtls) => PeerMethod::Mtls(mtls_mode(mtls)),
                api::PeerAuthenticationMethod::Jwt(jwt) => {
                    PeerMethod::Jwt(Jwt::from_api(jwt, &mut errors))
                }
            })
            .collect();
        let origins = origins
            .into_iter()
            .map(|api::OriginAuthenticationMethod { jwt }| Jwt::from_api(jwt, &mut errors))
            .collect();

        let policy = Self {
            namespace,
            name,
            targets,
            peers,
            peer_is_optional,
            origins,
            origin_is_optional,
            principal_binding: principal_binding.unwrap_or_default(),
        };
        Ok(Validated::new(policy, errors))
    }

    /// Checks whether this policy applies to the given service port.
    pub fn selects(&self, service: &str, port: u16, port_name: Option<&str>) -> bool {
        self.targets.is_empty()
            || self
                .targets
                .iter()
                .any(|t| t.selects(service, port, port_name))
    }

    /// Returns the origin methods whose trigger rules fire for `path`, in
    /// declaration order.
    pub fn triggered_origins<'p>(&'p self, path: &'p str) -> impl Iterator<Item = &'p Jwt> + 'p {
        self.origins
            .iter()
            .filter(move |jwt| jwt.trigger_rules.should_validate(path))
    }

    /// Checks whether a request to `path` must present a valid origin JWT.
    ///
    /// When every origin method is skipped, origin authentication is ignored
    /// as though it were not configured.
    pub fn origin_required(&self, path: &str) -> bool {
        !self.origin_is_optional && self.triggered_origins(path).next().is_some()
    }

    pub fn peer_required(&self) -> bool {
        !self.peers.is_empty() && !self.peer_is_optional
    }
}

// === impl Target ===

impl Target {
    pub fn selects(&self, service: &str, port: u16, port_name: Option<&str>) -> bool {
        if self.service != service {
            return false;
        }
        self.ports.is_empty()
            || self.ports.iter().any(|p| match p {
                PortRef::Number(n) => n.get() == port,
                PortRef::Name(name) => Some(name.as_str()) == port_name,
            })
    }

    fn from_api(
        api::TargetSelector { name, ports }: api::TargetSelector,
        errors: &mut Vec<ConfigError>,
    ) -> Option<Self> {
        if name.is_empty() {
            errors.push(ConfigError::EmptyTargetName);
            return None;
        }

        let ports = ports
            .into_iter()
            .filter_map(|port| match port {
                api::PortSelector::Name(name) => Some(PortRef::Name(name)),
                api::PortSelector::Number(n) => {
                    match u16::try_from(n).ok().and_then(NonZeroU16::new) {
                        Some(n) => Some(PortRef::Number(n)),
                        None => {
                            errors.push(ConfigError::InvalidPort(n));
                            None
                        }
                    }
                }
            })
            .collect();

        Some(Self {
            service: name,
            ports,
        })
    }
}

// === impl Jwt ===

impl Jwt {
    fn from_api(jwt: api::Jwt, errors: &mut Vec<ConfigError>) -> Self {
        let api::Jwt {
            issuer,
            audiences,
            jwks_uri,
            jwks,
            jwt_headers,
            jwt_params,
            trigger_rules,
        } = jwt;

        let jwks = match (jwks_uri, jwks) {
            (Some(uri), Some(_)) => {
                errors.push(ConfigError::JwksConflict);
                Some(JwksSource::Uri(uri))
            }
            (Some(uri), None) => Some(JwksSource::Uri(uri)),
            (None, Some(inline)) => Some(JwksSource::Inline(inline)),
            (None, None) => None,
        };

        let (trigger_rules, invalid) = TriggerRules::compile(trigger_rules);
        errors.extend(invalid.into_iter().map(ConfigError::from));

        Self {
            issuer,
            audiences,
            jwks,
            headers: jwt_headers,
            params: jwt_params,
            trigger_rules,
        }
    }
}

/// The deprecated `allowTls` flag means `PERMISSIVE` unless a mode is set.
fn mtls_mode(mtls: api::MutualTls) -> MtlsMode {
    match mtls.mode {
        Some(mode) => mode,
        None if mtls.allow_tls => MtlsMode::Permissive,
        None => MtlsMode::Strict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(yaml: &str) -> Validated<Policy> {
        let p: api::Policy = serde_yaml::from_str(yaml).expect("policy must parse");
        Policy::from_resource(p).expect("policy must convert")
    }

    const PRODUCTPAGE: &str = r#"
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
"#;

    #[test]
    fn converts_productpage_policy() {
        let Validated { value: p, errors } = policy(PRODUCTPAGE);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(p.namespace, "frod");
        assert_eq!(p.peers, vec![PeerMethod::Mtls(MtlsMode::Strict)]);
        assert_eq!(p.principal_binding, PrincipalBinding::UseOrigin);
        assert_eq!(
            p.origins[0].jwks,
            Some(JwksSource::Uri(
                "https://www.googleapis.com/oauth2/v1/certs".to_string()
            ))
        );
        assert_eq!(p.origins[0].headers, vec!["x-goog-iap-jwt-assertion"]);
    }

    #[test]
    fn selects_targets() {
        let p = policy(PRODUCTPAGE).value;
        assert!(p.selects("productpage", 9000, None));
        assert!(!p.selects("productpage", 8000, None));
        assert!(!p.selects("reviews", 9000, None));

        let all = policy(
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
        .value;
        assert!(all.selects("anything", 1234, Some("http")));
        assert!(all.peer_required());
        assert!(!all.origin_required("/"));
    }

    #[test]
    fn selects_named_ports() {
        let Validated { value: p, errors } = policy(
            r#"
apiVersion: authentication.istio.io/v1alpha1
kind: Policy
metadata:
  name: named
  namespace: frod
spec:
  targets:
  - name: reviews
    ports:
    - name: http
    - number: 0
  - name: ""
"#,
        );
        assert!(matches!(
            errors.as_slice(),
            [ConfigError::InvalidPort(0), ConfigError::EmptyTargetName]
        ));
        assert_eq!(p.targets.len(), 1);
        assert!(p.selects("reviews", 9080, Some("http")));
        assert!(!p.selects("reviews", 9080, Some("grpc")));
        assert!(!p.selects("reviews", 9080, None));
    }

    #[test]
    fn origin_triggering() {
        let p = policy(PRODUCTPAGE).value;
        assert!(!p.origin_required("/health_check"));
        assert!(p.origin_required("/productpage"));
        assert_eq!(p.triggered_origins("/productpage").count(), 1);
        assert_eq!(p.triggered_origins("/health_check").count(), 0);
    }

    #[test]
    fn optional_origins_are_never_required() {
        let p = policy(
            r#"
apiVersion: authentication.istio.io/v1alpha1
kind: Policy
metadata:
  name: optional
  namespace: frod
spec:
  origins:
  - jwt:
      issuer: https://example.com
  originIsOptional: true
"#,
        )
        .value;
        assert_eq!(p.triggered_origins("/").count(), 1);
        assert!(!p.origin_required("/"));
    }

    #[test]
    fn status_prefix_policy() {
        let p = policy(
            r#"
apiVersion: authentication.istio.io/v1alpha1
kind: Policy
metadata:
  name: status
  namespace: frod
spec:
  origins:
  - jwt:
      issuer: https://example.com
      jwksUri: https://example.com/.well-known/jwks.json
      triggerRules:
      - excludedPaths:
        - exact: /status/version
        includedPaths:
        - prefix: /status/
"#,
        )
        .value;
        assert!(!p.origin_required("/status/version"));
        assert!(p.origin_required("/status/health"));
        assert!(!p.origin_required("/other"));
    }

    #[test]
    fn malformed_exclusion_still_requires_jwt() {
        let Validated { value: p, errors } = policy(
            r#"
apiVersion: authentication.istio.io/v1alpha1
kind: Policy
metadata:
  name: broken
  namespace: frod
spec:
  origins:
  - jwt:
      issuer: https://example.com
      triggerRules:
      - excludedPaths:
        - regex: "/health_check("
"#,
        );
        assert!(matches!(
            errors.as_slice(),
            [ConfigError::InvalidRegexPattern(_)]
        ));
        assert!(p.origin_required("/health_check("));
        assert!(p.origin_required("/health_check"));
    }

    #[test]
    fn jwks_sources() {
        let Validated { value: p, errors } = policy(
            r#"
apiVersion: authentication.istio.io/v1alpha1
kind: Policy
metadata:
  name: jwks
  namespace: frod
spec:
  origins:
  - jwt:
      jwks: '{"keys": []}'
  - jwt:
      jwksUri: https://example.com/jwks.json
      jwks: '{"keys": []}'
"#,
        );
        assert!(matches!(errors.as_slice(), [ConfigError::JwksConflict]));
        assert_eq!(
            p.origins[0].jwks,
            Some(JwksSource::Inline(r#"{"keys": []}"#.to_string()))
        );
        assert_eq!(
            p.origins[1].jwks,
            Some(JwksSource::Uri("https://example.com/jwks.json".to_string()))
        );
    }

    #[test]
    fn legacy_allow_tls_is_permissive() {
        assert_eq!(
            mtls_mode(api::MutualTls {
                allow_tls: true,
                mode: None,
            }),
            MtlsMode::Permissive
        );
        assert_eq!(
            mtls_mode(api::MutualTls {
                allow_tls: true,
                mode: Some(MtlsMode::Strict),
            }),
            MtlsMode::Strict
        );
        assert_eq!(mtls_mode(api::MutualTls::default()), MtlsMode::Strict);
    }
}
