use crate::{
    host::HostSpecifier,
    validation::{ConfigError, Validated},
};
use anyhow::{anyhow, Result};
use istio_config_k8s_api::{
    networking::{self as api, PortProtocol, TlsMode, TlsOptions, TlsProtocol},
    ResourceExt,
};
use std::{collections::BTreeMap, num::NonZeroU16};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gateway {
    pub namespace: String,
    pub name: String,
    pub selector: BTreeMap<String, String>,
    pub servers: Vec<Server>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Server {
    pub port: Port,

    /// Malformed hosts are omitted, so they bind nothing.
    pub hosts: Vec<HostSpecifier>,
    pub tls: Option<TlsOptions>,
    pub default_endpoint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub number: NonZeroU16,
    pub protocol: PortProtocol,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTls {
    #[error("{0} servers must set TLS options")]
    Missing(PortProtocol),

    #[error("{0} mode requires serverCertificate or credentialName")]
    MissingServerCertificate(TlsMode),

    #[error("{0} mode requires privateKey or credentialName")]
    MissingPrivateKey(TlsMode),

    #[error("MUTUAL mode requires caCertificates or credentialName")]
    MissingCaCertificates,

    #[error("ISTIO_MUTUAL mode must not set certificates, keys or a credentialName")]
    IstioMutualWithCredentials,

    #[error("minProtocolVersion {min:?} is newer than maxProtocolVersion {max:?}")]
    ProtocolVersionRange { min: TlsProtocol, max: TlsProtocol },
}

// === impl Gateway ===

impl Gateway {
    /// Converts a `Gateway` resource, collecting configuration errors.
    ///
    /// Fails only if the resource lacks a name or namespace.
    pub fn from_resource(gw: api::Gateway) -> Result<Validated<Self>> {
        let namespace = gw
            .namespace()
            .ok_or_else(|| anyhow!("Gateway must be namespaced"))?;
        let name = gw
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow!("Gateway must have a name"))?;

        let mut errors = Vec::new();
        if gw.spec.servers.is_empty() {
            errors.push(ConfigError::NoServers);
        }
        let servers = gw
            .spec
            .servers
            .into_iter()
            .filter_map(|srv| Server::from_api(srv, &mut errors))
            .collect();

        let gateway = Self {
            namespace,
            name,
            selector: gw.spec.selector,
            servers,
        };
        Ok(Validated::new(gateway, errors))
    }

    /// Returns the servers to which a virtual service host in `candidate_ns`
    /// may bind.
    pub fn servers_for<'a>(
        &'a self,
        candidate_ns: &'a str,
        host: &'a str,
    ) -> impl Iterator<Item = &'a Server> + 'a {
        self.servers
            .iter()
            .filter(move |srv| srv.accepts(&self.namespace, candidate_ns, host))
    }
}

// === impl Server ===

impl Server {
    /// `gateway_ns` is the namespace of the gateway declaring this server.
    pub fn accepts(&self, gateway_ns: &str, candidate_ns: &str, host: &str) -> bool {
        self.hosts
            .iter()
            .any(|h| h.matches(gateway_ns, candidate_ns, host))
    }

    fn from_api(
        api::Server {
            port,
            hosts,
            tls,
            default_endpoint,
        }: api::Server,
        errors: &mut Vec<ConfigError>,
    ) -> Option<Self> {
        let number = match u16::try_from(port.number).ok().and_then(NonZeroU16::new) {
            Some(number) => number,
            None => {
                errors.push(ConfigError::InvalidPort(port.number));
                return None;
            }
        };

        if hosts.is_empty() {
            errors.push(ConfigError::NoHosts { port: number });
        }
        let hosts = hosts
            .into_iter()
            .filter_map(|host| match host.parse::<HostSpecifier>() {
                Ok(spec) => Some(spec),
                Err(source) => {
                    errors.push(ConfigError::MalformedHost { host, source });
                    None
                }
            })
            .collect();

        errors.extend(
            validate_tls(port.protocol, tls.as_ref())
                .into_iter()
                .map(|source| ConfigError::InvalidTls {
                    port: number,
                    source,
                }),
        );

        Some(Self {
            port: Port {
                number,
                protocol: port.protocol,
                name: port.name,
            },
            hosts,
            tls,
            default_endpoint,
        })
    }
}

fn validate_tls(protocol: PortProtocol, tls: Option<&TlsOptions>) -> Vec<InvalidTls> {
    let tls = match tls {
        Some(tls) => tls,
        None if matches!(protocol, PortProtocol::Https | PortProtocol::Tls) => {
            return vec![InvalidTls::Missing(protocol)]
        }
        None => return vec![],
    };

    let mut errors = Vec::new();
    let has_credential = tls.credential_name.is_some();
    match tls.mode {
        Some(mode @ (TlsMode::Simple | TlsMode::Mutual)) if !has_credential => {
            if tls.server_certificate.is_none() {
                errors.push(InvalidTls::MissingServerCertificate(mode));
            }
            if tls.private_key.is_none() {
                errors.push(InvalidTls::MissingPrivateKey(mode));
            }
            if mode == TlsMode::Mutual && tls.ca_certificates.is_none() {
                errors.push(InvalidTls::MissingCaCertificates);
            }
        }
        Some(TlsMode::IstioMutual) => {
            if has_credential
                || tls.server_certificate.is_some()
                || tls.private_key.is_some()
                || tls.ca_certificates.is_some()
            {
                errors.push(InvalidTls::IstioMutualWithCredentials);
            }
        }
        _ => {}
    }

    if let (Some(min), Some(max)) = (tls.min_protocol_version, tls.max_protocol_version) {
        if min != TlsProtocol::Auto && max != TlsProtocol::Auto && min > max {
            errors.push(InvalidTls::ProtocolVersionRange { min, max });
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(yaml: &str) -> Validated<Gateway> {
        let gw: api::Gateway = serde_yaml::from_str(yaml).expect("gateway must parse");
        Gateway::from_resource(gw).expect("gateway must convert")
    }

    const MULTI_NS: &str = r#"
apiVersion: networking.istio.io/v1alpha3
kind: Gateway
metadata:
  name: my-gateway
  namespace: some-config-namespace
spec:
  selector:
    app: my-gateway-controller
  servers:
  - port:
      number: 80
      name: http
      protocol: HTTP
    hosts:
    - "ns1/*"
    - "ns2/foo.bar.com"
  - port:
      number: 443
      name: https
      protocol: HTTPS
    hosts:
    - "./*.bookinfo.com"
    tls:
      mode: SIMPLE
      credentialName: bookinfo-secret
"#;

    #[test]
    fn converts_valid_gateway() {
        let Validated { value: gw, errors } = gateway(MULTI_NS);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(gw.namespace, "some-config-namespace");
        assert_eq!(gw.name, "my-gateway");
        assert_eq!(gw.servers.len(), 2);
        assert_eq!(gw.servers[0].port.number.get(), 80);
        assert_eq!(gw.servers[0].hosts.len(), 2);
    }

    #[test]
    fn binds_by_namespace_and_host() {
        let gw = gateway(MULTI_NS).value;
        let ports = |ns: &str, host: &str| {
            gw.servers_for(ns, host)
                .map(|srv| srv.port.number.get())
                .collect::<Vec<_>>()
        };

        assert_eq!(ports("ns1", "anything.example.com"), vec![80]);
        assert_eq!(ports("ns2", "foo.bar.com"), vec![80]);
        assert_eq!(ports("ns2", "baz.bar.com"), Vec::<u16>::new());
        assert_eq!(ports("ns3", "foo.bar.com"), Vec::<u16>::new());

        assert_eq!(ports("some-config-namespace", "uk.bookinfo.com"), vec![443]);
        assert_eq!(ports("some-config-namespace", "bookinfo.com"), Vec::<u16>::new());
        assert_eq!(ports("ns1", "uk.bookinfo.com"), vec![80]);
    }

    #[test]
    fn drops_malformed_hosts() {
        let Validated { value: gw, errors } = gateway(
            r#"
apiVersion: networking.istio.io/v1alpha3
kind: Gateway
metadata:
  name: gw
  namespace: ns
spec:
  servers:
  - port:
      number: 80
      protocol: HTTP
    hosts:
    - "foo.*.com"
    - "ok.example.com"
"#,
        );
        assert!(matches!(
            errors.as_slice(),
            [ConfigError::MalformedHost { host, .. }] if host == "foo.*.com"
        ));
        assert_eq!(gw.servers[0].hosts.len(), 1);
        assert!(gw.servers[0].accepts("ns", "ns", "ok.example.com"));
        assert!(!gw.servers[0].accepts("ns", "ns", "foo.x.com"));
    }

    #[test]
    fn rejects_bad_ports_and_missing_hosts() {
        let Validated { value: gw, errors } = gateway(
            r#"
apiVersion: networking.istio.io/v1alpha3
kind: Gateway
metadata:
  name: gw
  namespace: ns
spec:
  servers:
  - port:
      number: 70000
      protocol: HTTP
    hosts: ["*"]
  - port:
      number: 8080
      protocol: HTTP
"#,
        );
        assert_eq!(gw.servers.len(), 1);
        assert!(matches!(
            errors.as_slice(),
            [ConfigError::InvalidPort(70000), ConfigError::NoHosts { port }] if port.get() == 8080
        ));
    }

    #[test]
    fn rejects_empty_servers() {
        let Validated { errors, .. } = gateway(
            r#"
apiVersion: networking.istio.io/v1alpha3
kind: Gateway
metadata:
  name: gw
  namespace: ns
spec:
  servers: []
"#,
        );
        assert!(matches!(errors.as_slice(), [ConfigError::NoServers]));
    }

    #[test]
    fn requires_namespace() {
        let gw: api::Gateway = serde_yaml::from_str(
            r#"
apiVersion: networking.istio.io/v1alpha3
kind: Gateway
metadata:
  name: gw
spec:
  servers: []
"#,
        )
        .unwrap();
        assert!(Gateway::from_resource(gw).is_err());
    }

    #[test]
    fn validates_tls_modes() {
        let tls = |yaml: &str| -> TlsOptions { serde_yaml::from_str(yaml).unwrap() };

        assert_eq!(
            validate_tls(PortProtocol::Https, None),
            vec![InvalidTls::Missing(PortProtocol::Https)]
        );
        assert_eq!(validate_tls(PortProtocol::Http, None), vec![]);

        assert_eq!(
            validate_tls(PortProtocol::Https, Some(&tls("mode: MUTUAL"))),
            vec![
                InvalidTls::MissingServerCertificate(TlsMode::Mutual),
                InvalidTls::MissingPrivateKey(TlsMode::Mutual),
                InvalidTls::MissingCaCertificates,
            ]
        );
        assert_eq!(
            validate_tls(
                PortProtocol::Https,
                Some(&tls("{mode: MUTUAL, credentialName: creds}"))
            ),
            vec![]
        );
        assert_eq!(
            validate_tls(
                PortProtocol::Https,
                Some(&tls(
                    "{mode: SIMPLE, serverCertificate: /c.pem, privateKey: /k.pem}"
                ))
            ),
            vec![]
        );
        assert_eq!(
            validate_tls(
                PortProtocol::Https,
                Some(&tls("{mode: ISTIO_MUTUAL, credentialName: creds}"))
            ),
            vec![InvalidTls::IstioMutualWithCredentials]
        );
        assert_eq!(
            validate_tls(PortProtocol::Tls, Some(&tls("mode: PASSTHROUGH"))),
            vec![]
        );
        assert_eq!(
            validate_tls(
                PortProtocol::Https,
                Some(&tls(
                    "{mode: ISTIO_MUTUAL, minProtocolVersion: TLSV1_3, maxProtocolVersion: TLSV1_2}"
                ))
            ),
            vec![InvalidTls::ProtocolVersionRange {
                min: TlsProtocol::V1_3,
                max: TlsProtocol::V1_2,
            }]
        );
    }

    #[test]
    fn mutual_without_ca_is_reported_per_server() {
        let Validated { errors, .. } = gateway(
            r#"
apiVersion: networking.istio.io/v1alpha3
kind: Gateway
metadata:
  name: gw
  namespace: ns
spec:
  servers:
  - port:
      number: 443
      protocol: HTTPS
    hosts: ["*"]
    tls:
      mode: MUTUAL
      serverCertificate: /etc/certs/server.pem
      privateKey: /etc/certs/key.pem
"#,
        );
        assert!(matches!(
            errors.as_slice(),
            [ConfigError::InvalidTls {
                source: InvalidTls::MissingCaCertificates,
                ..
            }]
        ));
    }
}
