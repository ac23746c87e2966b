pub mod policy;

pub use self::policy::{
    Jwt, MtlsMode, MutualTls, OriginAuthenticationMethod, PeerAuthenticationMethod, Policy,
    PolicySpec, PortSelector, PrincipalBinding, TargetSelector, TriggerRule,
};
