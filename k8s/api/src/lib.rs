#![forbid(unsafe_code)]

pub mod authentication;
pub mod common;
pub mod networking;

pub use self::{
    authentication::{Policy, PolicySpec},
    common::StringMatch,
    networking::{Gateway, GatewaySpec},
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::ResourceExt;

/// Checks whether an `apiVersion`/`kind` pair, as found in a manifest,
/// describes the given resource type.
pub fn is_kind<T>(api_version: &str, kind: &str) -> bool
where
    T: kube::Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    api_version.eq_ignore_ascii_case(&T::api_version(&dt))
        && kind.eq_ignore_ascii_case(&T::kind(&dt))
}

/// Returns the resource kind, qualified by its group, if necessary.
pub fn canonical_kind<T>() -> String
where
    T: kube::Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    let group = T::group(&dt);
    if group.is_empty() {
        T::kind(&dt).to_string()
    } else {
        format!("{}.{}", T::kind(&dt), group)
    }
}
