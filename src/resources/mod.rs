//! # Source Resources
//!
//! The declarative objects the control plane watches. Each kind is a plain
//! serde model of the manifest fields gateplane reads; unknown fields are
//! ignored so full manifests load as-is.

pub mod core;
pub mod gateway;
pub mod httpproxy;
pub mod ingress;
pub mod meta;

pub use self::core::{Endpoints, Secret, Service, TlsCertificateDelegation, UpstreamProtocol};
pub use gateway::{Gateway, GatewayClass, HttpRoute, ReferenceGrant};
pub use httpproxy::HttpProxy;
pub use ingress::Ingress;
pub use meta::{Kind, NamespacedRef, ObjectKey, ObjectMeta, DEFAULT_NAMESPACE};

use serde::{Deserialize, Serialize};

/// Any object the store can hold, tagged by its `kind` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Resource {
    Ingress(Ingress),
    #[serde(rename = "HTTPProxy")]
    HttpProxy(HttpProxy),
    GatewayClass(GatewayClass),
    Gateway(Gateway),
    #[serde(rename = "HTTPRoute")]
    HttpRoute(HttpRoute),
    ReferenceGrant(ReferenceGrant),
    Service(Service),
    Endpoints(Endpoints),
    Secret(Secret),
    #[serde(rename = "TLSCertificateDelegation")]
    TlsCertificateDelegation(TlsCertificateDelegation),
}

impl Resource {
    pub fn kind(&self) -> Kind {
        match self {
            Resource::Ingress(_) => Kind::Ingress,
            Resource::HttpProxy(_) => Kind::HttpProxy,
            Resource::GatewayClass(_) => Kind::GatewayClass,
            Resource::Gateway(_) => Kind::Gateway,
            Resource::HttpRoute(_) => Kind::HttpRoute,
            Resource::ReferenceGrant(_) => Kind::ReferenceGrant,
            Resource::Service(_) => Kind::Service,
            Resource::Endpoints(_) => Kind::Endpoints,
            Resource::Secret(_) => Kind::Secret,
            Resource::TlsCertificateDelegation(_) => Kind::TlsCertificateDelegation,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Resource::Ingress(o) => &o.metadata,
            Resource::HttpProxy(o) => &o.metadata,
            Resource::GatewayClass(o) => &o.metadata,
            Resource::Gateway(o) => &o.metadata,
            Resource::HttpRoute(o) => &o.metadata,
            Resource::ReferenceGrant(o) => &o.metadata,
            Resource::Service(o) => &o.metadata,
            Resource::Endpoints(o) => &o.metadata,
            Resource::Secret(o) => &o.metadata,
            Resource::TlsCertificateDelegation(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Resource::Ingress(o) => &mut o.metadata,
            Resource::HttpProxy(o) => &mut o.metadata,
            Resource::GatewayClass(o) => &mut o.metadata,
            Resource::Gateway(o) => &mut o.metadata,
            Resource::HttpRoute(o) => &mut o.metadata,
            Resource::ReferenceGrant(o) => &mut o.metadata,
            Resource::Service(o) => &mut o.metadata,
            Resource::Endpoints(o) => &mut o.metadata,
            Resource::Secret(o) => &mut o.metadata,
            Resource::TlsCertificateDelegation(o) => &mut o.metadata,
        }
    }

    /// Identity of the object; cluster-scoped kinds use an empty namespace.
    pub fn key(&self) -> ObjectKey {
        let meta = self.meta();
        let namespace = match self.kind() {
            Kind::GatewayClass => String::new(),
            _ => meta.namespace().to_string(),
        };
        ObjectKey::new(self.kind(), namespace, meta.name.clone())
    }
}

macro_rules! impl_from_resource {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Resource {
                fn from(value: $ty) -> Self {
                    Resource::$variant(value)
                }
            }
        )*
    };
}

impl_from_resource!(
    Ingress => Ingress,
    HttpProxy => HttpProxy,
    GatewayClass => GatewayClass,
    Gateway => Gateway,
    HttpRoute => HttpRoute,
    ReferenceGrant => ReferenceGrant,
    Service => Service,
    Endpoints => Endpoints,
    Secret => Secret,
    TlsCertificateDelegation => TlsCertificateDelegation,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_deserializes_by_kind() {
        let yaml = r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: echo
  namespace: web
spec:
  virtualhost:
    fqdn: echo.example.com
  routes:
  - conditions:
    - prefix: /api
    - header:
        name: Target-Present
        present: true
    services:
    - name: echo
      port: 80
"#;
        let resource: Resource = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(resource.kind(), Kind::HttpProxy);
        assert_eq!(resource.key(), ObjectKey::new(Kind::HttpProxy, "web", "echo"));
        let Resource::HttpProxy(proxy) = resource else { panic!("wrong variant") };
        assert!(proxy.is_root());
        let route = &proxy.spec.routes[0];
        assert_eq!(route.conditions[0].prefix.as_deref(), Some("/api"));
        assert!(route.conditions[1].header.as_ref().unwrap().present);
    }

    #[test]
    fn test_missing_namespace_defaults() {
        let yaml = "kind: Service\nmetadata:\n  name: kuard\nspec:\n  ports:\n  - port: 80\n";
        let resource: Resource = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(resource.key(), ObjectKey::new(Kind::Service, "default", "kuard"));
    }

    #[test]
    fn test_gateway_class_is_cluster_scoped() {
        let yaml = "kind: GatewayClass\nmetadata:\n  name: gp\nspec:\n  controllerName: x\n";
        let resource: Resource = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(resource.key().namespace, "");
    }
}
