//! SDS secrets.

use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, CertificateValidationContext, Secret, TlsCertificate,
};

use crate::dag::{Secret as DagSecret, SecretData};

fn inline_bytes(bytes: &[u8]) -> Option<DataSource> {
    Some(DataSource { specifier: Some(Specifier::InlineBytes(bytes.to_vec())), ..Default::default() })
}

/// Build the SDS resource for a graph secret. The resource name is the
/// content-addressed secret name, so a rotated certificate is a new resource.
pub fn build_secret(secret: &DagSecret) -> Secret {
    let r#type = match &secret.data {
        SecretData::Tls { cert_chain, private_key } => secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: inline_bytes(cert_chain),
            private_key: inline_bytes(private_key),
            ..Default::default()
        }),
        SecretData::Ca { ca } => secret::Type::ValidationContext(CertificateValidationContext {
            trusted_ca: inline_bytes(ca),
            ..Default::default()
        }),
    };
    Secret { name: secret.name.clone(), r#type: Some(r#type) }
}
