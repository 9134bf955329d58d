//! Workflow volumes backed by persistent volume claims.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::backend::BackendError;

use super::config::BackendConfig;
use super::pod::dns_name;

/// Claim name of a workflow volume.
///
/// # Errors
///
/// Returns [`BackendError::InvalidName`] when the volume name cannot form one.
pub fn volume_name(name: &str) -> Result<String, BackendError> {
    dns_name("volume", name)
}

/// Persistent volume claim for the workflow volume `name`.
///
/// # Errors
///
/// Returns [`BackendError::InvalidName`] for an unusable volume name.
pub fn build_volume(name: &str, config: &BackendConfig) -> Result<PersistentVolumeClaim, BackendError> {
    let claim = volume_name(name)?;
    let access_mode = if config.storage_rwx {
        "ReadWriteMany"
    } else {
        "ReadWriteOnce"
    };
    let storage_class_name =
        (!config.storage_class.is_empty()).then(|| config.storage_class.clone());

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim),
            namespace: Some(config.namespace.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode.to_owned()]),
            storage_class_name,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_owned(),
                    Quantity(config.volume_size.clone()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    })
}
