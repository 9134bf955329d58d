//! Cluster services fronting service steps.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::backend::types::Step;
use crate::backend::BackendError;

use super::pod::{dns_name, protocol, SERVICE_LABEL};

/// Service name of a service step.
///
/// # Errors
///
/// Returns [`BackendError::InvalidName`] when the step name cannot form one.
pub fn service_name(step: &Step) -> Result<String, BackendError> {
    dns_name("service", &step.name)
}

/// `ClusterIP` service selecting the pod of `step`.
///
/// # Errors
///
/// Returns [`BackendError::ServiceWithoutPorts`] when the step exposes no
/// ports, or [`BackendError::InvalidName`] for an unusable step name.
pub fn build_service(step: &Step, namespace: &str) -> Result<Service, BackendError> {
    let name = service_name(step)?;
    if step.ports.is_empty() {
        return Err(BackendError::ServiceWithoutPorts(name));
    }

    let ports = step
        .ports
        .iter()
        .map(|port| {
            let number = i32::from(port.number);
            ServicePort {
                name: Some(format!("port-{number}")),
                port: number,
                target_port: Some(IntOrString::Int(number)),
                protocol: Some(protocol(&port.protocol)),
                ..ServicePort::default()
            }
        })
        .collect();

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_owned()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_owned()),
            selector: Some(BTreeMap::from([(
                SERVICE_LABEL.to_owned(),
                step.name.clone(),
            )])),
            ports: Some(ports),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}
