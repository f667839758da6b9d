use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WhaleError};
use crate::run::NAME_SUFFIX_LEN;

/// Longest base name that still fits a DNS-1035 label once the run suffix
/// and the Service suffix are appended.
pub const MAX_NAME_LEN: usize = 63 - (NAME_SUFFIX_LEN + 1) - 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = WhaleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "clusterip" => Ok(ServiceType::ClusterIP),
            "nodeport" => Ok(ServiceType::NodePort),
            "loadbalancer" => Ok(ServiceType::LoadBalancer),
            _ => Err(WhaleError::validation(format!(
                "unsupported service type '{}', expected ClusterIP, NodePort or LoadBalancer",
                s
            ))),
        }
    }
}

/// What to run. Handed to the controller by value and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub replicas: i32,
    pub container_port: i32,
    /// Port exposed by the Service; the container port when unset.
    #[serde(default)]
    pub service_port: Option<i32>,
    #[serde(default)]
    pub service_type: ServiceType,
    /// Extra labels applied to the Deployment, its pods and the Service.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl WorkloadSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        WorkloadSpec {
            name: name.into(),
            image: image.into(),
            replicas: 1,
            container_port: 80,
            service_port: None,
            service_type: ServiceType::ClusterIP,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_container_port(mut self, port: i32) -> Self {
        self.container_port = port;
        self
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn service_port(&self) -> i32 {
        self.service_port.unwrap_or(self.container_port)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.image.trim().is_empty() {
            return Err(WhaleError::validation("image must not be empty"));
        }
        if self.image.chars().any(char::is_whitespace) {
            return Err(WhaleError::validation(format!(
                "image '{}' must not contain whitespace",
                self.image
            )));
        }
        if self.replicas < 1 {
            return Err(WhaleError::validation(format!(
                "replicas must be at least 1, got {}",
                self.replicas
            )));
        }
        validate_port("containerPort", self.container_port)?;
        if let Some(port) = self.service_port {
            validate_port("servicePort", port)?;
        }
        for key in self.labels.keys() {
            if key.starts_with("whale.dev/") || key == crate::LABEL_MANAGED_BY {
                return Err(WhaleError::validation(format!(
                    "label '{}' is reserved",
                    key
                )));
            }
        }
        Ok(())
    }
}

fn validate_port(field: &str, port: i32) -> Result<()> {
    if !(1..=65535).contains(&port) {
        return Err(WhaleError::validation(format!(
            "{} must be in 1..=65535, got {}",
            field, port
        )));
    }
    Ok(())
}

// DNS-1035 label: lowercase alphanumerics and '-', starting with a letter.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(WhaleError::validation("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WhaleError::validation(format!(
            "name '{}' is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let starts_ok = name.starts_with(|c: char| c.is_ascii_lowercase());
    let ends_ok = !name.ends_with('-');
    if !(valid_chars && starts_ok && ends_ok) {
        return Err(WhaleError::validation(format!(
            "name '{}' must be a DNS-1035 label (lowercase letters, digits and '-', starting with a letter)",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> WorkloadSpec {
        WorkloadSpec::new("hello-whale", "docker/whalesay:latest")
            .with_replicas(3)
            .with_container_port(8080)
    }

    #[test]
    fn accepts_a_reasonable_spec() {
        assert!(valid().validate().is_ok());
        assert!(valid().with_service_type(ServiceType::NodePort).validate().is_ok());
        assert_eq!(valid().service_port(), 8080);
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "Hello", "1whale", "whale-", "whale_blue", &"w".repeat(MAX_NAME_LEN + 1)] {
            let mut spec = valid();
            spec.name = name.to_string();
            let err = spec.validate().unwrap_err();
            assert!(matches!(err, WhaleError::Validation(_)), "{name:?}");
        }
        let mut spec = valid();
        spec.name = "w".repeat(MAX_NAME_LEN);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_zero_replicas_and_bad_ports() {
        assert!(valid().with_replicas(0).validate().is_err());
        assert!(valid().with_container_port(0).validate().is_err());
        assert!(valid().with_container_port(65536).validate().is_err());

        let mut spec = valid();
        spec.service_port = Some(-1);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_empty_image_and_reserved_labels() {
        let mut spec = valid();
        spec.image = "  ".into();
        assert!(spec.validate().is_err());

        let mut spec = valid();
        spec.labels.insert("whale.dev/run-id".into(), "x".into());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn service_type_parses_case_insensitively() {
        assert_eq!("nodeport".parse::<ServiceType>().unwrap(), ServiceType::NodePort);
        assert_eq!("LoadBalancer".parse::<ServiceType>().unwrap(), ServiceType::LoadBalancer);
        assert!("ExternalName".parse::<ServiceType>().is_err());
    }
}
