//! Kubernetes side of whale: the kube-rs [`whale_core::ClusterApi`]
//! implementation, object builders and descriptor loading.

pub mod client;
pub mod descriptor;
pub mod error;
pub mod kube_cluster;
pub mod manifest;

pub use client::create_client;
pub use kube_cluster::KubeCluster;
