use async_trait::async_trait;
use fleet_controller_k8s_api::{ClusterClient, KubeClient};
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use sha2::{Digest, Sha256};
use std::fmt;

/// Builds a client bundle from a kubeconfig.
///
/// Implementations hold no per-cluster state and may be called concurrently.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Client: ClusterClient;

    async fn connect(&self, kubeconfig: &str) -> Result<Self::Client, ConnectError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("kubeconfig is empty")]
    EmptyKubeconfig,

    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("failed to build client: {0}")]
    Client(#[from] kube::Error),
}

/// Connects to real API servers.
#[derive(Clone, Debug, Default)]
pub struct KubeConnector(());

/// Identifies a kubeconfig without retaining its credentials.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConfigHash([u8; 32]);

// === impl KubeConnector ===

#[async_trait]
impl Connect for KubeConnector {
    type Client = KubeClient;

    async fn connect(&self, kubeconfig: &str) -> Result<KubeClient, ConnectError> {
        if kubeconfig.trim().is_empty() {
            return Err(ConnectError::EmptyKubeconfig);
        }
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = kube::Client::try_from(config.clone())?;
        Ok(KubeClient::new(client, config))
    }
}

// === impl ConfigHash ===

impl ConfigHash {
    pub fn of(kubeconfig: &str) -> Self {
        Self(Sha256::digest(kubeconfig.as_bytes()).into())
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigHash({self})")
    }
}
