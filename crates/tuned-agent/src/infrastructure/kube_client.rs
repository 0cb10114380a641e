use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::debug;

use crate::infrastructure::k8s::KubernetesError;

/// Build the cluster client.
///
/// Credentials are looked up in order: the explicit `kubeconfig` (flag or `KUBECONFIG`),
/// the in-cluster service account, then `$HOME/.kube/config`. A kubeconfig that was
/// chosen but does not exist is an error rather than a reason to keep looking.
///
/// # Errors
///
/// - [`KubernetesError::KubeconfigUnreadable`] if the chosen kubeconfig cannot be stat'ed
/// - [`KubernetesError::KubeconfigNotFound`] if no credentials source is available
/// - [`KubernetesError::ConnectionFailed`] if the configuration is invalid
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let config = load_config(kubeconfig).await?;
    Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
        message: "Failed to create Kubernetes client".to_string(),
    })
}

async fn load_config(kubeconfig: Option<PathBuf>) -> Result<Config, Report<KubernetesError>> {
    if let Some(path) = kubeconfig {
        return config_from_file(&path).await;
    }

    match Config::incluster() {
        Ok(config) => {
            debug!("Using in-cluster configuration");
            return Ok(config);
        }
        Err(e) => debug!("No in-cluster configuration: {e}"),
    }

    match home_kubeconfig(std::env::var_os("HOME")) {
        Some(path) => config_from_file(&path).await,
        None => Err(Report::new(KubernetesError::KubeconfigNotFound)),
    }
}

fn home_kubeconfig(home: Option<OsString>) -> Option<PathBuf> {
    home.filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".kube").join("config"))
}

async fn config_from_file(path: &Path) -> Result<Config, Report<KubernetesError>> {
    std::fs::metadata(path).change_context_lazy(|| KubernetesError::KubeconfigUnreadable {
        path: path.to_path_buf(),
    })?;

    let kubeconfig =
        Kubeconfig::read_from(path).change_context_lazy(|| KubernetesError::ConnectionFailed {
            message: format!("Failed to read kubeconfig {}", path.display()),
        })?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(|| KubernetesError::ConnectionFailed {
            message: format!("Invalid kubeconfig {}", path.display()),
        })?;
    debug!("Using kubeconfig {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: http://127.0.0.1:6443
contexts:
- name: local
  context:
    cluster: local
    user: local
current-context: local
users:
- name: local
  user:
    token: test-token
"#;

    #[tokio::test]
    async fn explicit_kubeconfig_must_exist() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let missing = dir.path().join("kubeconfig");

        let error = load_config(Some(missing.clone()))
            .await
            .expect_err("kubeconfig is missing");

        match error.current_context() {
            KubernetesError::KubeconfigUnreadable { path } => assert_eq!(path, &missing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn explicit_kubeconfig_is_loaded() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let path = dir.path().join("kubeconfig");
        std::fs::write(&path, KUBECONFIG).expect("should write kubeconfig");

        let config = load_config(Some(path)).await.expect("should load");

        assert_eq!(config.cluster_url.host(), Some("127.0.0.1"));
        assert_eq!(config.cluster_url.port_u16(), Some(6443));
    }

    #[test]
    fn home_kubeconfig_lives_under_dot_kube() {
        assert_eq!(
            home_kubeconfig(Some(OsString::from("/root"))),
            Some(PathBuf::from("/root/.kube/config"))
        );
        assert_eq!(home_kubeconfig(Some(OsString::new())), None);
        assert_eq!(home_kubeconfig(None), None);
    }
}
