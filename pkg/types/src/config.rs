use serde::{Deserialize, Serialize};

/// Proxy configuration file (YAML).
///
/// Example `proxy-config.yaml`:
/// ```yaml
/// server: http://10.0.0.1:6443
/// node-name: worker-1
/// cluster-cidr: 10.244.0.0/16
/// service-cidr: 10.96.0.0/16
/// workers: 8
/// iptables: /usr/sbin/iptables
/// dry-run: false
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default, alias = "node-name")]
    pub node_name: Option<String>,
    /// Pod network CIDR.
    #[serde(default, alias = "cluster-cidr")]
    pub cluster_cidr: Option<String>,
    /// CIDR ClusterIPs are allocated from.
    #[serde(default, alias = "service-cidr")]
    pub service_cidr: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub iptables: Option<String>,
    #[serde(default, alias = "dry-run")]
    pub dry_run: Option<bool>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: ProxyConfigFile =
            load_config_file("/nonexistent/k3rs/proxy-config.yaml").unwrap();
        assert!(cfg.server.is_none());
        assert!(cfg.dry_run.is_none());
    }

    #[test]
    fn kebab_case_keys_are_accepted() {
        let cfg: ProxyConfigFile = serde_yaml::from_str(
            "server: http://10.0.0.1:6443\nnode-name: worker-1\ncluster-cidr: 10.244.0.0/16\ndry-run: true\n",
        )
        .unwrap();
        assert_eq!(cfg.node_name.as_deref(), Some("worker-1"));
        assert_eq!(cfg.cluster_cidr.as_deref(), Some("10.244.0.0/16"));
        assert_eq!(cfg.dry_run, Some(true));
    }

    #[test]
    fn file_on_disk_is_parsed() {
        let path = std::env::temp_dir().join(format!("k3rs-proxy-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "workers: 3\nservice-cidr: 10.96.0.0/24\n").unwrap();

        let cfg: ProxyConfigFile = load_config_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.workers, Some(3));
        assert_eq!(cfg.service_cidr.as_deref(), Some("10.96.0.0/24"));

        std::fs::remove_file(&path).unwrap();
    }
}
