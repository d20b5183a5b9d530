//! Kubeconfig rewriting
//!
//! k3s writes a kubeconfig pointing at `https://127.0.0.1:6443` from inside
//! the container. The host reaches the API server through the published port
//! instead, so every cluster entry's `server` is rewritten.

use serde_yaml::Value;

use crate::{Error, Result};

/// Replace the `server` of every cluster entry with `server`
pub fn rewrite_server(kubeconfig: &str, server: &str) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(kubeconfig)?;

    let clusters = doc
        .get_mut("clusters")
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| Error::provision("kubeconfig", "kubeconfig has no clusters"))?;

    for entry in clusters.iter_mut() {
        let cluster = entry
            .get_mut("cluster")
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| Error::provision("kubeconfig", "cluster entry missing 'cluster'"))?;
        cluster.insert(Value::from("server"), Value::from(server));
    }

    Ok(serde_yaml::to_string(&doc)?)
}
