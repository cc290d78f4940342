//! # CRD Generator
//!
//! Prints the `SecretStore`, `ClusterSecretStore` and `ExternalSecret`
//! CustomResourceDefinitions as a multi-document YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/secretsync.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use secret_sync_controller::crd::{ClusterSecretStore, ExternalSecret, SecretStore};

fn main() {
    let crds = [SecretStore::crd(), ClusterSecretStore::crd(), ExternalSecret::crd()];

    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    println!("# Change the resource types under src/crd/ and regenerate");
    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!(
                    "Failed to serialize CRD {} to YAML: {e}",
                    crd.metadata.name.as_deref().unwrap_or_default()
                );
                std::process::exit(1);
            }
        }
    }
}
