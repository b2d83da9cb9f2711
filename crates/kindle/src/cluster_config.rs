//! Synthesis of kind cluster configuration documents.
//!
//! When a cluster asks for a node image or extra port mappings and no
//! explicit config file was supplied, a single control-plane document is
//! rendered and written to a temp file that disappears when dropped.

use kindle_core::PortMapping;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const KIND_API_VERSION: &str = "kind.x-k8s.io/v1alpha4";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindConfig<'a> {
    kind: &'static str,
    api_version: &'static str,
    nodes: Vec<KindNode<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindNode<'a> {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    extra_port_mappings: &'a [PortMapping],
}

/// Whether inline parameters call for a synthesized document.
pub fn needs_synthesis(image: Option<&str>, port_mappings: &[PortMapping]) -> bool {
    image.is_some() || !port_mappings.is_empty()
}

/// Render the configuration document for one control-plane node.
pub fn render(image: Option<&str>, port_mappings: &[PortMapping]) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&KindConfig {
        kind: "Cluster",
        api_version: KIND_API_VERSION,
        nodes: vec![KindNode {
            role: "control-plane",
            image,
            extra_port_mappings: port_mappings,
        }],
    })
}

/// The `--config` file handed to `kind create cluster`.
#[derive(Debug)]
pub enum ConfigFile {
    /// Supplied by the caller; never removed.
    Explicit(PathBuf),
    /// Written by us; removed on drop or [`ConfigFile::discard`].
    Synthesized(NamedTempFile),
}

impl ConfigFile {
    pub fn path(&self) -> &Path {
        match self {
            Self::Explicit(path) => path,
            Self::Synthesized(file) => file.path(),
        }
    }

    /// Release the file, deleting it if we created it.
    pub fn discard(self) {
        if let Self::Synthesized(file) = self {
            let path = file.path().to_path_buf();
            if let Err(err) = file.close() {
                warn!(path = %path.display(), error = %err, "failed to remove temporary kind config");
            }
        }
    }
}

/// Pick the config file for a creation: the explicit path if any, else a
/// synthesized document when inline parameters are set, else nothing.
pub fn prepare(
    explicit: Option<&Path>,
    image: Option<&str>,
    port_mappings: &[PortMapping],
) -> std::io::Result<Option<ConfigFile>> {
    if let Some(path) = explicit {
        return Ok(Some(ConfigFile::Explicit(path.to_path_buf())));
    }
    if !needs_synthesis(image, port_mappings) {
        return Ok(None);
    }

    let document = render(image, port_mappings).map_err(std::io::Error::other)?;
    let mut file = tempfile::Builder::new()
        .prefix("kind-config-")
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(document.as_bytes())?;
    file.flush()?;
    debug!(path = %file.path().display(), "wrote synthesized kind config");
    Ok(Some(ConfigFile::Synthesized(file)))
}
