//! External tool identities and their canonical container images

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical identity of an external tool suite
///
/// The key used in `opts.runner.images` is [`Tool::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Mrtrix3,
    Mrtrix3Tissue,
    Fsl,
    Ants,
    /// greedy and the c3d affine tools
    Greedy,
    Eddymotion,
    Workbench,
    /// In-process operation, never dispatched to a backend
    Builtin,
}

impl Tool {
    pub const EXTERNAL: [Tool; 7] = [
        Tool::Mrtrix3,
        Tool::Mrtrix3Tissue,
        Tool::Fsl,
        Tool::Ants,
        Tool::Greedy,
        Tool::Eddymotion,
        Tool::Workbench,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mrtrix3 => "mrtrix3",
            Self::Mrtrix3Tissue => "mrtrix3tissue",
            Self::Fsl => "fsl",
            Self::Ants => "ants",
            Self::Greedy => "greedy",
            Self::Eddymotion => "eddymotion",
            Self::Workbench => "workbench",
            Self::Builtin => "builtin",
        }
    }

    /// Image used by docker/podman when no override is configured
    pub fn canonical_image(&self) -> Option<&'static str> {
        match self {
            Self::Mrtrix3 => Some("mrtrix3/mrtrix3:3.0.4"),
            Self::Mrtrix3Tissue => Some("brainlife/3tissue:5.2.8"),
            Self::Fsl => Some("brainlife/fsl:6.0.4-patched2"),
            Self::Ants => Some("antsx/ants:v2.5.3"),
            Self::Greedy => Some("pyushkevich/itksnap:v3.8.2"),
            Self::Eddymotion => Some("nipreps/eddymotion:0.1.15"),
            Self::Workbench => Some("brainlife/connectome_workbench:1.5.0-freesurfer-update"),
            Self::Builtin => None,
        }
    }

    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Builtin)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::EXTERNAL
            .into_iter()
            .chain([Self::Builtin])
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| format!("unknown tool '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_external_tool_has_an_image() {
        for tool in Tool::EXTERNAL {
            assert!(tool.canonical_image().is_some(), "{tool} has no image");
        }
        assert!(Tool::Builtin.canonical_image().is_none());
    }

    #[test]
    fn parses_image_map_keys() {
        assert_eq!("mrtrix3tissue".parse::<Tool>().unwrap(), Tool::Mrtrix3Tissue);
        assert!("freesurfer".parse::<Tool>().is_err());
    }
}
