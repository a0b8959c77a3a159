//! Error types for pod validation.

use thiserror::Error;

/// Errors found while validating a pod.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// The pod has no name.
    #[error("pod name cannot be empty")]
    MissingName,

    /// The pod declares no run units.
    #[error("pod {pod} declares no containers")]
    NoContainers { pod: String },

    /// A unit has no name.
    #[error("pod {pod} has a container without a name")]
    UnnamedUnit { pod: String },

    /// A unit has no image.
    #[error("container {unit} in pod {pod} has no image")]
    MissingImage { pod: String, unit: String },

    /// Two units share a name.
    #[error("duplicate container name {unit} in pod {pod}")]
    DuplicateUnit { pod: String, unit: String },

    /// A unit name contains the reserved separator.
    #[error("container name {unit} in pod {pod} contains reserved character '{separator}'")]
    ReservedCharacter {
        pod: String,
        unit: String,
        separator: char,
    },

    /// Two volumes share a name.
    #[error("duplicate volume name {volume} in pod {pod}")]
    DuplicateVolume { pod: String, volume: String },

    /// A mount references a volume the pod does not declare.
    #[error("container {unit} in pod {pod} mounts unknown volume {volume}")]
    UnknownVolume {
        pod: String,
        unit: String,
        volume: String,
    },
}

impl SpecError {
    /// Returns true if the error concerns a volume or mount.
    pub fn is_volume_error(&self) -> bool {
        matches!(
            self,
            SpecError::DuplicateVolume { .. } | SpecError::UnknownVolume { .. }
        )
    }
}
