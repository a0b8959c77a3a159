//! Structural validation of pods before they are turned into runtime services.

use std::collections::HashSet;

use crate::error::SpecError;
use crate::types::Pod;

/// Separator between pod name and unit name in derived service names.
///
/// Reserved: a unit name must never contain it.
pub const UNIT_NAME_SEPARATOR: char = '.';

/// Validate a pod.
///
/// Checks, in order: the pod has a name and at least one container, every
/// unit (init or run) has a unique name free of the reserved separator and an
/// image, volume names are unique, and every mount references a declared
/// volume. The first violation is returned.
pub fn validate(pod: &Pod) -> Result<(), SpecError> {
    let pod_name = pod.metadata.name.as_str();
    if pod_name.is_empty() {
        return Err(SpecError::MissingName);
    }

    if pod.spec.containers.is_empty() {
        return Err(SpecError::NoContainers {
            pod: pod_name.to_string(),
        });
    }

    let mut volumes = HashSet::new();
    for volume in &pod.spec.volumes {
        if !volumes.insert(volume.name.as_str()) {
            return Err(SpecError::DuplicateVolume {
                pod: pod_name.to_string(),
                volume: volume.name.clone(),
            });
        }
    }

    let mut units = HashSet::new();
    let all_units = pod
        .spec
        .init_containers
        .iter()
        .chain(pod.spec.containers.iter());

    for unit in all_units {
        if unit.name.is_empty() {
            return Err(SpecError::UnnamedUnit {
                pod: pod_name.to_string(),
            });
        }
        if unit.name.contains(UNIT_NAME_SEPARATOR) {
            return Err(SpecError::ReservedCharacter {
                pod: pod_name.to_string(),
                unit: unit.name.clone(),
                separator: UNIT_NAME_SEPARATOR,
            });
        }
        if !units.insert(unit.name.as_str()) {
            return Err(SpecError::DuplicateUnit {
                pod: pod_name.to_string(),
                unit: unit.name.clone(),
            });
        }
        if unit.image.is_empty() {
            return Err(SpecError::MissingImage {
                pod: pod_name.to_string(),
                unit: unit.name.clone(),
            });
        }
        for mount in &unit.volume_mounts {
            if !volumes.contains(mount.name.as_str()) {
                return Err(SpecError::UnknownVolume {
                    pod: pod_name.to_string(),
                    unit: unit.name.clone(),
                    volume: mount.name.clone(),
                });
            }
        }
    }

    Ok(())
}
