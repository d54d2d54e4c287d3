//! Image Cache Manager
//!
//! Keeps the images on local disk and the instance's image inventory on the
//! control-plane in agreement.

use crate::control_plane::ControlPlane;
use crate::docker::ContainerEngine;
use crate::error::{AgentError, AgentResult};
use crate::types::{Image, InstanceType};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of re-pulling the instance inventory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub updated: Vec<String>,
    /// Image reference and the engine error
    pub failed: Vec<(String, String)>,
}

pub struct ImageCache {
    control_plane: Arc<dyn ControlPlane>,
    engine: Arc<dyn ContainerEngine>,
    instance_id: String,
}

impl ImageCache {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        engine: Arc<dyn ContainerEngine>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            engine,
            instance_id: instance_id.into(),
        }
    }

    /// Pull `reference` and add it to the instance inventory.
    ///
    /// Returns the engine output. Downloading an image the inventory already
    /// lists pulls again but leaves the inventory untouched.
    pub async fn download(&self, reference: &str) -> AgentResult<String> {
        self.check_compatibility(reference).await?;

        let logs = self.engine.pull_image(reference).await?;

        if self.inventory().await?.iter().any(|r| r == reference) {
            debug!("Image {} already in inventory", reference);
        } else {
            self.control_plane
                .add_image(&self.instance_id, reference)
                .await?;
            info!("Image {} added to instance {}", reference, self.instance_id);
        }

        Ok(logs)
    }

    /// Remove `reference` from disk and from the instance inventory
    pub async fn clean(&self, reference: &str) -> AgentResult<String> {
        let logs = match self.engine.remove_image(reference).await {
            Ok(logs) => logs,
            Err(e) if e.is_not_found() => {
                warn!("Image {} was not present locally", reference);
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        if self.inventory().await?.iter().any(|r| r == reference) {
            self.control_plane
                .remove_image(&self.instance_id, reference)
                .await?;
            info!("Image {} removed from instance {}", reference, self.instance_id);
        }

        Ok(logs)
    }

    /// Re-pull every image the control-plane associates with this instance
    pub async fn update_all(&self) -> AgentResult<UpdateSummary> {
        let mut summary = UpdateSummary::default();

        for reference in self.inventory().await? {
            match self.engine.pull_image(&reference).await {
                Ok(_) => {
                    info!("Image {} is up to date", reference);
                    summary.updated.push(reference);
                }
                Err(e) => {
                    warn!("Failed to update image {}: {}", reference, e);
                    summary.failed.push((reference, e.to_string()));
                }
            }
        }

        Ok(summary)
    }

    /// Reject images whose GPU requirement does not match the instance type.
    /// Images absent from the catalog are allowed.
    pub async fn check_compatibility(&self, reference: &str) -> AgentResult<()> {
        let instance = self
            .control_plane
            .get_instance(&self.instance_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    AgentError::InstanceNotFound(self.instance_id.clone())
                } else {
                    e.into()
                }
            })?;

        let catalog = self.control_plane.list_images(None).await?;
        match catalog.iter().find(|image| image.reference == reference) {
            Some(image) => check_image_type(instance.kind, image),
            None => Ok(()),
        }
    }

    async fn inventory(&self) -> AgentResult<Vec<String>> {
        let images = self
            .control_plane
            .list_images(Some(&self.instance_id))
            .await?;
        Ok(images.into_iter().map(|image| image.reference).collect())
    }
}

pub fn check_image_type(kind: InstanceType, image: &Image) -> AgentResult<()> {
    let required = if image.requires_gpu {
        InstanceType::Gpu
    } else {
        InstanceType::Cpu
    };

    if required == kind {
        Ok(())
    } else {
        Err(AgentError::Validation(format!(
            "your instance is type {}, but this image is only supported by type {}",
            kind.label(),
            required.label()
        )))
    }
}
