//! Command dispatch.

use std::sync::Arc;

use cont_core::error::Result;
use cont_runtime::oci::ImageReference;

use crate::context::DaemonContext;
use crate::protocol::{Command, Response, StartedImage};

/// Turns request lines into response lines.
#[derive(Clone)]
pub struct CommandHandler {
    context: Arc<DaemonContext>,
}

impl CommandHandler {
    pub fn new(context: Arc<DaemonContext>) -> Self {
        Self { context }
    }

    /// Handle one request line. Always produces exactly one response.
    pub async fn handle(&self, connection_id: u64, line: &str) -> Response {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(connection_id, line, error = %e, "Invalid message");
                return e.into();
            }
        };

        match command {
            Command::Start { container_id } => {
                tracing::info!(connection_id, container_id = %container_id, "Starting container");
                match self.ensure_image(&container_id).await {
                    Ok(image) => Response::Starting {
                        container_id,
                        image,
                    },
                    Err(e) => {
                        tracing::error!(
                            connection_id,
                            container_id = %container_id,
                            kind = e.kind(),
                            error = %e,
                            "Image acquisition failed"
                        );
                        e.into()
                    }
                }
            }
            Command::Stop { container_id } => {
                tracing::info!(connection_id, container_id = %container_id, "Stopping container");
                Response::Stopping { container_id }
            }
            Command::Echo(line) => {
                tracing::debug!(connection_id, line = %line, "Received message");
                Response::Received(line)
            }
        }
    }

    /// Make the container's image available locally, pulling it if needed.
    async fn ensure_image(&self, container_id: &str) -> Result<StartedImage> {
        let reference = ImageReference::parse(self.context.config.image_for(container_id))?;
        let puller = &self.context.puller;

        let location = if puller.is_present(&reference).await? {
            tracing::info!(reference = %reference, "Using stored image");
            puller.store().root().to_path_buf()
        } else {
            puller.pull(&reference).await?.output_location
        };

        Ok(StartedImage {
            reference: reference.to_string(),
            location,
        })
    }
}
