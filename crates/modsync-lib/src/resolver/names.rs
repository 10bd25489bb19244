use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ResolutionError;
use crate::provider::MetadataProvider;

use super::ROOT_REQUIRER;

/// Display names fetched lazily from the provider and kept for the lifetime
/// of one resolver.
pub struct DisplayNames {
    provider: Arc<dyn MetadataProvider>,
    names: Mutex<HashMap<String, String>>,
}

impl DisplayNames {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Display name of `reference`, or the reference itself when the provider
    /// does not know one.
    pub async fn name_of(&self, reference: &str) -> String {
        if reference == ROOT_REQUIRER {
            return "your profile".to_string();
        }
        if let Some(name) = self.names.lock().await.get(reference) {
            return name.clone();
        }
        let name = match self.provider.display_name(reference).await {
            Ok(name) if !name.trim().is_empty() => name,
            Ok(_) => reference.to_string(),
            Err(e) => {
                log::debug!("No display name for {}: {}", reference, e);
                reference.to_string()
            }
        };
        self.names
            .lock()
            .await
            .insert(reference.to_string(), name.clone());
        name
    }

    /// Render `err` for a user, with display names in place of references.
    pub async fn explain(&self, err: &ResolutionError) -> String {
        match err {
            ResolutionError::Conflict {
                package,
                resolved,
                selected,
            } => format!(
                "{} was resolved to {} but a later step selected {}",
                self.name_of(package).await,
                resolved,
                selected
            ),
            ResolutionError::ConstraintViolation {
                package,
                version,
                constraint,
                required_by,
                selected_constraint,
                selected_by,
            } => format!(
                "{} {} was chosen because {} requires \"{}\", but {} requires \"{}\"",
                self.name_of(package).await,
                version,
                self.name_of(selected_by).await,
                selected_constraint,
                self.name_of(required_by).await,
                constraint
            ),
            ResolutionError::UnresolvedReference { package } => format!(
                "{} could not be found in any metadata source",
                self.name_of(package).await
            ),
            ResolutionError::NoMatchingVersion {
                package,
                constraint,
            } => format!(
                "{} has no version matching \"{}\"",
                self.name_of(package).await,
                constraint
            ),
            ResolutionError::InvalidConstraint {
                package,
                constraint,
            } => format!(
                "\"{}\" is not a valid version range for {}",
                constraint,
                self.name_of(package).await
            ),
            ResolutionError::InvalidReference { package } => {
                format!("\"{}\" is not a valid package reference", package)
            }
            ResolutionError::Provider(e) => format!("Metadata source failed: {}", e),
        }
    }
}
