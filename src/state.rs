use std::sync::Arc;

use crate::coordinator::CoordinatorHandle;
use crate::identity::{IdentityError, IdentityGate, PrivilegeClassifier};
use crate::stats::StatsHandle;
use crate::types::Identity;

/// Shared application state handed to every axum handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub stats: StatsHandle,
    pub identity: Arc<dyn IdentityGate>,
    pub classifier: PrivilegeClassifier,
}

impl AppState {
    pub fn new(
        coordinator: CoordinatorHandle,
        stats: StatsHandle,
        identity: Arc<dyn IdentityGate>,
        classifier: PrivilegeClassifier,
    ) -> Self {
        Self {
            coordinator,
            stats,
            identity,
            classifier,
        }
    }

    /// Verify a connect-time credential and classify the result
    pub async fn authenticate(
        &self,
        token: Option<&str>,
    ) -> Result<(Identity, bool), IdentityError> {
        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let Some(token) = token else {
            return Err(IdentityError::Missing);
        };
        let identity = self.identity.verify(token).await?;
        let privileged = self.classifier.is_privileged(&identity);
        Ok((identity, privileged))
    }
}
