/// Organization used when the caller names none.
pub const DEFAULT_ORGANIZATION: &str = "default";

/// Tenant identity attached to every completion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    organization_id: String,
}

impl Default for TenantContext {
    fn default() -> Self {
        Self {
            organization_id: DEFAULT_ORGANIZATION.into(),
        }
    }
}

impl TenantContext {
    /// Blank ids fall back to [`DEFAULT_ORGANIZATION`].
    pub fn new(organization_id: impl Into<String>) -> Self {
        let organization_id = organization_id.into();
        if organization_id.trim().is_empty() {
            return Self::default();
        }
        Self { organization_id }
    }

    pub fn resolve(organization_id: Option<&str>) -> Self {
        organization_id.map(Self::new).unwrap_or_default()
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }
}
