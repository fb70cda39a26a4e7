use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Broad grouping a service type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCategory {
    Wash,
    Tire,
    Maintenance,
    Generic,
}

impl ServiceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceCategory::Wash => "wash",
            ServiceCategory::Tire => "tire",
            ServiceCategory::Maintenance => "maintenance",
            ServiceCategory::Generic => "generic",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "wash" => Some(ServiceCategory::Wash),
            "tire" => Some(ServiceCategory::Tire),
            "maintenance" => Some(ServiceCategory::Maintenance),
            "generic" => Some(ServiceCategory::Generic),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered service type, e.g. `tire_change_4x4` in the `tire` category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceType {
    pub id: String,
    pub category: ServiceCategory,
    pub label: String,
}

impl ServiceType {
    pub fn new(id: impl Into<String>, category: ServiceCategory, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown service type: {0}")]
    UnknownServiceType(String),
}

/// Read-only registry of the service types rights can be issued for.
/// Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    entries: BTreeMap<String, ServiceType>,
}

impl ServiceCatalog {
    pub fn new(entries: impl IntoIterator<Item = ServiceType>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.id.clone(), entry))
                .collect(),
        }
    }

    /// The service types offered by partner centers out of the box.
    pub fn standard() -> Self {
        use ServiceCategory::*;

        Self::new([
            ServiceType::new("wash_standard", Wash, "Standard wash"),
            ServiceType::new("wash_premium", Wash, "Premium wash"),
            ServiceType::new("wash_interior", Wash, "Interior cleaning"),
            ServiceType::new("tire_change", Tire, "Tire change"),
            ServiceType::new("tire_change_4x4", Tire, "Tire change (4x4)"),
            ServiceType::new("tire_repair", Tire, "Tire repair"),
            ServiceType::new("tire_storage", Tire, "Seasonal tire storage"),
            ServiceType::new("maintenance_oil", Maintenance, "Oil change"),
            ServiceType::new("maintenance_inspection", Maintenance, "Periodic inspection"),
            ServiceType::new("maintenance_brakes", Maintenance, "Brake service"),
        ])
    }

    pub fn is_valid(&self, service_type: &str) -> bool {
        self.entries.contains_key(service_type)
    }

    pub fn get(&self, service_type: &str) -> Result<&ServiceType, CatalogError> {
        self.entries
            .get(service_type)
            .ok_or_else(|| CatalogError::UnknownServiceType(service_type.to_string()))
    }

    pub fn category_of(&self, service_type: &str) -> Result<ServiceCategory, CatalogError> {
        self.get(service_type).map(|entry| entry.category)
    }

    /// All entries, ordered by identifier.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceType> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ServiceCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
