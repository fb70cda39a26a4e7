use serde::{Deserialize, Serialize};

use super::CompanyId;

/// Role of an already-authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    CompanyAdmin,
    ServiceCenterOperator,
    Driver,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::CompanyAdmin => "company_admin",
            Role::ServiceCenterOperator => "service_center_operator",
            Role::Driver => "driver",
            Role::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "company_admin" | "admin" => Some(Role::CompanyAdmin),
            "service_center_operator" | "operator" => Some(Role::ServiceCenterOperator),
            "driver" => Some(Role::Driver),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    /// Company-bound roles may only touch vehicles of their own company.
    pub fn is_company_scoped(&self) -> bool {
        matches!(self, Role::CompanyAdmin | Role::Driver)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The verified identity handed to the ledger by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
    pub company_id: Option<CompanyId>,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            company_id: None,
        }
    }

    pub fn with_company(mut self, company_id: CompanyId) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn system() -> Self {
        Self::new("system", Role::System)
    }

    pub fn company_admin(id: impl Into<String>, company_id: CompanyId) -> Self {
        Self::new(id, Role::CompanyAdmin).with_company(company_id)
    }

    pub fn driver(id: impl Into<String>, company_id: CompanyId) -> Self {
        Self::new(id, Role::Driver).with_company(company_id)
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self::new(id, Role::ServiceCenterOperator)
    }

    /// Whether this actor may act on a vehicle owned by `company_id`.
    pub fn can_access_company(&self, company_id: CompanyId) -> bool {
        !self.role.is_company_scoped() || self.company_id == Some(company_id)
    }
}

/// Every operation exposed at the ledger boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    RegisterVehicle,
    DeactivateVehicle,
    AllocateGeneric,
    AllocateRight,
    SpendGeneric,
    SpendRight,
    IssueToken,
    RedeemToken,
    ReadAccount,
    RegisterServiceCenter,
    CheckIntegrity,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::RegisterVehicle => "register_vehicle",
            Operation::DeactivateVehicle => "deactivate_vehicle",
            Operation::AllocateGeneric => "allocate_generic",
            Operation::AllocateRight => "allocate_right",
            Operation::SpendGeneric => "spend_generic",
            Operation::SpendRight => "spend_right",
            Operation::IssueToken => "issue_token",
            Operation::RedeemToken => "redeem_token",
            Operation::ReadAccount => "read_account",
            Operation::RegisterServiceCenter => "register_service_center",
            Operation::CheckIntegrity => "check_integrity",
        }
    }

    /// Roles allowed to invoke this operation.
    pub fn allowed_roles(&self) -> &'static [Role] {
        use Role::*;

        match self {
            Operation::RegisterVehicle
            | Operation::DeactivateVehicle
            | Operation::AllocateGeneric
            | Operation::AllocateRight => &[CompanyAdmin, System],
            Operation::SpendGeneric | Operation::SpendRight | Operation::RedeemToken => {
                &[ServiceCenterOperator, System]
            }
            Operation::IssueToken => &[Driver, CompanyAdmin, System],
            Operation::ReadAccount => &[CompanyAdmin, ServiceCenterOperator, Driver, System],
            Operation::RegisterServiceCenter | Operation::CheckIntegrity => &[System],
        }
    }

    pub fn permits(&self, role: Role) -> bool {
        self.allowed_roles().contains(&role)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
