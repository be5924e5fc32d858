//! Per-request identity supplied by the authentication layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Business role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Executive,
    Manager,
    StateManager,
    SalesRep,
    #[serde(rename = "so")]
    SalesOfficer,
    #[serde(rename = "asm")]
    AreaSalesManager,
    #[serde(rename = "zsm")]
    ZonalSalesManager,
    #[serde(rename = "nsm")]
    NationalSalesManager,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Executive => "executive",
            Role::Manager => "manager",
            Role::StateManager => "state_manager",
            Role::SalesRep => "sales_rep",
            Role::SalesOfficer => "so",
            Role::AreaSalesManager => "asm",
            Role::ZonalSalesManager => "zsm",
            Role::NationalSalesManager => "nsm",
        }
    }

    /// Geographic level and sales hierarchy level a role holds by default.
    pub fn default_scope(&self) -> (AccessLevel, Option<HierarchyLevel>) {
        match self {
            Role::Admin | Role::Executive => (AccessLevel::National, None),
            Role::Manager => (AccessLevel::Region, None),
            Role::StateManager => (AccessLevel::State, None),
            Role::SalesRep => (AccessLevel::Territory, None),
            Role::SalesOfficer => (AccessLevel::Territory, Some(HierarchyLevel::So)),
            Role::AreaSalesManager => (AccessLevel::Region, Some(HierarchyLevel::Asm)),
            Role::ZonalSalesManager => (AccessLevel::Region, Some(HierarchyLevel::Zsm)),
            Role::NationalSalesManager => (AccessLevel::National, Some(HierarchyLevel::Nsm)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "executive" => Ok(Role::Executive),
            "manager" => Ok(Role::Manager),
            "state_manager" => Ok(Role::StateManager),
            "sales_rep" => Ok(Role::SalesRep),
            "so" | "sales_officer" => Ok(Role::SalesOfficer),
            "asm" | "area_sales_manager" => Ok(Role::AreaSalesManager),
            "zsm" | "zonal_sales_manager" => Ok(Role::ZonalSalesManager),
            "nsm" | "national_sales_manager" => Ok(Role::NationalSalesManager),
            _ => Err(s.to_string()),
        }
    }
}

/// Breadth of data a user may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    National,
    Region,
    State,
    Territory,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessLevel::National => "national",
            AccessLevel::Region => "region",
            AccessLevel::State => "state",
            AccessLevel::Territory => "territory",
        };
        f.write_str(name)
    }
}

/// Position in the field sales hierarchy, from sales officer up to
/// national sales manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchyLevel {
    So,
    Asm,
    Zsm,
    Nsm,
}

impl fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HierarchyLevel::So => "SO",
            HierarchyLevel::Asm => "ASM",
            HierarchyLevel::Zsm => "ZSM",
            HierarchyLevel::Nsm => "NSM",
        };
        f.write_str(name)
    }
}

/// Who is asking, and what they may see.
///
/// A user placed in the sales hierarchy is scoped by their hierarchy codes;
/// the geographic lists only apply to users outside it.
///
/// The role stays a plain string so that an unrecognized role reaches the
/// injector and is refused there instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserContext {
    pub user_id: String,
    pub role: String,
    pub data_access_level: AccessLevel,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub territories: Vec<String>,
    #[serde(default)]
    pub sales_hierarchy_level: Option<HierarchyLevel>,
    #[serde(default)]
    pub so_codes: Vec<String>,
    #[serde(default)]
    pub asm_codes: Vec<String>,
    #[serde(default)]
    pub zsm_codes: Vec<String>,
    #[serde(default)]
    pub nsm_codes: Vec<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>, level: AccessLevel) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            data_access_level: level,
            regions: Vec::new(),
            states: Vec::new(),
            territories: Vec::new(),
            sales_hierarchy_level: None,
            so_codes: Vec::new(),
            asm_codes: Vec::new(),
            zsm_codes: Vec::new(),
            nsm_codes: Vec::new(),
        }
    }

    /// A context carrying a role's default levels and no scope values.
    ///
    /// Scope lists start empty, so anything short of national access is
    /// refused until the caller fills them in.
    pub fn for_role(user_id: impl Into<String>, role: Role) -> Self {
        let (level, hierarchy) = role.default_scope();
        let mut user = Self::new(user_id, role.as_str(), level);
        user.sales_hierarchy_level = hierarchy;
        user
    }

    /// Place the user in the sales hierarchy with the codes they cover.
    #[must_use]
    pub fn with_hierarchy<I, S>(mut self, level: HierarchyLevel, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let codes = codes.into_iter().map(Into::into).collect();
        self.sales_hierarchy_level = Some(level);
        match level {
            HierarchyLevel::So => self.so_codes = codes,
            HierarchyLevel::Asm => self.asm_codes = codes,
            HierarchyLevel::Zsm => self.zsm_codes = codes,
            HierarchyLevel::Nsm => self.nsm_codes = codes,
        }
        self
    }

    #[must_use]
    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_territories<I, S>(mut self, territories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.territories = territories.into_iter().map(Into::into).collect();
        self
    }

    /// Allowed values for the user's own access level.
    pub fn scope(&self) -> &[String] {
        match self.data_access_level {
            AccessLevel::National => &[],
            AccessLevel::Region => &self.regions,
            AccessLevel::State => &self.states,
            AccessLevel::Territory => &self.territories,
        }
    }

    /// Codes at `level` of the sales hierarchy.
    pub fn hierarchy_codes(&self, level: HierarchyLevel) -> &[String] {
        match level {
            HierarchyLevel::So => &self.so_codes,
            HierarchyLevel::Asm => &self.asm_codes,
            HierarchyLevel::Zsm => &self.zsm_codes,
            HierarchyLevel::Nsm => &self.nsm_codes,
        }
    }
}
