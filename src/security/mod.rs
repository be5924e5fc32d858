//! Row-level security.
//!
//! [`RowLevelSecurity::apply`] returns a new query with the user's mandatory
//! scope filter appended. The appended filter is an ordinary
//! [`Filter`]; nothing downstream can tell it apart from a user filter, so
//! nothing downstream can strip it.
//!
//! Users placed in the sales hierarchy are scoped by their hierarchy codes
//! ahead of any geography. Otherwise national scope adds no filter and is
//! only granted to the configured national roles. Unknown roles are refused.

mod context;

pub use context::{AccessLevel, HierarchyLevel, Role, UserContext};

use crate::config::SecuritySettings;
use crate::query::{Filter, FilterOp, FilterValue, StructuredQuery, TimeWindow};
use crate::validation::{CertifiedQuery, QueryShape, ValidationWarning};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("no user context supplied")]
    SecurityContextMissing,

    #[error("user '{user_id}' has {level} access but no allowed {level} values")]
    AccessScopeEmpty { user_id: String, level: AccessLevel },

    #[error("user '{user_id}' sits at {level} level but covers no {level} codes")]
    HierarchyScopeEmpty {
        user_id: String,
        level: HierarchyLevel,
    },

    #[error("user '{user_id}' has unrecognized role '{role}'")]
    UnknownRole { user_id: String, role: String },

    #[error("role '{role}' of user '{user_id}' may not hold {level} scope")]
    ScopeNotPermitted {
        user_id: String,
        role: Role,
        level: AccessLevel,
    },
}

pub type SecurityResult<T> = Result<T, SecurityError>;

/// The filter injector.
#[derive(Debug, Clone, Default)]
pub struct RowLevelSecurity {
    policy: SecuritySettings,
}

impl RowLevelSecurity {
    pub fn new(policy: SecuritySettings) -> Self {
        Self { policy }
    }

    /// The scope filter for `user`, or `None` for national scope.
    pub fn predicate_for(&self, user: &UserContext) -> SecurityResult<Option<Filter>> {
        let role: Role = user
            .role
            .parse()
            .map_err(|role| SecurityError::UnknownRole {
                user_id: user.user_id.clone(),
                role,
            })?;
        if let Some(level) = user.sales_hierarchy_level {
            let codes = user.hierarchy_codes(level);
            if codes.is_empty() {
                return Err(SecurityError::HierarchyScopeEmpty {
                    user_id: user.user_id.clone(),
                    level,
                });
            }
            return Ok(Some(Filter::new(
                self.policy.hierarchy_dimension(level),
                FilterOp::In,
                codes.iter().cloned().map(FilterValue::Text),
            )));
        }

        let level = user.data_access_level;
        let Some(dimension) = self.policy.dimension_for(level) else {
            if self.policy.national_roles.contains(&role) {
                return Ok(None);
            }
            return Err(SecurityError::ScopeNotPermitted {
                user_id: user.user_id.clone(),
                role,
                level,
            });
        };

        let scope = user.scope();
        if scope.is_empty() {
            return Err(SecurityError::AccessScopeEmpty {
                user_id: user.user_id.clone(),
                level,
            });
        }
        Ok(Some(Filter::new(
            dimension,
            FilterOp::In,
            scope.iter().cloned().map(FilterValue::Text),
        )))
    }

    /// Return a copy of `query` constrained to the user's scope.
    ///
    /// Not idempotent: each call appends one more filter.
    pub fn apply(
        &self,
        query: &StructuredQuery,
        user: Option<&UserContext>,
    ) -> SecurityResult<StructuredQuery> {
        let user = user.ok_or(SecurityError::SecurityContextMissing)?;
        let predicate = self.predicate_for(user)?;

        let mut secured = query.clone();
        let added = usize::from(predicate.is_some());
        secured.filters.extend(predicate);

        tracing::info!(
            user_id = %user.user_id,
            level = %user.data_access_level,
            hierarchy = ?user.sales_hierarchy_level,
            predicates = added,
            "row-level security applied"
        );
        Ok(secured)
    }

    /// Secure a certified query for compilation.
    pub fn secure(
        &self,
        certified: CertifiedQuery,
        user: Option<&UserContext>,
    ) -> SecurityResult<SecuredQuery> {
        let (query, shape, window, warnings) = certified.into_parts();
        let before = query.filters.len();
        let query = self.apply(&query, user)?;
        let security_filters = query.filters.len() - before;
        Ok(SecuredQuery {
            query,
            shape,
            window,
            warnings,
            security_filters,
        })
    }
}

/// A certified query with row-level security applied; the only input the
/// compiler accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct SecuredQuery {
    query: StructuredQuery,
    shape: QueryShape,
    window: TimeWindow,
    warnings: Vec<ValidationWarning>,
    security_filters: usize,
}

impl SecuredQuery {
    pub fn query(&self) -> &StructuredQuery {
        &self.query
    }

    pub fn shape(&self) -> &QueryShape {
        &self.shape
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn warnings(&self) -> &[ValidationWarning] {
        &self.warnings
    }

    /// Number of filters appended by row-level security.
    pub fn security_filter_count(&self) -> usize {
        self.security_filters
    }
}
