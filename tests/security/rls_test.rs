//! Row-level security over certified queries.

use semql::config::{SecuritySettings, Settings, ValidationSettings};
use semql::query::{Filter, FilterOp, FilterValue, Intent, StructuredQuery};
use semql::security::{
    AccessLevel, HierarchyLevel, Role, RowLevelSecurity, SecurityError, UserContext,
};
use semql::validation::Validator;
use semql::{CompileOptions, Pipeline, Registry, SemqlError};

fn brand_sales() -> StructuredQuery {
    StructuredQuery::new(Intent::Snapshot, "secondary_sales_value")
        .group_by("brand_name")
        .filter(
            "channel_name",
            FilterOp::Eq,
            [FilterValue::Text("General Trade".into())],
        )
}

fn territory_user() -> UserContext {
    UserContext::new("u-tm-7", "sales_rep", AccessLevel::Territory)
        .with_territories(["Madurai", "Theni"])
}

#[test]
fn test_territory_scope_is_a_superset_with_one_territory_predicate() {
    let rls = RowLevelSecurity::default();
    let original = brand_sales();
    let secured = rls.apply(&original, Some(&territory_user())).unwrap();

    for filter in &original.filters {
        assert!(secured.filters.contains(filter));
    }
    let territory: Vec<&Filter> = secured
        .filters
        .iter()
        .filter(|f| f.dimension == "district_name")
        .collect();
    assert_eq!(territory.len(), 1);
    assert_eq!(territory[0].operator, FilterOp::In);
    assert_eq!(
        territory[0].values,
        [
            FilterValue::Text("Madurai".into()),
            FilterValue::Text("Theni".into()),
        ]
    );
}

#[test]
fn test_input_query_is_untouched() {
    let rls = RowLevelSecurity::default();
    let original = brand_sales();
    let before = original.clone();
    let _ = rls.apply(&original, Some(&territory_user())).unwrap();
    assert_eq!(original, before);
}

#[test]
fn test_applying_twice_adds_two_filters() {
    let rls = RowLevelSecurity::default();
    let user = territory_user();
    let once = rls.apply(&brand_sales(), Some(&user)).unwrap();
    let twice = rls.apply(&once, Some(&user)).unwrap();

    assert_eq!(twice.filters.len(), brand_sales().filters.len() + 2);
    let scoped = twice
        .filters
        .iter()
        .filter(|f| f.dimension == "district_name")
        .count();
    assert_eq!(scoped, 2);
}

#[test]
fn test_missing_user_is_always_an_error() {
    let rls = RowLevelSecurity::default();
    assert_eq!(
        rls.apply(&brand_sales(), None),
        Err(SecurityError::SecurityContextMissing)
    );
}

#[test]
fn test_empty_scope_is_refused() {
    let rls = RowLevelSecurity::default();
    let user = UserContext::new("u-rm", "manager", AccessLevel::Region);
    assert!(matches!(
        rls.apply(&brand_sales(), Some(&user)),
        Err(SecurityError::AccessScopeEmpty { .. })
    ));
}

#[test]
fn test_unknown_role_never_sees_everything() {
    let rls = RowLevelSecurity::default();
    let user = UserContext::new("u-x", "intern", AccessLevel::National);
    assert!(matches!(
        rls.apply(&brand_sales(), Some(&user)),
        Err(SecurityError::UnknownRole { .. })
    ));

    let user = UserContext::new("u-y", "sales_rep", AccessLevel::National);
    assert!(matches!(
        rls.apply(&brand_sales(), Some(&user)),
        Err(SecurityError::ScopeNotPermitted { .. })
    ));
}

#[test]
fn test_policy_dimensions_are_configurable() {
    let settings = Settings::from_toml_str(
        r#"
        [security]
        state = "distributor_state_name"
        national_roles = ["admin"]
        "#,
    )
    .unwrap();
    let rls = RowLevelSecurity::new(settings.security.clone());
    let user = UserContext::new("u-sm", "state_manager", AccessLevel::State).with_states(["Goa"]);
    let secured = rls.apply(&brand_sales(), Some(&user)).unwrap();
    assert_eq!(secured.filters.last().unwrap().dimension, "distributor_state_name");

    let exec = UserContext::new("u-cxo", "executive", AccessLevel::National);
    assert!(rls.apply(&brand_sales(), Some(&exec)).is_err());
    assert_eq!(SecuritySettings::default().national_roles, [Role::Admin, Role::Executive]);
}

#[test]
fn test_secured_query_counts_security_filters() {
    let registry = Registry::builtin().unwrap();
    let certified = Validator::new(&registry, ValidationSettings::default())
        .certify(&brand_sales())
        .unwrap();
    let secured = RowLevelSecurity::default()
        .secure(certified, Some(&territory_user()))
        .unwrap();
    assert_eq!(secured.security_filter_count(), 1);
    assert_eq!(secured.query().filters.len(), 2);
}

#[test]
fn test_security_errors_stop_compilation() {
    let registry = Registry::builtin().unwrap();
    let settings = Settings::default();
    let pipeline = Pipeline::new(&registry, &settings, None, CompileOptions::default());
    let err = pipeline.compile(&brand_sales()).unwrap_err();
    assert!(matches!(
        err,
        SemqlError::Security(SecurityError::SecurityContextMissing)
    ));
}

#[test]
fn test_user_context_from_json() {
    let user: UserContext = serde_json::from_str(
        r#"{
            "user_id": "u-42",
            "role": "sales_rep",
            "data_access_level": "state",
            "states": ["Tamil Nadu"]
        }"#,
    )
    .unwrap();
    let secured = RowLevelSecurity::default()
        .apply(&brand_sales(), Some(&user))
        .unwrap();
    let scope = secured.filters.last().unwrap();
    assert_eq!(scope.dimension, "state_name");
    assert_eq!(scope.values, [FilterValue::Text("Tamil Nadu".into())]);
}

// ============================================================================
// Sales hierarchy
// ============================================================================

#[test]
fn test_hierarchy_scope_wins_over_geography() {
    let rls = RowLevelSecurity::default();
    let user = UserContext::new("u-asm-3", "asm", AccessLevel::Region)
        .with_regions(["South"])
        .with_hierarchy(HierarchyLevel::Asm, ["ASM-07", "ASM-09"]);
    let secured = rls.apply(&brand_sales(), Some(&user)).unwrap();

    assert_eq!(secured.filters.len(), brand_sales().filters.len() + 1);
    let scope = secured.filters.last().unwrap();
    assert_eq!(scope.dimension, "asm_code");
    assert_eq!(scope.operator, FilterOp::In);
    assert_eq!(
        scope.values,
        [
            FilterValue::Text("ASM-07".into()),
            FilterValue::Text("ASM-09".into()),
        ]
    );
    assert!(secured.filters.iter().all(|f| f.dimension != "zone_name"));
}

#[test]
fn test_empty_hierarchy_codes_are_refused() {
    let rls = RowLevelSecurity::default();
    // Geography alone must not stand in for missing hierarchy codes.
    let user = UserContext::for_role("u-zsm-1", Role::ZonalSalesManager).with_regions(["North"]);
    assert_eq!(
        rls.apply(&brand_sales(), Some(&user)),
        Err(SecurityError::HierarchyScopeEmpty {
            user_id: "u-zsm-1".into(),
            level: HierarchyLevel::Zsm,
        })
    );
}

#[test]
fn test_national_sales_manager_is_scoped_by_code() {
    let rls = RowLevelSecurity::default();
    let user = UserContext::for_role("u-nsm", Role::NationalSalesManager)
        .with_hierarchy(HierarchyLevel::Nsm, ["NSM-1"]);
    assert_eq!(user.data_access_level, AccessLevel::National);

    let secured = rls.apply(&brand_sales(), Some(&user)).unwrap();
    assert_eq!(secured.filters.last().unwrap().dimension, "nsm_code");
}

#[test]
fn test_context_derived_from_role() {
    let cases = [
        (Role::NationalSalesManager, AccessLevel::National, Some(HierarchyLevel::Nsm)),
        (Role::ZonalSalesManager, AccessLevel::Region, Some(HierarchyLevel::Zsm)),
        (Role::AreaSalesManager, AccessLevel::Region, Some(HierarchyLevel::Asm)),
        (Role::SalesOfficer, AccessLevel::Territory, Some(HierarchyLevel::So)),
        (Role::Executive, AccessLevel::National, None),
        (Role::Admin, AccessLevel::National, None),
        (Role::Manager, AccessLevel::Region, None),
        (Role::SalesRep, AccessLevel::Territory, None),
    ];
    for (role, level, hierarchy) in cases {
        let user = UserContext::for_role("u", role);
        assert_eq!(user.role, role.as_str());
        assert_eq!(user.data_access_level, level, "{role}");
        assert_eq!(user.sales_hierarchy_level, hierarchy, "{role}");
        assert!(user.scope().is_empty());
    }

    // Derived national roles pass; derived scoped roles wait for values.
    let rls = RowLevelSecurity::default();
    assert!(rls
        .apply(&brand_sales(), Some(&UserContext::for_role("u", Role::Executive)))
        .is_ok());
    assert!(matches!(
        rls.apply(&brand_sales(), Some(&UserContext::for_role("u", Role::Manager))),
        Err(SecurityError::AccessScopeEmpty { .. })
    ));
}

#[test]
fn test_hierarchy_dimensions_are_configurable() {
    let settings = Settings::from_toml_str(
        r#"
        [security.hierarchy]
        so = "officer_code"
        "#,
    )
    .unwrap();
    assert_eq!(settings.security.hierarchy.asm, "asm_code");

    let rls = RowLevelSecurity::new(settings.security);
    let user = UserContext::new("u-so", "so", AccessLevel::Territory)
        .with_hierarchy(HierarchyLevel::So, ["SO-11"]);
    let secured = rls.apply(&brand_sales(), Some(&user)).unwrap();
    assert_eq!(secured.filters.last().unwrap().dimension, "officer_code");
}

#[test]
fn test_hierarchy_context_from_json_compiles() {
    let user: UserContext = serde_json::from_str(
        r#"{
            "user_id": "u-so-4",
            "role": "so",
            "data_access_level": "territory",
            "sales_hierarchy_level": "so",
            "so_codes": ["SO-114"]
        }"#,
    )
    .unwrap();
    let registry = Registry::builtin().unwrap();
    let settings = Settings::default();
    let statement = Pipeline::new(&registry, &settings, Some(&user), CompileOptions::default())
        .compile(&brand_sales())
        .unwrap()
        .statement;
    assert!(statement.sql.contains("\"dim_sales_hierarchy\".\"so_code\" IN (?)"));
    assert!(!statement.sql.contains("district_name"));
}
