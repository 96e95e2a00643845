//! Governance Flow Integration Tests
//!
//! Exercises the managers together through a fully wired `Steward`:
//! - Domain → contract → product publishing flow
//! - Permission-filtered search across every source
//! - Role overrides changing what a user can see
//! - Comments, metadata, semantic links and costs on shared entities
//! - Referential rules between contracts and products

#![cfg(feature = "test-utils")]

use steward_core::{features, EntityType, FeatureAccessLevel, StewardError};
use steward_services::comments::CommentRequest;
use steward_services::contracts::{ContractStatus, DataContractRequest, SchemaObject, SchemaProperty};
use steward_services::costs::{CostCenter, CostItemRequest};
use steward_services::data_products::{DataProductRequest, Port, ProductStatus, ProductType};
use steward_services::domains::DataDomainRequest;
use steward_services::metadata::{LinkRequest, MetadataKind};
use steward_services::projects::{ProjectRequest, ProjectType};
use steward_services::semantic_links::OntologyConcept;
use steward_services::test_utils::{
    admin_user, consumer_user, producer_user, steward_user, TestSteward, TestUser,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn orders_contract(domain_id: &str) -> DataContractRequest {
    DataContractRequest {
        name: "orders".to_string(),
        version: "1.0.0".to_string(),
        domain_id: Some(domain_id.to_string()),
        description: Some("Order facts for revenue reporting".to_string()),
        schema: vec![SchemaObject {
            name: "orders".to_string(),
            description: None,
            properties: vec![
                SchemaProperty {
                    name: "order_id".to_string(),
                    logical_type: "bigint".to_string(),
                    required: true,
                    description: None,
                },
                SchemaProperty {
                    name: "amount".to_string(),
                    logical_type: "decimal".to_string(),
                    required: true,
                    description: None,
                },
            ],
        }],
        tags: vec!["sales".to_string()],
        ..Default::default()
    }
}

/// Domain, active contract and candidate product, returning their ids.
async fn publish_orders(env: &TestSteward) -> (String, String, String) {
    let s = env.steward();
    let steward = steward_user();
    let producer = producer_user();

    let domain = s
        .domains
        .create(
            DataDomainRequest {
                name: "Sales".to_string(),
                description: Some("Everything revenue".to_string()),
                ..Default::default()
            },
            &steward,
        )
        .await
        .unwrap();

    let contract = s
        .contracts
        .create(orders_contract(&domain.id), &producer)
        .await
        .unwrap();
    s.contracts
        .set_status(&contract.id, ContractStatus::Proposed, &producer)
        .await
        .unwrap();
    s.contracts
        .set_status(&contract.id, ContractStatus::Active, &steward)
        .await
        .unwrap();

    let product = s
        .products
        .create(
            DataProductRequest {
                name: "Orders Mart".to_string(),
                version: "1.0.0".to_string(),
                product_type: ProductType::ConsumerAligned,
                domain_id: Some(domain.id.clone()),
                description: Some("Curated orders".to_string()),
                tags: vec!["sales".to_string()],
                output_ports: vec![Port {
                    name: "warehouse".to_string(),
                    description: None,
                    contract_id: Some(contract.id.clone()),
                }],
                ..Default::default()
            },
            &producer,
        )
        .await
        .unwrap();
    s.products
        .set_status(&product.id, ProductStatus::Candidate, &producer)
        .await
        .unwrap();

    (domain.id, contract.id, product.id)
}

// ============================================================================
// Publishing Flow
// ============================================================================

#[tokio::test]
async fn test_publish_flow_records_change_log() {
    let env = TestSteward::new().await.unwrap();
    let (domain_id, contract_id, product_id) = publish_orders(&env).await;
    let s = env.steward();

    let contract = s.contracts.get(&contract_id).await.unwrap().unwrap();
    assert_eq!(contract.status, ContractStatus::Active);
    assert_eq!(contract.schema[0].properties[0].logical_type, "integer");
    assert_eq!(contract.schema[0].properties[1].logical_type, "number");

    let by_contract = s.products.list_by_contract(&contract_id).await.unwrap();
    assert_eq!(by_contract.len(), 1);
    assert_eq!(by_contract[0].id, product_id);

    let log = env.change_log();
    assert_eq!(log.actions_for(&domain_id), vec!["create"]);
    assert_eq!(
        log.actions_for(&contract_id),
        vec!["create", "status.proposed", "status.active"]
    );
    assert_eq!(log.actions_for(&product_id), vec!["create", "status.candidate"]);
}

#[tokio::test]
async fn test_referenced_contract_and_parent_domain_are_protected() {
    let env = TestSteward::new().await.unwrap();
    let (domain_id, contract_id, product_id) = publish_orders(&env).await;
    let s = env.steward();
    let steward = steward_user();

    assert!(matches!(
        s.contracts.delete(&contract_id, &steward).await,
        Err(StewardError::ConflictError(_))
    ));

    s.domains
        .create(
            DataDomainRequest {
                name: "Sales EMEA".to_string(),
                parent_id: Some(domain_id.clone()),
                ..Default::default()
            },
            &steward,
        )
        .await
        .unwrap();
    assert!(matches!(
        s.domains.delete(&domain_id, &steward).await,
        Err(StewardError::ConflictError(_))
    ));

    s.products.delete(&product_id, &steward).await.unwrap();
    s.contracts.delete(&contract_id, &steward).await.unwrap();
    assert!(s.contracts.get(&contract_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_contract_new_version_is_independent_draft() {
    let env = TestSteward::new().await.unwrap();
    let (_domain_id, contract_id, _product_id) = publish_orders(&env).await;
    let s = env.steward();
    let producer = producer_user();

    let v2 = s
        .contracts
        .new_version(&contract_id, "2.0.0", &producer)
        .await
        .unwrap();
    assert_eq!(v2.status, ContractStatus::Draft);
    assert_eq!(v2.parent_contract_id.as_deref(), Some(contract_id.as_str()));

    let v1 = s.contracts.get(&contract_id).await.unwrap().unwrap();
    assert_eq!(v1.status, ContractStatus::Active);
}

// ============================================================================
// Search
// ============================================================================

#[tokio::test]
async fn test_search_spans_sources_and_respects_permissions() {
    let env = TestSteward::new().await.unwrap();
    publish_orders(&env).await;
    let s = env.steward();

    s.projects
        .create(
            ProjectRequest {
                name: "orders-migration".to_string(),
                title: Some("Orders Migration".to_string()),
                project_type: ProjectType::Team,
                ..Default::default()
            },
            &producer_user(),
        )
        .await
        .unwrap();
    s.ontology()
        .insert(OntologyConcept {
            iri: "https://ontology.example.com/Order".to_string(),
            label: "Order".to_string(),
            description: Some("A customer purchase".to_string()),
            parent_iris: vec![],
        })
        .unwrap();

    // Domain + contract + product + project + concept
    assert_eq!(s.search.build_index().await.unwrap(), 5);

    let admin_hits = s.search.search("order", &admin_user()).await.unwrap();
    let types: Vec<&str> = admin_hits.iter().map(|h| h.item.item_type.as_str()).collect();
    assert_eq!(admin_hits[0].item.title, "Order");
    assert!(types.contains(&"data-contract"));
    assert!(types.contains(&"data-product"));
    assert!(types.contains(&"project"));
    assert!(types.contains(&"ontology-concept"));

    // Exact domain title outranks tag matches
    let sales_hits = s.search.search("sales", &consumer_user()).await.unwrap();
    assert_eq!(sales_hits[0].item.item_type, "data-domain");

    let nobody = TestUser::new("nobody").group("visitors").build();
    assert!(s.search.search("order", &nobody).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_role_override_narrows_search() {
    let env = TestSteward::new().await.unwrap();
    publish_orders(&env).await;
    let s = env.steward();
    s.search.build_index().await.unwrap();

    let admin = admin_user();
    let before = s.search.search("orders", &admin).await.unwrap().len();
    assert!(before >= 2);

    let roles = s.authz.list_roles().await.unwrap();
    let producer_role = roles.iter().find(|r| r.name == "Data Producer").unwrap();
    let mut narrowed = producer_role.clone();
    narrowed
        .feature_permissions
        .insert(features::DATA_CONTRACTS.to_string(), FeatureAccessLevel::None);
    let narrow_role = s
        .authz
        .create_role(
            steward_services::authorization::AppRoleRequest {
                name: "Products Only".to_string(),
                description: None,
                assigned_groups: vec![],
                feature_permissions: narrowed.feature_permissions,
            },
            &admin,
        )
        .await
        .unwrap();

    s.authz
        .set_role_override(&admin.username, &narrow_role.id)
        .await
        .unwrap();
    let hits = s.search.search("orders", &admin).await.unwrap();
    assert!(hits.iter().all(|h| h.item.feature_id != features::DATA_CONTRACTS));
    assert!(hits.len() < before);

    s.authz.clear_role_override(&admin.username);
    assert_eq!(s.search.search("orders", &admin).await.unwrap().len(), before);
}

// ============================================================================
// Attachments
// ============================================================================

#[tokio::test]
async fn test_attachments_on_a_product() {
    let env = TestSteward::new().await.unwrap();
    let (_domain_id, _contract_id, product_id) = publish_orders(&env).await;
    let s = env.steward();
    let producer = producer_user();
    let consumer = consumer_user();

    // Comments scoped to an audience
    s.comments
        .create_comment(
            EntityType::DataProduct,
            &product_id,
            CommentRequest {
                title: None,
                comment: "Public note".to_string(),
                audience: None,
            },
            &producer,
        )
        .await
        .unwrap();
    s.comments
        .create_comment(
            EntityType::DataProduct,
            &product_id,
            CommentRequest {
                title: Some("Internal".to_string()),
                comment: "Producers only".to_string(),
                audience: Some(vec!["data-producers".to_string()]),
            },
            &producer,
        )
        .await
        .unwrap();
    assert_eq!(
        s.comments
            .count_comments(EntityType::DataProduct, &product_id, &consumer)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        s.comments
            .count_comments(EntityType::DataProduct, &product_id, &producer)
            .await
            .unwrap(),
        2
    );

    // Link metadata
    let link = s
        .metadata
        .create_link(
            EntityType::DataProduct,
            &product_id,
            LinkRequest {
                title: "Dashboard".to_string(),
                short_description: None,
                url: "https://bi.example.com/orders".to_string(),
            },
            &producer,
        )
        .await
        .unwrap();
    assert_eq!(
        s.metadata
            .list_links(EntityType::DataProduct, &product_id)
            .await
            .unwrap()
            .len(),
        1
    );
    s.metadata
        .delete(MetadataKind::Link, &link.id, &producer)
        .await
        .unwrap();

    // Semantic link
    s.semantic_links
        .add(
            EntityType::DataProduct,
            &product_id,
            "https://ontology.example.com/Order",
            Some("Order"),
            &producer,
        )
        .await
        .unwrap();
    assert!(matches!(
        s.semantic_links
            .add(
                EntityType::DataProduct,
                &product_id,
                "https://ontology.example.com/Order",
                None,
                &producer,
            )
            .await,
        Err(StewardError::ConflictError(_))
    ));
    assert_eq!(
        s.semantic_links
            .list_for_iri("https://ontology.example.com/Order")
            .await
            .unwrap()
            .len(),
        1
    );

    // Costs in two currencies
    for (center, cents, currency) in [
        (CostCenter::Infrastructure, 120_00, "USD"),
        (CostCenter::Storage, 30_00, "USD"),
        (CostCenter::License, 50_00, "EUR"),
    ] {
        s.costs
            .create(
                EntityType::DataProduct,
                &product_id,
                CostItemRequest {
                    title: format!("{} spend", center),
                    description: None,
                    cost_center: center,
                    custom_center_name: None,
                    amount_cents: cents,
                    currency: currency.to_string(),
                    start_month: "2024-01".to_string(),
                    end_month: None,
                },
                &producer,
            )
            .await
            .unwrap();
    }
    let summary = s
        .costs
        .summarize(EntityType::DataProduct, &product_id, "2024-06")
        .await
        .unwrap();
    assert_eq!(summary.len(), 2);
    assert_eq!(summary[0].currency, "EUR");
    assert_eq!(summary[1].total_cents, 150_00);

    let actions = env.change_log().actions_for(&product_id);
    for expected in [
        "comment.create",
        "metadata.link.create",
        "metadata.link.delete",
        "semantic_link.add",
        "cost.create",
    ] {
        assert!(
            actions.iter().any(|a| a == expected),
            "missing {} in {:?}",
            expected,
            actions
        );
    }
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_open_is_idempotent_on_existing_store() {
    let env = TestSteward::with_config(|mut config| {
        config.admin_groups = vec!["platform-admins".to_string()];
        config
    })
    .await
    .unwrap();
    let s = env.steward();

    let roles = s.authz.list_roles().await.unwrap();
    assert_eq!(roles.len(), 4);
    let admin_role = roles.iter().find(|r| r.name == "Admin").unwrap();
    assert_eq!(admin_role.assigned_groups, vec!["platform-admins"]);

    // Seeding again is a no-op
    assert_eq!(s.authz.ensure_default_roles().await.unwrap(), 0);

    let platform_admin = TestUser::new("ops").group("platform-admins").build();
    assert!(s
        .authz
        .check_permission(&platform_admin, features::SETTINGS, FeatureAccessLevel::Admin)
        .await
        .is_ok());
    assert!(matches!(
        s.authz
            .check_permission(&admin_user(), features::SETTINGS, FeatureAccessLevel::ReadOnly)
            .await,
        Err(StewardError::Forbidden(_))
    ));
}
