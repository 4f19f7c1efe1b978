use gearflow::config::Config;
use gearflow::db::{self, Stores};
use gearflow::error::PipelineError;
use gearflow::models::{
    AuthorityCategory, ConfidenceLevel, KindLabel, NewStep, ResearchSource, SessionStatus,
    Validation, ValidationIssue,
};
use tempfile::TempDir;

fn test_config(tmp: &TempDir, extra: &str) -> Config {
    let config_content = format!(
        r#"[db]
path = "{}/data/gearflow.sqlite"

{}
"#,
        tmp.path().display(),
        extra
    );
    toml::from_str(&config_content).unwrap()
}

fn step(
    research_id: &str,
    discovery_id: &str,
    url: &str,
    fields: &[&str],
    confidence: ConfidenceLevel,
) -> NewStep {
    NewStep {
        research_id: research_id.to_string(),
        discovery_id: discovery_id.to_string(),
        kind: Some(KindLabel::Product),
        researcher: Some("tester".to_string()),
        source: ResearchSource::new(
            url,
            AuthorityCategory::Retailer,
            fields.iter().copied(),
            confidence,
        ),
    }
}

#[tokio::test]
async fn scores_do_not_depend_on_step_order() {
    let tmp = TempDir::new().unwrap();
    let stores = Stores::open(&test_config(&tmp, "")).await.unwrap();

    let a = ("https://a.example.com", &["weight", "price"][..], ConfidenceLevel::Corroborated);
    let b = ("https://b.example.com", &["price"][..], ConfidenceLevel::Verified);

    for (url, fields, confidence) in [a, b] {
        stores
            .ledger
            .log_step(step("forward", "d1", url, fields, confidence))
            .await
            .unwrap();
    }
    for (url, fields, confidence) in [b, a] {
        stores
            .ledger
            .log_step(step("reverse", "d2", url, fields, confidence))
            .await
            .unwrap();
    }

    let forward = stores.ledger.complete("forward").await.unwrap();
    let reverse = stores.ledger.complete("reverse").await.unwrap();

    assert_eq!(forward.completeness, reverse.completeness);
    assert_eq!(forward.overall_confidence, ConfidenceLevel::Verified);
    assert_eq!(reverse.overall_confidence, ConfidenceLevel::Verified);
    assert_eq!(forward.fields_found, reverse.fields_found);
    assert!((forward.completeness - 2.0 / 7.0).abs() < 1e-9);
}

#[tokio::test]
async fn validation_itemizes_the_failed_criterion() {
    let tmp = TempDir::new().unwrap();
    let extra = r#"
[research.required_fields]
product = ["f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9", "f10"]
"#;
    let stores = Stores::open(&test_config(&tmp, extra)).await.unwrap();

    let nine = ["f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9"];
    stores
        .ledger
        .log_step(step("weak", "d1", "https://forum.example.com", &nine, ConfidenceLevel::Reported))
        .await
        .unwrap();
    let six = ["f1", "f2", "f3", "f4", "f5", "f6"];
    stores
        .ledger
        .log_step(step("thin", "d2", "https://maker.example.com", &six, ConfidenceLevel::Verified))
        .await
        .unwrap();

    let weak = stores.ledger.complete("weak").await.unwrap();
    assert!((weak.completeness - 0.9).abs() < 1e-9);
    match stores.ledger.validate("weak").await.unwrap() {
        Validation::Invalid { reasons } => {
            assert_eq!(
                reasons,
                vec![ValidationIssue::LowConfidence {
                    found: ConfidenceLevel::Reported
                }]
            );
        }
        other => panic!("expected invalid, got {:?}", other),
    }

    let thin = stores.ledger.complete("thin").await.unwrap();
    assert!((thin.completeness - 0.6).abs() < 1e-9);
    match stores.ledger.validate("thin").await.unwrap() {
        Validation::Invalid { reasons } => {
            assert_eq!(reasons.len(), 1);
            assert!(matches!(reasons[0], ValidationIssue::LowCompleteness { .. }));
        }
        other => panic!("expected invalid, got {:?}", other),
    }
}

#[tokio::test]
async fn sessions_must_be_completed_before_validation() {
    let tmp = TempDir::new().unwrap();
    let stores = Stores::open(&test_config(&tmp, "")).await.unwrap();

    assert!(matches!(
        stores.ledger.validate("nope").await,
        Err(PipelineError::SessionNotFound(_))
    ));
    assert!(matches!(
        stores.ledger.complete("nope").await,
        Err(PipelineError::NoStepsLogged(_))
    ));

    stores
        .ledger
        .log_step(step("open", "d1", "https://x.example.com", &["name"], ConfidenceLevel::Verified))
        .await
        .unwrap();
    assert!(matches!(
        stores.ledger.validate("open").await,
        Err(PipelineError::NotCompleted(_))
    ));
}

#[tokio::test]
async fn completed_sessions_accept_no_more_steps() {
    let tmp = TempDir::new().unwrap();
    let stores = Stores::open(&test_config(&tmp, "")).await.unwrap();

    stores
        .ledger
        .log_step(step("r1", "d1", "https://x.example.com", &["name"], ConfidenceLevel::Verified))
        .await
        .unwrap();
    let first = stores.ledger.complete("r1").await.unwrap();

    let late = stores
        .ledger
        .log_step(step("r1", "d1", "https://y.example.com", &["price"], ConfidenceLevel::Verified))
        .await;
    assert!(matches!(late, Err(PipelineError::SessionClosed(_))));

    // Completing again returns the stored result unchanged.
    let again = stores.ledger.complete("r1").await.unwrap();
    assert_eq!(again, first);

    let session = stores.ledger.session("r1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.steps.len(), 1);
}

#[tokio::test]
async fn research_ids_belong_to_one_discovery() {
    let tmp = TempDir::new().unwrap();
    let stores = Stores::open(&test_config(&tmp, "")).await.unwrap();

    stores
        .ledger
        .log_step(step("r1", "d1", "https://x.example.com", &["name"], ConfidenceLevel::Reported))
        .await
        .unwrap();
    let err = stores
        .ledger
        .log_step(step("r1", "d2", "https://x.example.com", &["name"], ConfidenceLevel::Reported))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ResearchMismatch { .. }));
}

#[tokio::test]
async fn retrieve_returns_every_session_with_steps() {
    let tmp = TempDir::new().unwrap();
    let stores = Stores::open(&test_config(&tmp, "")).await.unwrap();

    for (research_id, url) in [("r1", "https://a.example.com"), ("r1", "https://b.example.com"), ("r2", "https://c.example.com")] {
        stores
            .ledger
            .log_step(step(research_id, "d1", url, &["name"], ConfidenceLevel::Reported))
            .await
            .unwrap();
    }

    let sessions = stores.ledger.retrieve("d1").await.unwrap();
    assert_eq!(sessions.len(), 2);
    let r1 = sessions.iter().find(|s| s.research_id == "r1").unwrap();
    let urls: Vec<&str> = r1.steps.iter().map(|s| s.source.url.as_str()).collect();
    assert_eq!(urls, vec!["https://a.example.com", "https://b.example.com"]);
    assert!(stores.ledger.retrieve("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn payload_is_attached_only_to_valid_sessions() {
    let tmp = TempDir::new().unwrap();
    let extra = r#"
[research.required_fields]
product = ["name", "price"]
"#;
    let stores = Stores::open(&test_config(&tmp, extra)).await.unwrap();

    stores
        .ledger
        .log_step(step("weak", "d1", "https://x.example.com", &["name"], ConfidenceLevel::Verified))
        .await
        .unwrap();
    stores.ledger.complete("weak").await.unwrap();
    let rejected = stores.ledger.attach_payload("weak", "CREATE (p)").await.unwrap();
    assert!(!rejected.is_valid());
    assert!(stores.ledger.ready_payload("d1").await.unwrap().is_none());

    stores
        .ledger
        .log_step(step("good", "d1", "https://y.example.com", &["name", "price"], ConfidenceLevel::Corroborated))
        .await
        .unwrap();
    stores.ledger.complete("good").await.unwrap();
    assert!(stores
        .ledger
        .attach_payload("good", "CREATE (p:Product)")
        .await
        .unwrap()
        .is_valid());

    let ready = stores.ledger.ready_payload("d1").await.unwrap().unwrap();
    assert_eq!(ready.research_id, "good");
    assert_eq!(ready.payload, "CREATE (p:Product)");

    let counts = stores.ledger.counts().await.unwrap();
    assert_eq!(counts.sessions, 2);
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.ready_for_load, 1);
    assert_eq!(counts.steps, 2);
}

#[tokio::test]
async fn steps_are_append_only() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();

    let logged = stores
        .ledger
        .log_step(step("r1", "d1", "https://x.example.com", &["name"], ConfidenceLevel::Reported))
        .await
        .unwrap();

    let pool = db::connect(&config).await.unwrap();
    let update = sqlx::query("UPDATE research_steps SET confidence = 'verified' WHERE step_id = ?")
        .bind(logged.step_id)
        .execute(&pool)
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM research_steps WHERE step_id = ?")
        .bind(logged.step_id)
        .execute(&pool)
        .await;
    assert!(delete.is_err());

    assert!(stores.ledger.verify_integrity("r1").await.unwrap().is_empty());
}

#[tokio::test]
async fn integrity_check_finds_edited_steps() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();

    let kept = stores
        .ledger
        .log_step(step("r1", "d1", "https://x.example.com", &["name"], ConfidenceLevel::Reported))
        .await
        .unwrap();
    let edited = stores
        .ledger
        .log_step(step("r1", "d1", "https://y.example.com", &["price"], ConfidenceLevel::Reported))
        .await
        .unwrap();

    // Simulate tampering below the ledger by lifting the guard.
    let pool = db::connect(&config).await.unwrap();
    sqlx::query("DROP TRIGGER research_steps_no_update")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE research_steps SET confidence = 'verified' WHERE step_id = ?")
        .bind(edited.step_id)
        .execute(&pool)
        .await
        .unwrap();

    let tampered = stores.ledger.verify_integrity("r1").await.unwrap();
    assert_eq!(tampered, vec![edited.step_id]);
    assert!(!tampered.contains(&kept.step_id));

    assert!(matches!(
        stores.ledger.verify_integrity("missing").await,
        Err(PipelineError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_logging_is_not_lost() {
    let tmp = TempDir::new().unwrap();
    let stores = Stores::open(&test_config(&tmp, "")).await.unwrap();

    let fields = ["name", "brand", "weight", "price", "productUrl", "imageUrl", "type"];
    let mut handles = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        let stores = stores.clone();
        let field = field.to_string();
        handles.push(tokio::spawn(async move {
            stores
                .ledger
                .log_step(step(
                    "shared",
                    "d1",
                    &format!("https://s{}.example.com", i),
                    &[field.as_str()],
                    ConfidenceLevel::Corroborated,
                ))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let report = stores.ledger.complete("shared").await.unwrap();
    assert_eq!(report.step_count, 7);
    assert!((report.completeness - 1.0).abs() < 1e-9);
    assert!(report.missing_fields.is_empty());
    assert!(stores.ledger.validate("shared").await.unwrap().is_valid());
}
