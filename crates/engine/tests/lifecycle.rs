//! Close, archive and reopen

mod support;

use lumen_common::*;
use lumen_engine::Archiver;
use support::*;

fn site() -> FakeSite {
    FakeSite::new()
        .page(
            "/",
            FakePage::scanning(scan(
                vec![rule("image-alt", &["html > body > main > img"])],
                vec![],
                vec![rule("link-name", &["html > body > nav > a"])],
            )),
        )
        .page(
            "/docs",
            FakePage::scanning(scan(vec![rule("image-alt", &["html > body > img"])], vec![], vec![])),
        )
}

fn sorted_targets(h: &Harness, run_id: &str) -> Vec<Target> {
    let mut targets = h.lumen.db().list_targets(run_id).unwrap();
    targets.sort_by(|a, b| a.id.cmp(&b.id));
    targets
}

#[tokio::test]
async fn close_then_reopen_restores_every_row() {
    let h = Harness::new(site());
    let (run, status) = h.execute(&["/", "/docs"]).await;
    assert_eq!(status, RunStatus::TestCompleted);

    let db = h.lumen.db();
    let pages_before = db.list_run_pages(&run.id).unwrap();
    let cases_before = db.count_cases(&run.id).unwrap();
    let targets_before = sorted_targets(&h, &run.id);
    assert_eq!(targets_before.len(), 3);

    let closed = h.lumen.close_test(&run.id).unwrap();
    assert_eq!(closed.status, RunStatus::Closed);
    assert!(h.lumen.is_archived(&run.id).unwrap());
    assert_eq!(db.count_targets(&run.id).unwrap(), 0);
    assert_eq!(db.count_cases(&run.id).unwrap(), 0);
    assert!(db.list_run_pages(&run.id).unwrap().is_empty());
    // The header stays listed
    assert!(db.list_runs(Some(&h.env.id)).unwrap().iter().any(|r| r.id == run.id));

    let reopened = h.lumen.reopen_test(&run.id).unwrap();
    assert_eq!(reopened.status, RunStatus::TestCompleted);
    assert!(!h.lumen.is_archived(&run.id).unwrap());
    assert_eq!(db.list_run_pages(&run.id).unwrap(), pages_before);
    assert_eq!(db.count_cases(&run.id).unwrap(), cases_before);
    assert_eq!(sorted_targets(&h, &run.id), targets_before);
}

#[tokio::test]
async fn archiving_twice_is_a_no_op() {
    let h = Harness::new(site());
    let (run, _) = h.execute(&["/"]).await;

    let archiver = Archiver::new(h.lumen.db().clone(), h.lumen.config().archive_dir(), 100);
    assert!(archiver.archive(&run.id).unwrap());
    assert!(!archiver.archive(&run.id).unwrap());
    assert!(archiver.is_archived(&run.id).unwrap());

    // The second call must not have replaced the snapshot with an empty one
    assert_eq!(archiver.unarchive(&run.id).unwrap(), Some(RunStatus::TestCompleted));
    assert_eq!(h.lumen.db().count_targets(&run.id).unwrap(), 2);
}

#[tokio::test]
async fn closing_twice_keeps_the_first_snapshot() {
    let h = Harness::new(site());
    let (run, _) = h.execute(&["/"]).await;

    h.lumen.close_test(&run.id).unwrap();
    let again = h.lumen.close_test(&run.id).unwrap();
    assert_eq!(again.status, RunStatus::Closed);

    h.lumen.reopen_test(&run.id).unwrap();
    assert_eq!(h.lumen.db().count_targets(&run.id).unwrap(), 2);
}

#[test]
fn executing_run_cannot_be_closed() {
    let h = Harness::new(site());
    let run = h.create_run(&["/"]);
    h.lumen
        .db()
        .mark_run_started(&run.id, RunStatus::InProgress, now())
        .unwrap();

    assert!(matches!(
        h.lumen.close_test(&run.id),
        Err(Error::InvalidStateTransition { .. })
    ));
    assert!(!h.lumen.is_archived(&run.id).unwrap());
}

#[test]
fn only_closed_runs_reopen() {
    let h = Harness::new(site());
    let run = h.create_run(&["/"]);
    assert!(matches!(
        h.lumen.reopen_test(&run.id),
        Err(Error::InvalidStateTransition { .. })
    ));
}

#[test]
fn reopen_without_snapshot_starts_over() {
    let h = Harness::new(site());
    let run = h.create_run(&["/"]);
    h.lumen.close_test(&run.id).unwrap();

    let archiver = Archiver::new(h.lumen.db().clone(), h.lumen.config().archive_dir(), 100);
    std::fs::remove_file(archiver.snapshot_path(&run.id).unwrap()).unwrap();

    let reopened = h.lumen.reopen_test(&run.id).unwrap();
    assert_eq!(reopened.status, RunStatus::Opened);
}

#[test]
fn new_test_orders_structured_before_random_pages() {
    let h = Harness::new(site());
    let pages = h.pages(&["/", "/a", "/b", "/c", "/d"]);
    let run = h
        .lumen
        .create_test(lumen_engine::NewTest {
            environment_id: h.env.id.clone(),
            name: "sampled".into(),
            structured_page_ids: vec![pages["/c"].id.clone(), pages["/"].id.clone()],
            random_count: 2,
            notes: Some("weekly".into()),
        })
        .unwrap();
    assert_eq!(run.status, RunStatus::Opened);

    let links = h.lumen.db().list_run_pages(&run.id).unwrap();
    assert_eq!(links.len(), 4);
    assert_eq!(links[0].page_id, pages["/c"].id);
    assert_eq!(links[1].page_id, pages["/"].id);
    assert!(links[..2].iter().all(|l| l.role == PageRole::Structured));
    assert!(links[2..].iter().all(|l| l.role == PageRole::Random));
    assert_ne!(links[2].page_id, links[3].page_id);
    assert!(links[2..]
        .iter()
        .all(|l| l.page_id != pages["/c"].id && l.page_id != pages["/"].id));

    // Two automatic cases per page
    assert_eq!(h.lumen.db().count_cases(&run.id).unwrap(), 8);
}

#[test]
fn new_test_validation_reports_each_field() {
    let h = Harness::new(site());
    let pages = h.pages(&["/docs/guide"]);
    let err = h
        .lumen
        .create_test(lumen_engine::NewTest {
            environment_id: h.env.id.clone(),
            name: "  ".into(),
            structured_page_ids: vec![pages["/docs"].id.clone()],
            random_count: 5,
            notes: None,
        })
        .unwrap_err();

    let fields: Vec<&str> = err.field_errors().iter().map(|f| f.field.as_str()).collect();
    assert!(fields.contains(&"name"));
    assert!(fields.contains(&"structured_page_ids"));
    assert!(fields.contains(&"random_count"));
}

#[test]
fn duplicate_environment_names_are_rejected() {
    let h = Harness::new(site());
    let err = h.lumen.add_environment("shop", "https://shop.example.com").unwrap_err();
    assert_eq!(err.field_errors()[0].field, "name");

    let err = h.lumen.add_environment("blog", "ftp://example.com").unwrap_err();
    assert_eq!(err.field_errors()[0].field, "base_url");
}
