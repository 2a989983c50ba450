//! Page execution end to end against a scripted browser

mod support;

use lumen_common::*;
use lumen_engine::{Outcome, RunEvent, TargetUpdate};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use support::*;

fn page_statuses(h: &Harness, run_id: &str) -> HashMap<String, PageRunStatus> {
    let pages = h.pages(&[]);
    let by_id: HashMap<&String, &String> = pages.values().map(|p| (&p.id, &p.path)).collect();
    h.lumen
        .db()
        .list_run_pages(run_id)
        .unwrap()
        .into_iter()
        .map(|link| (by_id[&link.page_id].to_string(), link.status))
        .collect()
}

fn case_status(h: &Harness, run_id: &str, path: &str, test_case_id: &str) -> TestStatus {
    h.cases_by_page(run_id, path)
        .into_iter()
        .find(|c| c.test_case_id == test_case_id)
        .map(|c| c.status)
        .unwrap()
}

#[tokio::test]
async fn violation_outranks_pass_for_the_same_rule() {
    let img = "html > body > img";
    let h = Harness::new(FakeSite::new().page(
        "/",
        FakePage::scanning(scan(
            vec![rule("image-alt", &[img])],
            vec![],
            vec![rule("image-alt", &[img, "html > body > img:nth-of-type(2)"])],
        )),
    ));

    let (run, status) = h.execute(&["/"]).await;
    assert_eq!(status, RunStatus::TestCompleted);
    assert_eq!(case_status(&h, &run.id, "/", "tc-alt"), TestStatus::Fail);
    // No rule of the link case was reported
    assert_eq!(case_status(&h, &run.id, "/", "tc-links"), TestStatus::Incomplete);

    let targets = h.lumen.db().list_targets(&run.id).unwrap();
    assert_eq!(targets.len(), 2);
    let failing = targets.iter().find(|t| t.selector == img).unwrap();
    assert_eq!(failing.status, TestStatus::Fail);
    assert_eq!(failing.remediation_id.as_deref(), Some("rem-alt"));
    let passing = targets.iter().find(|t| t.selector != img).unwrap();
    assert_eq!(passing.status, TestStatus::Pass);
    assert_eq!(passing.remediation_id, None);
}

#[tokio::test]
async fn timed_out_page_is_marked_error_and_the_run_continues() {
    let site = FakeSite::new()
        .page("/", FakePage::scanning(scan(vec![], vec![], vec![rule("image-alt", &["html > body > img"])])))
        .page("/slow", FakePage::hanging())
        .page("/about", FakePage::default());
    let h = Harness::new(site);

    let (run, status) = h.execute(&["/", "/slow", "/about"]).await;
    assert_eq!(status, RunStatus::TestCompleted);

    let pages = page_statuses(&h, &run.id);
    assert_eq!(pages["/"], PageRunStatus::Success);
    assert_eq!(pages["/slow"], PageRunStatus::Error);
    assert_eq!(pages["/about"], PageRunStatus::Success);

    for case in h.cases_by_page(&run.id, "/slow") {
        assert_eq!(case.status, TestStatus::Error);
        assert!(case.ended_at.is_some());
    }
    assert_eq!(case_status(&h, &run.id, "/", "tc-alt"), TestStatus::Pass);

    // The abandoned surface is replaced for the next page
    assert_eq!(h.surfaces.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn run_fails_only_when_every_page_times_out() {
    let h = Harness::new(
        FakeSite::new()
            .page("/a", FakePage::hanging())
            .page("/b", FakePage::hanging()),
    );
    let (run, status) = h.execute(&["/a", "/b"]).await;
    assert_eq!(status, RunStatus::Failed);

    let stored = h.lumen.db().require_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.ended_at.is_some());
}

#[tokio::test]
async fn failed_run_can_be_started_again() {
    let h = Harness::new(FakeSite::new().page("/a", FakePage::hanging()));
    let (run, status) = h.execute(&["/a"]).await;
    assert_eq!(status, RunStatus::Failed);

    let handle = h.lumen.start_test(&run.id).unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), RunStatus::Failed);
}

#[tokio::test]
async fn retried_run_scans_its_pages_again() {
    let img = "html > body > img";
    let h = Harness::new(FakeSite::new().page("/a", FakePage::hanging()));
    let (run, status) = h.execute(&["/a"]).await;
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(case_status(&h, &run.id, "/a", "tc-alt"), TestStatus::Error);

    h.surfaces.serve(FakeSite::new().page(
        "/a",
        FakePage::scanning(scan(vec![rule("image-alt", &[img])], vec![], vec![])),
    ));
    let started = h.lumen.start_test(&run.id).unwrap();
    let stored = h.lumen.db().require_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::InProgress);
    assert!(stored.ended_at.is_none());

    assert_eq!(started.await.unwrap().unwrap(), RunStatus::TestCompleted);
    assert_eq!(page_statuses(&h, &run.id)["/a"], PageRunStatus::Success);
    assert_eq!(case_status(&h, &run.id, "/a", "tc-alt"), TestStatus::Fail);
    assert_eq!(case_status(&h, &run.id, "/a", "tc-links"), TestStatus::Incomplete);

    let targets = h.lumen.db().list_targets(&run.id).unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].selector, img);
    assert_eq!(targets[0].status, TestStatus::Fail);
}

#[tokio::test]
async fn retry_keeps_manual_cases_manual() {
    let h = Harness::with_catalog(FakeSite::new().page("/", FakePage::hanging()), manual_catalog());
    let (run, status) = h.execute(&["/"]).await;
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(case_status(&h, &run.id, "/", "tc-skip-link"), TestStatus::Manual);

    h.surfaces.serve(manual_site(&["/"]));
    let status = h.lumen.start_test(&run.id).unwrap().await.unwrap().unwrap();
    assert_eq!(status, RunStatus::TestFailed);
    assert_eq!(case_status(&h, &run.id, "/", "tc-alt"), TestStatus::Incomplete);
    assert_eq!(case_status(&h, &run.id, "/", "tc-skip-link"), TestStatus::Manual);
    assert_eq!(h.lumen.db().list_targets(&run.id).unwrap().len(), 1);
}

#[tokio::test]
async fn executor_error_settles_the_run_as_failed() {
    let h = Harness::new(FakeSite::new().page("/", FakePage::default()));
    let run = h.create_run(&["/"]);
    h.lumen
        .db()
        .transaction(|tx| Ok(tx.execute_batch("DROP TABLE remediation_categories")?))
        .unwrap();
    let mut events = h.lumen.subscribe();

    let result = h.lumen.start_test(&run.id).unwrap().await.unwrap();
    assert!(result.is_err());

    let stored = h.lumen.db().require_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.ended_at.is_some());
    assert!(matches!(
        events.try_recv().unwrap(),
        RunEvent::Run { outcome: Outcome::Error, status: RunStatus::Failed, .. }
    ));

    let closed = h.lumen.close_test(&run.id).unwrap();
    assert_eq!(closed.status, RunStatus::Closed);
}

#[tokio::test]
async fn pages_under_a_base_path_load_at_their_own_url() {
    let h = Harness::build_at(
        FakeSite::new().page("/app/x", FakePage::default()),
        MapFetcher::new(),
        default_catalog(),
        "https://example.com/app",
    );

    let (run, status) = h.execute(&["/app/x"]).await;
    assert_eq!(status, RunStatus::TestCompleted);
    assert_eq!(page_statuses(&h, &run.id)["/app/x"], PageRunStatus::Success);
    assert_eq!(case_status(&h, &run.id, "/app/x", "tc-alt"), TestStatus::Incomplete);
}

#[tokio::test]
async fn finished_run_cannot_be_started_again() {
    let h = Harness::new(FakeSite::new().page("/", FakePage::default()));
    let (run, status) = h.execute(&["/"]).await;
    assert_eq!(status, RunStatus::TestCompleted);

    assert!(matches!(
        h.lumen.start_test(&run.id),
        Err(Error::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn nav_target_is_the_landmark_of_its_links() {
    let nav = "html > body > nav";
    let link = "html > body > nav > ul > li > a";
    let h = Harness::new(FakeSite::new().page(
        "/",
        FakePage::scanning(scan(vec![rule("link-name", &[nav, link])], vec![], vec![])),
    ));

    let (run, _) = h.execute(&["/"]).await;
    let targets = h.lumen.db().list_targets(&run.id).unwrap();
    let nav_target = targets.iter().find(|t| t.selector == nav).unwrap();
    let link_target = targets.iter().find(|t| t.selector == link).unwrap();

    assert_eq!(nav_target.landmark_id.as_deref(), Some("LANDMARK_NAV"));
    assert_eq!(nav_target.parent_landmark_id, None);
    assert_eq!(link_target.landmark_id, None);
    assert_eq!(link_target.parent_landmark_id.as_deref(), Some(nav_target.id.as_str()));
}

fn manual_site(paths: &[&str]) -> FakeSite {
    paths.iter().fold(FakeSite::new(), |site, path| {
        let mut page = FakePage::default();
        page.elements.insert(
            "a.skip".into(),
            vec![("html > body > a".into(), "<a class=\"skip\" href=\"#main\">".into())],
        );
        site.page(path, page)
    })
}

fn manual_catalog() -> Catalog {
    catalog(vec![
        automatic("tc-alt", &["image-alt"], &["rem-alt"]),
        manual("tc-skip-link", &["a.skip"]),
    ])
}

fn set_status(status: &str, propagate: bool) -> TargetUpdate {
    TargetUpdate {
        status: Some(status.into()),
        propagate,
        ..Default::default()
    }
}

#[tokio::test]
async fn reviewing_the_last_manual_target_completes_the_run() {
    let h = Harness::with_catalog(manual_site(&["/"]), manual_catalog());
    let (run, status) = h.execute(&["/"]).await;
    assert_eq!(status, RunStatus::TestFailed);
    assert_eq!(case_status(&h, &run.id, "/", "tc-skip-link"), TestStatus::Manual);

    let targets = h.lumen.db().list_targets(&run.id).unwrap();
    assert_eq!(targets.len(), 1);
    let target = &targets[0];
    assert_eq!(target.status, TestStatus::Manual);
    assert_eq!(target.rule_id, "manual");
    assert_eq!(target.selector, "html > body > a");

    let done = h.lumen.update_target(&target.id, set_status("PASS", false)).unwrap();
    assert_eq!(done.run_status, RunStatus::Completed);

    let reverted = h.lumen.update_target(&target.id, set_status("MANUAL", false)).unwrap();
    assert_eq!(reverted.run_status, RunStatus::InProgress);

    let again = h.lumen.update_target(&target.id, set_status("fail", false)).unwrap();
    assert_eq!(again.run_status, RunStatus::Completed);
    assert_eq!(again.targets[0].status, TestStatus::Fail);
}

#[tokio::test]
async fn propagated_review_covers_every_occurrence() {
    let h = Harness::with_catalog(manual_site(&["/", "/b"]), manual_catalog());
    let (run, status) = h.execute(&["/", "/b"]).await;
    assert_eq!(status, RunStatus::TestFailed);

    let targets = h.lumen.db().list_targets(&run.id).unwrap();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].occurrence_key, targets[1].occurrence_key);
    assert!(targets.iter().all(|t| t.status_occurrences == 2));

    let single = h.lumen.update_target(&targets[0].id, set_status("PASS", false)).unwrap();
    assert_eq!(single.targets.len(), 1);
    assert_eq!(single.run_status, RunStatus::TestFailed);
    let split = h.lumen.db().get_target(&targets[1].id).unwrap().unwrap();
    assert_eq!(split.status_occurrences, 1);

    let update = TargetUpdate {
        status: Some("PASS".into()),
        remediation_id: Some("rem-alt".into()),
        notes: Some("decorative".into()),
        propagate: true,
    };
    let all = h.lumen.update_target(&targets[1].id, update).unwrap();
    assert_eq!(all.targets.len(), 2);
    assert_eq!(all.run_status, RunStatus::Completed);
    for t in &all.targets {
        assert_eq!(t.status, TestStatus::Pass);
        assert_eq!(t.remediation_id.as_deref(), Some("rem-alt"));
        assert_eq!(t.status_occurrences, 2);
        assert_eq!(t.remediation_occurrences, 2);
    }
}

#[tokio::test]
async fn invalid_reviews_are_rejected() {
    let h = Harness::with_catalog(manual_site(&["/"]), manual_catalog());
    let (run, _) = h.execute(&["/"]).await;
    let target = h.lumen.db().list_targets(&run.id).unwrap().remove(0);

    let reserved = h.lumen.update_target(&target.id, set_status("IN_PROGRESS", false));
    assert!(matches!(reserved, Err(Error::Validation(_))));

    let unknown = TargetUpdate {
        remediation_id: Some("rem-missing".into()),
        ..Default::default()
    };
    let err = h.lumen.update_target(&target.id, unknown).unwrap_err();
    assert_eq!(err.field_errors()[0].field, "remediation_id");

    let empty = h.lumen.update_target(&target.id, TargetUpdate::default());
    assert!(matches!(empty, Err(Error::Validation(_))));

    let missing = h.lumen.update_target("nope", set_status("PASS", false));
    assert!(matches!(missing, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn page_and_run_events_are_published() {
    let h = Harness::new(
        FakeSite::new()
            .page("/", FakePage::default())
            .page("/slow", FakePage::hanging()),
    );
    let mut events = h.lumen.subscribe();
    let (run, status) = h.execute(&["/", "/slow"]).await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(received.len(), 3);
    assert!(matches!(
        &received[0],
        RunEvent::Page { outcome: Outcome::Success, .. }
    ));
    assert!(matches!(
        &received[1],
        RunEvent::Page { outcome: Outcome::Error, message: Some(_), .. }
    ));
    match &received[2] {
        RunEvent::Run { run_id, status: s, .. } => {
            assert_eq!(run_id, &run.id);
            assert_eq!(*s, status);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn review_during_execution_leaves_the_run_to_the_executor() {
    let site = manual_site(&["/"]).page("/slow", FakePage::hanging());
    let h = Harness::with_catalog(site, catalog(vec![manual("tc-skip-link", &["a.skip"])]));
    let run = h.create_run(&["/", "/slow"]);
    let mut events = h.lumen.subscribe();
    let handle = h.lumen.start_test(&run.id).unwrap();

    loop {
        match events.recv().await.unwrap() {
            RunEvent::Page { outcome: Outcome::Success, .. } => break,
            RunEvent::Page { .. } => continue,
            other => panic!("run ended early: {:?}", other),
        }
    }

    let root = h.pages(&[])["/"].id.clone();
    let targets = h.lumen.db().list_targets_for_page(&run.id, &root).unwrap();
    assert_eq!(targets.len(), 1);
    let reviewed = h.lumen.update_target(&targets[0].id, set_status("PASS", false)).unwrap();
    assert_eq!(reviewed.run_status, RunStatus::InProgress);
    assert!(matches!(
        h.lumen.close_test(&run.id),
        Err(Error::InvalidStateTransition { .. })
    ));
    assert!(!h.lumen.is_archived(&run.id).unwrap());

    // The reviewed target is settled by `finish`, not by the review
    assert_eq!(handle.await.unwrap().unwrap(), RunStatus::TestCompleted);
    let stored = h.lumen.db().require_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::TestCompleted);
    assert_eq!(h.lumen.close_test(&run.id).unwrap().status, RunStatus::Closed);
}
