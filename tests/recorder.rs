mod common;

use common::{FakePage, page_action, passed, task};
use rpa_trace::classify::KeywordEvent;
use rpa_trace::recorder::{ListenerEvent, MANUAL_TASK_TAG};
use rpa_trace::{
    ActionArgs, BBox, NullSurface, RecorderConfig, RobotAction, SaveStatus, Step, TraceError, TraceRecorder,
    load_trace,
};
use std::path::Path;

fn recorder(dir: &Path, page: FakePage) -> TraceRecorder<FakePage> {
    TraceRecorder::new(RecorderConfig::browser().with_output_dir(dir), page)
}

/// Start, run and finish one keyword.
fn run(rec: &mut TraceRecorder<FakePage>, event: &KeywordEvent) {
    rec.start_keyword(event).unwrap();
    rec.after_keyword_run().unwrap();
    rec.end_keyword(&passed(event)).unwrap();
}

fn names(step: &Step) -> Vec<&str> {
    step.children().iter().map(|s| s.name.as_str()).collect()
}

fn shot(observation: Option<&rpa_trace::Observation>) -> &str {
    observation.map(|o| &*o.screenshot).unwrap_or("")
}

#[test]
fn records_a_scenario_and_persists_it() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::open()
        .with_box("#user", BBox::new(10, 10, 100, 20))
        .with_box("#submit", BBox::new(10, 900, 80, 30));
    let mut rec = recorder(dir.path(), page);

    rec.start_suite("Smoke");
    rec.start_test("Login");

    let form = task("Fill form");
    rec.start_keyword(&form).unwrap();
    run(&mut rec, &page_action("Click", &["#user"]));
    run(&mut rec, &page_action("Keyboard Input", &["type", "user@test.com"]));
    rec.end_keyword(&passed(&form)).unwrap();

    run(&mut rec, &page_action("Click", &["#submit"]));

    let path = rec.end_test("Login", "PASS", &[]).unwrap().unwrap();
    assert!(rec.stack().is_empty());
    assert_eq!(rec.surface().settled, 3);
    assert_eq!(rec.surface().scrolled_into_view, vec!["#submit".to_string()]);

    let dir_name = path.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
    assert!(dir_name.starts_with("Smoke_"), "{dir_name}");
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("Login_"));

    let root = load_trace(&path).unwrap();
    assert_eq!(root.name, "Login");
    assert_eq!(names(&root), vec!["Fill form", "Scroll Down", "Click"]);
    assert_eq!(shot(root.start_observation()), "shot-1");
    assert_eq!(shot(root.end_observation()), "shot-9");

    let form = &root.children()[0];
    assert_eq!(names(form), vec!["Click", "Keyboard Input"]);
    assert_eq!(shot(form.start_observation()), "shot-1");
    assert_eq!(shot(form.end_observation()), "shot-6");

    let click = form.children()[0].args().unwrap();
    assert_eq!(click.selector, "#user");
    assert_eq!(click.bbox, Some(BBox::new(10, 10, 100, 20)));

    let typing = form.children()[1].args().unwrap();
    assert_eq!(typing.input_string, "user@test.com");
    assert_eq!(typing.bbox, None);

    // the scroll a human would have needed, recorded ahead of the click
    let scroll = &root.children()[1];
    assert_eq!(scroll.args().unwrap().selector, "#submit");
    assert_eq!(scroll.args().unwrap().bbox, Some(BBox::new(10, 900, 80, 30)));
    assert_eq!(shot(scroll.start_observation()), "shot-7");
    assert_eq!(shot(scroll.end_observation()), "shot-8");

    let submit = &root.children()[2];
    assert_eq!(submit.args().unwrap().bbox, Some(BBox::new(10, 360, 80, 30)));
    assert_eq!(shot(submit.start_observation()), "shot-8");
    assert_eq!(submit.context.as_ref().unwrap().status, "PASS");
}

#[test]
fn filtered_steps_are_left_out() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::open().with_box("#user", BBox::new(10, 10, 100, 20));
    let mut rec = recorder(dir.path(), page);
    rec.start_test("Filters");

    // action from a library that is not observed
    run(
        &mut rec,
        &KeywordEvent::keyword(Some("OtherLib"), "Click").with_tags(&["PageContent"]),
    );
    // excluded by tag
    run(&mut rec, &page_action("Wait For Elements State", &["#user"]).with_tags(&["Wait"]));
    // browser keyword not registered as page content
    run(&mut rec, &KeywordEvent::keyword(Some("Browser"), "Get Title"));

    // failed action
    let failing = page_action("Click", &["#user"]);
    rec.start_keyword(&failing).unwrap();
    rec.end_keyword(&failing.clone().with_status("FAIL")).unwrap();

    // task with nothing recorded inside
    let empty = task("Nothing happens");
    rec.start_keyword(&empty).unwrap();
    rec.end_keyword(&passed(&empty)).unwrap();

    // task excluded by tag, with an action inside
    let secret = task("Enter secret").with_tags(&["no_record"]);
    rec.start_keyword(&secret).unwrap();
    run(&mut rec, &page_action("Click", &["#user"]));
    rec.end_keyword(&passed(&secret)).unwrap();

    // control flow: only the body is recorded, attached to the scenario
    let for_loop = task("FOR ${i} IN RANGE 2").with_type("FOR");
    rec.start_keyword(&for_loop).unwrap();
    assert_eq!(rec.stack().peek_last().unwrap().status, SaveStatus::OnlySubsteps);
    run(&mut rec, &page_action("Click", &["#user"]));
    rec.end_keyword(&passed(&for_loop)).unwrap();

    let path = rec.end_test("Filters", "PASS", &[]).unwrap().unwrap();
    let root = load_trace(&path).unwrap();
    assert_eq!(names(&root), vec!["Click"]);
}

#[test]
fn sleeping_refreshes_the_observation() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open());
    rec.start_test("Wait");
    rec.start_keyword(&task("Idle")).unwrap();
    let before = rec.last_observation().screenshot.clone();

    let sleep = KeywordEvent::keyword(Some("BuiltIn"), "Sleep").with_args(&["2s"]);
    rec.start_keyword(&sleep).unwrap();
    assert_eq!(rec.last_observation().screenshot, before);
    rec.end_keyword(&passed(&sleep)).unwrap();
    assert_ne!(rec.last_observation().screenshot, before);
}

#[test]
fn keyboard_keywords_keep_their_payload_without_a_locator() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open());
    rec.start_test("Keys");
    run(&mut rec, &page_action("Keyboard Key", &["press", "Enter"]));
    run(&mut rec, &page_action("Keyboard Input", &["type", "hello world"]));

    assert!(rec.surface().resolved.is_empty());
    let path = rec.end_test("Keys", "PASS", &[]).unwrap().unwrap();
    let root = load_trace(&path).unwrap();
    assert_eq!(names(&root), vec!["Keyboard Key", "Keyboard Input"]);

    let key = root.children()[0].args().unwrap();
    assert_eq!(key, &ActionArgs::new("", "Enter", None));
    assert_eq!(root.children()[1].args().unwrap().input_string, "hello world");
}

#[test]
fn element_above_the_viewport_scrolls_to_top_first() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::open().with_box("#header", BBox::new(10, -300, 50, 20));
    let mut rec = recorder(dir.path(), page);
    rec.start_test("Top");
    run(&mut rec, &page_action("Click", &["#header"]));

    assert_eq!(rec.surface().scrolled_to_top, 1);
    let path = rec.end_test("Top", "PASS", &[]).unwrap().unwrap();
    let root = load_trace(&path).unwrap();
    // scrolling up is not recorded, only the corrected box
    assert_eq!(names(&root), vec!["Click"]);
    assert_eq!(root.children()[0].args().unwrap().bbox, Some(BBox::new(10, 100, 50, 20)));
}

#[test]
fn ambiguous_tags_fail_before_anything_is_pushed() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open());
    rec.start_test("Broken");
    let before = rec.stack().len();

    let event = page_action("Click", &["#user"]).with_tags(&["task", "action"]);
    assert!(matches!(rec.start_keyword(&event), Err(TraceError::Classification(_))));
    assert_eq!(rec.stack().len(), before);
    assert_eq!(rec.surface().shots, 0);
}

#[test]
fn ending_a_test_needs_a_task_at_the_bottom() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open());
    assert!(matches!(rec.end_test("Nothing", "PASS", &[]), Err(TraceError::Protocol(_))));

    rec.start_keyword(&page_action("Click", &["#user"])).unwrap();
    assert!(matches!(rec.end_test("Stray", "PASS", &[]), Err(TraceError::Protocol(_))));
}

#[test]
fn json_mirror_follows_the_json_tag() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open().with_box("#a", BBox::new(0, 0, 10, 10)));
    rec.start_test("Mirror");
    run(&mut rec, &page_action("Click", &["#a"]));
    let path = rec.end_test("Mirror", "PASS", &["JSON".to_string()]).unwrap().unwrap();

    let mirror = path.with_extension("json");
    assert!(mirror.exists());
    let (mirrored, binary) = (load_trace(&mirror).unwrap(), load_trace(&path).unwrap());
    assert_eq!(mirrored, binary);
    assert_same_fields(&mirrored, &binary);
    assert_eq!(binary.children().len(), 1);
}

#[test]
fn a_scenario_without_keywords_is_still_saved_whole() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open());
    rec.start_test("Idle");
    let path = rec.end_test("Idle", "PASS", &["JSON".to_string()]).unwrap().unwrap();

    let (mirrored, binary) = (load_trace(&path.with_extension("json")).unwrap(), load_trace(&path).unwrap());
    assert_eq!(binary.name, "Idle");
    assert!(binary.children().is_empty());
    assert_eq!(binary.context.as_ref().unwrap().status, "PASS");
    assert_same_fields(&mirrored, &binary);
}

/// Step equality only looks at screenshot hashes; compare the raw fields too.
fn assert_same_fields(left: &Step, right: &Step) {
    let (left, right) = (left.all_steps(), right.all_steps());
    assert_eq!(left.len(), right.len());
    for (l, r) in left.iter().zip(&right) {
        assert_eq!((l.id, &l.name, l.args()), (r.id, &r.name, r.args()));
        for (lo, ro) in [
            (l.start_observation(), r.start_observation()),
            (l.end_observation(), r.end_observation()),
        ] {
            let (lo, ro) = (lo.unwrap(), ro.unwrap());
            assert_eq!(lo.timestamp, ro.timestamp);
            assert_eq!(lo.pointer, ro.pointer);
            assert_eq!(lo.screenshot, ro.screenshot);
            assert_eq!(lo.dom_snapshot, ro.dom_snapshot);
        }
    }
}

#[test]
fn manual_tasks_and_substitutes_build_the_current_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open());
    rec.start_test("Shop");
    rec.start_task("Search milk").unwrap();
    assert!(rec.stack().peek_last().unwrap().has_tag(MANUAL_TASK_TAG));

    // nothing recorded yet: the open task is its own target
    let history = rec.current_history(false, false).unwrap();
    let entries: Vec<&str> = history.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(entries, vec!["Search milk"]);

    let type_text = page_action("Type Text", &["css=input", "milk"]);
    rec.start_keyword(&type_text).unwrap();
    rec.substitute_current_action(vec![
        (
            RobotAction::ClickAtBbox,
            ActionArgs::new("BBox(x=1, y=2, width=3, height=4)", "", Some(BBox::new(1, 2, 3, 4))),
        ),
        (RobotAction::KeyboardInput, ActionArgs::new("", "milk", None)),
    ])
    .unwrap();
    assert_eq!(rec.stack().peek_last().unwrap().status, SaveStatus::NoRecord);
    rec.end_keyword(&passed(&type_text)).unwrap();

    let local = rec.current_history(false, false).unwrap();
    let entries: Vec<&str> = local.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(entries, vec!["Search milk", "Click At BBox", "Keyboard Input"]);

    let full = rec.current_history(true, false).unwrap();
    assert_eq!(full[0].name, "Shop");
    assert_eq!(full.len(), 4);

    rec.end_task("PASS").unwrap();
    let path = rec.end_test("Shop", "PASS", &[]).unwrap().unwrap();
    let root = load_trace(&path).unwrap();
    assert_eq!(names(&root), vec!["Search milk"]);
    assert_eq!(names(&root.children()[0]), vec!["Click At BBox", "Keyboard Input"]);
    assert_eq!(root.children()[0].children()[1].args().unwrap().input_string, "milk");
}

#[test]
fn removing_the_last_task_forgets_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open().with_box("#a", BBox::new(0, 0, 10, 10)));
    rec.start_test("Undo");
    let step = task("Step");
    rec.start_keyword(&step).unwrap();
    run(&mut rec, &page_action("Click", &["#a"]));
    rec.end_keyword(&passed(&step)).unwrap();

    assert!(rec.remove_last_task());
    assert!(!rec.remove_last_task());
    assert!(rec.stack().root().unwrap().children().is_empty());
}

#[test]
fn variables_are_substituted_in_recorded_names() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path(), FakePage::open().with_box("#a", BBox::new(0, 0, 10, 10)));
    rec.set_variable("product", "milk");
    rec.start_test("Buy");
    let buy = task("Buy ${product}");
    rec.start_keyword(&buy).unwrap();
    run(&mut rec, &page_action("Click", &["#a"]));
    rec.end_keyword(&passed(&buy)).unwrap();

    assert_eq!(rec.stack().root().unwrap().children()[0].name, "Buy milk");
}

#[test]
fn replayed_event_logs_are_recorded_without_a_surface() {
    let dir = tempfile::tempdir().unwrap();
    let log = r#"
{"event":"start_test","name":"Login"}
{"event":"start_keyword","name":"Fill form","kwname":"Fill form"}
{"event":"start_keyword","name":"Browser.Click","kwname":"Click","libname":"Browser","tags":["PageContent"],"args":["BBox(x=10, y=10, width=20, height=20)"]}
{"event":"end_keyword","name":"Browser.Click","kwname":"Click","libname":"Browser","tags":["PageContent"],"status":"PASS"}
{"event":"end_keyword","name":"Fill form","kwname":"Fill form","status":"PASS"}
{"event":"end_test","name":"Login","status":"PASS"}
"#;
    let config = RecorderConfig::browser().with_output_dir(dir.path());
    let mut rec = TraceRecorder::new(config, NullSurface);

    let mut saved = Vec::new();
    for line in log.lines().filter(|l| !l.trim().is_empty()) {
        let event: ListenerEvent = serde_json::from_str(line).unwrap();
        saved.extend(rec.handle(&event).unwrap());
    }

    assert_eq!(saved.len(), 1);
    let root = load_trace(&saved[0]).unwrap();
    let click = &root.children()[0].children()[0];
    assert_eq!(click.args().unwrap().bbox, Some(BBox::new(10, 10, 20, 20)));
    assert_eq!(click.args().unwrap().selector, "BBox(x=10, y=10, width=20, height=20)");
    assert!(click.start_observation().unwrap().is_placeholder());
}

#[test]
fn disabled_recording_persists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RecorderConfig::browser().with_output_dir(dir.path());
    config.record = false;
    let mut rec = TraceRecorder::new(config, NullSurface);

    for name in ["Quiet", "Silent", "Mute"] {
        rec.start_test(name);
        assert_eq!(rec.stack().len(), 1);
        assert_eq!(rec.stack().root().unwrap().name, name);

        let step = task("Browse");
        rec.start_keyword(&step).unwrap();
        rec.start_keyword(&page_action("Click", &["BBox(0, 0, 10, 10)"])).unwrap();
        rec.end_keyword(&passed(&page_action("Click", &["BBox(0, 0, 10, 10)"]))).unwrap();
        rec.end_keyword(&passed(&step)).unwrap();

        assert_eq!(rec.end_test(name, "PASS", &[]).unwrap(), None);
        assert!(rec.stack().is_empty());
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
