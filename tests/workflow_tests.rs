//! End-to-end workflow tests against a fake device transport.

use async_trait::async_trait;
use bytebite::config::AppConfig;
use bytebite::device::{Adb, CommandResult, CommandRunner};
use bytebite::driver::{spawn_workflow, Driver, Workflow};
use bytebite::runlog::{RunRecord, RunSink, RunStatus};
use bytebite::storage::AggregationStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pretends to be one attached, rooted handset with a populated logcat.
#[derive(Default)]
struct FakeHandset {
    calls: Mutex<Vec<Vec<String>>>,
    logcat: Mutex<String>,
    marker: Mutex<String>,
    /// Delay applied to every command, to give cancellation a window.
    delay: Duration,
}

impl FakeHandset {
    fn shell_commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|argv| {
                let pos = argv.iter().position(|a| a == "shell")?;
                argv.get(pos + 1).cloned()
            })
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeHandset {
    async fn execute(&self, argv: Vec<String>, _timeout: Duration) -> CommandResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.lock().unwrap().push(argv.clone());
        let joined = argv.join(" ");

        let reply = |stdout: &str| CommandResult::new(argv.clone(), 0, stdout, "");
        if joined.contains("devices -l") {
            return reply("List of devices attached\nR58M123\tdevice usb:1-1 model:Pixel_7");
        }
        if joined.contains("su -c id") {
            return reply("uid=0(root) gid=0(root)");
        }
        if joined.contains("log -t ") {
            let message = argv.last().cloned().unwrap_or_default();
            self.logcat.lock().unwrap().push_str(&format!("\nI ByteBiteDemo: {}", message));
            return reply("");
        }
        if joined.contains("printf '%s\\n'") && joined.contains("trace_token=") {
            *self.marker.lock().unwrap() = joined;
            return reply("");
        }
        if joined.contains("logcat -d") {
            let logcat = self.logcat.lock().unwrap().clone();
            return reply(&logcat);
        }
        if joined.contains(" cat ") {
            let marker = self.marker.lock().unwrap().clone();
            return reply(&marker);
        }
        if joined.contains("pm path") {
            return reply("package:/data/app/~~x/com.example.app/base.apk");
        }
        reply("")
    }
}

fn driver(handset: Arc<FakeHandset>, cfg: AppConfig, logs: &std::path::Path) -> Driver {
    Driver::new(Adb::new(handset, "R58M123", "adb"), cfg).with_logs_dir(logs)
}

#[tokio::test]
async fn test_offensive_then_traceability_corroborates() {
    let dir = tempfile::tempdir().unwrap();
    let handset = Arc::new(FakeHandset::default());
    let d = driver(handset.clone(), AppConfig::default(), dir.path());

    let offensive = d.run(Workflow::Offensive, &CancellationToken::new()).await.unwrap();
    assert_eq!(offensive.record.status, RunStatus::Success);

    let trace = d.run(Workflow::Traceability, &CancellationToken::new()).await.unwrap();
    assert_eq!(trace.record.status, RunStatus::Success, "{:?}", trace.record.error);
    let validate = trace
        .record
        .steps
        .iter()
        .find(|s| s.name == "validate_traceability")
        .unwrap();
    assert!(validate.ok);
}

#[tokio::test]
async fn test_runs_feed_results_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(AggregationStore::open(&dir.path().join("results.db")).unwrap());
    let handset = Arc::new(FakeHandset::default());
    let mut cfg = AppConfig::default();
    cfg.forensic.target_package = "com.example.app".into();
    let d = driver(handset, cfg, dir.path()).with_sink(store.clone() as Arc<dyn RunSink>);

    let out = d.run(Workflow::Forensic, &CancellationToken::new()).await.unwrap();
    assert_eq!(out.record.status, RunStatus::Success);
    assert!(out.run_json.parent().unwrap().join("forensic_artifacts").join("apks").exists());

    // A second ingest of the same document must not duplicate it.
    store.ingest_file(&out.run_json).unwrap();
    let summary = store.summary().unwrap();
    assert_eq!(summary.total_runs, 1);
    assert_eq!(summary.successes, 1);
    assert_eq!(store.easy_read().unwrap().len(), 1);
}

#[tokio::test]
async fn test_shell_metacharacters_stay_one_token() {
    let dir = tempfile::tempdir().unwrap();
    let handset = Arc::new(FakeHandset::default());
    let mut cfg = AppConfig::default();
    cfg.offensive.test_package = "com.example; reboot".into();
    cfg.offensive.open_url = "https://example.com/?a=1&b=$(id)".into();
    let d = driver(handset.clone(), cfg, dir.path());

    d.run(Workflow::Offensive, &CancellationToken::new()).await.unwrap();
    let cmds = handset.shell_commands();
    assert!(cmds.contains(&"monkey -p 'com.example; reboot' -c android.intent.category.LAUNCHER 1".to_string()));
    assert!(cmds.contains(
        &"am start -a android.intent.action.VIEW -d 'https://example.com/?a=1&b=$(id)'".to_string()
    ));
}

#[tokio::test]
async fn test_comparison_writes_both_phases() {
    let dir = tempfile::tempdir().unwrap();
    let handset = Arc::new(FakeHandset::default());
    let d = driver(handset, AppConfig::default(), dir.path());

    let out = d.compare(&CancellationToken::new()).await.unwrap();
    let r = &out.result;
    assert!(r.root_available);
    assert_eq!(r.stock.status, RunStatus::Success);
    assert_eq!(r.rooted.status, RunStatus::Success);
    assert!(r.delta.root_only_success_gain.unwrap() > 0);

    let rooted = RunRecord::load(r.rooted.run_json.as_ref().unwrap()).unwrap();
    assert_eq!(rooted.meta_str("phase"), "rooted");
    assert!(rooted.steps.iter().any(|s| s.name == "offensive:root_probe_id"));
    assert!(rooted.steps.iter().any(|s| s.name == "forensic:network_snapshot_root"));
}

#[tokio::test]
async fn test_background_run_cancels_between_steps() {
    let dir = tempfile::tempdir().unwrap();
    let handset = Arc::new(FakeHandset {
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    let d = Arc::new(driver(handset, AppConfig::default(), dir.path()));

    let handle = spawn_workflow(d, Workflow::Offensive).await.unwrap();
    assert!(handle.is_running());
    tokio::time::sleep(Duration::from_millis(120)).await;
    handle.cancel();
    let out = handle.join().await.unwrap();

    assert_eq!(out.record.status, RunStatus::Cancelled);
    assert!(out.record.error.is_none());
    assert!(!out.record.steps.is_empty());
    assert!(out.record.steps.len() < 6);
    assert!(out.record.steps.iter().all(|s| s.ok));
}

/// Requires a real device on the host's `adb`.
/// Run with `cargo test --release -- --ignored`.
#[tokio::test]
#[ignore]
async fn test_live_forensic_extraction() {
    use bytebite::device::process::ProcessRunner;

    let dir = tempfile::tempdir().unwrap();
    let cfg = AppConfig::load_or_default();
    let adb = Adb::new(Arc::new(ProcessRunner), &cfg.device.serial, &cfg.device.adb_bin);
    let d = Driver::new(adb, cfg).with_logs_dir(dir.path());
    d.ensure_device_attached().await.unwrap();

    let out = d.run(Workflow::Forensic, &CancellationToken::new()).await.unwrap();
    println!("status = {}, steps = {}", out.record.status, out.record.steps.len());
    assert!(out.run_json.exists());
}
