//! ADB operations, each expressed as one executor call with a fixed budget.

use super::{shell_quote, CommandResult, CommandRunner};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Device and status queries.
const SHORT: Duration = Duration::from_secs(10);
const STATUS: Duration = Duration::from_secs(20);
/// Shell reads (package listing, hashing, snapshots).
const MEDIUM: Duration = Duration::from_secs(25);
const LOGCAT: Duration = Duration::from_secs(40);
/// Artifact transfer.
const LONG: Duration = Duration::from_secs(120);

pub const DEFAULT_MARKER_FILE: &str = "bytebite_marker.txt";
pub const MAX_LOGCAT_LINES: u32 = 2000;

const NETWORK_SNAPSHOT: &str = "echo '=== ip addr ==='; ip addr 2>/dev/null || true; \
     echo '=== ip route ==='; ip route 2>/dev/null || true; \
     echo '=== /proc/net/tcp ==='; cat /proc/net/tcp 2>/dev/null || true; \
     echo '=== /proc/net/tcp6 ==='; cat /proc/net/tcp6 2>/dev/null || true; \
     echo '=== netstat ==='; netstat -tunap 2>/dev/null || true; \
     echo '=== ss ==='; ss -tunap 2>/dev/null || true";

const ROOT_STATUS: &str = "echo '=== su which ==='; which su 2>/dev/null; \
     echo '=== su id ==='; su -c id 2>/dev/null; \
     echo '=== whoami ==='; whoami 2>/dev/null; \
     echo '=== test su paths ==='; ls -l /system/xbin/su /system/bin/su /sbin/su 2>/dev/null || true";

/// Client for one device, addressed by optional serial.
#[derive(Clone)]
pub struct Adb {
    runner: Arc<dyn CommandRunner>,
    serial: String,
    bin: String,
}

impl Adb {
    pub fn new(runner: Arc<dyn CommandRunner>, serial: &str, bin: &str) -> Self {
        Self {
            runner,
            serial: serial.trim().to_string(),
            bin: bin.to_string(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn base(&self) -> Vec<String> {
        let mut cmd = vec![self.bin.clone()];
        if !self.serial.is_empty() {
            cmd.push("-s".to_string());
            cmd.push(self.serial.clone());
        }
        cmd
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> CommandResult {
        let mut argv = self.base();
        argv.extend(args.iter().map(|a| a.to_string()));
        self.runner.execute(argv, timeout).await
    }

    pub async fn devices(&self) -> CommandResult {
        self.run(&["devices", "-l"], SHORT).await
    }

    pub async fn wait_for_device(&self) -> CommandResult {
        self.run(&["wait-for-device"], STATUS).await
    }

    /// Run `command` through the device shell. Callers are responsible for
    /// quoting any interpolated values.
    pub async fn shell(&self, command: &str, timeout: Duration) -> CommandResult {
        self.run(&["shell", command], timeout).await
    }

    /// Run `command` as superuser; the whole command is quoted as one token.
    pub async fn su_shell(&self, command: &str, timeout: Duration) -> CommandResult {
        self.shell(&format!("su -c {}", shell_quote(command)), timeout)
            .await
    }

    /// Elevated identity probe.
    pub async fn su_id(&self) -> CommandResult {
        self.su_shell("id", SHORT).await
    }

    pub async fn clear_logcat(&self) -> CommandResult {
        self.shell("logcat -c", SHORT).await
    }

    pub async fn dump_logcat(&self, tail_lines: u32) -> CommandResult {
        let lines = tail_lines.clamp(1, MAX_LOGCAT_LINES);
        self.shell(&format!("logcat -d -t {}", lines), LOGCAT).await
    }

    pub async fn list_packages(&self, prefix: &str) -> CommandResult {
        let mut cmd = "pm list packages".to_string();
        if !prefix.is_empty() {
            cmd.push(' ');
            cmd.push_str(&shell_quote(prefix));
        }
        self.shell(&cmd, MEDIUM).await
    }

    pub async fn package_paths(&self, package: &str) -> CommandResult {
        self.shell(&format!("pm path {}", shell_quote(package)), STATUS)
            .await
    }

    pub async fn install_apk(&self, apk_path: &Path) -> CommandResult {
        let host_apk = apk_path.display().to_string();
        if !apk_path.exists() {
            let mut argv = self.base();
            argv.extend(["install".to_string(), host_apk.clone()]);
            return CommandResult::rejected(argv, format!("APK not found: {}", host_apk));
        }
        self.run(&["install", "-r", "-g", &host_apk], LONG).await
    }

    pub async fn launch_package(&self, package: &str, activity: &str) -> CommandResult {
        let pkg = package.trim();
        if pkg.is_empty() {
            return CommandResult::rejected(vec![], "package_name is required");
        }
        let activity = activity.trim();
        if !activity.is_empty() {
            let component = format!("{}/{}", pkg, activity);
            return self
                .shell(&format!("am start -n {}", shell_quote(&component)), MEDIUM)
                .await;
        }
        self.shell(
            &format!(
                "monkey -p {} -c android.intent.category.LAUNCHER 1",
                shell_quote(pkg)
            ),
            MEDIUM,
        )
        .await
    }

    /// Pull a remote file; the local parent directory is created first.
    pub async fn pull(&self, remote_path: &str, local_path: &Path) -> CommandResult {
        if let Some(parent) = local_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                let mut argv = self.base();
                argv.extend(["pull".to_string(), remote_path.to_string()]);
                return CommandResult::rejected(
                    argv,
                    format!("cannot create {}: {}", parent.display(), e),
                );
            }
        }
        let local = local_path.display().to_string();
        self.run(&["pull", remote_path, &local], LONG).await
    }

    /// Hash a remote file, falling back through the hashers Android ships.
    pub async fn sha256_file(&self, remote_path: &str, use_root: bool) -> CommandResult {
        let q = shell_quote(remote_path);
        let cmd = format!(
            "sha256sum {q} || toybox sha256sum {q} || md5sum {q}",
            q = q
        );
        if use_root {
            self.su_shell(&cmd, MEDIUM).await
        } else {
            self.shell(&cmd, MEDIUM).await
        }
    }

    pub async fn network_snapshot(&self, use_root: bool) -> CommandResult {
        if use_root {
            self.su_shell(NETWORK_SNAPSHOT, MEDIUM).await
        } else {
            self.shell(NETWORK_SNAPSHOT, MEDIUM).await
        }
    }

    pub async fn root_status(&self) -> CommandResult {
        self.shell(ROOT_STATUS, STATUS).await
    }

    pub async fn read_text_file(&self, file_path: &str) -> CommandResult {
        self.shell(&format!("cat {}", shell_quote(file_path)), STATUS)
            .await
    }

    pub async fn ensure_dir(&self, dir: &str) -> CommandResult {
        self.shell(&format!("mkdir -p {}", shell_quote(dir)), SHORT)
            .await
    }

    /// Write `content` plus a UTC timestamp line to `<dir>/<file_name>`.
    pub async fn write_marker(&self, dir: &str, file_name: &str, content: &str) -> CommandResult {
        let trimmed = dir.trim_end_matches('/');
        let safe_dir = shell_quote(if trimmed.is_empty() { "/" } else { trimmed });
        let safe_file = shell_quote(&format!("{}/{}", trimmed, file_name));
        let cmd = format!(
            "mkdir -p {dir} && printf '%s\\n' {content} > {file} && date -u +%Y-%m-%dT%H:%M:%SZ >> {file}",
            dir = safe_dir,
            content = shell_quote(content),
            file = safe_file,
        );
        self.shell(&cmd, SHORT).await
    }

    pub async fn open_url(&self, url: &str) -> CommandResult {
        self.shell(
            &format!("am start -a android.intent.action.VIEW -d {}", shell_quote(url)),
            STATUS,
        )
        .await
    }

    pub async fn write_trace_log(&self, tag: &str, message: &str) -> CommandResult {
        self.shell(
            &format!("log -t {} {}", shell_quote(tag), shell_quote(message)),
            SHORT,
        )
        .await
    }
}

/// True when `adb devices -l` output lists at least one authorised device.
pub fn has_authorised_device(devices_output: &str) -> bool {
    devices_output.lines().any(|line| {
        let mut cols = line.split_whitespace();
        cols.next().is_some() && cols.next() == Some("device")
    })
}

/// Extract `package:` entries from `pm path` output.
pub fn package_paths_from_pm_output(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
