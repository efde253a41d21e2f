//! Sharing one server between separate OS processes.
//!
//! Script stand-ins for `initdb`, `pg_ctl`, and `psql` keep a real
//! background process as the "server" and append to `starts` and `stops`
//! files in the data directory, so every process observes the same state
//! through the filesystem exactly as with PostgreSQL.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::cargo::cargo_bin_cmd;
use pgshare::{CleanupPolicy, Coordinator, ServerState, get_server, inspect};
use pgshare_config::Config;
use predicates::str::contains;
use tempfile::TempDir;

/// Names the data directory for the re-executed child test.
const CHILD_DATA_DIR: &str = "PGSHARE_TEST_CHILD_DATA_DIR";

const INITDB: &str = r#"#!/bin/sh
mkdir -p "$2" && echo 16 > "$2/PG_VERSION"
"#;

const PG_CTL: &str = r#"#!/bin/sh
data_dir="$2"
for command; do :; done
marker="$data_dir/postmaster.pid"
case "$command" in
start)
    sleep 600 </dev/null >/dev/null 2>&1 &
    printf '%s\n%s\n%s\n%s\n%s\n\n%s\n%s\n' "$!" "$data_dir" "$(date +%s)" 5432 "$data_dir" "0 0" ready > "$marker"
    echo "$!" >> "$data_dir/starts"
    ;;
stop)
    if [ ! -f "$marker" ]; then
        echo "pg_ctl: PID file \"$marker\" does not exist" >&2
        echo "Is server running?" >&2
        exit 1
    fi
    kill "$(head -n 1 "$marker")"
    rm -f "$marker"
    echo stopped >> "$data_dir/stops"
    ;;
status)
    if [ -f "$marker" ]; then
        echo "pg_ctl: server is running (PID: $(head -n 1 "$marker"))"
        exit 0
    fi
    echo "pg_ctl: no server running"
    exit 3
    ;;
esac
"#;

const PSQL: &str = "#!/bin/sh\ncat\n";

struct Host {
    root: TempDir,
}

impl Host {
    fn new() -> Self {
        let root = TempDir::new().expect("temp dir");
        let bin = root.path().join("bin");
        fs::create_dir(&bin).expect("bin dir");
        for (name, body) in [("initdb", INITDB), ("pg_ctl", PG_CTL), ("psql", PSQL)] {
            let path = bin.join(name);
            fs::write(&path, body).expect("write script");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        }
        Self { root }
    }

    fn bin_dir(&self) -> PathBuf {
        self.root.path().join("bin")
    }

    fn runtime_dir(&self) -> PathBuf {
        self.root.path().join("ns")
    }

    fn data_dir(&self) -> PathBuf {
        self.root.path().join("data")
    }

    fn config(&self) -> Config {
        Config {
            bin_dir: Some(self.bin_dir().to_str().expect("utf8 bin dir").into()),
            runtime_dir: Some(self.runtime_dir().to_str().expect("utf8 runtime dir").into()),
            ..Config::default()
        }
    }

    /// `pgshare` running as a separate process against the same namespace.
    fn pgshare(&self) -> assert_cmd::Command {
        let mut command = cargo_bin_cmd!("pgshare");
        command
            .env("PGSHARE_BIN_DIR", self.bin_dir())
            .env("PGSHARE_RUNTIME_DIR", self.runtime_dir())
            .env("PGSHARE_LOG_FILTER", "warn");
        command
    }
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).map_or(0, |content| content.lines().count())
}

fn running_pid(data_dir: &Path) -> Option<u32> {
    match inspect(data_dir).expect("inspect").state {
        ServerState::Running(marker) => Some(marker.pid),
        ServerState::Absent | ServerState::Stale { .. } => None,
    }
}

#[test]
fn server_outlives_child_process_until_parent_releases() {
    let host = Host::new();
    let coordinator = Coordinator::new(host.config()).expect("coordinator");
    let handle = coordinator
        .acquire(host.data_dir(), CleanupPolicy::Stop)
        .expect("parent acquires");
    let data_dir = handle.data_dir().to_path_buf();
    let pid = running_pid(&data_dir).expect("server running");

    host.pgshare()
        .arg("query")
        .arg(&data_dir)
        .arg("select 1;")
        .assert()
        .success()
        .stdout(contains("select 1;"));

    let report = inspect(&data_dir).expect("inspect");
    assert_eq!(report.owners, BTreeSet::from([std::process::id()]));
    assert_eq!(running_pid(&data_dir), Some(pid));
    assert_eq!(line_count(&data_dir.join("starts")), 1);
    assert_eq!(line_count(&data_dir.join("stops")), 0);

    host.pgshare()
        .arg("stop")
        .arg(&data_dir)
        .assert()
        .failure()
        .stderr(contains("still held"));

    handle.release().expect("parent releases");
    assert_eq!(running_pid(&data_dir), None);
    assert_eq!(line_count(&data_dir.join("stops")), 1);
    assert!(inspect(&data_dir).expect("inspect").owners.is_empty());
}

#[test]
fn server_started_by_child_is_reused_by_parent() {
    let host = Host::new();
    host.pgshare()
        .arg("start")
        .arg(host.data_dir())
        .assert()
        .success()
        .stdout(contains("postgresql://"));
    let pid = running_pid(&host.data_dir()).expect("child left the server running");
    assert!(inspect(host.data_dir()).expect("inspect").owners.is_empty());

    let coordinator = Coordinator::new(host.config()).expect("coordinator");
    let handle = coordinator
        .acquire(host.data_dir(), CleanupPolicy::Delete)
        .expect("parent acquires");
    assert_eq!(handle.pid().expect("pid"), Some(pid));
    let data_dir = handle.data_dir().to_path_buf();
    assert_eq!(line_count(&data_dir.join("starts")), 1);

    handle.release().expect("parent releases");
    assert!(!data_dir.exists());
}

#[test]
fn exit_hook_releases_servers_left_held() {
    let host = Host::new();
    let status = Command::new(std::env::current_exe().expect("test binary"))
        .args(["--exact", "child_acquires_and_exits_holding", "--nocapture"])
        .env(CHILD_DATA_DIR, host.data_dir())
        .env("PGSHARE_BIN_DIR", host.bin_dir())
        .env("PGSHARE_RUNTIME_DIR", host.runtime_dir())
        .env("PGSHARE_LOG_FILTER", "warn")
        .status()
        .expect("run child");
    assert!(status.success());

    let data_dir = host.data_dir();
    assert_eq!(line_count(&data_dir.join("starts")), 1);
    assert_eq!(line_count(&data_dir.join("stops")), 1);
    assert_eq!(running_pid(&data_dir), None);
    assert!(inspect(&data_dir).expect("inspect").owners.is_empty());
}

/// Runs only inside the process spawned by `exit_hook_releases_servers_left_held`.
#[test]
fn child_acquires_and_exits_holding() {
    let Some(data_dir) = std::env::var_os(CHILD_DATA_DIR) else {
        return;
    };
    let handle = get_server(&data_dir, CleanupPolicy::Stop).expect("child acquires");
    assert!(handle.pid().expect("pid").is_some());
    std::mem::forget(handle);
}
