//! S6 — SIGTERM delivered to the running agent makes it exit within the
//! 30-second soft shutdown deadline, even mid-carve of a large file.

use std::fs::{self, File};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

fn write_large_file(path: &std::path::Path, megabytes: u64) {
    let mut file = File::create(path).unwrap();
    let chunk = vec![0xABu8; 1024 * 1024];
    for _ in 0..megabytes {
        file.write_all(&chunk).unwrap();
    }
}

/// S6, scaled down from the seed scenario's 1 GiB to keep the test fast:
/// the soft shutdown deadline (30s) does not scale with file size, so a
/// smaller file under active hashing exercises the same cancellation path.
#[test]
fn s6_sigterm_mid_carve_exits_within_soft_deadline() {
    let binary = env!("CARGO_BIN_EXE_backup-agentd");
    let tmp = tempfile::tempdir().unwrap();
    write_large_file(&tmp.path().join("big.bin"), 64);

    let dircache = tmp.path().join(".cache");
    let mut child = Command::new(binary)
        .arg("--dir")
        .arg(tmp.path())
        .arg("--dircache")
        .arg(&dircache)
        .arg("--blocksize")
        .arg("65536")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start backup-agentd");

    // Give the carve a moment to start hashing the large file.
    std::thread::sleep(Duration::from_millis(200));

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            assert!(
                status.success() || status.code() == Some(0),
                "agent exited with failure status: {status:?}"
            );
            break;
        }
        assert!(
            Instant::now() < deadline,
            "agent did not exit within the 30s soft shutdown deadline"
        );
        std::thread::sleep(Duration::from_millis(100));
    }

    // Nothing should persist a hash for the in-progress file: it either
    // finished entirely (unlikely given the timing) or contributed none.
    let _ = fs::metadata(&dircache);
}
