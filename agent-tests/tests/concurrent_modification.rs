//! S4 — a file modified between two carves is re-captured with a strictly
//! newer mtime, exercising the re-carve path the Change Monitor feeds.

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use backup_core::{Carver, ConfigRecord, MetaData, MetaSink};

struct LastSink {
    meta: std::sync::Mutex<Option<MetaData>>,
}

impl LastSink {
    fn new() -> Self {
        Self {
            meta: std::sync::Mutex::new(None),
        }
    }
}

impl MetaSink for LastSink {
    fn push(&self, meta: MetaData) -> bool {
        *self.meta.lock().unwrap() = Some(meta);
        true
    }
}

fn config_for(dir: &Path) -> ConfigRecord {
    ConfigRecord {
        dirname_list: vec![dir.to_path_buf()],
        blocksize: 4096,
        dircache: dir.join(".cache"),
        dbname: "hashes.bin".to_string(),
        host: "localhost".to_string(),
        port: 0,
    }
}

#[test]
fn s4_modification_while_carving_yields_newer_mtime() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("sub")).unwrap();
    let target = tmp.path().join("sub/b.bin");
    fs::write(&target, b"before").unwrap();

    let cfg = config_for(tmp.path());
    let cancel = AtomicBool::new(false);
    let carver = Carver::new(&cfg, &cancel);

    let before_meta = {
        let sink = LastSink::new();
        carver.recarve_entry(&target, &sink);
        sink.meta.lock().unwrap().take().unwrap()
    };

    // Close-after-write from an external writer, guaranteed to land on a
    // later whole second than the first capture.
    thread::sleep(Duration::from_millis(1100));
    fs::write(&target, b"after, and longer").unwrap();

    let after_meta = {
        let sink = LastSink::new();
        carver.recarve_entry(&target, &sink);
        sink.meta.lock().unwrap().take().unwrap()
    };

    assert!(
        after_meta.mtime > before_meta.mtime,
        "re-carved mtime ({}) must exceed the first capture's mtime ({})",
        after_meta.mtime,
        before_meta.mtime
    );
    assert_ne!(after_meta.size, before_meta.size);
}
