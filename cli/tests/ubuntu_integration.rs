//! Integration test: build an Ubuntu rootfs end to end.
//!
//! 1. Resolve `docker.io/library/ubuntu:latest` for linux/amd64
//! 2. Stage every layer and add a local file
//! 3. Format the tree into an ext4 image
//!
//! ## Prerequisites
//!
//! - `ocifs` binary built (`cargo build -p ocifs-cli`)
//! - `mke2fs` and `resize2fs` (e2fsprogs) in `PATH`
//! - Internet access
//!
//! ## Running
//!
//! ```bash
//! cargo test -p ocifs-cli --test ubuntu_integration -- --ignored --nocapture
//! ```

use std::path::Path;
use std::process::Command;

/// Find the ocifs binary in the target directory.
fn find_binary() -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let workspace_root = Path::new(manifest_dir)
        .parent()
        .expect("cli crate should be inside workspace");

    for profile in ["debug", "release"] {
        let bin = workspace_root.join("target").join(profile).join("ocifs");
        if bin.exists() {
            return bin.to_string_lossy().to_string();
        }
    }

    // Fall back to PATH
    "ocifs".to_string()
}

/// Run an ocifs command and return (stdout, success).
fn run_cmd(args: &[&str]) -> (String, bool) {
    let bin = find_binary();
    eprintln!("    $ ocifs {}", args.join(" "));

    let output = Command::new(&bin)
        .args(args)
        .stderr(std::process::Stdio::inherit())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run `ocifs {}`: {}", args.join(" "), e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    for line in stdout.lines() {
        eprintln!("    → {}", line);
    }
    (stdout, output.status.success())
}

#[test]
#[ignore]
fn test_ubuntu_rootfs() {
    let work = tempfile::TempDir::new().unwrap();
    let out = work.path().join("out");
    let marker = work.path().join("marker.txt");
    std::fs::write(&marker, "built by ocifs\n").unwrap();
    let overlay = format!("{}=/etc/ocifs/", marker.display());

    let (_, ok) = run_cmd(&[
        "build",
        "docker.io/library/ubuntu:latest",
        "--os",
        "linux",
        "--arch",
        "amd64",
        "-o",
        out.to_str().unwrap(),
        "--keep-staging",
        "-f",
        &overlay,
        "-vv",
    ]);
    assert!(ok, "build should succeed");

    let image = out.join("rootfs.ext4");
    let size = std::fs::metadata(&image).expect("image should exist").len();
    assert!(size > 0, "image should not be empty");

    // --keep-staging leaves exactly one staging tree behind.
    let kept: Vec<_> = std::fs::read_dir(std::env::temp_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("ocifs-rootfs-"))
                && p.join("etc/ocifs/marker.txt").exists()
        })
        .collect();
    assert!(!kept.is_empty(), "kept staging tree should exist");
    let tree = &kept[kept.len() - 1];
    assert!(tree.join("etc/os-release").exists());
    let _ = std::fs::remove_dir_all(tree);
}

#[test]
#[ignore]
fn test_manifest_lists_layers() {
    let (stdout, ok) = run_cmd(&[
        "manifest",
        "ubuntu:latest",
        "--platform",
        "linux/arm64",
        "--json",
    ]);
    assert!(ok);
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["platform"], "linux/arm64");
    assert!(!doc["layers"].as_array().unwrap().is_empty());
}
