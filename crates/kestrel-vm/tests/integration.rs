//! Integration tests for kestrel-vm.
//!
//! These tests require:
//! - Linux with /dev/kvm access
//! - Firecracker binary installed
//! - Kernel and raw disk images
//!
//! Run with: `cargo test -p kestrel-vm -- --ignored`

use kestrel_vm::VmBuilder;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

fn image_paths() -> Option<(String, String)> {
    let kernel_path = std::env::var("KESTREL_KERNEL_PATH")
        .unwrap_or_else(|_| "/var/lib/kestrel/kernel/vmlinux".to_string());
    let disk_path = std::env::var("KESTREL_DISK_PATH")
        .unwrap_or_else(|_| "/var/lib/kestrel/images/debian.raw".to_string());

    if !Path::new(&kernel_path).exists() || !Path::new(&disk_path).exists() {
        eprintln!("Skipping test: kernel or disk not found");
        eprintln!("Set KESTREL_KERNEL_PATH and KESTREL_DISK_PATH environment variables");
        return None;
    }
    Some((kernel_path, disk_path))
}

/// Boot a guest, read console output, then kill it.
#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_boot_and_kill() {
    let Some((kernel_path, disk_path)) = image_paths() else {
        return;
    };
    let run_dir = tempfile::tempdir().unwrap();

    let mut vm = VmBuilder::new()
        .vcpus(1)
        .memory_mib(128)
        .kernel(&kernel_path)
        .rootfs(&disk_path)
        .run_dir(run_dir.path())
        .launch("it-boot")
        .await
        .expect("Failed to launch VM");

    assert!(vm.is_running());
    assert!(vm.pid().is_some());

    let mut console = vm.take_console().expect("console taken once");
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(10), console.read(&mut buf))
        .await
        .expect("no console output")
        .unwrap();
    assert!(read > 0);

    vm.kill().await;
    assert!(!vm.is_running());
}

/// Graceful shutdown makes the Firecracker process exit.
#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_ctrl_alt_del_shutdown() {
    let Some((kernel_path, disk_path)) = image_paths() else {
        return;
    };
    let run_dir = tempfile::tempdir().unwrap();

    let vm = VmBuilder::new()
        .kernel(&kernel_path)
        .rootfs(&disk_path)
        .run_dir(run_dir.path())
        .launch("it-shutdown")
        .await
        .expect("Failed to launch VM");

    // Give the guest time to install its ctrl-alt-del handler.
    tokio::time::sleep(Duration::from_secs(3)).await;
    vm.shutdown().await.expect("Failed to send ctrl-alt-del");

    let exit = tokio::time::timeout(Duration::from_secs(30), vm.wait())
        .await
        .expect("guest did not shut down");
    eprintln!("guest exited: {exit}");
    assert!(!vm.is_running());
}
