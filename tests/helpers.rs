//! Shared test utilities for respin tests.
#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use respin::config::Config;
use respin::lifecycle::mountinfo;
use tempfile::TempDir;

/// Test environment with a private temp dir for generated workdirs and a
/// directory for input/output images.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Parent of generated workdirs (RESPIN_TMPDIR)
    pub tmp_dir: PathBuf,
    /// Where input and output images live
    pub images: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tmp_dir = temp_dir.path().join("tmp");
        let images = temp_dir.path().join("images");

        fs::create_dir_all(&tmp_dir).expect("Failed to create tmp dir");
        fs::create_dir_all(&images).expect("Failed to create images dir");

        Self {
            _temp_dir: temp_dir,
            tmp_dir,
            images,
        }
    }

    /// Configuration pointing generated workdirs at this environment.
    pub fn config(&self) -> Config {
        Config {
            tmp_dir: self.tmp_dir.clone(),
            ..Config::default()
        }
    }

    /// A scratch path inside the environment.
    pub fn path(&self, rel: &str) -> PathBuf {
        self._temp_dir.path().join(rel)
    }

    /// Entries left in the generated-workdir parent.
    pub fn leftover_workdirs(&self) -> Vec<PathBuf> {
        let mut entries: Vec<_> = fs::read_dir(&self.tmp_dir)
            .expect("Failed to read tmp dir")
            .map(|e| e.expect("Failed to read entry").path())
            .collect();
        entries.sort();
        entries
    }

    /// Write a dummy (unmountable) input file.
    pub fn fake_input(&self, name: &str) -> PathBuf {
        let path = self.images.join(name);
        fs::write(&path, b"not really an iso").expect("Failed to write input");
        path
    }

    /// Build a small ext4 image whose contents are `files`.
    pub fn ext4_image(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let src = self.image_source(name, files);
        let image = self.images.join(name);
        build_ext4_image(&src, &image, 16);
        image
    }

    /// Build an ext4 image holding `files` plus one `payload_mib` sized file,
    /// so that staging its contents takes a noticeable time.
    pub fn large_ext4_image(&self, name: &str, files: &[(&str, &str)], payload_mib: u64) -> PathBuf {
        let src = self.image_source(name, files);
        let chunk = vec![0xA5u8; 1024 * 1024];
        let mut payload =
            File::create(src.join("payload.bin")).expect("Failed to create payload");
        for _ in 0..payload_mib {
            payload.write_all(&chunk).expect("Failed to write payload");
        }
        drop(payload);

        let image = self.images.join(name);
        build_ext4_image(&src, &image, ext4_image_size_mib(payload_mib));
        image
    }

    fn image_source(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let src = self.path(&format!("{}-src", name));
        fs::create_dir_all(&src).expect("Failed to create image source dir");
        for (rel, content) in files {
            let path = src.join(rel);
            fs::create_dir_all(path.parent().unwrap()).expect("Failed to create image dir");
            fs::write(&path, content).expect("Failed to write image file");
        }
        src
    }

    /// Run the respin binary against this environment.
    pub fn respin(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_respin"))
            .args(args)
            .env("RESPIN_TMPDIR", &self.tmp_dir)
            .env_remove("RESPIN_LOG")
            .output()
            .expect("Failed to run respin")
    }
}

/// True if running with an effective UID of 0.
pub fn is_root() -> bool {
    respin::preflight::is_root()
}

/// Panic with a useful message unless mount tests can run.
pub fn require_mount_prerequisites() {
    if !is_root() {
        panic!("Mount tests need root. Run: sudo cargo test -- --ignored");
    }
    if !respin::process::exists("mkfs.ext4") {
        panic!("mkfs.ext4 not installed. Install e2fsprogs to run mount tests.");
    }
}

/// Image size for `payload_mib` of file data: ext4 metadata grows with the
/// filesystem, so the slack scales too.
pub fn ext4_image_size_mib(payload_mib: u64) -> u64 {
    payload_mib * 11 / 10 + 32
}

/// `mkfs.ext4 -d` populates the filesystem from a directory without mounting.
pub fn build_ext4_image(src: &Path, image: &Path, size_mib: u64) {
    let file = File::create(image).expect("Failed to create image file");
    file.set_len(size_mib * 1024 * 1024)
        .expect("Failed to size image file");
    drop(file);

    let status = Command::new("mkfs.ext4")
        .args(["-q", "-F", "-d"])
        .arg(src)
        .arg(image)
        .status()
        .expect("Failed to run mkfs.ext4");
    assert!(status.success(), "mkfs.ext4 failed for {}", image.display());
}

/// Assert the OS no longer lists anything mounted under `root`.
pub fn assert_nothing_mounted_under(root: &Path) {
    let table = mountinfo::read_mount_table().expect("Failed to read mount table");
    let left = mountinfo::mounts_below(&table, root);
    assert!(
        left.is_empty(),
        "Expected no mounts under {}, found: {:?}",
        root.display(),
        left
    );
}

/// Assert that a path does not exist.
pub fn assert_gone(path: &Path) {
    assert!(!path.exists(), "Expected {} to be removed", path.display());
}

/// Assert that a directory exists.
pub fn assert_dir_exists(path: &Path) {
    assert!(
        path.is_dir(),
        "Expected directory to exist: {}",
        path.display()
    );
}

/// Command lines of running processes that mention `path`.
pub fn processes_mentioning(path: &Path) -> Vec<String> {
    let needle = path.to_string_lossy().into_owned();
    let me = std::process::id().to_string();
    let mut found = Vec::new();
    for entry in fs::read_dir("/proc").expect("Failed to read /proc").flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == me || !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        // Processes may exit while we scan.
        let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
        if cmdline.contains(&needle) {
            found.push(format!("{}: {}", name, cmdline.trim_end()));
        }
    }
    found
}

/// Loop devices still backed by `image`, as reported by `losetup -j`.
pub fn loop_devices_backing(image: &Path) -> Vec<String> {
    let output = Command::new("losetup")
        .arg("-j")
        .arg(image)
        .output()
        .expect("Failed to run losetup");
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Assert that no loop device is left attached to `image`. Autoclear runs
/// when the last reference is dropped, so give the kernel a moment.
pub fn assert_no_loop_device_for(image: &Path) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut left = loop_devices_backing(image);
    while !left.is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(50));
        left = loop_devices_backing(image);
    }
    assert!(
        left.is_empty(),
        "Expected no loop device for {}, found: {:?}",
        image.display(),
        left
    );
}
