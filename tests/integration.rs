//! End-to-end deployment runs against synthetic build trees.

use ext_deploy::{
    deploy, DeployConfig, MetadataTool, Pipeline, Platform, ReferencePair, ToolOutcome,
    ToolStatus, WarningKind,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

/// A metadata tool that succeeds without touching the module.
#[derive(Clone, Default)]
struct RecordingTool {
    calls: Rc<RefCell<Vec<String>>>,
}

impl MetadataTool for RecordingTool {
    fn name(&self) -> String {
        "recording".into()
    }

    fn probe(&self) -> ToolStatus {
        ToolStatus::Available {
            version: "test".into(),
        }
    }

    fn change_reference(&self, old: &str, new: &str, module: &Path) -> ToolOutcome {
        self.calls.borrow_mut().push(format!(
            "change {old} {new} {}",
            module.file_name().unwrap().to_string_lossy()
        ));
        ToolOutcome::Applied
    }

    fn set_search_directive(&self, token: &str, module: &Path) -> ToolOutcome {
        self.calls.borrow_mut().push(format!(
            "directive {token} {}",
            module.file_name().unwrap().to_string_lossy()
        ));
        ToolOutcome::Applied
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Link(PathBuf),
}

fn snapshot(dir: &Path) -> BTreeMap<String, Node> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            let path = entry.path();
            let node = if path.is_symlink() {
                Node::Link(fs::read_link(&path).unwrap())
            } else {
                Node::File(fs::read(&path).unwrap())
            };
            (entry.file_name().to_string_lossy().into_owned(), node)
        })
        .collect()
}

/// A CMake-style Linux build tree with a module and a versioned library.
fn linux_build(root: &Path) {
    let out = root.join("build/lib");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("twitter_dm.cpython-311-x86_64-linux-gnu.so"), "module").unwrap();
    fs::write(out.join("libcpr.so.1.10.5"), "cpr").unwrap();
    symlink("libcpr.so.1.10.5", out.join("libcpr.so.1")).unwrap();
    symlink("libcpr.so.1", out.join("libcpr.so")).unwrap();
    fs::write(out.join("CMakeCache.txt"), "ignored").unwrap();
}

fn linux_config(root: &Path) -> DeployConfig {
    DeployConfig::new(root.join("build"), root.join("dist"), Platform::Linux, "twitter_dm")
        .with_dependency("libcpr")
        .with_dependency("libcurl")
        .with_verify(false)
}

#[test]
fn test_full_linux_run() {
    let temp = TempDir::new().unwrap();
    linux_build(temp.path());
    let tool = RecordingTool::default();

    let report = Pipeline::new(linux_config(temp.path()))
        .with_tool(tool.clone())
        .run()
        .unwrap();

    assert_eq!(report.discovered, 4);
    assert_eq!(report.deployed, 2);
    assert_eq!(report.relinked, 2);
    assert_eq!(report.rewritten, 1);
    assert!(!report.has_warnings(), "{:?}", report.warnings);

    let dist = temp.path().join("dist");
    assert_eq!(
        report.primary_module,
        Some(dist.join("twitter_dm.cpython-311-x86_64-linux-gnu.so"))
    );
    assert_eq!(fs::read_link(dist.join("libcpr.so.1")).unwrap(), PathBuf::from("libcpr.so.1.10.5"));
    assert_eq!(fs::read_link(dist.join("libcpr.so")).unwrap(), PathBuf::from("libcpr.so.1"));
    assert!(!dist.join("CMakeCache.txt").exists());
    assert_eq!(
        *tool.calls.borrow(),
        vec!["directive $ORIGIN twitter_dm.cpython-311-x86_64-linux-gnu.so"]
    );
}

#[test]
fn test_second_run_is_identical() {
    let temp = TempDir::new().unwrap();
    linux_build(temp.path());
    let dist = temp.path().join("dist");

    let first = Pipeline::new(linux_config(temp.path()))
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();
    let before = snapshot(&dist);

    let second = Pipeline::new(linux_config(temp.path()))
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();
    let after = snapshot(&dist);

    assert_eq!(before, after);
    assert_eq!(first.deployed, second.deployed);
    assert_eq!(first.relinked, second.relinked);
    assert!(!second.has_warnings());
}

#[test]
fn test_deploy_into_build_directory() {
    let temp = TempDir::new().unwrap();
    linux_build(temp.path());
    let out = temp.path().join("build/lib");
    let config = DeployConfig::new(&out, &out, Platform::Linux, "twitter_dm")
        .with_dependency("libcpr")
        .with_verify(false);
    let before = snapshot(&out);

    let report = Pipeline::new(config)
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();

    assert_eq!(report.deployed, 0);
    assert_eq!(report.in_place, 2);
    assert_eq!(snapshot(&out), before);
}

#[test]
fn test_links_follow_renamed_library() {
    let temp = TempDir::new().unwrap();
    let build = temp.path().join("build");
    fs::create_dir_all(&build).unwrap();
    fs::write(build.join("libfoo.bin"), "foo").unwrap();
    symlink("libfoo.bin", build.join("libfoo.bin.1")).unwrap();

    let config = DeployConfig::new(&build, temp.path().join("dist"), Platform::Linux, "ext")
        .with_pattern(ext_deploy::PatternSpec {
            label: "foo".into(),
            pattern: "libfoo.bin*".into(),
            substring: false,
            role: ext_deploy::ArtifactRole::Dependency,
            deploy: true,
        })
        .with_rename("libfoo.bin", "libfoo.2.bin");

    let report = Pipeline::new(config)
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();

    let dist = temp.path().join("dist");
    assert_eq!(fs::read_link(dist.join("libfoo.bin.1")).unwrap(), PathBuf::from("libfoo.2.bin"));
    assert_eq!(fs::read_to_string(dist.join("libfoo.bin.1")).unwrap(), "foo");
    assert!(!dist.join("libfoo.bin").exists());
    // nothing to rewrite without a module
    assert_eq!(report.warnings_of(WarningKind::NoPrimaryModule).count(), 1);
}

#[test]
fn test_unmatched_dependency_does_not_block() {
    let temp = TempDir::new().unwrap();
    linux_build(temp.path());
    let config = linux_config(temp.path()).with_dependency("libspdlog");

    let report = Pipeline::new(config)
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();

    assert_eq!(report.deployed, 2);
    assert!(!report.has_warnings());
}

#[test]
fn test_missing_tool_degrades() {
    let temp = TempDir::new().unwrap();
    linux_build(temp.path());
    let config = linux_config(temp.path()).with_tool("/nonexistent/bin/patchelf");

    let report = deploy(config).unwrap();

    assert_eq!(report.deployed, 2);
    assert_eq!(report.relinked, 2);
    assert_eq!(report.rewritten, 0);
    assert_eq!(report.warnings_of(WarningKind::ToolMissing).count(), 1);
    assert!(temp
        .path()
        .join("dist/twitter_dm.cpython-311-x86_64-linux-gnu.so")
        .exists());
}

#[test]
fn test_copy_failure_is_fatal() {
    let temp = TempDir::new().unwrap();
    linux_build(temp.path());
    let dist = temp.path().join("dist");
    // a non-empty directory squatting on a library's name cannot be replaced
    fs::create_dir_all(dist.join("libcpr.so.1.10.5/keep")).unwrap();
    let tool = RecordingTool::default();

    let err = Pipeline::new(linux_config(temp.path()))
        .with_tool(tool.clone())
        .run()
        .unwrap_err();

    assert!(
        format!("{err:#}").contains("libcpr.so.1.10.5"),
        "error should name the artifact: {err:#}"
    );
    assert!(!dist.join("libcpr.so.1").is_symlink());
    assert!(tool.calls.borrow().is_empty());
}

#[test]
fn test_nothing_built_yet() {
    let temp = TempDir::new().unwrap();
    let report = Pipeline::new(linux_config(temp.path()))
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();

    assert_eq!(report.discovered, 0);
    assert_eq!(report.warnings_of(WarningKind::NoArtifacts).count(), 1);
    assert_eq!(report.warnings_of(WarningKind::NoPrimaryModule).count(), 1);
    assert!(temp.path().join("dist").is_dir());
}

#[test]
fn test_macos_references_follow_deployed_names() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("cmake-build-release");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("twitter_dm.cpython-311-darwin.so"), "module").unwrap();
    fs::write(out.join("libcpr.1.10.5.dylib"), "cpr").unwrap();
    symlink("libcpr.1.10.5.dylib", out.join("libcpr.1.dylib")).unwrap();
    fs::write(out.join("libspdlog.1.12.0.dylib"), "spdlog").unwrap();

    let config = DeployConfig {
        build_roots: DeployConfig::candidate_roots(temp.path()),
        ..DeployConfig::new("unused", temp.path().join("dist"), Platform::MacOs, "twitter_dm")
    }
    .with_dependency("libcpr")
    .with_dependency("libspdlog")
    .with_reference(ReferencePair::new(
        "@rpath/libspdlog.1.12.dylib",
        "@loader_path/libspdlog.1.12.0.dylib",
    ));
    let tool = RecordingTool::default();

    let report = Pipeline::new(config).with_tool(tool.clone()).run().unwrap();

    assert_eq!(report.deployed, 3);
    assert_eq!(report.relinked, 1);
    assert_eq!(report.rewritten, 4);
    let calls = tool.calls.borrow();
    assert_eq!(
        calls[0],
        "change @rpath/libspdlog.1.12.dylib @loader_path/libspdlog.1.12.0.dylib twitter_dm.cpython-311-darwin.so"
    );
    assert!(calls.contains(
        &"change @rpath/libcpr.1.dylib @loader_path/libcpr.1.dylib twitter_dm.cpython-311-darwin.so"
            .to_string()
    ));
    assert!(!calls.iter().any(|c| c.starts_with("directive")));
}

#[test]
fn test_windows_needs_no_tool() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("Release");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("twitter_dm.cp311-win_amd64.pyd"), "module").unwrap();
    fs::write(out.join("libcurl.dll"), "curl").unwrap();
    fs::write(out.join("twitter_dm.so"), "wrong platform").unwrap();

    let config = DeployConfig::new(&out, temp.path().join("dist"), Platform::Windows, "twitter_dm")
        .with_dependency("libcurl");
    let report = deploy(config).unwrap();

    assert_eq!(report.deployed, 2);
    assert_eq!(report.rewritten, 0);
    assert!(!report.has_warnings(), "{:?}", report.warnings);
    assert!(!temp.path().join("dist/twitter_dm.so").exists());
}

#[test]
fn test_config_file_run() {
    let temp = TempDir::new().unwrap();
    linux_build(temp.path());
    let config_path = temp.path().join("deploy.toml");
    fs::write(
        &config_path,
        r#"
build_roots = ["build"]
destination = "dist"
platform = "linux"
module_name = "twitter_dm"
dependencies = ["libcpr"]
verify = false
"#,
    )
    .unwrap();

    let config = DeployConfig::load(&config_path).unwrap();
    let report = Pipeline::new(config)
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();

    assert_eq!(report.deployed, 2);
    assert!(temp.path().join("dist/libcpr.so").is_symlink());
}

#[test]
fn test_earlier_root_wins() {
    let temp = TempDir::new().unwrap();
    for (dir, body) in [("cmake-build-release", "release"), ("cmake-build-debug", "debug")] {
        let out = temp.path().join(dir);
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("ext.so"), body).unwrap();
    }
    let config = DeployConfig {
        build_roots: DeployConfig::candidate_roots(temp.path()),
        ..DeployConfig::new("unused", temp.path().join("dist"), Platform::Linux, "ext")
    }
    .with_verify(false);

    let report = Pipeline::new(config)
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();

    assert_eq!(report.deployed, 1);
    assert_eq!(report.warnings_of(WarningKind::DuplicateName).count(), 1);
    assert_eq!(fs::read_to_string(temp.path().join("dist/ext.so")).unwrap(), "release");
}

#[test]
fn test_rebuild_into_nested_destination() {
    let temp = TempDir::new().unwrap();
    let build = temp.path().join("build");
    let dist = build.join("lib.linux-x86_64-cpython-312");
    fs::create_dir_all(&build).unwrap();
    let module = "twitter_dm.cpython-312-x86_64-linux-gnu.so";
    fs::write(build.join(module), "v1").unwrap();
    let config = DeployConfig::new(&build, &dist, Platform::Linux, "twitter_dm").with_verify(false);

    Pipeline::new(config.clone())
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();
    fs::write(build.join(module), "v2").unwrap();
    let report = Pipeline::new(config)
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();

    assert_eq!(report.discovered, 1);
    assert_eq!(report.deployed, 1);
    assert_eq!(report.in_place, 0);
    assert!(!report.has_warnings(), "{:?}", report.warnings);
    assert_eq!(fs::read_to_string(dist.join(module)).unwrap(), "v2");
}

#[test]
fn test_later_root_link_keeps_earlier_file() {
    let temp = TempDir::new().unwrap();
    let release = temp.path().join("cmake-build-release");
    let build = temp.path().join("build");
    fs::create_dir_all(&release).unwrap();
    fs::create_dir_all(&build).unwrap();
    fs::write(release.join("ext.so"), "module").unwrap();
    fs::write(release.join("libcpr.so.1"), "release").unwrap();
    fs::write(build.join("libcpr.so.1.10.5"), "build").unwrap();
    symlink("libcpr.so.1.10.5", build.join("libcpr.so.1")).unwrap();

    let config = DeployConfig {
        build_roots: DeployConfig::candidate_roots(temp.path()),
        ..DeployConfig::new("unused", temp.path().join("dist"), Platform::Linux, "ext")
    }
    .with_dependency("libcpr")
    .with_verify(false);

    let report = Pipeline::new(config)
        .with_tool(RecordingTool::default())
        .run()
        .unwrap();

    let dist = temp.path().join("dist");
    assert_eq!(report.deployed, 3);
    assert_eq!(report.relinked, 0);
    assert_eq!(report.warnings_of(WarningKind::DuplicateName).count(), 1);
    assert!(!dist.join("libcpr.so.1").is_symlink());
    assert_eq!(fs::read_to_string(dist.join("libcpr.so.1")).unwrap(), "release");
}
