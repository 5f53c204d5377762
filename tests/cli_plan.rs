use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn ffmpeg_available() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

/// Video-only test pattern clip of an exact length.
fn write_clip(path: &Path, size: &str, seconds: f64) -> bool {
    std::process::Command::new("ffmpeg")
        .args(["-y", "-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
        .arg(format!("testsrc=size={}:rate=5:duration={}", size, seconds))
        .args(["-pix_fmt", "yuv420p"])
        .arg(path)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[test]
fn merge_help_lists_all_flags() {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .arg("merge")
        .arg("--help")
        .output()
        .expect("merge --help runs");

    assert!(output.status.success());
    let text = combined_output(&output);
    for flag in [
        "--max-duration",
        "--max-clips",
        "--standalone-threshold",
        "--mode",
        "--title",
        "--naming",
        "--output-dir",
        "--tier",
        "--hwaccel",
        "--config",
        "--progress",
    ] {
        assert!(text.contains(flag), "help text missing {flag}: {text}");
    }
}

#[test]
fn tier_command_reports_forced_tuning() {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .args(["tier", "--tier", "potato"])
        .output()
        .expect("tier runs");
    assert!(output.status.success(), "{}", combined_output(&output));

    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("Tier: potato (forced=true)"), "{text}");
    assert!(text.contains("max_batch_clips=4"), "{text}");
    assert!(text.contains("preset=Fast"), "{text}");
}

#[test]
fn tier_command_honors_config_overrides() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = tmp.path().join("reelmerge.toml");
    fs::write(
        &cfg,
        "[tier]\nforce = \"stability\"\nmerge_workers = 6\nio_queue_depth = 2048\n",
    )
    .expect("write config");

    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .arg("tier")
        .arg("--config")
        .arg(&cfg)
        .output()
        .expect("tier runs");
    assert!(output.status.success(), "{}", combined_output(&output));

    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("Tier: ultimate-stability"), "{text}");
    assert!(text.contains("merge_workers=1"), "{text}");
    assert!(text.contains("io_queue_depth=2048"), "{text}");
    assert!(text.contains("internal_fallback=false"), "{text}");
}

#[test]
fn bad_config_is_rejected_with_path() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = tmp.path().join("broken.toml");
    fs::write(&cfg, "[canvas]\nhorizontal = { width = 1921, height = 1080 }\n").expect("write");

    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .arg("tier")
        .arg("--config")
        .arg(&cfg)
        .output()
        .expect("tier runs");
    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(text.contains("broken.toml"), "{text}");
    assert!(text.contains("canvas.horizontal"), "{text}");
}

#[test]
fn plan_partitions_clips_by_limits() {
    if !ffmpeg_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let input = tmp.path().join("clips");
    fs::create_dir_all(&input).expect("create input dir");
    let lengths = [3.0, 4.0, 7.0, 2.0, 1.5];
    let mut paths: Vec<PathBuf> = vec![];
    for (i, secs) in lengths.iter().enumerate() {
        let p = input.join(format!("{:02}.mp4", i));
        assert!(write_clip(&p, "160x90", *secs), "could not generate {}", p.display());
        paths.push(p);
    }
    fs::write(input.join("notes.txt"), b"ignored").expect("write notes");

    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .arg("plan")
        .arg(&input)
        .args(["--max-duration", "6", "--max-clips", "3", "--standalone-threshold", "6"])
        .args(["--title", "Beach: Day/1", "--tier", "rocket", "--progress", "quiet"])
        .arg("--output-dir")
        .arg(tmp.path().join("out"))
        .output()
        .expect("plan runs");
    assert!(output.status.success(), "{}", combined_output(&output));

    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("Plan: batches=4 clips=5 excluded=0"), "{text}");
    assert!(text.contains("[1] clips 1-1"), "{text}");
    assert!(text.contains("[2] clips 2-2"), "{text}");
    assert!(text.contains("[3] clips 3-3"), "{text}");
    assert!(text.contains("(standalone)"), "{text}");
    assert!(text.contains("[4] clips 4-5"), "{text}");
    assert!(text.contains("Beach Day1 clip-4-5 merge 4.mp4"), "{text}");
    // plan never writes
    assert!(!tmp.path().join("out").exists());
}

#[test]
fn plan_lists_unprobeable_clips_as_excluded() {
    if !ffmpeg_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let good = tmp.path().join("good.mp4");
    let bad = tmp.path().join("bad.mp4");
    assert!(write_clip(&good, "160x90", 2.0));
    fs::write(&bad, b"definitely not a video").expect("write bad clip");

    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .arg("plan")
        .arg(&bad)
        .arg(&good)
        .args(["--progress", "plain"])
        .output()
        .expect("plan runs");
    assert!(output.status.success(), "{}", combined_output(&output));

    let text = combined_output(&output);
    assert!(text.contains("Plan: batches=1 clips=1 excluded=1"), "{text}");
    assert!(text.contains("excluded: "), "{text}");
    assert!(text.contains("[WARN] probe"), "missing probe warning: {text}");
    assert!(text.contains("[1] clips 2-2"), "{text}");
}
