use assert_cmd::Command;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn x264_available() -> bool {
    std::process::Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .output()
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).contains("libx264"))
        .unwrap_or(false)
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn write_clip(path: &Path, size: &str, seconds: f64, with_audio: bool) {
    let mut cmd = std::process::Command::new("ffmpeg");
    cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
        .arg(format!("testsrc=size={}:rate=10:duration={}", size, seconds));
    if with_audio {
        cmd.args(["-f", "lavfi", "-i"])
            .arg(format!("sine=frequency=440:sample_rate=48000:duration={}", seconds))
            .args(["-c:a", "aac", "-shortest"]);
    }
    let status = cmd
        .args(["-c:v", "libx264", "-preset", "ultrafast", "-pix_fmt", "yuv420p"])
        .arg(path)
        .status()
        .expect("spawn ffmpeg");
    assert!(status.success(), "could not generate {}", path.display());
}

fn video_size(path: &Path) -> String {
    let out = std::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .expect("ffprobe runs");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn has_audio(path: &Path) -> bool {
    let out = std::process::Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "a", "-show_entries", "stream=index", "-of", "csv=p=0"])
        .arg(path)
        .output()
        .expect("ffprobe runs");
    !String::from_utf8_lossy(&out.stdout).trim().is_empty()
}

fn small_canvas_config(dir: &Path) -> std::path::PathBuf {
    let cfg = dir.join("reelmerge.toml");
    fs::write(
        &cfg,
        "[canvas]\n\
         horizontal = { width = 320, height = 180 }\n\
         vertical = { width = 180, height = 320 }\n\
         square = { width = 180, height = 180 }\n",
    )
    .expect("write config");
    cfg
}

fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read output dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn merge_pads_mixed_clips_and_copies_standalone() {
    if !x264_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let input = tmp.path().join("clips");
    let out = tmp.path().join("out");
    fs::create_dir_all(&input).expect("create input dir");
    write_clip(&input.join("a.mp4"), "160x90", 2.0, true);
    write_clip(&input.join("b.mp4"), "90x160", 2.0, false);
    write_clip(&input.join("c.mp4"), "320x180", 4.0, true);
    let cfg = small_canvas_config(tmp.path());

    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .arg("merge")
        .arg(&input)
        .arg("--config")
        .arg(&cfg)
        .args(["--standalone-threshold", "3", "--title", "Demo"])
        .args(["--tier", "rocket", "--hwaccel", "off", "--progress", "plain"])
        .arg("--output-dir")
        .arg(&out)
        .output()
        .expect("merge runs");
    assert!(output.status.success(), "{}", combined_output(&output));

    let text = combined_output(&output);
    assert!(text.contains("[PROGRESS] merge"), "missing plain progress: {text}");
    assert!(text.contains("Merge summary: tier=rocket"), "{text}");
    assert!(text.contains("ok=2 failed=0"), "{text}");

    assert_eq!(
        listing(&out),
        vec!["Demo clip-1-2 merge 1.mp4", "Demo clip-3-3 merge 2.mp4"]
    );
    let merged = out.join("Demo clip-1-2 merge 1.mp4");
    assert_eq!(video_size(&merged), "320,180");
    assert!(has_audio(&merged), "silent clip should get a synthesized track");

    let copied = out.join("Demo clip-3-3 merge 2.mp4");
    assert_eq!(
        fs::read(&copied).expect("read copy"),
        fs::read(input.join("c.mp4")).expect("read source")
    );
}

#[test]
fn stability_tier_stages_large_batches() {
    if !x264_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let out = tmp.path().join("out");
    let mut clips = vec![];
    for i in 0..3 {
        let p = tmp.path().join(format!("v{}.mp4", i));
        write_clip(&p, "180x320", 1.0, i != 1);
        clips.push(p);
    }
    let cfg = small_canvas_config(tmp.path());

    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .arg("merge")
        .args(&clips)
        .arg("--config")
        .arg(&cfg)
        .args(["--tier", "stability", "--hwaccel", "off", "--progress", "quiet"])
        .args(["--naming", "parts", "--output-name", "reel"])
        .arg("--output-dir")
        .arg(&out)
        .output()
        .expect("merge runs");
    assert!(output.status.success(), "{}", combined_output(&output));

    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("staged x2"), "{text}");
    // single batch in parts mode writes the exact name; no partials or crash log remain
    assert_eq!(listing(&out), vec!["reel.mp4"]);
    assert_eq!(video_size(&out.join("reel.mp4")), "180,320");
}

#[test]
fn merge_fails_when_nothing_probes() {
    if !x264_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let bad = tmp.path().join("broken.mp4");
    fs::write(&bad, b"not a video at all").expect("write");

    let output = Command::new(assert_cmd::cargo::cargo_bin!("reelmerge"))
        .arg("merge")
        .arg(&bad)
        .args(["--hwaccel", "off", "--progress", "quiet"])
        .arg("--output-dir")
        .arg(tmp.path().join("out"))
        .output()
        .expect("merge runs");
    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(text.contains("nothing to merge"), "{text}");
}
