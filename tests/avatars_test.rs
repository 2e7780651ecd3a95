use std::fs;
use tempfile::tempdir;

#[test]
fn avatars_fallback_is_stable_across_runs() {
    let tmp = tempdir().expect("tempdir");
    let output = tmp.path().join("output");

    let run = || {
        assert_cmd::cargo::cargo_bin_cmd!("snapsplit")
            .current_dir(tmp.path())
            .env("SNAPSPLIT_HOME", tmp.path())
            .env("SNAPSPLIT_CONFIG_PATH", tmp.path().join("absent.toml"))
            .env("SNAPSPLIT_AVATAR_FETCH", "false")
            .args(["avatars", "alice", "Bob"])
            .arg("--output")
            .arg(&output)
            .assert()
            .success()
            .stdout(predicates::str::contains("alice=bitmoji/alice.svg (fallback)"));
        fs::read(output.join("bitmoji/alice.svg")).expect("alice svg")
    };

    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert!(output.join("bitmoji/bob.svg").is_file());
}
