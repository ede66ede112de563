use std::fs::{create_dir, write};
use std::process::Command;

use escargot::CargoBuild;
use tempfile::tempdir;

#[test]
fn smoke_test() {
    let dir = tempdir().unwrap();
    create_dir(dir.path().join("lib")).unwrap();

    write(
        dir.path().join("index.js"),
        r#"
            const math = require('./lib/math.js');
            console.log(JSON.stringify(App.event));
            math.add(App.event.a, 41)
        "#,
    )
    .unwrap();
    write(
        dir.path().join("lib/math.js"),
        "exports.add = (a, b) => a + b;",
    )
    .unwrap();

    let output = jsbridge_cli()
        .arg(dir.path().join("index.js"))
        .args(["--object-name", "App"])
        .args(["--var", r#"event={"a":1,"b":[1,2,3]}"#])
        .output()
        .unwrap();

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines = stdout.trim().lines().collect::<Vec<_>>();
    assert_eq!(lines, [r#"{"a":1,"b":[1,2,3]}"#, "Result: 42"]);
}

#[test]
fn snapshots_and_force_array() {
    let dir = tempdir().unwrap();
    write(dir.path().join("seed.js"), "function pair(x) { return { x, y: x * 2 }; }").unwrap();
    write(dir.path().join("main.js"), "pair(21)").unwrap();

    let output = jsbridge_cli()
        .arg(dir.path().join("main.js"))
        .arg("--snapshot")
        .arg(dir.path().join("seed.js"))
        .arg("--force-array")
        .output()
        .unwrap();

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), "Result: [21,42]");
}

#[test]
fn failures_exit_with_the_error_chain() {
    let dir = tempdir().unwrap();
    write(dir.path().join("spin.js"), "while (true) {}").unwrap();
    write(dir.path().join("throw.js"), "throw new TypeError('bad input')").unwrap();

    let output = jsbridge_cli()
        .arg(dir.path().join("spin.js"))
        .args(["--time-limit-ms", "50"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("spin.js"), "{stderr}");
    assert!(stderr.contains("time limit"), "{stderr}");

    let output = jsbridge_cli()
        .arg(dir.path().join("throw.js"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bad input"), "{stderr}");

    let output = jsbridge_cli()
        .arg(dir.path().join("main.js"))
        .args(["--var", "broken"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

fn jsbridge_cli() -> Command {
    CargoBuild::new()
        .manifest_path(env!("CARGO_MANIFEST_PATH"))
        .bin("jsbridge")
        .current_release()
        .current_target()
        .run()
        .unwrap()
        .command()
}
