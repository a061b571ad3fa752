//! Shared fixtures for unit tests that drive real processes
//!
//! [`fake_isolate`] is a small POSIX shell stand-in for isolate: `--init`
//! creates a directory, `--run` executes the command on the host inside that
//! directory and writes a meta file. Enough to exercise the orchestration
//! logic without root.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::Config;

const FAKE_ISOLATE: &str = r#"#!/bin/sh
root="$(dirname "$0")/boxes"
id=0
action=
meta=
stdin=
stdout=
merge=
time=
while [ $# -gt 0 ]; do
    case "$1" in
        --box-id=*) id="${1#--box-id=}" ;;
        --init) action=init ;;
        --cleanup) action=cleanup ;;
        --run) action=run ;;
        --meta=*) meta="${1#--meta=}" ;;
        --stdin=*) stdin="${1#--stdin=}" ;;
        --stdout=*) stdout="${1#--stdout=}" ;;
        --stderr-to-stdout) merge=1 ;;
        --time=*) time="${1#--time=}" ;;
        --) shift; break ;;
    esac
    shift
done
dir="$root/$id"
case "$action" in
    init)
        if [ -d "$dir" ]; then
            echo "Box already exists" >&2
            exit 2
        fi
        mkdir -p "$dir/box" && echo "$dir"
        ;;
    cleanup)
        rm -rf "$dir"
        ;;
    run)
        cd "$dir/box" || exit 2
        if [ -n "$stdin" ]; then exec 0<"$dir/box/${stdin#/box/}"; fi
        if [ -n "$stdout" ]; then exec 1>"$dir/box/${stdout#/box/}"; fi
        if [ -n "$merge" ]; then exec 2>&1; fi
        if [ -n "$time" ]; then timeout "$time" "$@"; else "$@"; fi
        code=$?
        {
            echo "time:0.010"
            echo "time-wall:0.020"
            echo "max-rss:1024"
            if [ -n "$time" ] && [ "$code" -eq 124 ]; then
                echo "status:TO"
                echo "killed:1"
                echo "message:Time limit exceeded"
            elif [ "$code" -ne 0 ]; then
                echo "exitcode:$code"
                echo "status:RE"
                echo "message:Exited with error status $code"
            else
                echo "exitcode:0"
            fi
        } > "$meta"
        ;;
esac
"#;

/// Languages used against the fake isolate: `sh` is interpreted, `shc`
/// "compiles" by syntax-checking and copying the script.
const TEST_LANGUAGES: &str = r#"
[languages.sh]
name = "POSIX shell"
extension = "sh"
run.command = ["sh", "{source}"]

[languages.shc]
name = "Checked shell"
extension = "sh"
compile.command = ["sh", "-c", "sh -n {source} && cp {source} {output}"]
compile.source_name = "main.sh"
compile.output_name = "main"
run.command = ["./{binary}"]
"#;

static NEXT_BOX_ID: AtomicU32 = AtomicU32::new(100);

/// Path of the fake isolate script, written once per test process
pub(crate) fn fake_isolate() -> &'static Path {
    static SCRIPT: OnceLock<PathBuf> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("judgebox-fake-isolate-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("boxes")).unwrap();
        let staging = dir.join("isolate.tmp");
        let script = dir.join("isolate");
        std::fs::write(&staging, FAKE_ISOLATE).unwrap();
        std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::rename(&staging, &script).unwrap();
        script
    })
}

/// A box id no other test in this process uses
pub(crate) fn next_box_id() -> u32 {
    NEXT_BOX_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reserve `count` consecutive box ids, returning the first
pub(crate) fn reserve_box_ids(count: u32) -> u32 {
    NEXT_BOX_ID.fetch_add(count, Ordering::Relaxed)
}

/// Configuration pointing at the fake isolate, with all state under `work_dir`
pub(crate) fn test_config(work_dir: &Path) -> Config {
    let mut config = Config::parse_toml(TEST_LANGUAGES).unwrap();
    config.isolate_path = Some(fake_isolate().to_path_buf());
    config.cgroup = false;
    config.meta_dir = work_dir.join("meta");
    config.storage.data_dir = work_dir.join("data");
    config.storage.compile_dir = work_dir.join("compiled");
    config.grader.reset_retries = 2;
    config.grader.first_box_id = next_box_id();
    config.grader.box_count = 1;
    config
}
