//! Shell-script stand-in for ffmpeg used by the process tests
//!
//! The script understands just enough of the command line: the `-encoders`
//! probe, concat mode and recording launches. Every recording launch is
//! appended to a log so tests can count attempts and inspect arguments.

use neorec_config::Config;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCRIPT: &str = r#"#!/bin/sh
dir='@DIR@'
case "$*" in
  *--fake-probe*) exit 0 ;;
esac

if [ "$1" = "-hide_banner" ] && [ "$2" = "-encoders" ]; then
  echo probe >> "$dir/probes"
  echo "Encoders:"
  echo " V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)"
@LISTING@
  exit 0
fi

is_concat=0
[ "$3" = "concat" ] && is_concat=1
[ "$is_concat" = 0 ] && echo "$*" >> "$dir/launches"

while IFS= read -r pattern; do
  [ -z "$pattern" ] && continue
  case "$*" in
    *"$pattern"*) echo "simulated failure: $pattern" >&2; exit 1 ;;
  esac
done < "$dir/fail_patterns"

if [ "$is_concat" = 1 ]; then
  out="${10}"
  : > "$out"
  sed -n "s/^file '\(.*\)'\$/\1/p" "$7" | while IFS= read -r f; do cat "$f" >> "$out"; done
  exit 0
fi

for arg in "$@"; do out="$arg"; done
printf '%s' '@PAYLOAD@' > "$out"
echo "Input #0, lavfi, from 'capture':" >&2
printf 'frame=  120 fps= 59.8 q=23.0 size=    1024kB time=00:00:02.00 bitrate=4194.3kbits/s dup=0 drop=3 speed=0.998x\r' >&2

@BEHAVIOUR@
"#;

const WAIT_FOR_QUIT: &str = "read -r _\nexit 0";

#[derive(Debug, Clone, Default)]
pub struct FakeEncoderBuilder {
    hardware: Vec<String>,
    fail_patterns: Vec<String>,
    ignore_quit: bool,
    ignore_terminate: bool,
    crash_after: Option<Duration>,
}

impl FakeEncoderBuilder {
    /// Hardware encoder names listed by the `-encoders` probe
    pub fn with_hardware(mut self, names: &[&str]) -> Self {
        self.hardware = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Exit 1 at startup whenever the argument list contains `pattern`
    pub fn fail_when(mut self, pattern: &str) -> Self {
        self.fail_patterns.push(pattern.to_string());
        self
    }

    /// Never react to `q` on stdin
    pub fn ignore_quit(mut self) -> Self {
        self.ignore_quit = true;
        self
    }

    /// Also ignore SIGTERM; only a kill ends the process
    pub fn ignore_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    /// Exit 1 on its own after running for `ms`
    pub fn crash_after_ms(mut self, ms: u64) -> Self {
        self.crash_after = Some(Duration::from_millis(ms));
        self
    }

    fn behaviour(&self) -> String {
        if let Some(after) = self.crash_after {
            return format!(
                "sleep {}.{:03}\necho 'Error: capture device lost' >&2\nexit 1",
                after.as_secs(),
                after.subsec_millis()
            );
        }
        if self.ignore_quit {
            let trap = if self.ignore_terminate { "trap '' TERM\n" } else { "" };
            return format!(
                "{}while :; do sleep 0.1 </dev/null >/dev/null 2>&1; done",
                trap
            );
        }
        WAIT_FOR_QUIT.to_string()
    }

    fn listing(&self) -> String {
        self.hardware
            .iter()
            .map(|name| format!("  echo \" V....D {:<20} hardware encoder (codec h264)\"", name))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[cfg(unix)]
    pub fn install(self) -> FakeEncoder {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("ffmpeg");
        let script = SCRIPT
            .replace("@DIR@", &dir.path().display().to_string())
            .replace("@LISTING@", &self.listing())
            .replace("@PAYLOAD@", FakeEncoder::SEGMENT_PAYLOAD)
            .replace("@BEHAVIOUR@", &self.behaviour());

        std::fs::write(&binary, script).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut patterns = self.fail_patterns.join("\n");
        patterns.push('\n');
        std::fs::write(dir.path().join("fail_patterns"), patterns).unwrap();

        // A concurrently forked test process may still hold the write
        // handle for a moment (ETXTBSY); wait until the script can run.
        for _ in 0..100 {
            match std::process::Command::new(&binary).arg("--fake-probe").status() {
                Ok(_) => break,
                Err(e) if e.raw_os_error() == Some(26) => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(e) => panic!("fake encoder did not run: {}", e),
            }
        }

        FakeEncoder { dir, binary }
    }
}

/// An installed fake encoder; removed when dropped
#[derive(Debug)]
pub struct FakeEncoder {
    dir: tempfile::TempDir,
    pub binary: PathBuf,
}

impl FakeEncoder {
    /// Bytes every recording launch writes to its output file
    pub const SEGMENT_PAYLOAD: &'static str = "fake-segment-data";

    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> FakeEncoderBuilder {
        FakeEncoderBuilder::default()
    }

    /// Argument lines of every recording launch, in order
    pub fn launches(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("launches"))
    }

    pub fn probe_count(&self) -> usize {
        read_lines(&self.dir.path().join("probes")).len()
    }

    /// Make every later launch matching `pattern` fail
    pub fn fail_from_now_on(&self, pattern: &str) {
        use std::io::Write;

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.dir.path().join("fail_patterns"))
            .unwrap();
        writeln!(file, "{}", pattern).unwrap();
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Configuration pointing at `fake` with short timings and `temp_base` as
/// the session directory root
pub fn test_config(fake: &FakeEncoder, temp_base: &Path) -> Config {
    let mut config = Config::default();
    config.encoder.binary = fake.binary.clone();
    config.encoder.detect_timeout_secs = 5;
    config.process.settle_ms = 100;
    config.process.graceful_stop_secs = 5;
    config.process.terminate_secs = 2;
    config.process.merge_timeout_secs = 10;
    config.session.temp_dir = Some(temp_base.to_path_buf());
    config
}
