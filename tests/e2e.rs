use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn write_config(dir: &Path, hashcat: &Path) -> std::path::PathBuf {
    let rules = dir.join("best64.rule");
    let words = dir.join("words.txt");
    fs::write(&rules, ":\n").unwrap();
    fs::write(&words, "Summer2024!\n").unwrap();
    let cfg = dir.join("gladius.toml");
    fs::write(
        &cfg,
        format!(
            "[project]\npath = '{root}/project'\n\n[secretsdump]\nwatch_path = '{root}/dumps'\n\n[hashcat]\nbinary = '{hc}'\nruleset = '{rules}'\nwordlist = '{words}'\n",
            root = dir.display(),
            hc = hashcat.display(),
            rules = rules.display(),
            words = words.display(),
        ),
    )
    .unwrap();
    cfg
}

#[test]
fn missing_config_causes_non_zero_exit() {
    let tmp = tempdir().unwrap();
    let mut cmd = Command::cargo_bin("gladius").unwrap();
    cmd.arg("-c").arg(tmp.path().join("nope.toml"));
    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("nope.toml"));
}

#[test]
fn config_without_sources_is_rejected() {
    let tmp = tempdir().unwrap();
    let cfg = tmp.path().join("gladius.toml");
    fs::write(
        &cfg,
        "[project]\npath = '/tmp/x'\n[hashcat]\nbinary = 'h'\nruleset = 'r'\nwordlist = 'w'\n",
    )
    .unwrap();
    let mut cmd = Command::cargo_bin("gladius").unwrap();
    cmd.arg("-c").arg(&cfg);
    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("no capture source"));
}

#[test]
fn missing_engine_binary_aborts_before_watching() {
    let tmp = tempdir().unwrap();
    let cfg = write_config(tmp.path(), &tmp.path().join("hashcat.bin"));
    let mut cmd = Command::cargo_bin("gladius").unwrap();
    cmd.arg("-c").arg(&cfg);
    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("binary not found"));
    assert!(!tmp.path().join("dumps").exists());
}

#[cfg(unix)]
fn fake_engine(path: &Path, body: &str) {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    let mut f = fs::File::create(path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    f.sync_all().unwrap();
    drop(f);
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
#[test]
fn outdated_engine_exits_with_distinct_code() {
    let tmp = tempdir().unwrap();
    let hc = tmp.path().join("hashcat.bin");
    fake_engine(
        &hc,
        "#!/bin/sh\necho 'This copy of hashcat is outdated. Get a more recent version.' >&2\nexit 255\n",
    );
    let cfg = write_config(tmp.path(), &hc);
    let mut cmd = Command::cargo_bin("gladius").unwrap();
    cmd.arg("-c").arg(&cfg);
    cmd.assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("outdated"));
}

/// Drives the library pipeline with a fake hashcat that "cracks" every
/// digest in its batch to the same password.
#[cfg(unix)]
#[test]
fn dump_to_cracked_credentials_end_to_end() {
    use gladius::config::Config;
    use gladius::cracker::CrackInvoker;
    use gladius::export::CredentialSink;
    use gladius::graph::PipelineGraph;
    use gladius::render::{CredentialRenderer, Style};
    use gladius::stage::StageContext;
    use gladius::store::HashStore;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    let tmp = tempdir().unwrap();
    let hc = tmp.path().join("hashcat.bin");
    fake_engine(
        &hc,
        r#"#!/bin/sh
out=""
prev=""
last2=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  last2="$prev"
  prev="$a"
done
batch="$last2"
while IFS= read -r h; do echo "$h:Summer2024!"; done < "$batch" > "$out"
"#,
    );
    let cfg_path = write_config(tmp.path(), &hc);
    let cfg = Config::load(&cfg_path).unwrap();

    let store = Arc::new(HashStore::new());
    let ctx = Arc::new(StageContext {
        store: Arc::clone(&store),
        invoker: CrackInvoker::new(cfg.hashcat.clone(), None),
        renderer: CredentialRenderer::new(Style::Plain),
        sink: CredentialSink::in_dir(&cfg.creds_dir()),
    });
    let mut graph = PipelineGraph::from_config(&cfg, ctx).unwrap();
    graph.start().unwrap();

    let dump = "[*] Dumping local SAM hashes (uid:rid:lmhash:nthash)\n\
Administrator:500:aad3b435b51404eeaad3b435b51404ee:8846f7eaee8fb117ad06bdd830b7586c:::\n\
helpdesk:1002:aad3b435b51404eeaad3b435b51404ee:8846f7eaee8fb117ad06bdd830b7586c:::\n\
WS01$:1003:aad3b435b51404eeaad3b435b51404ee:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa:::\n";
    fs::write(tmp.path().join("dumps").join("ws01.sam"), dump).unwrap();

    let creds_file = cfg.creds_dir().join("credentials.txt");
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut text = String::new();
    while Instant::now() < deadline {
        text = fs::read_to_string(&creds_file).unwrap_or_default();
        if text.lines().count() >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    graph.stop();

    assert!(text.contains(". Administrator Summer2024!"), "got: {text}");
    assert!(text.contains(". helpdesk Summer2024!"), "got: {text}");
    assert!(!text.contains("WS01$"));
    let stats = store.snapshot_stats();
    assert_eq!((stats.cracked, stats.total), (2, 2));
    assert!(tmp.path().join(gladius::cracker::EULA_FILE).exists());
}
