//! End-to-end `carton compile` scenarios driven through the real binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

use carton_phar::{Compression, PharReader, SignatureAlgorithm};

fn carton() -> Command {
    Command::new(env!("CARGO_BIN_EXE_carton"))
}

fn touch(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn compile_in(dir: &Path) -> assert_cmd::assert::Assert {
    let mut cmd = carton();
    cmd.args(["compile", "--working-dir"])
        .arg(dir)
        .env_remove("PHAR_READONLY");
    cmd.assert()
}

#[test]
fn minimal_build_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("index.php"), "<?php echo 'Yo';");

    compile_in(dir.path()).success();

    let bundle = dir.path().join("index.phar");
    assert!(bundle.is_file());

    let reader = PharReader::open(&bundle).unwrap();
    assert_eq!(reader.entry_names(), vec!["index.php"]);
    assert_eq!(reader.read_entry("index.php").unwrap(), b"<?php echo 'Yo';");
    assert_eq!(reader.signature_algorithm(), SignatureAlgorithm::Sha1);
    reader.verify_signature(None).unwrap();

    let stub = String::from_utf8(reader.stub().to_vec()).unwrap();
    assert!(stub.starts_with("#!/usr/bin/env php\n<?php\n"));
    // box-auto-generated-alias-<12 alphanumerics>.phar
    let alias = reader.alias();
    assert!(alias.starts_with("box-auto-generated-alias-"));
    assert!(alias.ends_with(".phar"));
    let token = &alias["box-auto-generated-alias-".len()..alias.len() - ".phar".len()];
    assert_eq!(token.len(), 12);
    assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    assert!(stub.contains(&format!("Phar::mapPhar('{}');", alias)));
}

#[test]
fn configured_build_with_openssl_banner_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("run.php"), "<?php echo 'run';");
    write_encrypted_key(&dir.path().join("private.key"), "test");
    touch(
        &dir.path().join("box.json"),
        r#"{
            "alias": "alias-test.phar",
            "banner": "custom banner",
            "main": "run.php",
            "output": "alias-test.phar",
            "algorithm": "OPENSSL",
            "key": "private.key",
            "key-pass": "test",
            "metadata": {"rand": 42},
            "chmod": "0700"
        }"#,
    );

    compile_in(dir.path()).success();

    let bundle = dir.path().join("alias-test.phar");
    let reader = PharReader::open(&bundle).unwrap();
    assert_eq!(reader.alias(), "alias-test.phar");
    assert_eq!(reader.signature_algorithm(), SignatureAlgorithm::OpenSsl);
    assert_eq!(reader.metadata_bytes().unwrap(), b"a:1:{s:4:\"rand\";i:42;}");

    let stub = String::from_utf8(reader.stub().to_vec()).unwrap();
    assert!(stub.starts_with("#!/usr/bin/env php\n"));
    assert!(stub.contains("/*\n * custom banner\n */\n"));
    assert_eq!(stub.matches("Phar::mapPhar('alias-test.phar');").count(), 1);

    let pubkey_path = dir.path().join("alias-test.phar.pubkey");
    assert!(pubkey_path.is_file());
    let pubkey = std::fs::read_to_string(&pubkey_path).unwrap();
    reader.verify_signature(Some(&pubkey)).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&bundle).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}

#[test]
fn custom_stub_is_embedded_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("index.php"), "<?php echo 'Yo';");
    let stub = "#!/usr/bin/env php\n<?php echo 'from stub'; __HALT_COMPILER(); ?>\n";
    touch(&dir.path().join("stub.php"), stub);
    touch(&dir.path().join("box.json"), r#"{"stub": "stub.php"}"#);

    compile_in(dir.path()).success();

    let reader = PharReader::open(&dir.path().join("index.phar")).unwrap();
    assert_eq!(reader.stub(), stub.as_bytes());
}

#[test]
fn gz_compression_flags_every_entry_and_warns() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("index.php"), "<?php echo 'Yo';");
    touch(&dir.path().join("src/a.php"), "<?php function a() {}");
    touch(
        &dir.path().join("box.json"),
        r#"{"directories": ["src"], "compression": "GZ"}"#,
    );

    compile_in(dir.path())
        .success()
        .stdout(predicate::str::contains(
            "the extension \"zlib\" will now be required",
        ));

    let reader = PharReader::open(&dir.path().join("index.phar")).unwrap();
    assert_eq!(reader.entries().len(), 2);
    for entry in reader.entries() {
        assert_eq!(entry.compression, Compression::Gz);
    }
    assert_eq!(
        reader.read_entry("src/a.php").unwrap(),
        b"<?php function a() {}"
    );
}

#[test]
fn empty_bundle_holds_single_placeholder_entry() {
    let dir = tempfile::tempdir().unwrap();
    touch(
        &dir.path().join("stub.php"),
        "<?php echo 'stub only'; __HALT_COMPILER(); ?>\n",
    );
    touch(
        &dir.path().join("box.json"),
        r#"{"main": false, "output": "empty.phar", "stub": "stub.php"}"#,
    );

    compile_in(dir.path()).success();

    let reader = PharReader::open(&dir.path().join("empty.phar")).unwrap();
    assert_eq!(reader.entry_names(), vec![".box_empty"]);
    assert_eq!(reader.read_entry(".box_empty").unwrap(), b"");
}

#[test]
fn conflicting_map_aborts_without_output() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("index.php"), "<?php");
    touch(&dir.path().join("one/app.php"), "1");
    touch(&dir.path().join("two/app.php"), "2");
    touch(
        &dir.path().join("box.json"),
        r#"{"directories": ["one", "two"],
            "map": [{"one/": "lib/"}, {"two/": "lib/"}]}"#,
    );

    compile_in(dir.path())
        .failure()
        .code(1)
        .stderr(predicate::str::contains("conflicting source paths"));

    assert!(!dir.path().join("index.phar").exists());
    assert!(!dir.path().join("index.phar.tmp").exists());
}

#[test]
fn unknown_config_key_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("index.php"), "<?php");
    touch(&dir.path().join("box.json"), r#"{"no-such-option": true}"#);

    compile_in(dir.path())
        .failure()
        .code(2)
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn readonly_host_fails_before_building() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("index.php"), "<?php");

    let mut cmd = carton();
    cmd.args(["compile", "--working-dir"])
        .arg(dir.path())
        .env("PHAR_READONLY", "1");
    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("disabled by the host environment"));
    assert!(!dir.path().join("index.phar").exists());
}

#[test]
fn debug_dump_is_written_beside_the_output() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("index.php"), "<?php echo 'Yo';");

    let mut cmd = carton();
    cmd.args(["compile", "--debug", "--working-dir"])
        .arg(dir.path())
        .env_remove("PHAR_READONLY");
    cmd.assert().success();

    let dump = dir.path().join(".box_dump");
    let runner = std::fs::read_to_string(dump.join("runner.txt")).unwrap();
    assert!(runner.contains("builder: carton"));
    assert!(runner.contains("os: "));
    assert!(runner.contains("timestamp: "));
    let files = std::fs::read_to_string(dump.join("files.txt")).unwrap();
    // The main script is added separately from the enumerated set.
    assert!(!files.contains("index.phar"));
    let config = std::fs::read_to_string(dump.join("config.txt")).unwrap();
    assert!(config.contains("algorithm: Sha1"));
}

#[test]
fn no_config_ignores_the_configuration_file() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("index.php"), "<?php echo 'Yo';");
    touch(&dir.path().join("box.json"), r#"{"no-such-option": true}"#);

    let mut cmd = carton();
    cmd.args(["compile", "--no-config", "--working-dir"])
        .arg(dir.path())
        .env_remove("PHAR_READONLY");
    cmd.assert().success();
    assert!(dir.path().join("index.phar").is_file());
}

fn write_encrypted_key(path: &PathBuf, passphrase: &str) {
    use rsa::pkcs8::EncodePrivateKey;
    // 1024 bits keeps the test fast; production keys are larger.
    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let pem = key
        .to_pkcs8_encrypted_pem(&mut rand::thread_rng(), passphrase, rsa::pkcs8::LineEnding::LF)
        .unwrap();
    std::fs::write(path, pem.as_bytes()).unwrap();
}
