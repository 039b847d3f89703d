//! An [`Engine`] backed by the `gpg` command line.
//!
//! Every operation spawns one `gpg --batch` process. Passphrases go through
//! loopback pinentry on stdin, outcomes are read from `--status-fd` lines.

use crate::armor::{self, ArmorMarker};
use crate::config::GpgConfig;
use crate::engine::{
    Engine, EngineError, EngineKeyInfo, MissingSecretKeySnafu, NoKeySetSnafu, OperationSnafu,
    SignatureInfo, SpawnSnafu, UnknownKeySnafu, Utf8Snafu,
};
use crate::fingerprint::Fingerprint;
use crate::roles::Role;
use crate::timestamp;
use snafu::{ensure, OptionExt, ResultExt};
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

const STATUS_PREFIX: &str = "[GNUPG:] ";
/// `GPG_ERR_BAD_PASSPHRASE`, the low 16 bits of a `FAILURE` or `ERROR` code.
const BAD_PASSPHRASE: u32 = 11;
/// `INV_RECP` / `INV_SGNR` reason for a key that is not in the keyring.
const NOT_FOUND: &str = "1";
const PROBE: &[u8] = b"probe";

pub struct GnupgEngine {
    program: PathBuf,
    agent: PathBuf,
    home: Option<PathBuf>,
    putenv: bool,
    encrypt_keys: Vec<Fingerprint>,
    decrypt_keys: Vec<(Fingerprint, String)>,
    sign_keys: Vec<(Fingerprint, String)>,
}

impl std::fmt::Debug for GnupgEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fingerprints = |keys: &[(Fingerprint, String)]| -> Vec<Fingerprint> {
            keys.iter().map(|(fingerprint, _)| *fingerprint).collect()
        };
        f.debug_struct("GnupgEngine")
            .field("program", &self.program)
            .field("home", &self.home)
            .field("putenv", &self.putenv)
            .field("encrypt_keys", &self.encrypt_keys)
            .field("decrypt_keys", &fingerprints(&self.decrypt_keys))
            .field("sign_keys", &fingerprints(&self.sign_keys))
            .field("passphrases", &"<secret>")
            .finish()
    }
}

impl Default for GnupgEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GnupgEngine {
    /// `gpg` from `PATH` with its default home directory.
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("gpg"),
            agent: PathBuf::from("gpg-connect-agent"),
            home: None,
            putenv: false,
            encrypt_keys: Vec::new(),
            decrypt_keys: Vec::new(),
            sign_keys: Vec::new(),
        }
    }

    pub fn from_config(config: &GpgConfig) -> Self {
        Self {
            home: config.keyring.clone(),
            putenv: config.putenv,
            ..Self::new()
        }
    }

    pub fn with_home(self, home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
            ..self
        }
    }

    pub fn with_program(self, program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..self
        }
    }

    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    /// Whether the `gpg` program can be run at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    fn command(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        if let Some(home) = &self.home {
            if self.putenv {
                command.env("GNUPGHOME", home);
            } else {
                command.arg("--homedir").arg(home);
            }
        }
        command
    }

    fn run<I, S>(&self, args: I, passphrase: Option<&str>, input: &[u8]) -> Result<Output, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = self.command(&self.program);
        command.args(["--batch", "--no-tty", "--yes", "--status-fd", "2"]);
        if passphrase.is_some() {
            command.args(["--pinentry-mode", "loopback", "--passphrase-fd", "0"]);
        }
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(?command, "running gpg");

        let mut payload = Vec::with_capacity(input.len() + 64);
        if let Some(passphrase) = passphrase {
            payload.extend_from_slice(passphrase.as_bytes());
            payload.push(b'\n');
        }
        payload.extend_from_slice(input);

        let mut child = command.spawn().context(SpawnSnafu)?;
        // fed from a thread so a large input cannot deadlock against stdout
        let writer = child
            .stdin
            .take()
            .map(|mut stdin| std::thread::spawn(move || stdin.write_all(&payload)));
        let output = child.wait_with_output().context(SpawnSnafu)?;
        if let Some(Ok(Err(error))) = writer.map(std::thread::JoinHandle::join) {
            debug!(%error, "gpg stopped reading its input");
        }

        Ok(Output::parse(
            output.status.success(),
            output.stdout,
            &output.stderr,
        ))
    }

    /// The agent caches loopback passphrases; drop them so a passphrase
    /// check really checks.
    fn forget_passphrases(&self) {
        let status = self
            .command(&self.agent)
            .args(["reloadagent", "/bye"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(%status, "could not reload the gpg agent"),
            Err(error) => warn!(%error, "could not reload the gpg agent"),
        }
    }

    /// Primary fingerprint and user ids of the first key matching `query`.
    fn lookup(&self, query: &str) -> Result<Option<(Fingerprint, Vec<String>)>, EngineError> {
        let output = self.run(["--with-colons", "--list-keys", query], None, &[])?;
        if !output.success {
            return Ok(None);
        }
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    fn has_secret(&self, fingerprint: &Fingerprint) -> Result<bool, EngineError> {
        let query = fingerprint.to_string();
        let output = self.run(
            ["--with-colons", "--list-secret-keys", query.as_str()],
            None,
            &[],
        )?;
        Ok(output.success
            && String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| line.starts_with("sec:")))
    }

    fn require_secret(&self, fingerprint: &Fingerprint) -> Result<(), EngineError> {
        let fingerprint = *fingerprint;
        ensure!(
            self.key_info(&fingerprint)?.is_some(),
            UnknownKeySnafu { fingerprint }
        );
        ensure!(
            self.has_secret(&fingerprint)?,
            MissingSecretKeySnafu { fingerprint }
        );
        Ok(())
    }

    fn encrypt_args(recipients: &[Fingerprint]) -> Vec<String> {
        let mut args = vec!["--armor".to_owned(), "--trust-model".into(), "always".into()];
        for recipient in recipients {
            args.push("--recipient".into());
            args.push(recipient.to_string());
        }
        args
    }

    fn encrypt_with(&self, text: &str, signer: Option<&(Fingerprint, String)>) -> Result<String, EngineError> {
        let recipient = *self.encrypt_keys.first().context(NoKeySetSnafu {
            role: Role::Encrypt,
        })?;
        let mut args = Self::encrypt_args(&self.encrypt_keys);
        if let Some((fingerprint, _)) = signer {
            args.extend(["--local-user".into(), fingerprint.to_string(), "--sign".into()]);
        }
        args.push("--encrypt".into());

        let passphrase = signer.map(|(_, passphrase)| passphrase.as_str());
        let output = self.run(&args, passphrase, text.as_bytes())?;
        let blame = signer
            .filter(|_| output.bad_passphrase())
            .map_or(recipient, |(fingerprint, _)| *fingerprint);
        output.check(blame)?.into_text()
    }

    /// Decrypt with the first bound key whose secret key opens the message.
    fn decrypt_with(&self, text: &str, verify: bool) -> Result<Output, EngineError> {
        ensure!(
            !self.decrypt_keys.is_empty(),
            NoKeySetSnafu {
                role: Role::Decrypt
            }
        );
        let args: &[&str] = if verify {
            &["--decrypt"]
        } else {
            &["--skip-verify", "--decrypt"]
        };

        let mut failure = None;
        for (fingerprint, passphrase) in &self.decrypt_keys {
            let output = self.run(args, Some(passphrase.as_str()), text.as_bytes())?;
            if !output.decrypted() {
                failure = Some(output.failure(*fingerprint));
                continue;
            }
            if output.decryption_key() == Some(*fingerprint) {
                return Ok(output);
            }
            failure = Some(
                OperationSnafu {
                    message: format!("the message is not encrypted to {fingerprint}"),
                }
                .build(),
            );
        }
        Err(failure.unwrap_or_else(|| {
            OperationSnafu {
                message: "decryption failed",
            }
            .build()
        }))
    }

    fn signatures(&self, output: &Output) -> Result<Vec<SignatureInfo>, EngineError> {
        let mut signatures = valid_signatures(output);
        for fields in output.status("BADSIG") {
            let Some(key_id) = fields.first() else {
                continue;
            };
            if let Some((fingerprint, _)) = self.lookup(key_id)? {
                signatures.push(SignatureInfo {
                    fingerprint,
                    valid: false,
                    created: None,
                });
            }
        }
        Ok(signatures)
    }

    fn first_sign_key(&self) -> Result<&(Fingerprint, String), EngineError> {
        self.sign_keys
            .first()
            .context(NoKeySetSnafu { role: Role::Sign })
    }
}

impl Engine for GnupgEngine {
    fn import(&mut self, armored_key: &str) -> Result<Fingerprint, EngineError> {
        let output = self.run(["--import"], None, armored_key.as_bytes())?;
        let fingerprint = output
            .status("IMPORT_OK")
            .find_map(|fields| fields.get(1)?.parse().ok())
            .with_context(|| OperationSnafu {
                message: output.message(),
            });
        fingerprint
    }

    fn key_info(&self, fingerprint: &Fingerprint) -> Result<Option<EngineKeyInfo>, EngineError> {
        let Some((found, uids)) = self.lookup(&fingerprint.to_string())? else {
            return Ok(None);
        };
        // a subkey fingerprint also matches, but does not name this key
        if found != *fingerprint {
            return Ok(None);
        }
        Ok(Some(EngineKeyInfo {
            fingerprint: found,
            has_secret: self.has_secret(&found)?,
            uids,
        }))
    }

    fn add_encrypt_key(&mut self, fingerprint: &Fingerprint) -> Result<(), EngineError> {
        let fingerprint = *fingerprint;
        ensure!(
            self.key_info(&fingerprint)?.is_some(),
            UnknownKeySnafu { fingerprint }
        );
        let mut args = Self::encrypt_args(&[fingerprint]);
        args.push("--encrypt".into());
        self.run(&args, None, PROBE)?.check(fingerprint)?;

        self.encrypt_keys.push(fingerprint);
        Ok(())
    }

    fn add_decrypt_key(
        &mut self,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), EngineError> {
        let fingerprint = *fingerprint;
        self.require_secret(&fingerprint)?;

        let mut args = Self::encrypt_args(&[fingerprint]);
        args.push("--encrypt".into());
        let probe = self.run(&args, None, PROBE)?.check(fingerprint)?;
        self.forget_passphrases();
        let output = self.run(["--skip-verify", "--decrypt"], Some(passphrase), &probe.stdout)?;
        if !output.decrypted() {
            return Err(output.failure(fingerprint));
        }

        self.decrypt_keys.push((fingerprint, passphrase.to_owned()));
        Ok(())
    }

    fn add_sign_key(
        &mut self,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), EngineError> {
        let fingerprint = *fingerprint;
        self.require_secret(&fingerprint)?;

        self.forget_passphrases();
        let user = fingerprint.to_string();
        let args = ["--local-user", user.as_str(), "--detach-sign"];
        self.run(args, Some(passphrase), PROBE)?.check(fingerprint)?;

        self.sign_keys.push((fingerprint, passphrase.to_owned()));
        Ok(())
    }

    fn encrypt(&mut self, text: &str) -> Result<String, EngineError> {
        self.encrypt_with(text, None)
    }

    fn encrypt_and_sign(&mut self, text: &str) -> Result<String, EngineError> {
        let signer = self.first_sign_key()?;
        self.encrypt_with(text, Some(signer))
    }

    fn decrypt(&mut self, text: &str) -> Result<String, EngineError> {
        self.decrypt_with(text, false)?.into_text()
    }

    fn decrypt_and_verify(
        &mut self,
        text: &str,
    ) -> Result<(String, Vec<SignatureInfo>), EngineError> {
        let output = self.decrypt_with(text, true)?;
        let signatures = self.signatures(&output)?;
        Ok((output.into_text()?, signatures))
    }

    fn sign(&mut self, text: &str) -> Result<String, EngineError> {
        let (fingerprint, passphrase) = self.first_sign_key()?;
        let user = fingerprint.to_string();
        let args = ["--local-user", user.as_str(), "--clearsign"];
        self.run(args, Some(passphrase.as_str()), text.as_bytes())?
            .check(*fingerprint)?
            .into_text()
    }

    fn verify(&mut self, signed_text: &str) -> Result<(Vec<SignatureInfo>, String), EngineError> {
        // keeps gpg from trying to decrypt whatever else it is handed
        armor::assert_marker(signed_text, ArmorMarker::SignedMessage).map_err(|error| {
            OperationSnafu {
                message: error.to_string(),
            }
            .build()
        })?;

        let output = self.run(["--decrypt"], None, signed_text.as_bytes())?;
        let signatures = self.signatures(&output)?;
        if !output.success && signatures.is_empty() {
            return OperationSnafu {
                message: output.message(),
            }
            .fail();
        }
        Ok((signatures, output.into_text()?))
    }

    fn clear_encrypt_keys(&mut self) {
        self.encrypt_keys.clear();
    }

    fn clear_decrypt_keys(&mut self) {
        self.decrypt_keys.clear();
    }

    fn clear_sign_keys(&mut self) {
        self.sign_keys.clear();
    }
}

/// What a `gpg` run left behind: stdout, status lines and the rest of stderr.
#[derive(Debug)]
struct Output {
    success: bool,
    stdout: Vec<u8>,
    status: Vec<String>,
    diagnostics: Vec<String>,
}

impl Output {
    fn parse(success: bool, stdout: Vec<u8>, stderr: &[u8]) -> Self {
        let mut status = Vec::new();
        let mut diagnostics = Vec::new();
        for line in String::from_utf8_lossy(stderr).lines() {
            match line.strip_prefix(STATUS_PREFIX) {
                Some(keyword) => status.push(keyword.to_owned()),
                None if !line.trim().is_empty() => diagnostics.push(line.trim().to_owned()),
                None => {}
            }
        }
        Self {
            success,
            stdout,
            status,
            diagnostics,
        }
    }

    /// Arguments of every `keyword` status line.
    fn status<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = Vec<&'a str>> + 'a {
        self.status.iter().filter_map(move |line| {
            let mut fields = line.split(' ');
            (fields.next() == Some(keyword)).then(|| fields.collect())
        })
    }

    fn has(&self, keyword: &str) -> bool {
        self.status(keyword).next().is_some()
    }

    fn message(&self) -> String {
        if self.diagnostics.is_empty() {
            "gpg failed".to_owned()
        } else {
            self.diagnostics.join("; ")
        }
    }

    fn bad_passphrase(&self) -> bool {
        self.has("BAD_PASSPHRASE")
            || self.status("FAILURE").chain(self.status("ERROR")).any(|fields| {
                fields
                    .get(1)
                    .and_then(|code| code.parse::<u32>().ok())
                    .is_some_and(|code| code & 0xFFFF == BAD_PASSPHRASE)
            })
    }

    fn not_found(&self) -> bool {
        self.status("INV_RECP")
            .chain(self.status("INV_SGNR"))
            .any(|fields| fields.first() == Some(&NOT_FOUND))
    }

    fn decrypted(&self) -> bool {
        self.has("DECRYPTION_OKAY") && !self.has("DECRYPTION_FAILED")
    }

    /// Primary fingerprint of the key that opened the message.
    fn decryption_key(&self) -> Option<Fingerprint> {
        self.status("DECRYPTION_KEY")
            .find_map(|fields| fields.get(1)?.parse().ok())
    }

    fn failure(&self, fingerprint: Fingerprint) -> EngineError {
        if self.bad_passphrase() {
            EngineError::BadPassphrase { fingerprint }
        } else if self.has("NO_SECKEY") {
            EngineError::MissingSecretKey { fingerprint }
        } else if self.not_found() {
            EngineError::UnknownKey { fingerprint }
        } else if self.has("INV_RECP") || self.has("INV_SGNR") {
            EngineError::Unusable {
                fingerprint,
                reason: self.message(),
            }
        } else {
            EngineError::Operation {
                message: self.message(),
            }
        }
    }

    fn check(self, fingerprint: Fingerprint) -> Result<Self, EngineError> {
        if self.success {
            Ok(self)
        } else {
            Err(self.failure(fingerprint))
        }
    }

    fn into_text(self) -> Result<String, EngineError> {
        String::from_utf8(self.stdout).context(Utf8Snafu)
    }
}

/// `VALIDSIG` lines, attributed to the primary key of the signer.
fn valid_signatures(output: &Output) -> Vec<SignatureInfo> {
    output
        .status("VALIDSIG")
        .filter_map(|fields| {
            let fingerprint = fields.get(9).or(fields.first())?.parse().ok()?;
            let created = fields
                .get(2)
                .and_then(|seconds| seconds.parse::<u32>().ok())
                .and_then(|seconds| timestamp::from_epoch(seconds).ok());
            Some(SignatureInfo {
                fingerprint,
                valid: true,
                created,
            })
        })
        .collect()
}

/// Primary fingerprint and user ids from a `--with-colons` key listing.
fn parse_listing(listing: &str) -> Option<(Fingerprint, Vec<String>)> {
    let mut primary = None;
    let mut uids = Vec::new();
    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("fpr") if primary.is_none() => {
                primary = fields.get(9).and_then(|fingerprint| fingerprint.parse().ok());
            }
            Some("uid") => {
                if let Some(uid) = fields.get(9) {
                    uids.push(uid.replace("\\x3a", ":"));
                }
            }
            // only the first key of the listing
            Some("pub") if primary.is_some() => break,
            _ => {}
        }
    }
    primary.map(|primary| (primary, uids))
}
