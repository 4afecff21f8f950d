//! SSH/SFTP transport used to drop user-data and the reboot trigger on pool machines.
//!
//! `ssh2` is blocking, so every session runs inside `spawn_blocking`. The socket is
//! shut down when the caller's token fires, which unblocks the session thread.

use anyhow::Context;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use peerpod_common::ProviderError;
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use ssh2::Session;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const SSH_PORT: u16 = 22;
pub const USER_DATA_PATH: &str = "/media/cidata/user-data";
pub const REBOOT_PATH: &str = "/media/cidata/reboot";
pub const REBOOT_PAYLOAD: &[u8] = b"reboot";

pub const MAX_ALLOWED_HOST_KEYS: usize = 100;
pub const MAX_KEY_FILE_SIZE: u64 = 16 * 1024;

const CHROOT_PREFIX: &str = "/media/";
const RSA_KEY_BITS: usize = 2048;

/// How presented host keys are judged.
#[derive(Clone, Debug)]
pub enum HostKeyPolicy {
    /// Accept any key and log its fingerprint. Pool members are ephemeral and not pre-known.
    StatelessTofu,
    /// Accept only keys whose SHA-256 fingerprint is in the set.
    Allowlist(Arc<HashSet<String>>),
}

impl HostKeyPolicy {
    /// Allowlist when a directory is configured, TOFU otherwise.
    pub fn from_dir(dir: Option<&Path>) -> Result<Self, ProviderError> {
        match dir {
            Some(dir) => {
                let keys = load_allowed_host_keys(dir)?;
                info!(
                    "ssh host key allowlist loaded from {}: {} key(s)",
                    dir.display(),
                    keys.len()
                );
                Ok(HostKeyPolicy::Allowlist(Arc::new(keys)))
            }
            None => {
                warn!("no ssh host key allowlist configured, trusting host keys on first use");
                Ok(HostKeyPolicy::StatelessTofu)
            }
        }
    }

    pub fn verify(&self, host: &str, key_blob: &[u8]) -> Result<(), ProviderError> {
        let fp = fingerprint(key_blob);
        match self {
            HostKeyPolicy::StatelessTofu => {
                info!("accepting host key {} for {} (trust on first use)", fp, host);
                Ok(())
            }
            HostKeyPolicy::Allowlist(keys) => {
                if keys.contains(&fp) {
                    debug!("host key {} for {} is allowlisted", fp, host);
                    Ok(())
                } else {
                    warn!("rejecting host key {} for {}: not in allowlist", fp, host);
                    Err(ProviderError::Ssh(format!(
                        "host key {} for {} is not in the allowlist",
                        fp, host
                    )))
                }
            }
        }
    }
}

/// `SHA256:<unpadded base64>` of a wire-format public key blob.
pub fn fingerprint(key_blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key_blob)))
}

/// Parse one authorized-key line (`<type> <base64> [comment]`) into its type and blob.
pub fn parse_authorized_key(line: &str) -> Result<(String, Vec<u8>), ProviderError> {
    let mut fields = line.split_whitespace();
    let (key_type, encoded) = match (fields.next(), fields.next()) {
        (Some(t), Some(b)) => (t, b),
        _ => {
            return Err(ProviderError::Ssh(
                "authorized key line needs a type and a base64 blob".to_string(),
            ))
        }
    };
    let blob = STANDARD
        .decode(encoded)
        .map_err(|e| ProviderError::Ssh(format!("invalid key encoding: {}", e)))?;

    let embedded = read_ssh_string(&blob)
        .ok_or_else(|| ProviderError::Ssh("truncated public key blob".to_string()))?;
    if embedded != key_type.as_bytes() {
        return Err(ProviderError::Ssh(format!(
            "key type {} does not match the encoded key ({})",
            key_type,
            String::from_utf8_lossy(embedded)
        )));
    }
    Ok((key_type.to_string(), blob))
}

fn read_ssh_string(buf: &[u8]) -> Option<&[u8]> {
    let len = u32::from_be_bytes(buf.get(..4)?.try_into().ok()?) as usize;
    buf.get(4..4 + len)
}

/// Scan `dir` recursively for `*.pub` files and collect their fingerprints.
///
/// Oversized or unparsable files are skipped. A missing directory or one without a
/// single usable key is an error.
pub fn load_allowed_host_keys(dir: &Path) -> Result<HashSet<String>, ProviderError> {
    if !dir.is_dir() {
        return Err(ProviderError::HostKeyAllowlist(format!(
            "directory {} does not exist",
            dir.display()
        )));
    }

    let mut keys = HashSet::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable allowlist entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("pub") {
            continue;
        }

        match entry.metadata() {
            Ok(meta) if meta.len() > MAX_KEY_FILE_SIZE => {
                warn!(
                    "skipping host key file {}: {} bytes exceeds the {} byte limit",
                    path.display(),
                    meta.len(),
                    MAX_KEY_FILE_SIZE
                );
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("skipping host key file {}: {}", path.display(), e);
                continue;
            }
        }

        let fp = match read_key_file(path) {
            Ok(fp) => fp,
            Err(e) => {
                warn!("skipping host key file {}: {}", path.display(), e);
                continue;
            }
        };
        if keys.contains(&fp) {
            debug!("duplicate host key {} in {}", fp, path.display());
            continue;
        }
        if keys.len() >= MAX_ALLOWED_HOST_KEYS {
            warn!(
                "host key allowlist is capped at {} keys, ignoring {}",
                MAX_ALLOWED_HOST_KEYS,
                path.display()
            );
            continue;
        }
        keys.insert(fp);
    }

    if keys.is_empty() {
        return Err(ProviderError::HostKeyAllowlist(format!(
            "no valid host keys found in {}",
            dir.display()
        )));
    }
    Ok(keys)
}

fn read_key_file(path: &Path) -> Result<String, ProviderError> {
    let text = fs::read_to_string(path).map_err(|e| ProviderError::Ssh(e.to_string()))?;
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| ProviderError::Ssh("empty key file".to_string()))?;
    let (_, blob) = parse_authorized_key(line)?;
    Ok(fingerprint(&blob))
}

// --- Client keys ---

#[derive(Clone)]
pub struct SshKeyPair {
    pub private_key_pem: String,
    /// Authorized-key line, injected into the guest.
    pub public_key: String,
}

impl std::fmt::Debug for SshKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshKeyPair")
            .field("private_key_pem", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl SshKeyPair {
    pub fn load(private_key_path: &Path, public_key_path: &Path) -> Result<Self, ProviderError> {
        let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
            ProviderError::Ssh(format!(
                "reading private key {}: {}",
                private_key_path.display(),
                e
            ))
        })?;
        let public_key = fs::read_to_string(public_key_path).map_err(|e| {
            ProviderError::Ssh(format!(
                "reading public key {}: {}",
                public_key_path.display(),
                e
            ))
        })?;
        let pair = SshKeyPair {
            private_key_pem,
            public_key: public_key.trim().to_string(),
        };
        pair.validate()?;
        Ok(pair)
    }

    /// Load from disk, or mint a fresh RSA key when the files are unusable and `allow_generate` is set.
    pub fn load_or_generate(
        private_key_path: &Path,
        public_key_path: &Path,
        allow_generate: bool,
    ) -> anyhow::Result<Self> {
        match Self::load(private_key_path, public_key_path) {
            Ok(pair) => Ok(pair),
            Err(e) if allow_generate => {
                warn!("ssh keys unusable ({}), generating a fresh RSA key pair", e);
                Self::generate()
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn generate() -> anyhow::Result<Self> {
        generate_rsa(RSA_KEY_BITS)
    }

    fn validate(&self) -> Result<(), ProviderError> {
        let pem = self.private_key_pem.trim();
        if pem.is_empty() || !pem.starts_with("-----BEGIN ") || !pem.contains("PRIVATE KEY-----") {
            return Err(ProviderError::Ssh(
                "private key is not a PEM block".to_string(),
            ));
        }
        parse_authorized_key(&self.public_key).map(|_| ())
    }
}

fn generate_rsa(bits: usize) -> anyhow::Result<SshKeyPair> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits).context("generating RSA key")?;
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .context("encoding RSA private key")?;

    let mut blob = Vec::new();
    put_ssh_string(&mut blob, b"ssh-rsa");
    put_mpint(&mut blob, &key.e().to_bytes_be());
    put_mpint(&mut blob, &key.n().to_bytes_be());

    Ok(SshKeyPair {
        private_key_pem: pem.as_str().to_owned(),
        public_key: format!("ssh-rsa {}", STANDARD.encode(&blob)),
    })
}

fn put_ssh_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn put_mpint(buf: &mut Vec<u8>, magnitude: &[u8]) {
    let start = magnitude.iter().position(|b| *b != 0).unwrap_or(magnitude.len());
    let digits = &magnitude[start..];
    if digits.first().map_or(false, |b| b & 0x80 != 0) {
        buf.extend_from_slice(&((digits.len() + 1) as u32).to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(digits);
    } else {
        put_ssh_string(buf, digits);
    }
}

// --- Client ---

#[derive(Clone)]
pub struct SshClient {
    username: String,
    keys: Arc<SshKeyPair>,
    policy: HostKeyPolicy,
    timeout: Duration,
    port: u16,
    chroot: bool,
}

impl SshClient {
    pub fn new(
        username: impl Into<String>,
        keys: SshKeyPair,
        policy: HostKeyPolicy,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if timeout.is_zero() {
            return Err(ProviderError::ConfigInvalid(
                "ssh timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            username: username.into(),
            keys: Arc::new(keys),
            policy,
            timeout,
            port: SSH_PORT,
            chroot: true,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Send paths verbatim, for guests whose SFTP server has no chroot.
    pub fn without_chroot(mut self) -> Self {
        self.chroot = false;
        self
    }

    pub fn public_key(&self) -> &str {
        &self.keys.public_key
    }

    /// Write `content` to `remote_path` on the guest. Unless disabled, a leading
    /// `/media/` is the server's chroot and is stripped before sending.
    pub async fn send_file(
        &self,
        ctx: &CancellationToken,
        ip: IpAddr,
        remote_path: &str,
        content: &[u8],
    ) -> anyhow::Result<()> {
        let addr = SocketAddr::new(ip, self.port);
        let timeout = self.timeout;

        let connect = tokio::task::spawn_blocking(move || TcpStream::connect_timeout(&addr, timeout));
        let stream = tokio::select! {
            res = connect => res
                .context("ssh connect task")?
                .map_err(|e| ProviderError::Ssh(format!("connecting to {}: {}", addr, e)))?,
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled.into()),
        };
        let abort = stream.try_clone().context("cloning ssh socket")?;

        let job = Upload {
            host: addr.to_string(),
            username: self.username.clone(),
            keys: self.keys.clone(),
            policy: self.policy.clone(),
            timeout,
            path: if self.chroot {
                chroot_relative(remote_path)
            } else {
                PathBuf::from(remote_path)
            },
            content: content.to_vec(),
        };
        let work = tokio::task::spawn_blocking(move || job.run(stream));
        tokio::select! {
            res = work => {
                res.context("ssh upload task")??;
                debug!("wrote {} to {}", remote_path, addr);
                Ok(())
            }
            _ = ctx.cancelled() => {
                let _ = abort.shutdown(Shutdown::Both);
                Err(ProviderError::Cancelled.into())
            }
        }
    }
}

/// Path as seen inside the SFTP chroot.
pub fn chroot_relative(remote_path: &str) -> PathBuf {
    PathBuf::from(remote_path.strip_prefix(CHROOT_PREFIX).unwrap_or(remote_path))
}

struct Upload {
    host: String,
    username: String,
    keys: Arc<SshKeyPair>,
    policy: HostKeyPolicy,
    timeout: Duration,
    path: PathBuf,
    content: Vec<u8>,
}

impl Upload {
    fn run(self, stream: TcpStream) -> anyhow::Result<()> {
        let ssh = |what: &str, e: ssh2::Error| ProviderError::Ssh(format!("{} {}: {}", what, self.host, e));

        let mut session = Session::new().map_err(|e| ssh("creating session for", e))?;
        session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(stream);
        session.handshake().map_err(|e| ssh("handshake with", e))?;

        let (blob, _) = session
            .host_key()
            .ok_or_else(|| ProviderError::Ssh(format!("{} presented no host key", self.host)))?;
        self.policy.verify(&self.host, blob)?;

        session
            .userauth_pubkey_memory(&self.username, None, &self.keys.private_key_pem, None)
            .map_err(|e| ssh("authenticating to", e))?;
        if !session.authenticated() {
            return Err(ProviderError::Ssh(format!("authentication to {} rejected", self.host)).into());
        }

        let sftp = session.sftp().map_err(|e| ssh("opening sftp on", e))?;
        if let Some(parent) = self.path.parent() {
            let mut dir = PathBuf::new();
            for part in parent.components() {
                dir.push(part);
                if sftp.stat(&dir).is_err() {
                    sftp.mkdir(&dir, 0o755)
                        .map_err(|e| ssh(&format!("creating {} on", dir.display()), e))?;
                }
            }
        }
        let mut file = sftp
            .create(&self.path)
            .map_err(|e| ssh(&format!("creating {} on", self.path.display()), e))?;
        file.write_all(&self.content)
            .with_context(|| format!("writing {} on {}", self.path.display(), self.host))?;
        drop(file);
        drop(sftp);

        let _ = session.disconnect(None, "done", None);
        Ok(())
    }
}
