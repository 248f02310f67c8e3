//! Artifact staging: passwords, answer-file crypts, the per-VM staging
//! directory on the region network share, and the hypervisor image store.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::Rng;
use sha2::{Digest, Sha512};
use tracing::{debug, warn};

/// Characters used for generated passwords.
const PASSWORD_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
/// The crypt(3) base64 alphabet, also used for salts.
const CRYPT_CHARS: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub const ADMIN_PASSWORD_LEN: usize = 12;
pub const ROOT_PASSWORD_LEN: usize = 128;

/// Random password of `size` characters from `[A-Za-z0-9]`.
pub fn generate_password(size: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..size)
        .map(|_| PASSWORD_CHARS[rng.gen_range(0..PASSWORD_CHARS.len())] as char)
        .collect()
}

/// Random 16-character salt for SHA-512 crypt.
pub fn generate_salt() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| CRYPT_CHARS[rng.gen_range(0..CRYPT_CHARS.len())] as char)
        .collect()
}

/// SHA-512 crypt(3) (`$6$`), as consumed by kickstart/preseed answer
/// files. Default round count, no `rounds=` parameter.
pub fn sha512_crypt(password: &str, salt: &str) -> String {
    const ROUNDS: usize = 5000;
    let key = password.as_bytes();
    let salt_str: &str = if salt.len() > 16 { &salt[..16] } else { salt };
    let salt = salt_str.as_bytes();

    // Digest B: key, salt, key
    let mut b = Sha512::new();
    b.update(key);
    b.update(salt);
    b.update(key);
    let b = b.finalize();

    // Digest A: key, salt, then B folded in for the key length, then one of
    // B/key per bit of the key length
    let mut a = Sha512::new();
    a.update(key);
    a.update(salt);
    let mut cnt = key.len();
    while cnt > 64 {
        a.update(b);
        cnt -= 64;
    }
    a.update(&b[..cnt]);
    let mut cnt = key.len();
    while cnt > 0 {
        if cnt & 1 != 0 {
            a.update(b);
        } else {
            a.update(key);
        }
        cnt >>= 1;
    }
    let a = a.finalize();

    // Byte sequence P from digest of the key repeated
    let mut dp = Sha512::new();
    for _ in 0..key.len() {
        dp.update(key);
    }
    let dp = dp.finalize();
    let p: Vec<u8> = dp.iter().copied().cycle().take(key.len()).collect();

    // Byte sequence S from digest of the salt repeated
    let mut ds = Sha512::new();
    for _ in 0..(16 + a[0] as usize) {
        ds.update(salt);
    }
    let ds = ds.finalize();
    let s: Vec<u8> = ds.iter().copied().cycle().take(salt.len()).collect();

    // The expensive loop
    let mut c: Vec<u8> = a.to_vec();
    for round in 0..ROUNDS {
        let mut h = Sha512::new();
        if round & 1 != 0 {
            h.update(&p);
        } else {
            h.update(&c);
        }
        if round % 3 != 0 {
            h.update(&s);
        }
        if round % 7 != 0 {
            h.update(&p);
        }
        if round & 1 != 0 {
            h.update(&c);
        } else {
            h.update(&p);
        }
        c = h.finalize().to_vec();
    }

    // Crypt base64 with the SHA-512 byte permutation
    let mut encoded = String::with_capacity(86);
    let mut b64 = |b2: u8, b1: u8, b0: u8, n: usize| {
        let mut w = ((b2 as u32) << 16) | ((b1 as u32) << 8) | (b0 as u32);
        for _ in 0..n {
            encoded.push(CRYPT_CHARS[(w & 0x3f) as usize] as char);
            w >>= 6;
        }
    };
    const ORDER: [(usize, usize, usize); 21] = [
        (0, 21, 42),
        (22, 43, 1),
        (44, 2, 23),
        (3, 24, 45),
        (25, 46, 4),
        (47, 5, 26),
        (6, 27, 48),
        (28, 49, 7),
        (50, 8, 29),
        (9, 30, 51),
        (31, 52, 10),
        (53, 11, 32),
        (12, 33, 54),
        (34, 55, 13),
        (56, 14, 35),
        (15, 36, 57),
        (37, 58, 16),
        (59, 17, 38),
        (18, 39, 60),
        (40, 61, 19),
        (62, 20, 41),
    ];
    for (i2, i1, i0) in ORDER {
        b64(c[i2], c[i1], c[i0], 4);
    }
    b64(0, 0, c[63], 2);

    format!("$6${salt_str}${encoded}")
}

// ─── Per-VM staging directory ──────────────────────────────────────────────

/// The per-VM directory under the region network share where answer files
/// and bridge definitions are staged for the host build scripts. Always
/// removed at worker exit, success or failure.
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub async fn create(drive_path: &str, identifier: &str) -> Result<Self, String> {
        let path = Path::new(drive_path).join("VMs").join(identifier);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|err| format!("failed to create staging directory {}: {err}", path.display()))?;
        debug!(path = %path.display(), "staging directory ready");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, filename: &str, contents: &str) -> Result<(), String> {
        let file = self.path.join(filename);
        tokio::fs::write(&file, contents)
            .await
            .map_err(|err| format!("failed to write {}: {err}", file.display()))?;
        debug!(file = %file.display(), "staged file written");
        Ok(())
    }

    /// Remove the directory and everything staged in it.
    pub async fn remove(self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.path).await {
            warn!(path = %self.path.display(), error = %err, "failed to remove staging directory");
        }
    }
}

// ─── Image store ───────────────────────────────────────────────────────────

fn download_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(reqwest::Client::new)
}

/// Ensure the OS image is present in the regional image store, downloading
/// it from the mirror when absent. The download lands in a temp path first
/// so concurrent builds of the same image never see a partial file.
pub async fn ensure_image(drive_path: &str, mirror_url: &str, filename: &str) -> Result<(), String> {
    let store = Path::new(drive_path).join("ISOs");
    let target = store.join(filename);
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Ok(());
    }

    debug!(filename, "image not in store, downloading from mirror");
    let temp_dir = store.join("temp");
    tokio::fs::create_dir_all(&temp_dir)
        .await
        .map_err(|err| format!("failed to create temp dir {}: {err}", temp_dir.display()))?;

    let url = format!("{mirror_url}{filename}");
    let response = download_client()
        .get(&url)
        .send()
        .await
        .map_err(|err| format!("image download from {url} failed: {err}"))?;
    if !response.status().is_success() {
        return Err(format!("image {filename} not found at {url} (HTTP {})", response.status()));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| format!("image download from {url} failed: {err}"))?;

    let temp_file = temp_dir.join(filename);
    tokio::fs::write(&temp_file, &bytes)
        .await
        .map_err(|err| format!("failed to write {}: {err}", temp_file.display()))?;
    tokio::fs::rename(&temp_file, &target)
        .await
        .map_err(|err| format!("failed to move image into store: {err}"))?;
    debug!(filename, "image downloaded into store");
    Ok(())
}
