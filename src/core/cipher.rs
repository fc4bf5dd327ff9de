/// Symmetric file cipher
///
/// AES-256-CBC with PKCS#7 padding. Key and IV come from PBKDF2-HMAC-SHA256
/// over the first line of a key-material file and a random 8-byte salt. The
/// output layout is `Salted__` + salt + ciphertext, which is what
/// `openssl enc -aes-256-cbc -salt -pbkdf2 -md sha256 -pass file:<key>` produces.

use aes::Aes256;
use anyhow::{anyhow, bail, Context, Result};
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const BLOCK: usize = 16;
const KEY_LEN: usize = 32;
const CHUNK: usize = 64 * 1024;

pub trait Cipher: Send + Sync {
    /// Encrypt `input` into a new file at `output`
    fn encrypt(&self, input: &Path, output: &Path, key_file: &Path, iterations: u32) -> Result<()>;

    /// Decrypt `input` into a new file at `output`; fails on a wrong key or damaged input
    fn decrypt(&self, input: &Path, output: &Path, key_file: &Path, iterations: u32) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct Aes256CbcCipher;

impl Aes256CbcCipher {
    pub fn new() -> Self {
        Self
    }
}

impl Cipher for Aes256CbcCipher {
    fn encrypt(&self, input: &Path, output: &Path, key_file: &Path, iterations: u32) -> Result<()> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let material = derive(key_file, &salt, iterations)?;
        let mut enc = Aes256CbcEnc::new_from_slices(&material[..KEY_LEN], &material[KEY_LEN..])
            .map_err(|e| anyhow!("Invalid key material: {}", e))?;

        let mut reader = BufReader::new(
            File::open(input).with_context(|| format!("Failed to open {}", input.display()))?,
        );
        let mut writer = BufWriter::new(create_new(output)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&salt)?;

        let mut chunk = vec![0u8; CHUNK];
        let mut pending: Vec<u8> = Vec::with_capacity(CHUNK + BLOCK);

        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&chunk[..n]);
            let ready = pending.len() / BLOCK * BLOCK;
            for block in pending[..ready].chunks_exact_mut(BLOCK) {
                enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&pending[..ready])?;
            pending.drain(..ready);
        }

        let pad = BLOCK - pending.len();
        pending.resize(BLOCK, pad as u8);
        enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut pending));
        writer.write_all(&pending)?;

        finish(writer)
    }

    fn decrypt(&self, input: &Path, output: &Path, key_file: &Path, iterations: u32) -> Result<()> {
        let mut reader = BufReader::new(
            File::open(input).with_context(|| format!("Failed to open {}", input.display()))?,
        );

        let mut header = [0u8; MAGIC.len() + SALT_LEN];
        reader
            .read_exact(&mut header)
            .context("Encrypted file is too short")?;
        if &header[..MAGIC.len()] != MAGIC {
            bail!("Not a salted AES-256-CBC file");
        }

        let material = derive(key_file, &header[MAGIC.len()..], iterations)?;
        let mut dec = Aes256CbcDec::new_from_slices(&material[..KEY_LEN], &material[KEY_LEN..])
            .map_err(|e| anyhow!("Invalid key material: {}", e))?;

        let mut writer = BufWriter::new(create_new(output)?);
        let mut chunk = vec![0u8; CHUNK];
        let mut pending: Vec<u8> = Vec::with_capacity(CHUNK + BLOCK);

        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&chunk[..n]);
            // Hold back the final block until EOF; it carries the padding
            let ready = pending.len().saturating_sub(1) / BLOCK * BLOCK;
            for block in pending[..ready].chunks_exact_mut(BLOCK) {
                dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&pending[..ready])?;
            pending.drain(..ready);
        }

        if pending.len() != BLOCK {
            bail!("Ciphertext length is not a multiple of the block size");
        }
        dec.decrypt_block_mut(GenericArray::from_mut_slice(&mut pending));

        let pad = pending[BLOCK - 1] as usize;
        if pad == 0 || pad > BLOCK || pending[BLOCK - pad..].iter().any(|b| *b as usize != pad) {
            bail!("Bad decrypt: wrong key or corrupted data");
        }
        writer.write_all(&pending[..BLOCK - pad])?;

        finish(writer)
    }
}

/// PBKDF2 output split as 32 bytes of key followed by 16 bytes of IV
fn derive(key_file: &Path, salt: &[u8], iterations: u32) -> Result<Zeroizing<[u8; KEY_LEN + BLOCK]>> {
    if iterations == 0 {
        bail!("KDF iteration count must be non-zero");
    }

    let contents = Zeroizing::new(
        fs::read(key_file).with_context(|| format!("Failed to read key material {}", key_file.display()))?,
    );
    let line_end = contents
        .iter()
        .position(|b| *b == b'\n' || *b == b'\r')
        .unwrap_or(contents.len());
    let password = &contents[..line_end];
    if password.is_empty() {
        bail!("Key material file is empty");
    }

    let mut out = Zeroizing::new([0u8; KEY_LEN + BLOCK]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out[..]);
    Ok(out)
}

fn create_new(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))
}

fn finish(writer: BufWriter<File>) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush output: {}", e.error()))?;
    file.sync_all()?;
    Ok(())
}
