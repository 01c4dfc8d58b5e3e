//! External transcoder shelling and segment decryption (§4.8 steps 2-5).
//!
//! Fragments are persisted under a name derived from the MD5 of their
//! origin URL so concurrent fragments never collide on disk; the HLS
//! path decrypts AES-128 CBC segments in-process then shells out to the
//! configured `ffmpeg`/`sox` binaries, mirroring `hls_vod_lib`'s own
//! preference for an external transcoder over an in-process codec for
//! anything beyond container remuxing.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ServerError;
use eos_core::types::Encryption;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Shells out to the binaries named by `[APP] FFMPEG_PATH`/`SOX_PATH`
/// and scratches files under `[APP] TMP_FILES_PATH`.
pub struct Transcoder {
    ffmpeg_path: String,
    sox_path: String,
    tmp_dir: PathBuf,
}

impl Transcoder {
    pub fn new(ffmpeg_path: impl Into<String>, sox_path: impl Into<String>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self { ffmpeg_path: ffmpeg_path.into(), sox_path: sox_path.into(), tmp_dir: tmp_dir.into() }
    }

    /// Persist `body` under `MD5(url).seg` (§4.8 step 3).
    pub async fn persist_temp(&self, url: &str, body: &Bytes) -> Result<PathBuf, ServerError> {
        tokio::fs::create_dir_all(&self.tmp_dir).await.map_err(|e| ServerError::Internal(format!("tmp dir: {e}")))?;
        let digest = md5::compute(url.as_bytes());
        let path = self.tmp_dir.join(format!("{digest:x}.seg"));
        let mut file = tokio::fs::File::create(&path).await.map_err(|e| ServerError::Internal(format!("tmp write: {e}")))?;
        file.write_all(body).await.map_err(|e| ServerError::Internal(format!("tmp write: {e}")))?;
        Ok(path)
    }

    pub async fn remove_temp(&self, path: &Path) {
        let _ = tokio::fs::remove_file(path).await;
    }

    /// Extract raw AAC (ADTS-wrapped) from an HLS transport-stream
    /// fragment (§4.8 step 4, HLS path: "shells out to an external
    /// audio extractor").
    pub async fn extract_aac_hls(&self, ts_path: &Path) -> Result<Vec<u8>, ServerError> {
        self.run_to_stdout(
            &self.ffmpeg_path,
            &["-loglevel", "error", "-i", &path_str(ts_path)?, "-vn", "-acodec", "copy", "-f", "adts", "pipe:1"],
        )
        .await
    }

    /// Resample to signed 16-bit little-endian mono PCM at
    /// `target_rate_hz` (§4.8 step 5).
    pub async fn resample_to_pcm16(&self, aac_path: &Path, target_rate_hz: u32) -> Result<Vec<u8>, ServerError> {
        let rate = target_rate_hz.to_string();
        self.run_to_stdout(&self.sox_path, &[&path_str(aac_path)?, "-t", "raw", "-e", "signed", "-b", "16", "-c", "1", "-r", &rate, "-"])
            .await
    }

    async fn run_to_stdout(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, ServerError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ServerError::Internal(format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(ServerError::Internal(format!("{program} exited with {}", output.status)));
        }
        Ok(output.stdout)
    }
}

fn path_str(path: &Path) -> Result<String, ServerError> {
    path.to_str().map(str::to_string).ok_or_else(|| ServerError::Internal("non-UTF8 temp path".into()))
}

/// Decrypt an AES-128 CBC HLS segment with the delivered key and IV,
/// then strip PKCS#7 padding (§4.8 step 2).
pub fn decrypt_aes128_cbc(ciphertext: &[u8], key: &[u8], encryption: &Encryption) -> Result<Vec<u8>, ServerError> {
    if key.len() != 16 {
        return Err(ServerError::Internal("AES-128 key must be 16 bytes".into()));
    }
    let iv = parse_iv(encryption)?;
    let mut buf = ciphertext.to_vec();
    let decryptor =
        Aes128CbcDec::new_from_slices(key, &iv).map_err(|e| ServerError::Internal(format!("bad key/iv: {e}")))?;
    let plaintext = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| ServerError::Internal(format!("decrypt: {e}")))?;
    Ok(plaintext.to_vec())
}

fn parse_iv(encryption: &Encryption) -> Result<[u8; 16], ServerError> {
    let Some(iv_hex) = &encryption.iv else {
        return Err(ServerError::Internal("missing IV".into()));
    };
    let hex_digits = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
    if hex_digits.len() != 32 {
        return Err(ServerError::Internal("IV must be 16 bytes".into()));
    }
    let mut iv = [0u8; 16];
    for (i, byte) in iv.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex_digits[i * 2..i * 2 + 2], 16).map_err(|_| ServerError::Internal("malformed IV hex".into()))?;
    }
    Ok(iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_temp_names_file_by_md5_of_url() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Transcoder::new("ffmpeg", "sox", dir.path());
        let path = transcoder.persist_temp("https://origin/seg1.ts", &Bytes::from_static(b"data")).await.unwrap();
        let expected = format!("{:x}.seg", md5::compute(b"https://origin/seg1.ts"));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), expected);
        transcoder.remove_temp(&path).await;
    }

    #[test]
    fn parse_iv_rejects_wrong_length() {
        let enc = Encryption { method: "AES-128".into(), key_uri: "https://k".into(), iv: Some("0x0102".into()) };
        assert!(parse_iv(&enc).is_err());
    }

    #[test]
    fn parse_iv_accepts_32_hex_digits_with_0x_prefix() {
        let enc = Encryption { method: "AES-128".into(), key_uri: "https://k".into(), iv: Some(format!("0x{}", "ab".repeat(16))) };
        let iv = parse_iv(&enc).unwrap();
        assert_eq!(iv, [0xab; 16]);
    }
}
