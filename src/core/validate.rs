use anyhow::{anyhow, bail, Result};
use std::path::Path;
use tokio::io::AsyncReadExt;

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "ogg", "wav"];

/// Sniffs the audio container from leading magic bytes.
pub fn detect_audio_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 12 {
        return None;
    }
    if bytes.starts_with(b"ID3") {
        return Some("mp3");
    }
    // MPEG frame sync: eleven set bits
    if bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
        return Some("mp3");
    }
    if bytes.starts_with(b"fLaC") {
        return Some("flac");
    }
    if bytes.starts_with(b"OggS") {
        return Some("ogg");
    }
    if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WAVE" {
        return Some("wav");
    }
    if &bytes[4..8] == b"ftyp" {
        return Some("m4a");
    }
    None
}

pub fn is_audio_destination(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Accepts or rejects a fully transferred file before it is moved into
/// place. Audio destinations must clear a size floor and carry a known
/// container signature; anything else passes on a non-empty size alone.
pub async fn validate_download(path: &Path, min_audio_bytes: u64) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| anyhow!("downloaded file missing at {}: {}", path.display(), e))?;

    if meta.len() == 0 {
        bail!("downloaded file is empty");
    }

    if !is_audio_destination(path) {
        return Ok(());
    }

    if meta.len() < min_audio_bytes {
        bail!(
            "audio file is {} bytes, below the {} byte floor — likely an error page",
            meta.len(),
            min_audio_bytes
        );
    }

    let mut header = [0u8; 16];
    let mut file = tokio::fs::File::open(path).await?;
    let n = file.read(&mut header).await?;
    match detect_audio_format(&header[..n]) {
        Some(format) => {
            tracing::debug!("validated {} as {}", path.display(), format);
            Ok(())
        }
        None => bail!("file does not start with a known audio container signature"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("crescendo-validate-{}-{}", nanos, name))
    }

    fn mp3_bytes(len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        v[..3].copy_from_slice(b"ID3");
        v
    }

    #[test]
    fn detects_id3_and_frame_sync() {
        assert_eq!(detect_audio_format(&mp3_bytes(16)), Some("mp3"));
        let mut sync = vec![0u8; 16];
        sync[0] = 0xFF;
        sync[1] = 0xFB;
        assert_eq!(detect_audio_format(&sync), Some("mp3"));
    }

    #[test]
    fn detects_flac_ogg_wav_m4a() {
        let mut flac = vec![0u8; 16];
        flac[..4].copy_from_slice(b"fLaC");
        assert_eq!(detect_audio_format(&flac), Some("flac"));

        let mut ogg = vec![0u8; 16];
        ogg[..4].copy_from_slice(b"OggS");
        assert_eq!(detect_audio_format(&ogg), Some("ogg"));

        let mut wav = vec![0u8; 16];
        wav[..4].copy_from_slice(b"RIFF");
        wav[8..12].copy_from_slice(b"WAVE");
        assert_eq!(detect_audio_format(&wav), Some("wav"));

        let mut m4a = vec![0u8; 16];
        m4a[4..8].copy_from_slice(b"ftyp");
        assert_eq!(detect_audio_format(&m4a), Some("m4a"));
    }

    #[test]
    fn rejects_html_and_short_input() {
        assert_eq!(detect_audio_format(b"<!DOCTYPE html><ht"), None);
        assert_eq!(detect_audio_format(b"ID3"), None);
    }

    #[test]
    fn audio_destination_by_extension() {
        assert!(is_audio_destination(Path::new("/x/song.mp3")));
        assert!(is_audio_destination(Path::new("/x/song.FLAC")));
        assert!(!is_audio_destination(Path::new("/x/cover.jpg")));
        assert!(!is_audio_destination(Path::new("/x/noext")));
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let err = validate_download(&scratch("missing.mp3"), 10).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn empty_file_fails() {
        let path = scratch("empty.bin");
        tokio::fs::write(&path, b"").await.unwrap();
        assert!(validate_download(&path, 10).await.is_err());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn small_audio_file_fails_floor() {
        let path = scratch("small.mp3");
        tokio::fs::write(&path, mp3_bytes(20)).await.unwrap();
        let err = validate_download(&path, 1024).await.unwrap_err();
        assert!(err.to_string().contains("floor"));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn html_saved_as_mp3_fails_signature() {
        let path = scratch("page.mp3");
        let mut body = b"<!DOCTYPE html>".to_vec();
        body.resize(4096, b' ');
        tokio::fs::write(&path, body).await.unwrap();
        assert!(validate_download(&path, 1024).await.is_err());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn valid_mp3_passes() {
        let path = scratch("good.mp3");
        tokio::fs::write(&path, mp3_bytes(4096)).await.unwrap();
        assert!(validate_download(&path, 1024).await.is_ok());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn non_audio_extension_passes_on_size_alone() {
        let path = scratch("lyrics.txt");
        tokio::fs::write(&path, b"la la la").await.unwrap();
        assert!(validate_download(&path, 1024).await.is_ok());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
