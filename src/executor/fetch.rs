//! ArtifactFetcher: download with overwrite-always semantics.
//!
//! Downloads land in a `.partial` sibling and are renamed into place, so a
//! failed fetch leaves the previous copy untouched.

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::files::{self, fs_error};
use super::{Applied, Host};
use crate::error::{ProvisionError, Result};
use crate::plan::RemoteArtifact;

/// Streams a URL into a writer.
pub trait Downloader {
    /// Returns the number of bytes written.
    fn download(&self, url: &str, sink: &mut dyn Write, timeout: Duration) -> Result<u64>;
}

/// Blocking HTTP(S) downloader.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("appliance-provision/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, sink: &mut dyn Write, timeout: Duration) -> Result<u64> {
        let failed = |reason: String| ProvisionError::FetchFailed {
            resource: url.to_string(),
            reason,
        };
        let describe = |e: reqwest::Error| {
            if e.is_timeout() {
                format!("timeout after {}s", timeout.as_secs())
            } else {
                e.to_string()
            }
        };

        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| failed(describe(e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP status {}", status)));
        }
        io::copy(&mut response, sink).map_err(|e| failed(format!("reading body: {}", e)))
    }
}

/// Archive formats accepted for `extract_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    TarZst,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(ArchiveKind::TarZst)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Download one artifact, replacing whatever was at the destination.
pub fn fetch(host: &Host<'_>, artifact: &RemoteArtifact) -> Result<Applied> {
    let dest = &artifact.dest;
    files::ensure_parent(dest).map_err(|e| fs_error(dest, "creating parent directory", e))?;

    let partial = partial_path(dest);
    let (bytes, digest) = match download_to(host, &artifact.url, &partial) {
        Ok(result) => result,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
    };
    fs::rename(&partial, dest).map_err(|e| fs_error(dest, "moving download into place", e))?;
    if artifact.executable {
        files::make_executable(dest).map_err(|e| fs_error(dest, "setting executable bit", e))?;
    }
    log::info!(
        "Fetched {} -> {} ({}, sha256 {})",
        artifact.url,
        dest.display(),
        files::format_size(bytes),
        &digest[..12]
    );

    if let Some(dir) = &artifact.extract_to {
        extract(dest, dir).map_err(|e| ProvisionError::FetchFailed {
            resource: artifact.url.clone(),
            reason: format!("extracting into {}: {}", dir.display(), e),
        })?;
        log::info!("Unpacked {} into {}", dest.display(), dir.display());
    }

    Ok(Applied::done())
}

fn download_to(host: &Host<'_>, url: &str, partial: &Path) -> Result<(u64, String)> {
    let file = File::create(partial).map_err(|e| fs_error(partial, "creating", e))?;
    let mut sink = HashingWriter {
        inner: BufWriter::new(file),
        hasher: Sha256::new(),
    };
    let bytes = host.downloader.download(url, &mut sink, host.ctx.fetch_timeout)?;
    sink.inner
        .flush()
        .map_err(|e| fs_error(partial, "writing", e))?;
    Ok((bytes, format!("{:x}", sink.hasher.finalize())))
}

/// Digest is logged for the operator; it is never compared against anything.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Unpack a tar bundle into `dir`, overwriting existing files.
pub fn extract(archive: &Path, dir: &Path) -> io::Result<()> {
    let kind = ArchiveKind::detect(archive).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a .tar, .tar.gz or .tar.zst archive", archive.display()),
        )
    })?;
    let file = File::open(archive)?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::Tar => Box::new(file),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveKind::TarZst => Box::new(zstd::stream::read::Decoder::new(file)?),
    };

    fs::create_dir_all(dir)?;
    let mut tar = tar::Archive::new(reader);
    tar.set_overwrite(true);
    tar.set_preserve_permissions(true);
    tar.unpack(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Rig;
    use std::os::unix::fs::PermissionsExt;

    fn artifact(url: &str, dest: PathBuf) -> RemoteArtifact {
        RemoteArtifact {
            url: url.to_string(),
            dest,
            executable: false,
            load_bearing: true,
            extract_to: None,
        }
    }

    fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_fetch_creates_parents_and_overwrites() {
        let rig = Rig::new();
        let dest = rig.home().join("dishaligner/icons/dish.png");
        rig.downloader.serve("https://example.org/dish.png", "new-bytes");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, "old-bytes-from-last-run").unwrap();

        fetch(&rig.host(), &artifact("https://example.org/dish.png", dest.clone())).unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "new-bytes");
        assert!(!partial_path(&dest).exists());
        assert_eq!(rig.downloader.requests(), vec!["https://example.org/dish.png"]);
    }

    #[test]
    fn test_fetch_sets_executable_bit() {
        let rig = Rig::new();
        let dest = rig.home().join("bin/start.sh");
        rig.downloader.serve("https://example.org/start.sh", "#!/bin/sh\n");
        let mut a = artifact("https://example.org/start.sh", dest.clone());
        a.executable = true;

        fetch(&rig.host(), &a).unwrap();

        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o100, 0o100);
    }

    #[test]
    fn test_failed_fetch_keeps_previous_copy() {
        let rig = Rig::new();
        let dest = rig.home().join("icon.png");
        fs::write(&dest, "previous").unwrap();

        let err = fetch(&rig.host(), &artifact("https://example.org/gone.png", dest.clone()))
            .unwrap_err();

        assert!(matches!(err, ProvisionError::FetchFailed { .. }));
        assert_eq!(fs::read_to_string(&dest).unwrap(), "previous");
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_fetch_extracts_bundle() {
        let rig = Rig::new();
        let dest = rig.home().join("downloads/config.tar.gz");
        let target = rig.home().join(".config/sdrpp");
        rig.downloader.serve(
            "https://example.org/config.tar.gz",
            tar_gz(&[("config.json", "{\"theme\":\"dark\"}"), ("modules/a.json", "[]")]),
        );
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("config.json"), "stale").unwrap();
        let mut a = artifact("https://example.org/config.tar.gz", dest);
        a.extract_to = Some(target.clone());

        fetch(&rig.host(), &a).unwrap();

        assert_eq!(
            fs::read_to_string(target.join("config.json")).unwrap(),
            "{\"theme\":\"dark\"}"
        );
        assert!(target.join("modules/a.json").exists());
    }

    #[test]
    fn test_extract_rejects_unknown_format() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bundle.zip");
        fs::write(&path, "PK").unwrap();
        let err = extract(&path, &temp.path().join("out")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_archive_kind_detect() {
        assert_eq!(ArchiveKind::detect(Path::new("/x/a.tar")), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::detect(Path::new("/x/a.TGZ")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("/x/a.tar.zst")), Some(ArchiveKind::TarZst));
        assert_eq!(ArchiveKind::detect(Path::new("/x/a.png")), None);
    }

    #[test]
    fn test_http_downloader_streams_body() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/encoder.py")
            .with_status(200)
            .with_body("print('hi')\n")
            .create();

        let downloader = HttpDownloader::new().unwrap();
        let mut body = Vec::new();
        let n = downloader
            .download(
                &format!("{}/encoder.py", server.url()),
                &mut body,
                Duration::from_secs(10),
            )
            .unwrap();

        mock.assert();
        assert_eq!(n, 12);
        assert_eq!(body, b"print('hi')\n");
    }

    #[test]
    fn test_http_downloader_error_status() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/missing.png").with_status(404).create();

        let downloader = HttpDownloader::new().unwrap();
        let err = downloader
            .download(
                &format!("{}/missing.png", server.url()),
                &mut Vec::<u8>::new(),
                Duration::from_secs(10),
            )
            .unwrap_err();

        match err {
            ProvisionError::FetchFailed { reason, .. } => assert!(reason.contains("404")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
