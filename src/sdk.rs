//! Android SDK system images.
//!
//! A `google_apis` system image is taken from an installed SDK when its
//! revision fits. Otherwise the package is downloaded from Google's
//! repository and its `system.img` unpacked into the images directory:
//!
//! ```text
//! <sdk>/system-images/android-<api>/google_apis/<abi>/system.img
//! <images>/<abi>-<api>_r<rev>.zip
//! <images>/android-<api>_r<rev>/<abi>/system.img
//! ```

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::cache;
use crate::process::Cmd;

pub const REPOSITORY_URL: &str = "http://dl.google.com/android/repository/sys-img/google_apis";

const PROPERTIES_FILE: &str = "source.properties";
/// Property keys are compared lowercased.
const REVISION_KEY: &str = "pkg.revision";
const IMAGE_FILE: &str = "system.img";
const PACKAGE_HASH_FILE: &str = ".package.hash";

/// Download retry policy.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Attempts after the first one, for transient failures only
    pub retries: u32,
    /// Delay before the first retry; doubles each retry
    pub retry_delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// One `google_apis` system image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub abi: String,
    pub api: u32,
    /// 0 means "whatever the SDK has installed"
    pub rev: u32,
}

impl ImageRequest {
    /// `<api>_r<rev>`, with the revision zero-padded to two digits.
    pub fn version(&self) -> String {
        format!("{}_r{:02}", self.api, self.rev)
    }

    /// `<abi>-<api>_r<rev>.zip`
    pub fn package_name(&self) -> String {
        format!("{}-{}.zip", self.abi, self.version())
    }

    pub fn url(&self) -> String {
        format!("{}/{}", REPOSITORY_URL, self.package_name())
    }

    /// Where an installed SDK keeps this image.
    pub fn sdk_dir(&self, sdk: &Path) -> PathBuf {
        sdk.join("system-images")
            .join(format!("android-{}", self.api))
            .join("google_apis")
            .join(&self.abi)
    }

    /// Where the downloaded package is unpacked.
    pub fn extract_dir(&self, images_dir: &Path) -> PathBuf {
        images_dir.join(format!("android-{}", self.version()))
    }
}

/// Parse a Java-style properties file (`key=value` or `key: value`).
/// Keys are lowercased; `#` and `;` start comment lines.
pub fn parse_source_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            let (key, value) = line.split_at(split);
            Some((key.trim().to_lowercase(), value[1..].trim().to_string()))
        })
        .collect()
}

/// Properties in `<dir>/source.properties`; empty if the file is absent.
pub fn load_source_properties(dir: &Path) -> Result<HashMap<String, String>> {
    let path = dir.join(PROPERTIES_FILE);
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let text =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(parse_source_properties(&text))
}

/// `Pkg.Revision`, major part only; 0 when absent or unreadable.
pub fn revision(properties: &HashMap<String, String>) -> u32 {
    properties
        .get(REVISION_KEY)
        .and_then(|rev| rev.split('.').next())
        .and_then(|major| major.parse().ok())
        .unwrap_or(0)
}

/// Image and revision installed in the SDK for `abi` and `api`.
pub fn lookup_system_image(sdk: &Path, abi: &str, api: u32) -> Result<(Option<PathBuf>, u32)> {
    let request = ImageRequest {
        abi: abi.to_string(),
        api,
        rev: 0,
    };
    let dir = request.sdk_dir(sdk);
    let rev = revision(&load_source_properties(&dir)?);
    let image = dir.join(IMAGE_FILE);
    Ok((image.is_file().then_some(image), rev))
}

/// Download the system image package into `dir` unless it is already there.
pub fn download_system_package(
    dir: &Path,
    request: &ImageRequest,
    options: &DownloadOptions,
) -> Result<PathBuf> {
    let path = dir.join(request.package_name());
    if path.is_file() {
        println!("  {} already downloaded", path.display());
        return Ok(path);
    }

    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let partial = dir.join(format!("{}.part", request.package_name()));
    let url = request.url();
    println!("Downloading {}...", url);

    let mut attempt = 0;
    loop {
        let result = Cmd::new("curl")
            .args(["-L", "-f", "-sS", "-o"])
            .arg_path(&partial)
            .arg(&url)
            .error_msg(format!("Failed to download {}", url))
            .run();

        match result {
            Ok(_) => break,
            Err(e) if attempt < options.retries && is_retryable_error(&e) => {
                attempt += 1;
                let delay = options.retry_delay * (1 << (attempt - 1).min(4));
                println!("    Retry {}/{} in {:?}...", attempt, options.retries, delay);
                thread::sleep(delay);
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        }
    }

    fs::rename(&partial, &path).with_context(|| {
        format!(
            "Failed to move {} to {}",
            partial.display(),
            path.display()
        )
    })?;
    println!("  Downloaded to {}", path.display());
    Ok(path)
}

/// Check if an error is likely transient and worth retrying.
fn is_retryable_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("temporarily unavailable")
        || msg.contains("try again")
        || msg.contains("503")
        || msg.contains("502")
        || msg.contains("504")
}

/// Unpack `<abi>/system.img` from `package` into `dst`.
///
/// Returns the image (None if the package has none) and the revision the
/// package declares. Unpacking is skipped when `dst` already holds the
/// image from this exact package.
pub fn extract_system_package(
    package: &Path,
    abi: &str,
    dst: &Path,
) -> Result<(Option<PathBuf>, u32)> {
    let abi_dir = dst.join(abi);
    let image = abi_dir.join(IMAGE_FILE);
    let hash_file = dst.join(PACKAGE_HASH_FILE);
    let package_hash = cache::hash_file(package)?;

    if !cache::needs_rebuild(&package_hash, &hash_file, &image) {
        let rev = revision(&load_source_properties(&abi_dir)?);
        return Ok((Some(image), rev));
    }

    fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
    unzip_member(package, &format!("{}/{}", abi, PROPERTIES_FILE), dst)?;
    let rev = revision(&load_source_properties(&abi_dir)?);
    if rev == 0 {
        return Ok((None, 0));
    }

    unzip_member(package, &format!("{}/{}", abi, IMAGE_FILE), dst)?;
    if !image.is_file() {
        return Ok((None, rev));
    }
    cache::write_cached_hash(&hash_file, &package_hash)?;
    Ok((Some(image), rev))
}

fn unzip_member(package: &Path, member: &str, dst: &Path) -> Result<()> {
    Cmd::new("unzip")
        .args(["-o", "-q"])
        .arg_path(package)
        .arg(member)
        .arg("-d")
        .arg_path(dst)
        .error_msg(format!(
            "Failed to extract {} from {}",
            member,
            package.display()
        ))
        .run()?;
    Ok(())
}

/// Find or fetch the system image for `request`.
///
/// An SDK install is used when it has the image and either `request.rev`
/// is 0 or matches. Otherwise the exact revision is downloaded, which
/// requires a non-zero `request.rev`.
pub fn system_image(
    sdk: Option<&Path>,
    request: &ImageRequest,
    images_dir: &Path,
    options: &DownloadOptions,
) -> Result<PathBuf> {
    if let Some(sdk) = sdk {
        let (image, rev) = lookup_system_image(sdk, &request.abi, request.api)?;
        match image {
            Some(image) if rev != 0 && (request.rev == 0 || request.rev == rev) => {
                println!(
                    "Using SDK system image {} (revision {})",
                    image.display(),
                    rev
                );
                return Ok(image);
            }
            Some(_) if rev != 0 => println!(
                "  Required system image revision is {} but {} in SDK",
                request.rev, rev
            ),
            _ => println!(
                "  No system image {} android-{} in SDK {}",
                request.abi,
                request.api,
                sdk.display()
            ),
        }
    }

    if request.rev == 0 {
        bail!(
            "No usable {} android-{} system image; give --rev to download one",
            request.abi,
            request.api
        );
    }

    let package = download_system_package(images_dir, request, options)?;
    println!("Extracting {}...", package.display());
    let (image, rev) =
        extract_system_package(&package, &request.abi, &request.extract_dir(images_dir))?;

    match image {
        Some(image) if rev == request.rev => Ok(image),
        Some(_) => bail!(
            "{} declares revision {} but {} was requested",
            package.display(),
            rev,
            request.rev
        ),
        None => bail!(
            "{} has no {}/{} (revision {})",
            package.display(),
            request.abi,
            IMAGE_FILE,
            rev
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(rev: u32) -> ImageRequest {
        ImageRequest {
            abi: "arm64-v8a".to_string(),
            api: 30,
            rev,
        }
    }

    fn install(sdk: &Path, api: u32, properties: &str, with_image: bool) -> PathBuf {
        let dir = sdk
            .join("system-images")
            .join(format!("android-{}", api))
            .join("google_apis/arm64-v8a");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PROPERTIES_FILE), properties).unwrap();
        if with_image {
            fs::write(dir.join(IMAGE_FILE), b"image").unwrap();
        }
        dir.join(IMAGE_FILE)
    }

    #[test]
    fn test_package_naming() {
        let req = request(8);
        assert_eq!(req.version(), "30_r08");
        assert_eq!(req.package_name(), "arm64-v8a-30_r08.zip");
        assert_eq!(
            req.url(),
            "http://dl.google.com/android/repository/sys-img/google_apis/arm64-v8a-30_r08.zip"
        );
        assert_eq!(
            req.extract_dir(Path::new("/cache/system-images")),
            PathBuf::from("/cache/system-images/android-30_r08")
        );

        let req = ImageRequest { rev: 12, ..req };
        assert_eq!(req.package_name(), "arm64-v8a-30_r12.zip");
    }

    #[test]
    fn test_parse_source_properties() {
        let props = parse_source_properties(
            "# generated\nPkg.Desc=Google APIs ARM 64 v8a System Image\n\
             Pkg.Revision=8\nSystemImage.Abi : arm64-v8a\nAndroidVersion.ApiLevel=30\n\nnot a property\n",
        );
        assert_eq!(revision(&props), 8);
        assert_eq!(props["systemimage.abi"], "arm64-v8a");
        assert_eq!(props["pkg.desc"], "Google APIs ARM 64 v8a System Image");
        assert_eq!(props.len(), 4);

        assert_eq!(revision(&parse_source_properties("Pkg.Revision=13.0.1")), 13);
        assert_eq!(revision(&parse_source_properties("Pkg.Revision=soon")), 0);
        assert_eq!(revision(&HashMap::new()), 0);
    }

    #[test]
    fn test_lookup_system_image() {
        let sdk = TempDir::new().unwrap();
        let image = install(sdk.path(), 30, "Pkg.Revision=8\n", true);
        install(sdk.path(), 31, "Pkg.Revision=3\n", false);

        assert_eq!(
            lookup_system_image(sdk.path(), "arm64-v8a", 30).unwrap(),
            (Some(image), 8)
        );
        assert_eq!(
            lookup_system_image(sdk.path(), "arm64-v8a", 31).unwrap(),
            (None, 3)
        );
        assert_eq!(
            lookup_system_image(sdk.path(), "x86_64", 30).unwrap(),
            (None, 0)
        );
    }

    #[test]
    fn test_system_image_prefers_matching_sdk_install() {
        let sdk = TempDir::new().unwrap();
        let images = TempDir::new().unwrap();
        let installed = install(sdk.path(), 30, "Pkg.Revision=8\n", true);
        let options = DownloadOptions::default();

        for rev in [0, 8] {
            let found =
                system_image(Some(sdk.path()), &request(rev), images.path(), &options).unwrap();
            assert_eq!(found, installed);
        }

        // Without an SDK install a download needs an explicit revision.
        let err = system_image(None, &request(0), images.path(), &options).unwrap_err();
        assert!(err.to_string().contains("--rev"));
    }

    #[test]
    fn test_download_skipped_when_package_present() {
        let images = TempDir::new().unwrap();
        let package = images.path().join("arm64-v8a-30_r08.zip");
        fs::write(&package, b"zip").unwrap();

        let path = download_system_package(images.path(), &request(8), &DownloadOptions::default())
            .unwrap();
        assert_eq!(path, package);
        assert_eq!(fs::read(&path).unwrap(), b"zip");
    }

    #[test]
    fn test_extract_reuses_image_from_same_package() {
        let images = TempDir::new().unwrap();
        let package = images.path().join("arm64-v8a-30_r08.zip");
        fs::write(&package, b"zip").unwrap();

        let dst = request(8).extract_dir(images.path());
        let abi_dir = dst.join("arm64-v8a");
        fs::create_dir_all(&abi_dir).unwrap();
        fs::write(abi_dir.join(IMAGE_FILE), b"image").unwrap();
        fs::write(abi_dir.join(PROPERTIES_FILE), "Pkg.Revision=8\n").unwrap();
        cache::write_cached_hash(&dst.join(PACKAGE_HASH_FILE), &cache::hash_bytes(b"zip")).unwrap();

        let (image, rev) = extract_system_package(&package, "arm64-v8a", &dst).unwrap();
        assert_eq!(image, Some(abi_dir.join(IMAGE_FILE)));
        assert_eq!(rev, 8);

        // A full pipeline with the package already downloaded and unpacked
        // needs neither curl nor unzip.
        let found =
            system_image(None, &request(8), images.path(), &DownloadOptions::default()).unwrap();
        assert_eq!(found, abi_dir.join(IMAGE_FILE));
    }

    #[test]
    fn test_is_retryable_error() {
        assert!(is_retryable_error(&anyhow::anyhow!(
            "curl: (28) Operation timed out after 30000 milliseconds"
        )));
        assert!(is_retryable_error(&anyhow::anyhow!(
            "curl: (22) The requested URL returned error: 503"
        )));
        assert!(is_retryable_error(&anyhow::anyhow!(
            "curl: (56) Recv failure: Connection reset by peer"
        )));
        assert!(!is_retryable_error(&anyhow::anyhow!(
            "curl: (22) The requested URL returned error: 404"
        )));
        assert!(!is_retryable_error(&anyhow::anyhow!(
            "curl: (6) Could not resolve host: dl.google.com"
        )));
    }
}
