//! Firmware releases published on GitHub
//!
//! Release names follow `version#idf#config#branch`, e.g.
//! `1191-master-v4.3#v4.3.1#I2S-4MFlash#master-v4.3`.

use std::sync::OnceLock;

use common::{ConfigDocument, Status};
use log::debug;
use regex::Regex;
use serde::Deserialize;

use crate::{config::Settings, error::ApiError, nvs::RELEASE_API_KEY};

/// Path the Squeezelite-ESP32 LMS plugin serves firmware from
pub const LMS_FIRMWARE_PATH: &str = "/plugins/SqueezeESP32/firmware/";

/// `GET /repos/{owner}/{repo}/releases` entry, only the fields we read
#[derive(Debug, Clone, Deserialize)]
pub struct GithubRelease {
    pub name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubAsset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: String,
    pub idf: String,
    /// Platform the image is built for, e.g. `I2S-4MFlash`
    pub config: String,
    pub branch: String,
    /// 16 or 32 bit output, from the version suffix
    pub bits: Option<u8>,
    /// Download URL of the firmware image
    pub url: Option<String>,
    pub notes: String,
    pub created_at: String,
}

impl From<&GithubRelease> for Release {
    fn from(release: &GithubRelease) -> Self {
        let mut parts = release.name.split('#').map(str::to_string);
        let version = parts.next().unwrap_or_default();
        let idf = parts.next().unwrap_or_default();
        let config = parts.next().unwrap_or_default();
        let branch = parts.next().unwrap_or_default();

        let bits = version
            .rsplit_once('-')
            .and_then(|(_, suffix)| match suffix {
                "16" => Some(16),
                "32" => Some(32),
                _ => None,
            });

        // The last image listed wins
        let url = release
            .assets
            .iter()
            .filter(|a| a.name.ends_with(".bin"))
            .last()
            .map(|a| a.browser_download_url.clone());

        Self {
            version,
            idf,
            config,
            branch,
            bits,
            url,
            notes: trim_notes(release.body.as_deref().unwrap_or_default()),
            created_at: release.created_at.clone(),
        }
    }
}

/// Keep only the "Revision Log" section of release notes and drop the
/// commit hashes in front of each entry.
pub fn trim_notes(body: &str) -> String {
    static SECTION: OnceLock<Regex> = OnceLock::new();
    static HASH: OnceLock<Regex> = OnceLock::new();
    let section = SECTION.get_or_init(|| {
        Regex::new(r"(?s).+(### Revision Log.+)### ESP-IDF Version Used.+").expect("static regex")
    });
    let hash = HASH.get_or_init(|| Regex::new(r"- \(.+?\) ").expect("static regex"));

    let body = body.replace('\'', "\"");
    let body = section.replace(&body, "$1");
    hash.replace_all(&body, "- ").into_owned()
}

/// Branch names in the order they first appear
pub fn branches(releases: &[Release]) -> Vec<String> {
    let mut branches: Vec<String> = Vec::new();
    for release in releases {
        if !branches.contains(&release.branch) {
            branches.push(release.branch.clone());
        }
    }
    branches
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseFilter {
    /// Matched case-insensitively against [`Release::config`]
    pub platform: Option<String>,
    pub branch: Option<String>,
}

impl ReleaseFilter {
    pub fn matches(&self, release: &Release) -> bool {
        let platform = self
            .platform
            .as_deref()
            .map_or(true, |p| release.config.eq_ignore_ascii_case(p));
        let branch = self.branch.as_deref().map_or(true, |b| release.branch == b);
        platform && branch
    }

    pub fn apply<'a>(&self, releases: &'a [Release]) -> Vec<&'a Release> {
        releases.iter().filter(|r| self.matches(r)).collect()
    }

    /// Filter on the device's platform, falling back to its project name
    /// when no release is built for the platform.
    pub fn for_device(status: &Status, releases: &[Release]) -> Self {
        let candidates = [status.platform_name.as_deref(), status.project_name.as_deref()];
        let platform = candidates
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .find(|p| releases.iter().any(|r| r.config.eq_ignore_ascii_case(p)))
            .map(str::to_string);
        Self {
            platform,
            branch: None,
        }
    }
}

/// `http://<lms_ip>:<lms_port>` when the device knows its music server
pub fn lms_base_url(status: &Status) -> Option<String> {
    match (status.lms_ip.as_deref(), status.lms_port) {
        (Some(ip), Some(port)) if !ip.is_empty() => Some(format!("http://{}:{}", ip, port)),
        _ => None,
    }
}

/// Route a GitHub download through the LMS plugin proxy
pub fn proxy_url(url: &str, lms_base: &str) -> String {
    static DOWNLOAD: OnceLock<Regex> = OnceLock::new();
    let download = DOWNLOAD.get_or_init(|| Regex::new(r".*/download/").expect("static regex"));
    let replacement = format!("{}{}", lms_base.trim_end_matches('/'), LMS_FIRMWARE_PATH);
    download
        .replace(url, regex::NoExpand(&replacement))
        .into_owned()
}

/// Release list URL: the device's `rel_api` key wins over the settings
pub fn release_api_url(settings: &Settings, config: Option<&ConfigDocument>) -> String {
    config
        .and_then(|c| c.get(RELEASE_API_KEY))
        .map(|e| e.value_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| settings.release_url.clone())
}

pub async fn fetch_releases(http: &reqwest::Client, url: &str) -> Result<Vec<Release>, ApiError> {
    debug!("releases::fetch: {}", url);
    let response = http
        .get(url)
        .header(reqwest::header::USER_AGENT, "squeezectl")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(ApiError::Status {
            endpoint: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    let text = response.text().await?;
    let releases: Vec<GithubRelease> =
        serde_json::from_str(&text).map_err(|source| ApiError::Malformed {
            endpoint: url.to_string(),
            source,
        })?;
    Ok(releases.iter().map(Release::from).collect())
}

/// Whether the LMS plugin can proxy firmware downloads
pub async fn lms_proxy_available(http: &reqwest::Client, lms_base: &str) -> bool {
    let url = format!("{}{}-check.bin", lms_base.trim_end_matches('/'), LMS_FIRMWARE_PATH);
    match http.head(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!("releases::proxy: {} unreachable: {}", url, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github(name: &str, assets: &[&str]) -> GithubRelease {
        GithubRelease {
            name: name.to_string(),
            body: None,
            created_at: "2023-01-01T00:00:00Z".to_string(),
            assets: assets
                .iter()
                .map(|a| GithubAsset {
                    name: a.to_string(),
                    browser_download_url: format!(
                        "https://github.com/sle118/squeezelite-esp32/releases/download/tag/{}",
                        a
                    ),
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_release_name() {
        let release = Release::from(&github(
            "1191-master-v4.3-32#v4.3.1#I2S-4MFlash#master-v4.3",
            &["squeezelite.zip", "recovery.bin", "squeezelite.bin"],
        ));
        assert_eq!(release.version, "1191-master-v4.3-32");
        assert_eq!(release.idf, "v4.3.1");
        assert_eq!(release.config, "I2S-4MFlash");
        assert_eq!(release.branch, "master-v4.3");
        assert_eq!(release.bits, Some(32));
        assert!(release.url.unwrap().ends_with("/squeezelite.bin"));

        let odd = Release::from(&github("nightly", &[]));
        assert_eq!(odd.branch, "");
        assert_eq!(odd.bits, None);
        assert_eq!(odd.url, None);
    }

    #[test]
    fn test_branches_and_filter() {
        let releases: Vec<Release> = [
            "3#idf#SqueezeAmp#master",
            "2#idf#I2S-4MFlash#dev",
            "1#idf#squeezeamp#master",
        ]
        .iter()
        .map(|n| Release::from(&github(n, &[])))
        .collect();

        assert_eq!(branches(&releases), vec!["master", "dev"]);

        let filter = ReleaseFilter {
            platform: Some("SQUEEZEAMP".into()),
            branch: Some("master".into()),
        };
        assert_eq!(filter.apply(&releases).len(), 2);

        let status = Status {
            platform_name: Some("ESP32-A1S".into()),
            project_name: Some("SqueezeAmp".into()),
            ..Default::default()
        };
        let device = ReleaseFilter::for_device(&status, &releases);
        assert_eq!(device.platform.as_deref(), Some("SqueezeAmp"));
    }

    #[test]
    fn test_trim_notes() {
        let body = "Intro\n### Revision Log\n- (abc1234) fixed 'it'\n### ESP-IDF Version Used\nv4.3";
        assert_eq!(trim_notes(body), "### Revision Log\n- fixed \"it\"\n");
        assert_eq!(trim_notes("plain"), "plain");
    }

    #[test]
    fn test_proxy_url() {
        let url = "https://github.com/sle118/squeezelite-esp32/releases/download/v1/squeezelite.bin";
        assert_eq!(
            proxy_url(url, "http://192.168.1.5:9000"),
            "http://192.168.1.5:9000/plugins/SqueezeESP32/firmware/squeezelite.bin"
        );

        let status = Status {
            lms_ip: Some("192.168.1.5".into()),
            lms_port: Some(9000),
            ..Default::default()
        };
        assert_eq!(
            lms_base_url(&status).as_deref(),
            Some("http://192.168.1.5:9000")
        );
    }

    #[test]
    fn test_release_api_override() {
        let settings = Settings::default();
        assert_eq!(release_api_url(&settings, None), settings.release_url);

        let config: ConfigDocument = serde_json::from_str(
            r#"{"config": {"rel_api": {"value": "https://example.com/releases", "type": 33}}}"#,
        )
        .unwrap();
        assert_eq!(
            release_api_url(&settings, Some(&config)),
            "https://example.com/releases"
        );
    }
}
