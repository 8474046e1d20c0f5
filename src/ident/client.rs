//! Remote identification client.
//!
//! Base64-embeds an encoded signature into the tag request, posts it to
//! the discovery endpoint under a strict global rate limit, and parses
//! the best match out of the response. A companion endpoint resolves an
//! Apple track id into streaming links.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::seq::SliceRandom;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::signature::{CodecError, Signature};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bad status: {0} ({1})")]
    BadStatus(u16, String),
}

/// Best match reported by the identification service. `skew` is the
/// time-skew of the match and is only meaningful when `found`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMatch {
    pub found: bool,
    pub skew: f64,
    pub artist: String,
    pub title: String,
    pub album: String,
    pub year: String,
    pub apple_id: String,
}

/// The seam the search driver talks through, so tests can substitute a
/// canned service for the real endpoint.
#[async_trait]
pub trait IdentifyService: Send + Sync {
    async fn identify(&self, sig: &Signature) -> anyhow::Result<TrackMatch>;
}

const RATE_INTERVAL: Duration = Duration::from_secs(3);

/// Process-wide token bucket: capacity one, 3 s refill. The lock is held
/// across the wait so exactly one caller advances per interval.
async fn throttle() {
    static LAST: OnceLock<Mutex<Option<Instant>>> = OnceLock::new();
    let mut last = LAST.get_or_init(|| Mutex::new(None)).lock().await;
    if let Some(prev) = *last {
        tokio::time::sleep_until(prev + RATE_INTERVAL).await;
    }
    *last = Some(Instant::now());
}

fn tag_url() -> String {
    let tag1 = uuid::Uuid::new_v4().to_string().to_uppercase();
    let tag2 = uuid::Uuid::new_v4().to_string();
    format!(
        "http://amp.shazam.com/discovery/v5/en/US/android/-/tag/{tag1}/{tag2}\
         ?sync=true&webv3=true&sampling=true&connected=&shazamapiversion=v3&sharehub=true&video=v3"
    )
}

fn request_body(sig: &Signature, timestamp_ms: i64) -> Result<String, CodecError> {
    let uri = format!("data:audio/vnd.shazam.sig;base64,{}", BASE64.encode(sig.encode()?));
    let body = serde_json::json!({
        "geolocation": {
            "altitude": 300,
            "latitude": 45,
            "longitude": 2,
        },
        "signature": {
            "samplems": (sig.num_samples / sig.sample_rate) * 1000,
            "timestamp": timestamp_ms,
            "uri": uri,
        },
        "timestamp": timestamp_ms,
        "timezone": "Europe/Berlin",
    });
    Ok(body.to_string())
}

// Response shape of the discovery endpoint; unknown keys are ignored.

#[derive(Debug, Default, Deserialize)]
struct AmpResponse {
    #[serde(default)]
    matches: Vec<AmpMatch>,
    #[serde(default)]
    track: AmpTrack,
}

#[derive(Debug, Default, Deserialize)]
struct AmpMatch {
    #[serde(default, rename = "timeskew")]
    time_skew: f64,
}

#[derive(Debug, Default, Deserialize)]
struct AmpTrack {
    #[serde(default)]
    title: String,
    #[serde(default)]
    subtitle: String,
    #[serde(default)]
    hub: AmpHub,
    #[serde(default)]
    sections: Vec<AmpSection>,
}

#[derive(Debug, Default, Deserialize)]
struct AmpHub {
    #[serde(default)]
    actions: Vec<AmpAction>,
}

#[derive(Debug, Default, Deserialize)]
struct AmpAction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct AmpSection {
    #[serde(default)]
    metadata: Vec<AmpMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct AmpMetadata {
    #[serde(default)]
    title: String,
    #[serde(default)]
    text: String,
}

fn parse_response(data: AmpResponse) -> TrackMatch {
    let Some(best) = data.matches.first() else {
        return TrackMatch::default();
    };
    let mut album = String::new();
    let mut year = String::new();
    for section in &data.track.sections {
        for meta in &section.metadata {
            match meta.title.as_str() {
                "Album" => album = meta.text.clone(),
                "Released" | "Sortie" => year = meta.text.clone(),
                _ => {}
            }
        }
    }
    let apple_id = data
        .track
        .hub
        .actions
        .iter()
        .find(|action| action.name == "apple" && !action.id.is_empty())
        .map(|action| action.id.clone())
        .unwrap_or_default();

    TrackMatch {
        found: true,
        skew: best.time_skew,
        artist: data.track.subtitle,
        title: data.track.title,
        album,
        year,
        apple_id,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongLinkResponse {
    #[serde(default)]
    links_by_platform: LinksByPlatform,
}

#[derive(Debug, Default, Deserialize)]
struct LinksByPlatform {
    #[serde(default)]
    youtube: PlatformLink,
    #[serde(default)]
    spotify: PlatformLink,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformLink {
    #[serde(default)]
    url: String,
}

impl SongLinkResponse {
    fn into_links(self) -> BTreeMap<String, String> {
        let mut links = BTreeMap::new();
        if !self.links_by_platform.youtube.url.is_empty() {
            links.insert("YouTube".to_string(), self.links_by_platform.youtube.url);
        }
        if !self.links_by_platform.spotify.url.is_empty() {
            links.insert("Spotify".to_string(), self.links_by_platform.spotify.url);
        }
        links
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShazamClient {
    http: reqwest::Client,
}

impl ShazamClient {
    pub fn new() -> Self {
        ShazamClient {
            http: reqwest::Client::new(),
        }
    }

    /// Resolve streaming links for an Apple track id.
    pub async fn links(&self, apple_id: &str) -> Result<BTreeMap<String, String>, NetworkError> {
        let url = format!(
            "https://api.song.link/v1-alpha.1/links\
             ?type=song&songIfSingle=true&platform=appleMusic&id={apple_id}"
        );
        let resp = self.http.get(&url).send().await?;
        if resp.status() != StatusCode::OK {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NetworkError::BadStatus(status, body));
        }
        let data: SongLinkResponse = resp.json().await?;
        Ok(data.into_links())
    }
}

#[async_trait]
impl IdentifyService for ShazamClient {
    async fn identify(&self, sig: &Signature) -> anyhow::Result<TrackMatch> {
        let body = request_body(sig, chrono::Utc::now().timestamp_millis())?;
        let url = tag_url();
        let user_agent = *USER_AGENTS
            .choose(&mut rand::thread_rng())
            .expect("user agent pool is non-empty");

        loop {
            throttle().await;
            let resp = self
                .http
                .post(&url)
                .header("User-Agent", user_agent)
                .header("Content-Language", "en_US")
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
                .await
                .map_err(NetworkError::from)?;

            match resp.status() {
                StatusCode::TOO_MANY_REQUESTS => {
                    tracing::debug!("identification throttled upstream; retrying");
                    tokio::time::sleep(RATE_INTERVAL).await;
                }
                StatusCode::OK => {
                    let data: AmpResponse = resp.json().await.map_err(NetworkError::from)?;
                    return Ok(parse_response(data));
                }
                status => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(NetworkError::BadStatus(status.as_u16(), body).into());
                }
            }
        }
    }
}

static USER_AGENTS: &[&str] = &[
    "Dalvik/2.1.0 (Linux; U; Android 5.0.2; VS980 4G Build/LRX22G)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; SM-T210 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-P905V Build/LMY47X)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; Vodafone Smart Tab 4G Build/KTU84P)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; SM-G360H Build/KTU84P)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0.2; SM-S920L Build/LRX22G)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; Fire Pro Build/LRX21M)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; SM-N9005 Build/LRX21V)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G920F Build/MMB29K)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; SM-G7102 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; SM-G900F Build/LRX21T)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G928F Build/MMB29K)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-J500FN Build/LMY48B)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; Coolpad 3320A Build/LMY47V)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; SM-J110F Build/KTU84P)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; SAMSUNG-SGH-I747 Build/KOT49H)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; SAMSUNG-SM-T337A Build/KOT49H)",
    "Dalvik/1.6.0 (Linux; U; Android 4.3; SGH-T999 Build/JSS15J)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; D6603 Build/23.5.A.0.570)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-J700H Build/LMY48B)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; HTC6600LVW Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-N910G Build/LMY47X)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-N910T Build/LMY47X)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; C6903 Build/14.4.A.0.157)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G920F Build/MMB29K)",
    "Dalvik/1.6.0 (Linux; U; Android 4.2.2; GT-I9105P Build/JDQ39)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; SM-G900F Build/LRX21T)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; GT-I9192 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-G531H Build/LMY48B)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; SM-N9005 Build/LRX21V)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; LGMS345 Build/LMY47V)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0.2; HTC One Build/LRX22G)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0.2; LG-D800 Build/LRX22G)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-G531H Build/LMY48B)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; SM-N9005 Build/LRX21V)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; SM-T113 Build/KTU84P)",
    "Dalvik/1.6.0 (Linux; U; Android 4.2.2; AndyWin Build/JDQ39E)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; Lenovo A7000-a Build/LRX21M)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; LGL16C Build/KOT49I.L16CV11a)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; GT-I9500 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0.2; SM-A700FD Build/LRX22G)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; SM-G130HN Build/KOT49H)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; SM-N9005 Build/KOT49H)",
    "Dalvik/1.6.0 (Linux; U; Android 4.1.2; LG-E975T Build/JZO54K)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; E1 Build/KOT49H)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; GT-I9500 Build/KOT49H)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; GT-N5100 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-A310F Build/LMY47X)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-J105H Build/LMY47V)",
    "Dalvik/1.6.0 (Linux; U; Android 4.3; GT-I9305T Build/JSS15J)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; android Build/JDQ39)",
    "Dalvik/1.6.0 (Linux; U; Android 4.2.1; HS-U970 Build/JOP40D)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; SM-T561 Build/KTU84P)",
    "Dalvik/1.6.0 (Linux; U; Android 4.2.2; GT-P3110 Build/JDQ39)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G925T Build/MMB29K)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; HUAWEI Y221-U22 Build/HUAWEIY221-U22)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-G530T1 Build/LMY47X)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-G920I Build/LMY47X)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; SM-G900F Build/LRX21T)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; Vodafone Smart ultra 6 Build/LMY47V)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; XT1080 Build/SU6-7.7)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; ASUS MeMO Pad 7 Build/KTU84P)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; SM-G800F Build/KOT49H)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; GT-N7100 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G925I Build/MMB29K)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; A0001 Build/MMB29X)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1; XT1045 Build/LPB23.13-61)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; LGMS330 Build/LMY47V)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; Z970 Build/KTU84P)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; SM-N900P Build/LRX21V)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; T1-701u Build/HuaweiMediaPad)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1; HTCD100LVWPP Build/LMY47O)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G935R4 Build/MMB29M)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G930V Build/MMB29M)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0.2; ZTE Blade Q Lux Build/LRX22G)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; GT-I9060I Build/KTU84P)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; LGUS992 Build/MMB29M)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G900P Build/MMB29M)",
    "Dalvik/1.6.0 (Linux; U; Android 4.1.2; SGH-T999L Build/JZO54K)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-N910V Build/LMY47X)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; GT-I9500 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-P601 Build/LMY47X)",
    "Dalvik/1.6.0 (Linux; U; Android 4.2.2; GT-S7272 Build/JDQ39)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-N910T Build/LMY47X)",
    "Dalvik/1.6.0 (Linux; U; Android 4.3; SAMSUNG-SGH-I747 Build/JSS15J)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0.2; ZTE Blade Q Lux Build/LRX22G)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-G930F Build/MMB29K)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; HTC_PO582 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0; HUAWEI MT7-TL10 Build/HuaweiMT7-TL10)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0; LG-H811 Build/MRA58K)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; SM-N7505 Build/KOT49H)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0; LG-H815 Build/MRA58K)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.2; LenovoA3300-HV Build/KOT49H)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; SM-G360G Build/KTU84P)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; GT-I9300I Build/KTU84P)",
    "Dalvik/2.1.0 (Linux; U; Android 5.0; SM-G900F Build/LRX21T)",
    "Dalvik/2.1.0 (Linux; U; Android 6.0.1; SM-J700T Build/MMB29K)",
    "Dalvik/2.1.0 (Linux; U; Android 5.1.1; SM-J500FN Build/LMY48B)",
    "Dalvik/1.6.0 (Linux; U; Android 4.2.2; SM-T217S Build/JDQ39)",
    "Dalvik/1.6.0 (Linux; U; Android 4.4.4; SAMSUNG-SM-N900A Build/KTU84P)",
];
